//! Per-thread output files: the raw per-sample counter log and the
//! MPKI/IPC curve dumps.
//!
//! Ported from `ThreadInfo`'s three `FILE*` members and
//! `EventGroup::finalize_events`/`read_counters`/`dump_mrc_estimates`/
//! `dump_ipc_estimates`. The curve files are rewritten in full on every
//! emission (`rewind` + full re-print in the original) rather than
//! appended to, since each completed estimate adds one more column to a
//! table whose row count (cache ways) never changes.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

/// One row of a `<prefix>_{counters|grouped_counters}_<tid>` file, in the
/// original's exact column order.
pub struct CounterRow<'a> {
    pub group_fd: i32,
    pub cpu: u32,
    pub tid: i32,
    pub nanoseconds: u64,
    pub tsc: u64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub mem_traffic_total: u64,
    pub llc_occupancy: u64,
    pub values: &'a [u64],
}

/// The three output streams owned by one profiled thread.
pub struct ThreadOutputs {
    counters: File,
    mrc: File,
    ipc: File,
}

impl ThreadOutputs {
    /// Creates the triple of files for `tid` under `results_dir`, named
    /// `<prefix>_{counters|mrc|ipc}_<tid>`. `grouped` selects the
    /// `grouped_counters` filename variant used once a thread owns more
    /// than one rotating [`crate::counters::CounterSet`] group.
    pub fn create(
        results_dir: &Path,
        prefix: &str,
        tid: i32,
        grouped: bool,
    ) -> io::Result<Self> {
        let counters_name = if grouped { "grouped_counters" } else { "counters" };
        let counters = File::create(results_dir.join(format!("{prefix}_{counters_name}_{tid}")))?;
        let mrc = File::create(results_dir.join(format!("{prefix}_mrc_{tid}")))?;
        let ipc = File::create(results_dir.join(format!("{prefix}_ipc_{tid}")))?;
        Ok(Self { counters, mrc, ipc })
    }

    /// Writes a group's header row, `"group <fd> <event-name>...\n"`,
    /// once per [`crate::counters::group::CounterGroup`] as it is
    /// opened. Ported from `EventGroup::finalize_events`.
    pub fn write_group_header(&mut self, group_fd: i32, event_names: &[String]) -> io::Result<()> {
        write!(self.counters, "group {group_fd}")?;
        for name in event_names {
            write!(self.counters, " {name}")?;
        }
        writeln!(self.counters)
    }

    /// Appends one sample row. Ported from `read_counters`'s `fprintf`
    /// sequence.
    pub fn write_counter_row(&mut self, row: &CounterRow) -> io::Result<()> {
        write!(
            self.counters,
            "{} {} {} {} {} {} {} {} {}",
            row.group_fd,
            row.cpu,
            row.tid,
            row.nanoseconds,
            row.tsc,
            row.time_enabled,
            row.time_running,
            row.mem_traffic_total,
            row.llc_occupancy,
        )?;
        for value in row.values {
            write!(self.counters, " {value}")?;
        }
        writeln!(self.counters)
    }

    /// Rewrites the full `<prefix>_mrc_<tid>`/`<prefix>_ipc_<tid>` files:
    /// one row per cache way, one column per completed estimate so far.
    /// `columns` are the per-invocation interpolated curves in emission
    /// order, already monotonicity-corrected by the caller (the
    /// correction is applied once at write time, never to the stored raw
    /// arrays).
    pub fn write_mrc_curves(&mut self, columns: &[Vec<f64>]) -> io::Result<()> {
        write_curve_table(&mut self.mrc, columns)
    }

    pub fn write_ipc_curves(&mut self, columns: &[Vec<f64>]) -> io::Result<()> {
        write_curve_table(&mut self.ipc, columns)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.counters.flush()?;
        self.mrc.flush()?;
        self.ipc.flush()
    }
}

fn write_curve_table(file: &mut File, columns: &[Vec<f64>]) -> io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.set_len(0)?;

    if columns.is_empty() {
        return Ok(());
    }
    let num_ways = columns[0].len();
    for way in 0..num_ways {
        for (j, column) in columns.iter().enumerate() {
            if j > 0 {
                write!(file, " ")?;
            }
            write!(file, "{:.6}", column[way])?;
        }
        writeln!(file)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Read;

    #[test]
    fn create_produces_three_distinctly_named_files() {
        let dir = tempfile::tempdir().unwrap();
        let _outputs = ThreadOutputs::create(dir.path(), "run", 1234, false).unwrap();
        assert!(dir.path().join("run_counters_1234").exists());
        assert!(dir.path().join("run_mrc_1234").exists());
        assert!(dir.path().join("run_ipc_1234").exists());
    }

    #[test]
    fn grouped_variant_uses_grouped_counters_filename() {
        let dir = tempfile::tempdir().unwrap();
        let _outputs = ThreadOutputs::create(dir.path(), "run", 5, true).unwrap();
        assert!(dir.path().join("run_grouped_counters_5").exists());
    }

    #[test]
    fn counter_row_matches_column_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut outputs = ThreadOutputs::create(dir.path(), "run", 1, false).unwrap();
        outputs
            .write_counter_row(&CounterRow {
                group_fd: 7,
                cpu: 2,
                tid: 1,
                nanoseconds: 100,
                tsc: 200,
                time_enabled: 300,
                time_running: 300,
                mem_traffic_total: 4096,
                llc_occupancy: 2048,
                values: &[10, 20, 30],
            })
            .unwrap();
        outputs.flush().unwrap();

        let mut contents = String::new();
        File::open(dir.path().join("run_counters_1"))
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "7 2 1 100 200 300 300 4096 2048 10 20 30\n");
    }

    #[test]
    fn curve_table_rewrites_rather_than_appends() {
        let dir = tempfile::tempdir().unwrap();
        let mut outputs = ThreadOutputs::create(dir.path(), "run", 9, false).unwrap();

        outputs.write_mrc_curves(&[vec![5.0, 3.0]]).unwrap();
        outputs
            .write_mrc_curves(&[vec![5.0, 3.0], vec![4.5, 3.2]])
            .unwrap();
        outputs.flush().unwrap();

        let mut contents = String::new();
        File::open(dir.path().join("run_mrc_9"))
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        // Two rows (ways), two columns (estimates); no leftover from the
        // first, shorter write.
        assert_eq!(contents, "5.000000 4.500000\n3.000000 3.200000\n");
    }
}
