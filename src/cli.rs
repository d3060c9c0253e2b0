//! Command-line surface: flag parsing, cross-field validation, and the
//! derived warmup/profile interval constants every phase-gated transition
//! in [`crate::coordinator`] reads.
//!
//! Ported from `parse_args`/`usage` in `datamime-profiler.cpp`. `clap`
//! (derive API) is used instead of hand-rolled `getopt`, matching the CLI
//! crate the nearest pack sibling in this domain (`mstange-samply`)
//! actually depends on. Unlike `clap::Parser::parse()`'s default exit
//! code of 2 on a bad argument, a bad argument here should exit 1, so
//! `main` calls [`RunConfig::parse_args`] instead and maps the error
//! itself.

use std::path::PathBuf;

use clap::Parser;

use crate::error::{Error, Result};

/// Raw flags exactly as the user types them, before derived fields are
/// computed.
#[derive(Debug, Parser)]
#[command(name = "datamime-profiler", about = "Online per-thread LLC miss-rate and IPC curve profiler")]
struct Args {
    /// Comma-separated rotating events to sample; ignored in MRC-estimation mode.
    #[arg(short = 'e', long = "events", default_value = "")]
    events: String,

    /// Phase length, in reference cycles.
    #[arg(short = 'l', long = "phase-len")]
    phase_len: u64,

    /// Total number of phases before termination.
    #[arg(short = 'n', long = "num-phases")]
    num_phases: u64,

    /// MRC warmup period, in million cycles.
    #[arg(short = 'w', long = "warmup-period")]
    mrc_warmup_period: u64,

    /// MRC profile period, in million cycles.
    #[arg(short = 'p', long = "profile-period")]
    mrc_profile_period: u64,

    /// Output-file name prefix.
    #[arg(short = 'f', long = "outfile-prefix")]
    glob_outfile_name: String,

    /// Thread-group id of the workload.
    #[arg(short = 'g', long = "tgid")]
    tgid: i32,

    /// Comma-separated thread ids within that group to profile.
    #[arg(short = 't', long = "tids")]
    tids: String,

    /// Absolute path to the results directory.
    #[arg(short = 'r', long = "results-dir")]
    results_dir: PathBuf,

    /// Enable MRC-estimation mode (rotating events are ignored).
    #[arg(short = 'm', long = "mrc-est-mode")]
    mrc_est_mode: bool,

    /// Enable debug logging to `<prefix>_datamime-profiler.log`.
    #[arg(short = 'd', long = "debug")]
    debug: bool,
}

/// Fully parsed, cross-validated run configuration. Exposes the derived
/// `mrc_warmup_interval`/`mrc_profile_interval` phase counts; `monitorLen`
/// is a separate constant, see [`crate::coordinator::MONITOR_LEN`].
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub events: Vec<String>,
    pub phase_len: u64,
    pub num_phases: u64,
    pub mrc_warmup_period: u64,
    pub mrc_profile_period: u64,
    pub glob_outfile_name: String,
    pub tgid: i32,
    pub profiled_tids: Vec<i32>,
    pub results_dir: PathBuf,
    pub mrc_est_mode: bool,
    pub debug: bool,
}

impl RunConfig {
    /// Parses `argv`, mapping any error (including `-h`/`--help`, which
    /// clap treats as a "display" error) onto the right exit code: usage
    /// text is printed either way, but a genuine argument error exits 1
    /// while `-h` exits 0.
    pub fn parse_args<I, T>(argv: I) -> std::result::Result<Self, (String, i32)>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let args = match Args::try_parse_from(argv) {
            Ok(args) => args,
            Err(err) => {
                let code = if err.kind() == clap::error::ErrorKind::DisplayHelp
                    || err.kind() == clap::error::ErrorKind::DisplayVersion
                {
                    0
                } else {
                    1
                };
                return Err((err.to_string(), code));
            }
        };
        Self::from_args(args).map_err(|err| (err.to_string(), 1))
    }

    fn from_args(args: Args) -> Result<Self> {
        let profiled_tids = parse_csv_ints(&args.tids)
            .ok_or_else(|| Error::Argument(format!("invalid -t thread id list: {:?}", args.tids)))?;
        if profiled_tids.is_empty() {
            return Err(Error::Argument("-t must name at least one thread id".into()));
        }

        let events = if args.mrc_est_mode {
            Vec::new()
        } else {
            args.events
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        };

        if args.phase_len == 0 {
            return Err(Error::Argument("-l phase_len must be nonzero".into()));
        }

        Ok(Self {
            events,
            phase_len: args.phase_len,
            num_phases: args.num_phases,
            mrc_warmup_period: args.mrc_warmup_period,
            mrc_profile_period: args.mrc_profile_period,
            glob_outfile_name: args.glob_outfile_name,
            tgid: args.tgid,
            profiled_tids,
            results_dir: args.results_dir,
            mrc_est_mode: args.mrc_est_mode,
            debug: args.debug,
        })
    }

    /// Rejects a thread count that would leave no core for the filler
    /// thread and the main thread: never more profiled threads than
    /// `assignable_cores - 2`.
    pub fn validate_thread_count(&self, assignable_cores: usize) -> Result<()> {
        if assignable_cores < 2 || self.profiled_tids.len() > assignable_cores - 2 {
            return Err(Error::TooManyThreads {
                profiled: self.profiled_tids.len(),
                assignable: assignable_cores,
            });
        }
        Ok(())
    }

    /// `mrc_warmup_interval = (mrc_warmup_period * 1e6) / phase_len`,
    /// ported verbatim from `parse_args`.
    pub fn mrc_warmup_interval(&self) -> u64 {
        (self.mrc_warmup_period * 1_000_000) / self.phase_len
    }

    /// `mrc_profile_interval = (mrc_profile_period * 1e6) / phase_len`.
    pub fn mrc_profile_interval(&self) -> u64 {
        (self.mrc_profile_period * 1_000_000) / self.phase_len
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.results_dir
            .join(format!("{}_datamime-profiler.log", self.glob_outfile_name))
    }
}

fn parse_csv_ints(csv: &str) -> Option<Vec<i32>> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<i32>().ok())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn base_argv() -> Vec<&'static str> {
        vec![
            "datamime-profiler",
            "-l", "1000000",
            "-n", "100",
            "-w", "10",
            "-p", "1",
            "-f", "out",
            "-g", "42",
            "-t", "1,2,3",
            "-r", "/tmp/results",
        ]
    }

    #[test]
    fn parses_minimal_valid_invocation() {
        let cfg = RunConfig::parse_args(base_argv()).unwrap();
        assert_eq!(cfg.profiled_tids, vec![1, 2, 3]);
        assert_eq!(cfg.tgid, 42);
        assert!(!cfg.mrc_est_mode);
        assert!(cfg.events.is_empty());
    }

    #[test]
    fn mrc_mode_ignores_rotating_events() {
        let mut argv = base_argv();
        argv.push("-e");
        argv.push("INST_RETIRED,CACHE_MISSES");
        argv.push("-m");
        let cfg = RunConfig::parse_args(argv).unwrap();
        assert!(cfg.mrc_est_mode);
        assert!(cfg.events.is_empty());
    }

    #[test]
    fn non_mrc_mode_splits_events_csv() {
        let mut argv = base_argv();
        argv.push("-e");
        argv.push("INST_RETIRED, CACHE_MISSES");
        let cfg = RunConfig::parse_args(argv).unwrap();
        assert_eq!(cfg.events, vec!["INST_RETIRED", "CACHE_MISSES"]);
    }

    #[test]
    fn rejects_malformed_tid_list() {
        let mut argv = base_argv();
        // Overwrite the "-t" value with garbage.
        let idx = argv.iter().position(|a| *a == "1,2,3").unwrap();
        argv[idx] = "1,x,3";
        let (_, code) = RunConfig::parse_args(argv).unwrap_err();
        assert_eq!(code, 1);
    }

    #[test]
    fn help_flag_exits_zero() {
        let (_, code) = RunConfig::parse_args(vec!["datamime-profiler", "-h"]).unwrap_err();
        assert_eq!(code, 0);
    }

    #[test]
    fn derives_warmup_and_profile_intervals() {
        let cfg = RunConfig::parse_args(base_argv()).unwrap();
        // phase_len=1_000_000, warmup_period=10e6 cycles -> 10 phases.
        assert_eq!(cfg.mrc_warmup_interval(), 10);
        assert_eq!(cfg.mrc_profile_interval(), 1);
    }

    #[test]
    fn thread_count_validated_against_assignable_cores() {
        let cfg = RunConfig::parse_args(base_argv()).unwrap();
        assert!(cfg.validate_thread_count(5).is_ok()); // 3 profiled + filler + main
        assert!(cfg.validate_thread_count(4).is_err());
    }
}
