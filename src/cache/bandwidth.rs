//! Memory-bandwidth and LLC-occupancy monitoring (CMT/MBM), keyed by
//! resource-monitoring id (RMID).
//!
//! Ported from `datamime-profiler.cpp::getMemTrafficDelta`/
//! `updateMemTraffic`/`updateCacheOccupancy`. Counter reads are
//! non-blocking and hardware-wrapping; the wrap-handling formula is
//! ported verbatim.

use crate::error::Result;

/// Backend that reads the two raw CMT/MBM counters for an RMID. Hardware
/// access sits behind this trait for the same testability reason as
/// [`super::CatBackend`].
pub trait CmtBackend {
    /// Cumulative local memory traffic in bytes for `rmid`, as read from
    /// hardware (wraps at [`Self::mem_traffic_max`]).
    fn local_mem_traffic(&self, rmid: u32) -> u64;

    /// Instantaneous LLC occupancy in bytes for `rmid`.
    fn llc_occupancy(&self, rmid: u32) -> u64;

    /// Value the raw counter wraps at.
    fn mem_traffic_max(&self) -> u64;

    /// Bind a core to an RMID.
    fn set_rmid(&mut self, core_id: u32, rmid: u32) -> Result<()>;
}

/// Per-thread memory-bandwidth accounting: tracks the last raw reading and
/// the running cumulative total, handling hardware counter wrap.
#[derive(Debug, Default, Clone, Copy)]
pub struct BandwidthCounter {
    last: u64,
    total: u64,
}

impl BandwidthCounter {
    pub fn new(initial: u64) -> Self {
        Self {
            last: initial,
            total: 0,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Folds in one new raw reading:
    /// `delta = current >= last ? current - last : (max - last) + current`.
    pub fn update(&mut self, current: u64, max: u64) -> u64 {
        let delta = if current >= self.last {
            current - self.last
        } else {
            (max - self.last) + current
        };
        self.total += delta;
        self.last = current;
        delta
    }
}

/// Reads and accumulates per-thread memory traffic / occupancy from a
/// [`CmtBackend`].
pub struct BandwidthMonitor<B: CmtBackend> {
    backend: B,
}

impl<B: CmtBackend> BandwidthMonitor<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn set_rmid(&mut self, core_id: u32, rmid: u32) -> Result<()> {
        self.backend.set_rmid(core_id, rmid)
    }

    /// Initializes per-thread accounting for a freshly assigned RMID.
    pub fn init_counter(&self, rmid: u32) -> BandwidthCounter {
        BandwidthCounter::new(self.backend.local_mem_traffic(rmid))
    }

    /// Reads the current LLC occupancy for `rmid`.
    pub fn llc_occupancy(&self, rmid: u32) -> u64 {
        self.backend.llc_occupancy(rmid)
    }

    /// Reads the current memory-traffic counter and folds the delta into
    /// `counter`, returning the updated running total.
    pub fn update_mem_traffic(&self, rmid: u32, counter: &mut BandwidthCounter) -> u64 {
        let current = self.backend.local_mem_traffic(rmid);
        counter.update(current, self.backend.mem_traffic_max());
        counter.total()
    }
}

/// In-memory [`CmtBackend`] for tests: a caller-driven sequence of raw
/// readings per RMID.
#[derive(Default)]
pub struct NullCmtBackend {
    pub max: u64,
    pub readings: std::collections::HashMap<u32, u64>,
}

impl CmtBackend for NullCmtBackend {
    fn local_mem_traffic(&self, rmid: u32) -> u64 {
        *self.readings.get(&rmid).unwrap_or(&0)
    }

    fn llc_occupancy(&self, _rmid: u32) -> u64 {
        0
    }

    fn mem_traffic_max(&self) -> u64 {
        self.max
    }

    fn set_rmid(&mut self, _core_id: u32, _rmid: u32) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn monotonic_sequence_sums_positive_deltas() {
        // For any monotonic sequence, total = sum of positive diffs.
        let mut counter = BandwidthCounter::new(100);
        let readings = [100u64, 500, 900, 1400, 2000];
        let max = 1_000_000;
        for &r in &readings[1..] {
            counter.update(r, max);
        }
        assert_eq!(counter.total(), 2000 - 100);
    }

    #[test]
    fn single_wrap_reported_correctly() {
        // A single wraparound: [100, 500, 900, 200, 600], max=1000.
        let mut counter = BandwidthCounter::new(100);
        let max = 1000;
        let expected_deltas = [400u64, 400, 1000 - 900 + 200, 400];
        let readings = [500u64, 900, 200, 600];
        for (i, &r) in readings.iter().enumerate() {
            let delta = counter.update(r, max);
            assert_eq!(delta, expected_deltas[i]);
        }
        assert_eq!(counter.total(), 1500);
    }
}
