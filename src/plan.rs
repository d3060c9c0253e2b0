//! Sampling-plan generation: for a given cache capacity, the sequence of
//! target-thread way counts to sweep and the raw target/co-runner way
//! partition for each point.
//!
//! Ported from `datamime-profiler.cpp::generate_profiling_plan`. The
//! original hardcoded a one-off override of the first two way-assignment
//! slices for a 12-way cache to dodge the Broadwell CAT errata; here that
//! same result falls out of always running every slice's partition
//! through [`crate::cache::workaround::fix_cos_10_11_split`], so the
//! planner itself stays capacity-table-only.

use crate::cache::workaround::fix_cos_10_11_split;
use crate::error::{Error, Result};

/// One point on the sampling curve: how many ways the target thread gets,
/// and the resulting way partition for target vs. co-runner(s).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice {
    /// Ways allocated to the profiled thread at this point.
    pub target_ways: u32,
    /// Way indices assigned to the profiled thread.
    pub target_partition: Vec<u32>,
    /// Way indices assigned to the co-runner (filler / other threads).
    pub co_runner_partition: Vec<u32>,
}

/// The fixed per-capacity target-way tables from `generate_profiling_plan`,
/// indexed by `cache_num_ways - 3`.
const PLAN_TABLE: &[(u32, &[u32])] = &[
    (3, &[2, 2, 1]),
    (4, &[3, 3, 2, 1]),
    (5, &[4, 4, 3, 2, 1]),
    (6, &[5, 5, 4, 3, 2, 1]),
    (7, &[6, 6, 5, 4, 3, 2, 1]),
    (8, &[7, 7, 6, 4, 3, 2, 1]),
    (9, &[8, 8, 6, 4, 3, 2, 1]),
    (10, &[9, 9, 8, 6, 4, 2, 1]),
    (11, &[10, 10, 8, 6, 4, 2, 1]),
    (12, &[11, 11, 8, 6, 4, 2, 1]),
    (13, &[12, 12, 9, 6, 4, 2, 1]),
    (14, &[13, 13, 9, 6, 4, 2, 1]),
    (15, &[14, 14, 10, 7, 4, 2, 1]),
    (16, &[15, 15, 11, 7, 4, 2, 1]),
];

/// Builds the sequence of [`Slice`]s to sweep for a given cache capacity.
pub struct SamplingPlanner {
    slices: Vec<Slice>,
}

impl SamplingPlanner {
    /// Builds a planner for `cache_num_ways`. Valid capacities are 3..=16,
    /// matching every case `generate_profiling_plan` handles.
    pub fn new(cache_num_ways: u32) -> Result<Self> {
        let table = PLAN_TABLE
            .iter()
            .find(|(ways, _)| *ways == cache_num_ways)
            .map(|(_, plan)| *plan)
            .ok_or(Error::InvalidWayCount {
                ways: cache_num_ways,
            })?;

        let slices = table
            .iter()
            .map(|&target_ways| build_slice(cache_num_ways, target_ways))
            .collect();

        Ok(Self { slices })
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn slice(&self, idx: usize) -> &Slice {
        &self.slices[idx]
    }

    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }
}

/// Splits `cache_num_ways` ways contiguously (target gets the low
/// `target_ways`, the co-runner gets the rest), then rewrites the split so
/// ways 10 and 11 never land in different partitions.
fn build_slice(cache_num_ways: u32, target_ways: u32) -> Slice {
    let target: Vec<u32> = (0..target_ways).collect();
    let co_runner: Vec<u32> = (target_ways..cache_num_ways).collect();

    let mut partitions = vec![target, co_runner];
    fix_cos_10_11_split(&mut partitions);
    let co_runner_partition = partitions.pop().unwrap();
    let target_partition = partitions.pop().unwrap();

    Slice {
        target_ways,
        target_partition,
        co_runner_partition,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_out_of_range_capacity() {
        assert!(SamplingPlanner::new(2).is_err());
        assert!(SamplingPlanner::new(17).is_err());
    }

    #[test]
    fn matches_known_table_for_six_ways() {
        let planner = SamplingPlanner::new(6).unwrap();
        let ways: Vec<u32> = planner.slices().iter().map(|s| s.target_ways).collect();
        assert_eq!(ways, vec![5, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn twelve_way_plan_keeps_ten_and_eleven_together_every_slice() {
        let planner = SamplingPlanner::new(12).unwrap();
        for slice in planner.slices() {
            let ten_in_target = slice.target_partition.contains(&10);
            let eleven_in_target = slice.target_partition.contains(&11);
            assert_eq!(
                ten_in_target, eleven_in_target,
                "ways 10 and 11 must always be co-located (slice target_ways={})",
                slice.target_ways
            );
        }
    }

    #[test]
    fn first_two_slices_of_twelve_way_plan_match_hardware_errata_override() {
        // Mirrors the original's explicit slice-0/1 override for a 12-way
        // cache: target ends up with ways 1..=11, co-runner with way 0.
        let planner = SamplingPlanner::new(12).unwrap();
        for idx in 0..2 {
            let slice = planner.slice(idx);
            let mut target = slice.target_partition.clone();
            target.sort_unstable();
            assert_eq!(target, (1..=11).collect::<Vec<u32>>());
            assert_eq!(slice.co_runner_partition, vec![0]);
        }
    }

    #[test]
    fn partition_covers_every_way_exactly_once() {
        for ways in 3..=16u32 {
            let planner = SamplingPlanner::new(ways).unwrap();
            for slice in planner.slices() {
                let mut all: Vec<u32> = slice
                    .target_partition
                    .iter()
                    .chain(slice.co_runner_partition.iter())
                    .copied()
                    .collect();
                all.sort_unstable();
                assert_eq!(all, (0..ways).collect::<Vec<u32>>());
            }
        }
    }
}
