//! Owns a profiled thread's PMU counter groups: the permanent leader +
//! followers, any user-requested rotating events split greedily across
//! extra groups, and which group is currently active.
//!
//! Ported from `ThreadInfo::create_event_groups` (group construction and
//! the initial `PERF_EVENT_IOC_REFRESH` arm) and the group-rotation tail
//! of `read_counters`.

pub mod event;
pub mod group;
pub mod ring;

use std::collections::HashMap;

use crate::error::Result;
use event::{EventSpec, CLOCK_EVENT, PERMANENT_EVENTS};
use group::{CounterGroup, PendingEvent, MAX_GROUP_EVENTS};

/// Overflows the active group is armed for before rotating to the next
/// one, in non-MRC mode. Ported from `PHASES_BETWEEN_SWITCHES`.
pub const PHASES_BETWEEN_SWITCHES: i64 = 10;

/// Effectively-infinite overflow count used to arm the leader once in
/// MRC-estimation mode, where no rotation happens. Ported from the
/// `1L << 62` literal passed to `PERF_EVENT_IOC_REFRESH`.
pub const NO_ROTATION_REFRESH: i64 = 1 << 62;

fn resolve_all(names: &[String]) -> Vec<(String, EventSpec)> {
    names
        .iter()
        .filter_map(|name| match event::resolve(name) {
            Ok(spec) => Some((name.clone(), spec)),
            Err(err) => {
                log::warn!("dropping unresolvable event {name:?}: {err}");
                None
            }
        })
        .collect()
}

/// The set of counter groups owned by one profiled thread, and which one
/// is active right now.
pub struct CounterSet {
    groups: Vec<CounterGroup>,
    active: usize,
}

impl CounterSet {
    /// Builds every group for `tid`: one group carrying the leader and
    /// the two permanent followers, then as many more groups as needed to
    /// fit `rotating_events`, each holding up to [`MAX_GROUP_EVENTS`]
    /// events. In MRC-estimation mode `rotating_events` should be empty
    /// (§4.3: "in MRC-estimation mode no rotation occurs").
    pub fn open(
        tid: i32,
        phase_len: u64,
        rotating_events: &[String],
        sigthyme_signal: i32,
    ) -> Result<Self> {
        let clock = event::resolve(CLOCK_EVENT)?;
        let permanent = resolve_all(&PERMANENT_EVENTS.map(String::from));
        let rotating = resolve_all(rotating_events);

        let leader = PendingEvent {
            name: CLOCK_EVENT.to_string(),
            spec: clock,
        };
        let permanent_pending: Vec<PendingEvent> = permanent
            .into_iter()
            .map(|(name, spec)| PendingEvent { name, spec })
            .collect();

        let first_group =
            CounterGroup::open(tid, phase_len, leader, &permanent_pending, sigthyme_signal)?;
        let mut groups = vec![first_group];

        // Greedily fill groups with rotating events: try the most
        // recently opened group first, and only open a fresh one (with
        // its own leader + permanent followers) once that one is full.
        // Ported from `ThreadInfo::create_event_groups`'s
        // `event_group->add_event(...)` / fallback-to-new-`EventGroup`
        // loop.
        for (name, spec) in rotating {
            let pending = PendingEvent { name, spec };
            if !groups.last_mut().unwrap().add_event(pending.clone(), phase_len) {
                let retry_leader = PendingEvent {
                    name: CLOCK_EVENT.to_string(),
                    spec: clock,
                };
                let retry_permanent: Vec<PendingEvent> = PERMANENT_EVENTS
                    .iter()
                    .filter_map(|n| {
                        event::resolve(n).ok().map(|s| PendingEvent {
                            name: (*n).to_string(),
                            spec: s,
                        })
                    })
                    .collect();
                let mut fresh = CounterGroup::open(
                    tid,
                    phase_len,
                    retry_leader,
                    &retry_permanent,
                    sigthyme_signal,
                )?;
                fresh.add_event(pending, phase_len);
                groups.push(fresh);
            }
        }

        Ok(Self { groups, active: 0 })
    }

    pub fn active_group(&self) -> &CounterGroup {
        &self.groups[self.active]
    }

    pub fn active_leader_fd(&self) -> i32 {
        self.groups[self.active].leader_fd()
    }

    /// Arms the currently-active group. In MRC mode this is called once
    /// with [`NO_ROTATION_REFRESH`]; in rotating mode with
    /// [`PHASES_BETWEEN_SWITCHES`].
    pub fn arm_active(&self, count: i64) -> Result<()> {
        self.groups[self.active].refresh(count)
    }

    /// Rotates to the next group and re-arms it for
    /// [`PHASES_BETWEEN_SWITCHES`] more overflows. Ported from the tail
    /// of `read_counters`: `if (++group_it == end) group_it = begin()`.
    pub fn rotate(&mut self) -> Result<()> {
        if self.groups.len() <= 1 {
            return Ok(());
        }
        self.active = (self.active + 1) % self.groups.len();
        self.groups[self.active].refresh(PHASES_BETWEEN_SWITCHES)
    }

    /// Maps a group's leader fd back to its index, for dispatching a
    /// `SIGTHYME` delivery (`info->si_fd`) to the right group.
    pub fn group_for_fd(&self, fd: i32) -> Option<usize> {
        self.groups.iter().position(|g| g.leader_fd() == fd)
    }

    pub fn group(&self, idx: usize) -> &CounterGroup {
        &self.groups[idx]
    }

    pub fn groups(&self) -> &[CounterGroup] {
        &self.groups
    }

    pub fn is_grouped(&self) -> bool {
        self.groups.len() > 1
    }

    /// Every group's leader fd, for populating the coordinator-wide
    /// `fd -> tidx` table once at thread setup (ported from the
    /// original's global `fd_map`, which is populated per `EventGroup`
    /// regardless of which one is currently active).
    pub fn leader_fds(&self) -> impl Iterator<Item = i32> + '_ {
        self.groups.iter().map(|g| g.leader_fd())
    }

    /// Reads the one pending sample off the active group's ring buffer,
    /// if any. Ported from `read_counters`'s grouped-read sequence.
    pub fn read_active_sample(&self) -> Result<Option<ring::RawSample>> {
        let group = self.active_group();
        group.ring_buffer().read_sample(group.num_events())
    }
}

/// Per-fd lookup from a `SIGTHYME` handler's `si_fd` back to the owning
/// thread's tid, mirroring the original's global `fd_map`.
pub type FdToTid = HashMap<i32, i32>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn phase_constants_match_original() {
        assert_eq!(PHASES_BETWEEN_SWITCHES, 10);
        assert_eq!(NO_ROTATION_REFRESH, 1 << 62);
    }
}
