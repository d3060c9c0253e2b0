//! The signal-driven state machine: every overflow of a thread's active
//! [`crate::counters::CounterSet`] leader re-enters
//! [`Coordinator::on_overflow`], which is the *only* mutator of
//! coordinator state. Everything it needs to decide what to do next is a
//! pure function of `(phase counter, current target, slice index,
//! per-target status row)`; those decisions are factored out into the
//! free functions at the bottom of this module so they are unit-testable
//! without a real PMU or traced process.
//!
//! Ported from `sigthyme_handler` in `datamime-profiler.cpp`. A detail
//! easy to miss reading spec.md alone, confirmed against the original:
//! the entire cache-allocation sweep (planner, `CacheController`,
//! `FillerThread`, `CurveBuilder`) is gated on MRC-estimation mode
//! (`-m`). Outside of it, overflows still rotate counter groups and
//! write the raw per-sample log, but the way-allocation sweep never
//! runs — the tool is just collecting the user's rotating events.

use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::cache::bandwidth::{BandwidthCounter, BandwidthMonitor, CmtBackend, NullCmtBackend};
use crate::cache::{CacheController, CatBackend, NullCatBackend};
use crate::cli::RunConfig;
use crate::counters::CounterSet;
use crate::curve::{enforce_monotonic, CurveBuilder, CurveHistory, SampleOutcome};
use crate::error::{Error, Result};
use crate::filler::FillerThread;
use crate::output::{CounterRow, ThreadOutputs};
use crate::plan::SamplingPlanner;

/// `monitorLen` in the original is set to 1 on every observed code path,
/// so it is kept here as a hard constant rather than a configurable
/// field.
pub const MONITOR_LEN: u64 = 1;

/// How many historical curve estimates are averaged into the running
/// `mrcAvg`/`ipcAvg` exposed per thread.
pub const HIST_WINDOW_LENGTH: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleStatus {
    /// Collected cleanly this phase (`currentlySampling[.., 1] == 0`).
    Collected,
    /// Applied but not yet sampled (`== 1`).
    Pending,
    /// Counter glitch, discarded (`== 5`).
    Error,
}

#[derive(Debug, Clone, Copy)]
pub struct SamplingRow {
    pub ways: u32,
    pub status: SampleStatus,
}

impl Default for SamplingRow {
    fn default() -> Self {
        Self {
            ways: 0,
            status: SampleStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    WarmupLong,
    Sampling,
    WarmupProfile,
    Done,
}

/// Everything the coordinator owns per profiled thread.
pub struct ThreadRecord {
    pub tidx: usize,
    pub tid: i32,
    pub tgid: i32,
    pub core: u32,
    pub rmid: u32,
    pub counters: CounterSet,
    pub phases: u64,
    pub phases_with_current_group: u64,
    pub bandwidth: BandwidthCounter,
    last_instr: f64,
    last_cycles: f64,
    last_mem_traffic: f64,
    curve: CurveBuilder,
    history: CurveHistory,
    pub outputs: ThreadOutputs,
    pub sampling: SamplingRow,
    pub alive: bool,
}

impl ThreadRecord {
    pub fn new(
        tidx: usize,
        tid: i32,
        tgid: i32,
        core: u32,
        rmid: u32,
        counters: CounterSet,
        bandwidth: BandwidthCounter,
        outputs: ThreadOutputs,
        num_slices: usize,
        cache_num_ways: u32,
    ) -> Self {
        Self {
            tidx,
            tid,
            tgid,
            core,
            rmid,
            counters,
            phases: 0,
            phases_with_current_group: 0,
            bandwidth,
            last_instr: 0.0,
            last_cycles: 0.0,
            last_mem_traffic: 0.0,
            curve: CurveBuilder::new(num_slices, cache_num_ways),
            history: CurveHistory::new(HIST_WINDOW_LENGTH),
            outputs,
            sampling: SamplingRow::default(),
            alive: true,
        }
    }

    /// Mean curve over the last [`HIST_WINDOW_LENGTH`] emissions, if any
    /// have completed yet.
    pub fn averaged_curves(&self) -> Option<(Vec<f64>, Vec<f64>)> {
        self.history.average()
    }
}

/// The decision made at a SAMPLING-state overflow for the active target,
/// factored out of [`Coordinator::step`] so it is testable without a
/// real `CounterSet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Re-arm for the next slice and keep sampling this target.
    ApplyNextSlice { slice_idx: usize },
    /// This was the last slice and it collected cleanly: emit the curve,
    /// then move to the next target.
    EmitAndAdvance,
    /// A counter glitch (or any other non-collected status): discard
    /// this target's round and move to the next target without emitting.
    AbortAndAdvance,
}

/// Pure decision table for what happens after one SAMPLING-state sample
/// is folded into the curve.
pub fn next_step(slice_idx: usize, num_slices: usize, status: SampleStatus) -> NextStep {
    if status == SampleStatus::Error {
        return NextStep::AbortAndAdvance;
    }
    if slice_idx >= num_slices {
        NextStep::EmitAndAdvance
    } else {
        NextStep::ApplyNextSlice { slice_idx }
    }
}

/// Whether the warmup gate should fire this phase, during either
/// WARMUP_LONG or WARMUP_PROFILE: `phase % interval == 0 && phase <
/// num_phases`.
pub fn warmup_transition_due(phase: u64, interval: u64, num_phases: u64) -> bool {
    interval != 0 && phase % interval == 0 && phase < num_phases
}

/// Advances to the next target thread, wrapping around to 0 and
/// reporting whether a full round over every thread just completed.
pub fn advance_target(current: usize, num_threads: usize) -> (usize, bool) {
    let next = current + 1;
    if next >= num_threads {
        (0, true)
    } else {
        (next, false)
    }
}

fn way_bitmask(indices: &[u32]) -> u32 {
    indices.iter().fold(0u32, |mask, &w| mask | (1 << w))
}

/// The signal-driven controller. Generic over the CAT/CMT hardware
/// backend so it can run against [`NullCatBackend`]/[`NullCmtBackend`]
/// in tests; [`DefaultCoordinator`] fixes both to those null backends,
/// since driving real CAT/CMT hardware needs a documented MSR/resctrl
/// stub rather than a portable software path (see `cache` module docs).
pub struct Coordinator<B: CatBackend, C: CmtBackend> {
    cfg: RunConfig,
    cache: CacheController<B>,
    bandwidth: BandwidthMonitor<C>,
    filler: FillerThread,
    planner: SamplingPlanner,
    threads: Vec<ThreadRecord>,
    fd_to_tidx: HashMap<i32, usize>,
    num_logical_cores: u32,
    cache_num_ways: u32,
    cache_line_size: f64,
    phase: Phase,
    current_target_tidx: usize,
    slice_idx: usize,
    monitoring: bool,
    first_invocation: bool,
    done: bool,
    first_finished_tid: Option<i32>,
    mrc_invoke_monitor_len: u64,
}

impl<B: CatBackend, C: CmtBackend> Coordinator<B, C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: RunConfig,
        cache: CacheController<B>,
        bandwidth: BandwidthMonitor<C>,
        filler: FillerThread,
        planner: SamplingPlanner,
        threads: Vec<ThreadRecord>,
        num_logical_cores: u32,
        cache_num_ways: u32,
        cache_line_size: u32,
    ) -> Self {
        let mut fd_to_tidx = HashMap::new();
        for thread in &threads {
            for fd in thread.counters.leader_fds() {
                fd_to_tidx.insert(fd, thread.tidx);
            }
        }

        let mrc_invoke_monitor_len = cfg.mrc_warmup_interval();

        Self {
            cfg,
            cache,
            bandwidth,
            filler,
            planner,
            threads,
            fd_to_tidx,
            num_logical_cores,
            cache_num_ways,
            cache_line_size: cache_line_size as f64,
            phase: Phase::WarmupLong,
            current_target_tidx: 0,
            slice_idx: 0,
            monitoring: false,
            first_invocation: true,
            done: false,
            first_finished_tid: None,
            mrc_invoke_monitor_len,
        }
    }

    pub fn done(&self) -> bool {
        self.done
    }

    pub fn first_finished_tid(&self) -> Option<i32> {
        self.first_finished_tid
    }

    pub fn tidx_for_tid(&self, tid: i32) -> Option<usize> {
        self.threads.iter().position(|t| t.tid == tid)
    }

    pub fn thread(&self, tidx: usize) -> &ThreadRecord {
        &self.threads[tidx]
    }

    pub fn mark_dropped(&mut self, tidx: usize) {
        self.threads[tidx].alive = false;
    }

    pub fn live_thread_count(&self) -> usize {
        self.threads.iter().filter(|t| t.alive).count()
    }

    pub fn flush_thread(&mut self, tidx: usize) -> Result<()> {
        self.threads[tidx].outputs.flush().map_err(Error::Io)
    }

    /// Every other profiled thread's (tgid, tid), used to `SIGSTOP` them
    /// once the first thread finishes.
    pub fn other_tids(&self, tidx: usize) -> Vec<(i32, i32)> {
        self.threads
            .iter()
            .enumerate()
            .filter(|(i, t)| *i != tidx && t.alive)
            .map(|(_, t)| (t.tgid, t.tid))
            .collect()
    }

    /// `fini_handler`/SIGINT path: releases every core back to a single
    /// shared class-of-service. The caller is responsible for exiting
    /// with code 2 afterward.
    pub fn handle_sigint(&mut self) -> Result<()> {
        self.cache.share_all(self.num_logical_cores)?;
        for thread in &mut self.threads {
            let _ = thread.outputs.flush();
        }
        Ok(())
    }

    /// The signal handler body: all counter reading, state-machine
    /// advance, plan application, and curve construction execute inside
    /// it. `fd` is the overflowing leader's fd (`info->si_fd`).
    pub fn on_overflow(&mut self, fd: i32) -> Result<()> {
        let Some(&tidx) = self.fd_to_tidx.get(&fd) else {
            return Ok(());
        };
        self.step(tidx, fd)
    }

    fn step(&mut self, tidx: usize, fd: i32) -> Result<()> {
        let sample = self.threads[tidx].counters.read_active_sample()?;

        let rmid = self.threads[tidx].rmid;
        let mem_total = self
            .bandwidth
            .update_mem_traffic(rmid, &mut self.threads[tidx].bandwidth) as f64;
        let llc_occupancy = self.bandwidth.llc_occupancy(rmid);

        self.threads[tidx].phases += 1;
        self.threads[tidx].phases_with_current_group += 1;

        let (instr, cycles) = match &sample {
            Some(s) if s.values.len() >= 3 => (s.values[1] as f64, s.values[2] as f64),
            _ => (self.threads[tidx].last_instr, self.threads[tidx].last_cycles),
        };

        if self.cfg.mrc_est_mode {
            match self.phase {
                Phase::WarmupLong | Phase::WarmupProfile => {
                    self.handle_warmup(tidx, instr, cycles, mem_total)?;
                }
                Phase::Sampling => {
                    self.handle_sampling(tidx, instr, cycles, mem_total)?;
                }
                Phase::Done => {}
            }
        }

        if let Some(raw) = &sample {
            let group_idx = self.threads[tidx].counters.group_for_fd(fd).unwrap_or(0);
            let group_fd = self.threads[tidx].counters.group(group_idx).leader_fd();
            let tid = self.threads[tidx].tid;
            self.threads[tidx]
                .outputs
                .write_counter_row(&CounterRow {
                    group_fd,
                    cpu: raw.cpu,
                    tid,
                    nanoseconds: raw.nanoseconds,
                    tsc: raw.nanoseconds,
                    time_enabled: raw.time_enabled,
                    time_running: raw.time_running,
                    mem_traffic_total: mem_total as u64,
                    llc_occupancy,
                    values: &raw.values,
                })
                .map_err(Error::Io)?;
        }

        if self.threads[tidx].phases_with_current_group >= crate::counters::PHASES_BETWEEN_SWITCHES as u64
            && !self.cfg.mrc_est_mode
        {
            self.threads[tidx].phases_with_current_group = 0;
            self.threads[tidx].counters.rotate()?;
        }

        if tidx == 0 && self.threads[0].phases >= self.cfg.num_phases {
            self.done = true;
            if self.first_finished_tid.is_none() {
                let tgid = self.threads[0].tgid;
                let tid = self.threads[0].tid;
                self.first_finished_tid = Some(tid);
                crate::attach::tgkill(tgid, tid, libc::SIGSTOP)?;
            }
        }

        Ok(())
    }

    fn handle_warmup(&mut self, tidx: usize, instr: f64, cycles: f64, mem_total: f64) -> Result<()> {
        if self.threads[tidx].phases > 1 {
            self.snapshot(tidx, instr, cycles, mem_total);
        }
        if tidx != 0 {
            return Ok(());
        }

        let phase = self.threads[0].phases;
        if !warmup_transition_due(phase, self.mrc_invoke_monitor_len, self.cfg.num_phases) {
            return Ok(());
        }

        self.snapshot(tidx, instr, cycles, mem_total);

        if self.first_invocation {
            self.mrc_invoke_monitor_len = self.cfg.mrc_profile_interval();
            self.first_invocation = false;
        }

        self.filler.enable();
        self.monitoring = true;
        self.slice_idx = 0;
        self.apply_slice(self.current_target_tidx, 0, true)?;
        self.slice_idx = 1;
        self.phase = Phase::Sampling;
        Ok(())
    }

    fn handle_sampling(&mut self, tidx: usize, instr: f64, cycles: f64, mem_total: f64) -> Result<()> {
        if tidx != self.current_target_tidx {
            return Ok(());
        }
        if self.threads[tidx].phases % MONITOR_LEN != 0 {
            return Ok(());
        }

        let ways_held = self.threads[tidx].sampling.ways;
        let last_instr = self.threads[tidx].last_instr;
        let last_cycles = self.threads[tidx].last_cycles;
        let last_mem = self.threads[tidx].last_mem_traffic;

        let outcome = self.threads[tidx].curve.record(
            self.slice_idx - 1,
            ways_held,
            instr - last_instr,
            cycles - last_cycles,
            mem_total - last_mem,
            self.cache_line_size,
        );
        self.snapshot(tidx, instr, cycles, mem_total);

        self.threads[tidx].sampling.status = match outcome {
            SampleOutcome::Collected => SampleStatus::Collected,
            SampleOutcome::CounterGlitch => SampleStatus::Error,
        };

        let num_slices = self.planner.len();
        match next_step(self.slice_idx, num_slices, self.threads[tidx].sampling.status) {
            NextStep::ApplyNextSlice { slice_idx } => {
                self.apply_slice(self.current_target_tidx, slice_idx, false)?;
                self.slice_idx = slice_idx + 1;
            }
            NextStep::EmitAndAdvance => {
                self.emit_curve(tidx);
                self.finish_round()?;
            }
            NextStep::AbortAndAdvance => {
                self.finish_round()?;
            }
        }
        Ok(())
    }

    fn finish_round(&mut self) -> Result<()> {
        self.slice_idx = 0;
        let (next, round_complete) = advance_target(self.current_target_tidx, self.threads.len());
        self.current_target_tidx = next;
        if round_complete {
            self.filler.disable();
            self.cache.share_all(self.num_logical_cores)?;
            self.monitoring = false;
            self.phase = Phase::WarmupProfile;
        }
        Ok(())
    }

    fn snapshot(&mut self, tidx: usize, instr: f64, cycles: f64, mem_total: f64) {
        let t = &mut self.threads[tidx];
        t.last_instr = instr;
        t.last_cycles = cycles;
        t.last_mem_traffic = mem_total;
    }

    /// Applies one plan slice: programs the target's/co-runner's
    /// bitmasks, binds every core accordingly, and updates
    /// `currentlySampling` rows. `reset_curve` is true only
    /// for the first slice of a round (ported from
    /// `generate_profiling_plan` zeroing `xPoints`/`yPoints_*` per
    /// thread; here that happens once per round rather than once at
    /// startup, since `CurveBuilder` is reused across rounds).
    fn apply_slice(&mut self, target_tidx: usize, slice_idx: usize, reset_curve: bool) -> Result<()> {
        let slice = self.planner.slice(slice_idx).clone();
        let target_mask = way_bitmask(&slice.target_partition);
        let co_runner_mask = way_bitmask(&slice.co_runner_partition);

        const TARGET_COS: u32 = 1;
        const CO_RUNNER_COS: u32 = 2;

        self.cache.set_cbm(TARGET_COS, target_mask)?;
        self.cache.set_cbm(CO_RUNNER_COS, co_runner_mask)?;
        self.cache.set_cos(self.threads[target_tidx].core, TARGET_COS)?;

        for (i, thread) in self.threads.iter().enumerate() {
            if i != target_tidx {
                self.cache.set_cos(thread.core, CO_RUNNER_COS)?;
            }
        }
        self.cache.set_cos(self.filler.core(), CO_RUNNER_COS)?;

        if reset_curve {
            let num_slices = self.planner.len();
            self.threads[target_tidx].curve = CurveBuilder::new(num_slices, self.cache_num_ways);
        }

        for (i, thread) in self.threads.iter_mut().enumerate() {
            thread.sampling.status = SampleStatus::Pending;
            if i == target_tidx {
                thread.sampling.ways = slice.target_ways;
            }
        }

        Ok(())
    }

    fn emit_curve(&mut self, tidx: usize) {
        let (mpki, ipc) = self.threads[tidx].curve.interpolate();
        self.threads[tidx].history.push(mpki, ipc);

        // Each (mpki, ipc) pair came from the same round's `interpolate()`
        // call, so monotonicity must be corrected on the matching pair, not
        // independently per file.
        let mut mpki_columns = Vec::new();
        let mut ipc_columns = Vec::new();
        for (m, i) in self.threads[tidx]
            .history
            .mpki_columns()
            .iter()
            .zip(self.threads[tidx].history.ipc_columns().iter())
        {
            let mut m = m.clone();
            let mut i = i.clone();
            enforce_monotonic(&mut m, &mut i);
            mpki_columns.push(m);
            ipc_columns.push(i);
        }

        let _ = self.threads[tidx].outputs.write_mrc_curves(&mpki_columns);
        let _ = self.threads[tidx].outputs.write_ipc_curves(&ipc_columns);
    }
}

/// The concrete coordinator type main() drives: real CAT/CMT MSR access
/// is stubbed, so the process-wide instance runs against the in-memory
/// null backends, which still exercise every piece of control flow in
/// this module.
pub type DefaultCoordinator = Coordinator<NullCatBackend, NullCmtBackend>;

static COORDINATOR_PTR: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Installs the `SIGTHYME` handler, pointing it at `coordinator`. Ported
/// from the `fcntl`/`sigaction` setup spread across `EventGroup`'s
/// constructor and `main()`; centralized here since this crate installs
/// one process-wide handler rather than one per fd.
///
/// # Safety
/// `coordinator` must remain valid for as long as the handler might
/// fire; callers should `Box::leak` it and call
/// [`uninstall_sigthyme_handler`] before the process considers it free.
pub unsafe fn install_sigthyme_handler(coordinator: &'static mut DefaultCoordinator, signum: i32) -> Result<()> {
    COORDINATOR_PTR.store(coordinator as *mut DefaultCoordinator as *mut (), Ordering::SeqCst);

    let action = libc::sigaction {
        sa_sigaction: sigthyme_trampoline as usize,
        sa_mask: std::mem::zeroed(),
        sa_flags: libc::SA_SIGINFO,
        sa_restorer: None,
    };
    if libc::sigaction(signum, &action, ptr::null_mut()) != 0 {
        return Err(Error::Init("sigaction(SIGTHYME) failed".into()));
    }
    Ok(())
}

/// Restores the default disposition for `signum` and clears the stored
/// coordinator pointer. Must be called before the coordinator is
/// dropped.
pub fn uninstall_sigthyme_handler(signum: i32) {
    unsafe {
        let action = libc::sigaction {
            sa_sigaction: libc::SIG_DFL,
            sa_mask: std::mem::zeroed(),
            sa_flags: 0,
            sa_restorer: None,
        };
        libc::sigaction(signum, &action, ptr::null_mut());
    }
    COORDINATOR_PTR.store(ptr::null_mut(), Ordering::SeqCst);
}

extern "C" fn sigthyme_trampoline(_signum: i32, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let ptr = COORDINATOR_PTR.load(Ordering::SeqCst);
    if ptr.is_null() || info.is_null() {
        return;
    }
    let coordinator = unsafe { &mut *(ptr as *mut DefaultCoordinator) };
    let fd = unsafe { si_fd(&*info) };
    if let Err(err) = coordinator.on_overflow(fd) {
        log::error!("sigthyme handler error: {err}");
    }
}

/// Extracts `si_fd` from a `POLL_IN`-style `siginfo_t`, as delivered for
/// an `F_SETSIG`-armed perf-event fd. `libc::siginfo_t` does not
/// expose this union member on Linux (its layout is signal-class
/// specific), so this reads the kernel's fixed `_sigpoll` branch
/// directly: a `long si_band` at offset 16 (after the three leading
/// `int` fields, padded to 8-byte alignment), immediately followed by
/// the 4-byte `si_fd`.
unsafe fn si_fd(info: &libc::siginfo_t) -> i32 {
    const SI_BAND_OFFSET: isize = 16;
    const SI_FD_OFFSET: isize = SI_BAND_OFFSET + 8;
    let base = info as *const libc::siginfo_t as *const u8;
    *(base.offset(SI_FD_OFFSET) as *const i32)
}

/// Registers the SIGINT flag used by `main`'s top-level loop to detect
/// the user-initiated abort path. Uses `signal_hook`'s coarse flag
/// registration rather than a raw `sigaction`, since unlike `SIGTHYME`
/// this needs no `siginfo_t` payload.
pub fn register_sigint_flag() -> Result<Arc<std::sync::atomic::AtomicBool>> {
    let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    signal_hook::flag::register(libc::SIGINT, Arc::clone(&flag)).map_err(Error::Io)?;
    Ok(flag)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn next_step_applies_next_slice_when_not_at_plan_end() {
        assert_eq!(
            next_step(2, 7, SampleStatus::Collected),
            NextStep::ApplyNextSlice { slice_idx: 2 }
        );
    }

    #[test]
    fn next_step_emits_at_plan_end_when_clean() {
        assert_eq!(next_step(7, 7, SampleStatus::Collected), NextStep::EmitAndAdvance);
    }

    #[test]
    fn next_step_aborts_on_error_regardless_of_slice_position() {
        assert_eq!(next_step(3, 7, SampleStatus::Error), NextStep::AbortAndAdvance);
        assert_eq!(next_step(7, 7, SampleStatus::Error), NextStep::AbortAndAdvance);
    }

    #[test]
    fn warmup_transition_requires_exact_multiple_and_budget_remaining() {
        assert!(warmup_transition_due(10, 10, 100));
        assert!(!warmup_transition_due(11, 10, 100));
        assert!(!warmup_transition_due(100, 10, 100)); // phase < num_phases fails
        assert!(!warmup_transition_due(10, 0, 100)); // guard against div-by-zero interval
    }

    #[test]
    fn advance_target_wraps_and_reports_round_completion() {
        assert_eq!(advance_target(0, 3), (1, false));
        assert_eq!(advance_target(1, 3), (2, false));
        assert_eq!(advance_target(2, 3), (0, true));
    }

    #[test]
    fn way_bitmask_covers_exactly_the_given_indices() {
        assert_eq!(way_bitmask(&[0, 1, 2]), 0b111);
        assert_eq!(way_bitmask(&[10, 11]), 0b1100_0000_0000);
        assert_eq!(way_bitmask(&[]), 0);
    }
}
