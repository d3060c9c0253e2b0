//! Entry point: parses flags, discovers cache/core topology, attaches to
//! the target thread group, opens counter groups, installs the
//! `SIGTHYME`/`SIGINT` handlers, and drives the ptrace reaction loop
//! until every profiled thread has wound down.
//!
//! Ported from `main()`/`attach()`/`profile()` in
//! `datamime-profiler.cpp`. NUMA-node-0 core restriction (`numa_available`/
//! `numa_node_of_cpu`) is dropped: no pack sibling depends on a NUMA
//! crate, and `assignable_cores` here is simply every logical core
//! `sysconf` reports (see `DESIGN.md`).

use std::process::ExitCode;
use std::sync::atomic::Ordering;

use datamime_profiler::attach::{wait_any, Attacher, WaitAction};
use datamime_profiler::cache::bandwidth::{BandwidthMonitor, NullCmtBackend};
use datamime_profiler::cache::{CacheController, NullCatBackend};
use datamime_profiler::cli::RunConfig;
use datamime_profiler::coordinator::{self, Coordinator, ThreadRecord};
use datamime_profiler::counters::CounterSet;
use datamime_profiler::filler::FillerThread;
use datamime_profiler::logging;
use datamime_profiler::output::ThreadOutputs;
use datamime_profiler::plan::SamplingPlanner;
use datamime_profiler::Error;

/// Real-time signal used for PMU overflow delivery, ported verbatim
/// from `datamime-profiler.h`'s `constexpr int SIGTHYME = 37`.
const SIGTHYME: i32 = 37;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("datamime-profiler: {err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn run() -> datamime_profiler::Result<()> {
    let cache_line_size = sysconf_u32(libc::_SC_LEVEL3_CACHE_LINESIZE).unwrap_or(64);
    let num_logical_cores = sysconf_u32(libc::_SC_NPROCESSORS_CONF).unwrap_or(1);
    let cache_num_ways = sysconf_u32(libc::_SC_LEVEL3_CACHE_ASSOC).unwrap_or(0);

    let cfg = match RunConfig::parse_args(std::env::args_os()) {
        Ok(cfg) => cfg,
        Err((message, code)) => {
            eprintln!("{message}");
            std::process::exit(code);
        }
    };

    // Every core but the one the main thread and the filler thread sit
    // on is assignable to a profiled target: never more profiled threads
    // than assignable cores.
    let assignable_cores: usize = num_logical_cores as usize;
    cfg.validate_thread_count(assignable_cores)?;

    logging::init(&cfg.log_file_path(), cfg.debug)?;

    log::info!(
        "MRC estimation warmup period: {} M cycles",
        cfg.mrc_warmup_period
    );
    log::info!(
        "MRC estimation profile period: {} M cycles",
        cfg.mrc_profile_period
    );
    if cfg.mrc_est_mode {
        log::info!("MRC estimation mode enabled. Ignoring user-specified events list");
    }

    let mut cache = CacheController::new(NullCatBackend::new(4), cache_num_ways.max(1));
    let mut bandwidth = BandwidthMonitor::new(NullCmtBackend::default());
    if cfg.mrc_est_mode {
        cache.share_all(num_logical_cores)?;
    }

    let planner = SamplingPlanner::new(cache_num_ways.max(3).min(16))?;

    // One core per profiled thread, assigned in order; the remaining two
    // (filler + main) are claimed afterward.
    let mut next_core = 0u32;
    let mut threads = Vec::new();
    for (tidx, &tid) in cfg.profiled_tids.iter().enumerate() {
        Attacher::seize(tid)?;

        let core = next_core;
        next_core += 1;
        let rmid = tidx as u32 + 1;

        let counters = CounterSet::open(tid, cfg.phase_len, &cfg.events, SIGTHYME)?;
        let grouped = counters.is_grouped();
        let mut outputs = ThreadOutputs::create(&cfg.results_dir, &cfg.glob_outfile_name, tid, grouped)?;
        for group in counters.groups() {
            outputs.write_group_header(group.leader_fd(), group.event_names())?;
        }
        let bw_counter = bandwidth.init_counter(rmid);

        threads.push(ThreadRecord::new(
            tidx,
            tid,
            cfg.tgid,
            core,
            rmid,
            counters,
            bw_counter,
            outputs,
            planner.len(),
            cache_num_ways.max(1),
        ));

        if !cfg.mrc_est_mode {
            threads[tidx].counters.arm_active(
                datamime_profiler::counters::PHASES_BETWEEN_SWITCHES,
            )?;
        } else {
            threads[tidx]
                .counters
                .arm_active(datamime_profiler::counters::NO_ROTATION_REFRESH)?;
        }
    }

    // The filler claims the next core past every profiled thread and an
    // rmid one past the last profiled thread's, mirroring
    // `create_scan_threads`'s dummy `ThreadInfo` (`cores` popped from the
    // front of the assignable-cores list, `rmid = cur_tidx + 1`).
    let filler_core = next_core;
    let filler_rmid = cfg.profiled_tids.len() as u32 + 1;
    bandwidth.set_rmid(filler_core, filler_rmid)?;
    let filler = FillerThread::spawn(filler_core, filler_rmid)?;

    let coordinator = Coordinator::new(
        cfg.clone(),
        cache,
        bandwidth,
        filler,
        planner,
        threads,
        num_logical_cores,
        cache_num_ways.max(1),
        cache_line_size,
    );
    let coordinator: &'static mut coordinator::DefaultCoordinator = Box::leak(Box::new(coordinator));

    unsafe {
        coordinator::install_sigthyme_handler(coordinator, SIGTHYME)?;
    }
    let sigint_flag = coordinator::register_sigint_flag()?;

    let exit_result = attach_loop(coordinator, &sigint_flag);

    coordinator::uninstall_sigthyme_handler(SIGTHYME);
    log::info!("done!");
    exit_result
}

/// The `profile()` main loop: blocks on `waitpid`, classifies the result,
/// and reacts per [`datamime_profiler::attach::classify`]'s table,
/// checking the SIGINT flag and the coordinator's `done` flag between
/// events.
fn attach_loop(
    coordinator: &mut coordinator::DefaultCoordinator,
    sigint_flag: &std::sync::Arc<std::sync::atomic::AtomicBool>,
) -> datamime_profiler::Result<()> {
    loop {
        if sigint_flag.load(Ordering::Relaxed) {
            coordinator.handle_sigint()?;
            std::process::exit(2);
        }

        let (pid, status) = match wait_any() {
            Ok(result) => result,
            Err(Error::Io(ref io_err)) if io_err.raw_os_error() == Some(libc::ECHILD) => {
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let action = datamime_profiler::attach::classify(pid, status, coordinator.done());
        match action {
            WaitAction::Exited { pid } => {
                if let Some(tidx) = coordinator.tidx_for_tid(pid) {
                    coordinator.flush_thread(tidx)?;
                    coordinator.mark_dropped(tidx);
                }
                if coordinator.live_thread_count() == 0 {
                    return Ok(());
                }
            }
            WaitAction::ContinueNoSignal { pid } => {
                Attacher::cont(pid, 0)?;
            }
            WaitAction::Listen { pid } => {
                Attacher::listen(pid)?;
            }
            WaitAction::ContinueWithSignal { pid, signal } => {
                Attacher::cont(pid, signal)?;
            }
            WaitAction::Detach { pid } => {
                if let Some(tidx) = coordinator.tidx_for_tid(pid) {
                    coordinator.flush_thread(tidx)?;
                    coordinator.mark_dropped(tidx);
                }
                Attacher::detach(pid)?;
                if coordinator.live_thread_count() == 0 {
                    return Ok(());
                }
            }
            WaitAction::Signaled { pid, signal } => {
                Attacher::cont(pid, signal)?;
                if let Some(tidx) = coordinator.tidx_for_tid(pid) {
                    coordinator.mark_dropped(tidx);
                }
            }
            WaitAction::Unexpected { pid, status } => {
                return Err(Error::UnexpectedWaitStatus { pid, status });
            }
        }
    }
}

fn sysconf_u32(name: libc::c_int) -> Option<u32> {
    let value = unsafe { libc::sysconf(name) };
    if value < 0 {
        None
    } else {
        Some(value as u32)
    }
}

