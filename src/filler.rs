//! Dummy thread that keeps the co-runner's cache ways saturated.
//!
//! Ported from `datamime-profiler.cpp::scan_array`. The original gates
//! the scan loop with a `bool` behind a `std::mutex`; this uses an
//! `AtomicBool` instead since the gate is a single word read every
//! iteration and the mutex adds nothing a relaxed atomic doesn't already
//! give at this granularity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::ffi::syscall;

/// 32MB worth of 4-byte elements, matching `arrayElems = 32000*1024 /
/// sizeof(Elem)`.
const ARRAY_BYTES: usize = 32_000 * 1024;

#[repr(C, align(4))]
#[derive(Clone, Copy)]
struct Elem {
    val: i32,
}

/// Handle to a running filler thread. Dropping this does not stop the
/// thread; call [`FillerThread::stop`] and join explicitly during
/// shutdown.
pub struct FillerThread {
    core: u32,
    rmid: u32,
    enabled: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FillerThread {
    /// Spawns the scan thread pinned to `core` with its own `rmid`. It
    /// starts disabled (`enable()` must be called once the coordinator
    /// wants ways filled) and blocks every signal on entry so
    /// `SIGTHYME`/`SIGINT` are never delivered to it — posix threads
    /// inherit the spawning thread's mask, so this only matters if this is
    /// ever called after the coordinator installs its handlers. Mirrors
    /// `create_scan_threads`/the main setup loop's `sched_setaffinity` +
    /// `initCmt` pass over the dummy thread's `ThreadInfo`.
    pub fn spawn(core: u32, rmid: u32) -> std::io::Result<Self> {
        let enabled = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));

        let thread_enabled = Arc::clone(&enabled);
        let thread_running = Arc::clone(&running);

        let handle = std::thread::Builder::new()
            .name("datamime-filler".into())
            .spawn(move || {
                if let Err(err) = syscall::block_all_signals() {
                    log::error!("filler thread could not block signals: {err}");
                    return;
                }
                if let Err(err) = syscall::set_affinity(core) {
                    log::error!("filler thread could not pin to core {core}: {err}");
                    return;
                }
                run_scan_loop(&thread_enabled, &thread_running);
            })?;

        Ok(Self {
            core,
            rmid,
            enabled,
            running,
            handle: Some(handle),
        })
    }

    pub fn core(&self) -> u32 {
        self.core
    }

    pub fn rmid(&self) -> u32 {
        self.rmid
    }

    /// Starts (or resumes) scanning. Ported from the coordinator setting
    /// `enable_array_scans = true` when it kicks off a profiling run.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Pauses scanning without tearing down the thread.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Signals the loop to exit and joins the thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FillerThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_scan_loop(enabled: &AtomicBool, running: &AtomicBool) {
    let elems = ARRAY_BYTES / std::mem::size_of::<Elem>();
    let mut array = vec![Elem { val: 1 }; elems];

    while running.load(Ordering::Relaxed) {
        if enabled.load(Ordering::Relaxed) {
            for e in array.iter_mut() {
                e.val /= 5;
            }
        } else {
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn starts_disabled_and_toggles() {
        let filler = FillerThread::spawn(0, 1).unwrap();
        assert!(!filler.is_enabled());
        filler.enable();
        assert!(filler.is_enabled());
        filler.disable();
        assert!(!filler.is_enabled());
    }

    #[test]
    fn stop_joins_the_thread() {
        let mut filler = FillerThread::spawn(0, 1).unwrap();
        filler.enable();
        std::thread::sleep(Duration::from_millis(5));
        filler.stop();
        assert!(filler.handle.is_none());
    }
}
