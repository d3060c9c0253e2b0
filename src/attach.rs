//! Ptrace-mediated attach and the synchronous `waitpid` reaction table.
//! This is strictly the process-control half of the design: the
//! PMU overflow stream that drives the actual state machine is a
//! separate, asynchronous signal path owned by
//! [`crate::coordinator`] — this module only ever reacts to
//! `waitpid`-reported ptrace events on the main thread.
//!
//! Ported from `attach()` and the `profile()` main loop in
//! `datamime-profiler.cpp`.

use crate::error::{Error, Result};
use crate::ffi::syscall;

/// What to do in response to one `waitpid` result. Kept as a pure
/// classification ([`classify`]) separate from the
/// `ptrace`/bookkeeping side effects so the table itself is unit-testable
/// without a real traced process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitAction {
    /// Thread exited normally: drop it from the live set, flush its logs.
    Exited { pid: i32 },
    /// Group-stop with `SIGTRAP`: `PTRACE_CONT` with signal 0.
    ContinueNoSignal { pid: i32 },
    /// Any other group-stop: `PTRACE_LISTEN`.
    Listen { pid: i32 },
    /// An ordinary stop signal that isn't a group-stop: forward it with
    /// `PTRACE_CONT`.
    ContinueWithSignal { pid: i32, signal: i32 },
    /// `done == true` and this thread stopped (typically on the `SIGSTOP`
    /// the coordinator sent it): `PTRACE_DETACH`, flush, drop.
    Detach { pid: i32 },
    /// Thread was killed by a signal: forward the terminating signal with
    /// `PTRACE_CONT`, drop it.
    Signaled { pid: i32, signal: i32 },
    /// Anything else is an unexpected `waitpid` status — fatal.
    Unexpected { pid: i32, status: i32 },
}

/// Classifies one `waitpid` result into the action the coordinator's
/// attach loop should take, following the exact branch order from
/// `profile()`: exit is checked first (even during wind-down), then
/// non-`SIGSTOP` stop signals, then the `done` detach path, then
/// `WIFSIGNALED`.
pub fn classify(pid: i32, status: i32, done: bool) -> WaitAction {
    if libc::WIFEXITED(status) {
        return WaitAction::Exited { pid };
    }

    if libc::WIFSTOPPED(status) && libc::WSTOPSIG(status) != libc::SIGSTOP {
        let group_stop = (status >> 16) == libc::PTRACE_EVENT_STOP;
        return if group_stop {
            if libc::WSTOPSIG(status) == libc::SIGTRAP {
                WaitAction::ContinueNoSignal { pid }
            } else {
                WaitAction::Listen { pid }
            }
        } else {
            WaitAction::ContinueWithSignal {
                pid,
                signal: libc::WSTOPSIG(status),
            }
        };
    }

    if done {
        return WaitAction::Detach { pid };
    }

    if libc::WIFSIGNALED(status) {
        return WaitAction::Signaled {
            pid,
            signal: libc::WTERMSIG(status),
        };
    }

    WaitAction::Unexpected { pid, status }
}

/// Thin `ptrace`/`waitpid`/`tgkill` wrappers, in the same
/// `io::Result`-returning style as [`crate::ffi::syscall`]'s
/// `perf_event_open`/`ioctl`/`mmap` wrappers.
pub struct Attacher;

impl Attacher {
    /// `PTRACE_SEIZE`: attach without stopping the target.
    pub fn seize(tid: i32) -> Result<()> {
        syscall::ptrace(libc::PTRACE_SEIZE, tid, 0, 0).map_err(Error::Io)?;
        Ok(())
    }

    pub fn cont(pid: i32, signal: i32) -> Result<()> {
        syscall::ptrace(libc::PTRACE_CONT, pid, 0, signal as u64).map_err(Error::Io)?;
        Ok(())
    }

    pub fn listen(pid: i32) -> Result<()> {
        syscall::ptrace(libc::PTRACE_LISTEN, pid, 0, 0).map_err(Error::Io)?;
        Ok(())
    }

    pub fn detach(pid: i32) -> Result<()> {
        syscall::ptrace(libc::PTRACE_DETACH, pid, 0, 0).map_err(Error::Io)?;
        Ok(())
    }
}

/// Sends `signal` to `tid` within `tgid`, used to `SIGSTOP` the first
/// finished thread's siblings so they all converge on the detach path.
pub fn tgkill(tgid: i32, tid: i32, signal: i32) -> Result<()> {
    syscall::tgkill(tgid, tid, signal).map_err(Error::Io)
}

/// Blocks for the next ptrace event from any attached thread
/// (`waitpid(-1, __WALL | WSTOPPED)`).
pub fn wait_any() -> Result<(i32, i32)> {
    syscall::waitpid(-1, libc::__WALL | libc::WSTOPPED).map_err(Error::Io)
}

#[cfg(test)]
mod test {
    use super::*;

    fn exited(code: i32) -> i32 {
        code << 8
    }

    fn stopped(sig: i32) -> i32 {
        (sig << 8) | 0x7f
    }

    fn group_stopped(sig: i32) -> i32 {
        stopped(sig) | (i32::from(libc::PTRACE_EVENT_STOP) << 16)
    }

    fn signaled(sig: i32) -> i32 {
        sig
    }

    #[test]
    fn normal_exit_is_classified_even_during_winddown() {
        assert_eq!(classify(10, exited(0), false), WaitAction::Exited { pid: 10 });
        assert_eq!(classify(10, exited(0), true), WaitAction::Exited { pid: 10 });
    }

    #[test]
    fn group_stop_sigtrap_continues_with_no_signal() {
        let status = group_stopped(libc::SIGTRAP);
        assert_eq!(
            classify(11, status, false),
            WaitAction::ContinueNoSignal { pid: 11 }
        );
    }

    #[test]
    fn other_group_stop_listens() {
        let status = group_stopped(libc::SIGSTOP + 1);
        assert_eq!(classify(12, status, false), WaitAction::Listen { pid: 12 });
    }

    #[test]
    fn ordinary_stop_signal_is_forwarded() {
        let status = stopped(libc::SIGUSR1);
        assert_eq!(
            classify(13, status, false),
            WaitAction::ContinueWithSignal {
                pid: 13,
                signal: libc::SIGUSR1
            }
        );
    }

    #[test]
    fn sigstop_during_winddown_detaches() {
        let status = stopped(libc::SIGSTOP);
        assert_eq!(classify(14, status, true), WaitAction::Detach { pid: 14 });
    }

    #[test]
    fn signaled_termination_forwards_terminating_signal() {
        let status = signaled(libc::SIGKILL);
        assert_eq!(
            classify(15, status, false),
            WaitAction::Signaled {
                pid: 15,
                signal: libc::SIGKILL
            }
        );
    }
}
