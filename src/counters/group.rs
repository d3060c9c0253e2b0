//! One `perf_event_open` group: a leader plus its grouped siblings,
//! sharing one ring buffer.
//!
//! Ported from `EventGroup` (construction, `add_event`, the
//! `F_SETFL`/`F_SETSIG`/`F_SETOWN` async-signal setup). The fds are kept
//! as a flat `Vec<File>` rather than `Rc`-shared leader/sibling handles,
//! since this crate only ever needs one owner (the thread record).

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;

use crate::error::{Error, Result};
use crate::ffi::bindings as b;
use crate::ffi::syscall::{ioctl_arg, perf_event_open};
use crate::ffi::Attr;

use super::event::EventSpec;
use super::ring::RingBuffer;

pub const MAX_GROUP_EVENTS: usize = 6;
const PAGE_SIZE: usize = 4096;
const BUFFER_PAGES: usize = 1;

/// A named, resolved event still waiting to be opened as a group member.
#[derive(Clone)]
pub struct PendingEvent {
    pub name: String,
    pub spec: EventSpec,
}

fn build_attr(spec: EventSpec, is_leader: bool, phase_len: u64) -> Attr {
    let mut attr = b::perf_event_attr::new(spec.ty, spec.config);
    attr.set_disabled(is_leader);
    attr.set_pinned(is_leader);
    attr.set_wakeup_events(1);
    attr.sample_type = b::PERF_SAMPLE_READ | b::PERF_SAMPLE_TIME | b::PERF_SAMPLE_CPU;
    attr.set_sample_period(if is_leader { phase_len } else { 1u64 << 62 });
    if is_leader {
        attr.read_format =
            b::PERF_FORMAT_GROUP | b::PERF_FORMAT_TOTAL_TIME_ENABLED | b::PERF_FORMAT_TOTAL_TIME_RUNNING;
    }
    attr
}

/// One leader + up to `MAX_GROUP_EVENTS - 1` grouped followers, with the
/// leader's ring buffer mapped in and wired for `SIGTHYME` delivery.
pub struct CounterGroup {
    tid: i32,
    names: Vec<String>,
    fds: Vec<File>,
    mmap_base: *mut u8,
    mmap_len: usize,
}

// The mmap is only ever touched from the thread that owns this
// `CounterGroup`; it does not claim to be `Sync`.
unsafe impl Send for CounterGroup {}

impl CounterGroup {
    /// Opens the leader plus `followers` (permanent events first), maps
    /// its ring buffer, and arms `sigthyme_signal` for async delivery.
    pub fn open(
        tid: i32,
        phase_len: u64,
        leader: PendingEvent,
        followers: &[PendingEvent],
        sigthyme_signal: i32,
    ) -> Result<Self> {
        assert!(followers.len() + 1 <= MAX_GROUP_EVENTS);

        let leader_attr = build_attr(leader.spec, true, phase_len);
        let leader_fd = perf_event_open(&leader_attr, tid, -1, -1, 0).map_err(|source| {
            Error::PerfOpen {
                event: leader.name.clone(),
                source,
            }
        })?;

        let mut names = vec![leader.name];
        let mut fds = vec![leader_fd];

        for follower in followers {
            let attr = build_attr(follower.spec, false, phase_len);
            let fd = perf_event_open(&attr, tid, -1, fds[0].as_raw_fd(), 0).map_err(|source| {
                Error::PerfOpen {
                    event: follower.name.clone(),
                    source,
                }
            })?;
            names.push(follower.name.clone());
            fds.push(fd);
        }

        let mmap_len = (1 + BUFFER_PAGES) * PAGE_SIZE;
        let mmap_base = unsafe {
            crate::ffi::syscall::mmap::<u8>(
                std::ptr::null_mut(),
                mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                &fds[0],
                0,
            )
            .map_err(Error::Io)?
        };

        let leader_raw = fds[0].as_raw_fd();
        set_async_signal(leader_raw, sigthyme_signal)?;

        Ok(Self {
            tid,
            names,
            fds,
            mmap_base,
            mmap_len,
        })
    }

    pub fn tid(&self) -> i32 {
        self.tid
    }

    pub fn leader_fd(&self) -> i32 {
        self.fds[0].as_raw_fd()
    }

    pub fn num_events(&self) -> usize {
        self.fds.len()
    }

    pub fn event_names(&self) -> &[String] {
        &self.names
    }

    /// Adds one more grouped follower, if there's room. Mirrors
    /// `EventGroup::add_event`'s "drop the event and keep going" error
    /// policy (§7): a failed `perf_event_open` here does not abort the
    /// group, it just returns `false` so the caller can open a fresh
    /// group for this event instead.
    pub fn add_event(&mut self, event: PendingEvent, phase_len: u64) -> bool {
        if self.fds.len() >= MAX_GROUP_EVENTS {
            return false;
        }
        let attr = build_attr(event.spec, false, phase_len);
        match perf_event_open(&attr, self.tid, -1, self.fds[0].as_raw_fd(), 0) {
            Ok(fd) => {
                self.names.push(event.name);
                self.fds.push(fd);
                true
            }
            Err(err) => {
                log::warn!("could not open event {:?}: {err}", event.name);
                false
            }
        }
    }

    /// Re-arms the leader for `count` more overflows.
    /// `PERF_EVENT_IOC_REFRESH` implicitly enables a disabled group.
    pub fn refresh(&self, count: i64) -> Result<()> {
        ioctl_arg(&self.fds[0], b::PERF_EVENT_IOC_REFRESH, count as u64).map_err(Error::Io)?;
        Ok(())
    }

    /// # Safety
    /// Valid as long as `self` is alive; the returned borrow must not
    /// outlive it.
    pub fn ring_buffer(&self) -> RingBuffer<'_> {
        unsafe { RingBuffer::new(self.mmap_base, PAGE_SIZE, BUFFER_PAGES) }
    }
}

impl Drop for CounterGroup {
    fn drop(&mut self) {
        let _ = unsafe { crate::ffi::syscall::munmap(self.mmap_base, self.mmap_len) };
    }
}

/// `fcntl(F_SETFL, ... | O_ASYNC)` + `F_SETSIG` + `F_SETOWN`: routes the
/// leader's overflow notifications to this process as `sigthyme_signal`.
fn set_async_signal(fd: i32, sigthyme_signal: i32) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags == -1 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_ASYNC) == -1 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        if libc::fcntl(fd, libc::F_SETSIG, sigthyme_signal) == -1 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        if libc::fcntl(fd, libc::F_SETOWN, libc::getpid()) == -1 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
    }
    Ok(())
}
