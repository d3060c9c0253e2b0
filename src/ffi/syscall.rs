use std::fs::File;
use std::io::{Error, Result};
use std::os::fd::{AsRawFd, FromRawFd};

use super::Attr;

pub fn perf_event_open(attr: &Attr, pid: i32, cpu: i32, group_fd: i32, flags: u64) -> Result<File> {
    let num = libc::SYS_perf_event_open;
    let fd = unsafe { libc::syscall(num, attr, pid, cpu, group_fd, flags) };
    if fd != -1 {
        Ok(unsafe { File::from_raw_fd(fd as _) })
    } else {
        Err(Error::last_os_error())
    }
}

pub fn ioctl_arg(file: &File, op: u64, arg: u64) -> Result<i32> {
    let fd = file.as_raw_fd();
    let result = unsafe { libc::ioctl(fd, op as _, arg) };
    if result != -1 {
        Ok(result)
    } else {
        Err(Error::last_os_error())
    }
}

pub unsafe fn mmap<T>(
    ptr: *mut (),
    len: usize,
    prot: i32,
    flags: i32,
    file: &File,
    offset: i64,
) -> Result<*mut T> {
    let ptr = libc::mmap(ptr as _, len, prot, flags, file.as_raw_fd(), offset);
    if ptr != libc::MAP_FAILED {
        Ok(ptr as _)
    } else {
        Err(Error::last_os_error())
    }
}

pub unsafe fn munmap<T>(ptr: *mut T, len: usize) -> Result<()> {
    let result = libc::munmap(ptr as _, len);
    if result != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

/// `ptrace(2)` with an integer-valued `data` argument. Only wraps the
/// requests this crate issues (`SEIZE`, `CONT`, `LISTEN`, `DETACH`), all
/// of which return 0 on success and -1 on error; `PEEK*` requests, whose
/// return value overloads both data and error, are not wrapped here.
pub fn ptrace(request: i32, pid: i32, addr: u64, data: u64) -> Result<i64> {
    let result = unsafe { libc::ptrace(request as _, pid, addr, data) };
    if result != -1 {
        Ok(result)
    } else {
        Err(Error::last_os_error())
    }
}

pub fn waitpid(pid: i32, options: i32) -> Result<(i32, i32)> {
    let mut status = 0;
    let ret = unsafe { libc::waitpid(pid, &mut status, options) };
    if ret != -1 {
        Ok((ret, status))
    } else {
        Err(Error::last_os_error())
    }
}

pub fn tgkill(tgid: i32, tid: i32, sig: i32) -> Result<()> {
    let ret = unsafe { libc::syscall(libc::SYS_tgkill, tgid, tid, sig) };
    if ret == 0 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

/// Blocks every signal on the calling thread. Ported from `scan_array`'s
/// `sigfillset` + `pthread_sigmask(SIG_BLOCK, ...)`: a dummy filler
/// thread must never receive `SIGTHYME` or `SIGINT`.
pub fn block_all_signals() -> Result<()> {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut set);
        let ret = libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
        if ret == 0 {
            Ok(())
        } else {
            Err(Error::from_raw_os_error(ret))
        }
    }
}

/// Pins the calling thread to a single logical core via
/// `sched_setaffinity(2)`.
pub fn set_affinity(core: u32) -> Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core as usize, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret == 0 {
            Ok(())
        } else {
            Err(Error::last_os_error())
        }
    }
}
