//! Lock-free consumer side of a `perf_event_open` sample ring buffer.
//!
//! Adapted from Thaumy's `sample::rb::Rb` chunk-popping consumer, but
//! simplified to this crate's one fixed record shape: a
//! `PERF_RECORD_SAMPLE` built from `PERF_SAMPLE_READ | PERF_SAMPLE_TIME |
//! PERF_SAMPLE_CPU` with `PERF_FORMAT_GROUP`. One phase produces at most
//! one record (the leader's `wakeup_events` is 1), so unlike the general
//! ring buffer this only ever needs to pop a single chunk per read.

use std::ptr::copy_nonoverlapping;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::ffi::bindings::{perf_event_header, perf_event_mmap_page, PERF_RECORD_SAMPLE};

/// Raw fields read off one grouped-read overflow sample, before the
/// counter values are attributed to specific events.
pub struct RawSample {
    pub cpu: u32,
    pub nanoseconds: u64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub values: Vec<u64>,
}

/// The fixed-layout struct this crate's samples carry right after the
/// record header, matching `PERF_SAMPLE_TIME | PERF_SAMPLE_CPU |
/// PERF_SAMPLE_READ` with `PERF_FORMAT_GROUP` (no
/// `PERF_FORMAT_TOTAL_TIME_*` id field since this crate never needs
/// per-sibling ids, only the `PERF_FORMAT_GROUP` value array).
#[repr(C)]
struct SampleHeader {
    nanoseconds: u64,
    cpu: u32,
    reserved: u32,
    nr: u64,
    time_enabled: u64,
    time_running: u64,
}

/// Borrows a group leader's mmap'd ring buffer and pops samples from it.
pub struct RingBuffer<'a> {
    header: *const perf_event_mmap_page,
    data: &'a [u8],
}

impl<'a> RingBuffer<'a> {
    /// # Safety
    /// `mmap_base` must point at a live mapping of `(1 + pages) *
    /// page_size` bytes created over the group leader's fd, and must
    /// outlive this `RingBuffer`.
    pub unsafe fn new(mmap_base: *mut u8, page_size: usize, pages: usize) -> Self {
        let header = mmap_base as *const perf_event_mmap_page;
        let data_offset = (*header).data_offset as usize;
        let data_size = (*header).data_size as usize;
        let data = if data_size > 0 {
            std::slice::from_raw_parts(mmap_base.add(data_offset), data_size)
        } else {
            // Pre-data_offset kernels: the data region is every page after
            // the header page.
            std::slice::from_raw_parts(mmap_base.add(page_size), pages * page_size)
        };
        Self { header, data }
    }

    fn data_head(&self) -> &'a AtomicU64 {
        unsafe { &*(&(*self.header).data_head as *const u64 as *const AtomicU64) }
    }

    fn data_tail(&self) -> &'a AtomicU64 {
        unsafe { &*(&(*self.header).data_tail as *const u64 as *const AtomicU64) }
    }

    pub fn time_shift(&self) -> u16 {
        unsafe { (*self.header).time_shift }
    }

    pub fn time_mult(&self) -> u32 {
        unsafe { (*self.header).time_mult }
    }

    /// Pops the next available record. Returns `Ok(None)` if nothing is
    /// pending. Skips and warns on any record that is not
    /// `PERF_RECORD_SAMPLE` or whose size does not match this crate's
    /// fixed layout for `num_events` values.
    pub fn read_sample(&self, num_events: usize) -> Result<Option<RawSample>> {
        let size = self.data.len() as u64;
        let tail = self.data_tail().load(Ordering::Relaxed);
        let head = self.data_head().load(Ordering::Acquire);
        if tail == head {
            return Ok(None);
        }

        let header = self.read_header(tail, size);
        let record_len = header.size as u64;
        let payload = self.copy_range(tail + 8, record_len - 8, size);
        self.data_tail().store((tail + record_len) % size, Ordering::Release);

        if header.ty != PERF_RECORD_SAMPLE {
            log::warn!("unexpected ring buffer record type {}, skipping", header.ty);
            return Ok(None);
        }

        let sample_header_len = std::mem::size_of::<SampleHeader>();
        if payload.len() < sample_header_len {
            return Err(Error::UnexpectedRecordType(header.ty as u32));
        }
        let sh = unsafe { &*(payload.as_ptr() as *const SampleHeader) };
        if sh.nr as usize != num_events {
            return Err(Error::UnexpectedRecordType(header.ty as u32));
        }

        let mut values = Vec::with_capacity(num_events);
        let values_bytes = &payload[sample_header_len..];
        for chunk in values_bytes.chunks_exact(8).take(num_events) {
            values.push(u64::from_ne_bytes(chunk.try_into().unwrap()));
        }

        let consumed = sample_header_len + num_events * 8;
        if consumed < payload.len() {
            log::warn!("{} bytes of leftover sample data", payload.len() - consumed);
        }

        Ok(Some(RawSample {
            cpu: sh.cpu,
            nanoseconds: sh.nanoseconds,
            time_enabled: sh.time_enabled,
            time_running: sh.time_running,
            values,
        }))
    }

    fn read_header(&self, tail: u64, size: u64) -> perf_event_header {
        let bytes = self.copy_range(tail, 8, size);
        unsafe { *(bytes.as_ptr() as *const perf_event_header) }
    }

    /// Copies `len` bytes starting at `offset % size`, handling
    /// wraparound by splitting into two `copy_nonoverlapping` calls.
    fn copy_range(&self, offset: u64, len: u64, size: u64) -> Vec<u8> {
        let start = offset % size;
        let mut buf = vec![0u8; len as usize];
        let ptr = self.data.as_ptr();
        unsafe {
            if start + len <= size {
                copy_nonoverlapping(ptr.add(start as usize), buf.as_mut_ptr(), len as usize);
            } else {
                let first = (size - start) as usize;
                copy_nonoverlapping(ptr.add(start as usize), buf.as_mut_ptr(), first);
                copy_nonoverlapping(ptr, buf.as_mut_ptr().add(first), len as usize - first);
            }
        }
        buf
    }
}
