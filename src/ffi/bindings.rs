//! Hand-maintained subset of `<linux/perf_event.h>`.
//!
//! Generating this at build time with `bindgen` against vendored kernel
//! headers only pays off when a crate needs to track a wide kernel
//! compatibility matrix. This crate only ever opens one fixed shape of
//! counter group (leader + grouped siblings, `PERF_FORMAT_GROUP`,
//! overflow sampling with `PERF_SAMPLE_TIME | PERF_SAMPLE_CPU |
//! PERF_SAMPLE_READ`), so the constants below are pinned by hand instead.
#![allow(non_camel_case_types, non_upper_case_globals, dead_code)]

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_RAW: u32 = 4;

pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
pub const PERF_COUNT_HW_REF_CPU_CYCLES: u64 = 9;

pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_TIME: u64 = 1 << 2;
pub const PERF_SAMPLE_READ: u64 = 1 << 4;
pub const PERF_SAMPLE_CPU: u64 = 1 << 7;

pub const PERF_FORMAT_TOTAL_TIME_ENABLED: u64 = 1 << 0;
pub const PERF_FORMAT_TOTAL_TIME_RUNNING: u64 = 1 << 1;
pub const PERF_FORMAT_GROUP: u64 = 1 << 3;

pub const PERF_RECORD_SAMPLE: u32 = 9;

pub const PERF_FLAG_FD_CLOEXEC: u32 = 1 << 3;

// `_IO('$', n)`/`_IOW('$', n, u64)` expansions from
// `include/uapi/linux/perf_event.h`.
pub const PERF_EVENT_IOC_ENABLE: u64 = 0x2400;
pub const PERF_EVENT_IOC_DISABLE: u64 = 0x2401;
pub const PERF_EVENT_IOC_REFRESH: u64 = 0x2402;
pub const PERF_EVENT_IOC_RESET: u64 = 0x2403;
pub const PERF_EVENT_IOC_ID: u64 = 0x8008_2407;

/// Bit positions within `perf_event_attr`'s packed flag word.
///
/// Real bindgen output represents this as a bitfield struct; we keep a
/// single `u64` and named setters instead, since we only ever touch a
/// handful of these bits.
mod attr_flag {
    pub const DISABLED: u64 = 1 << 0;
    pub const INHERIT: u64 = 1 << 1;
    pub const PINNED: u64 = 1 << 2;
    pub const ENABLE_ON_EXEC: u64 = 1 << 12;
}

/// Mirrors `struct perf_event_attr` (the fields this crate populates;
/// reserved padding is zeroed by `Default`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct perf_event_attr {
    pub ty: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period_or_freq: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events_or_watermark: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub reserved_2: u16,
    pub aux_sample_size: u32,
    pub reserved_3: u32,
}

impl perf_event_attr {
    pub fn new(ty: u32, config: u64) -> Self {
        let mut attr = Self {
            ty,
            config,
            ..Default::default()
        };
        attr.size = size_of::<Self>() as u32;
        attr
    }

    pub fn set_disabled(&mut self, v: bool) -> &mut Self {
        self.set_flag(attr_flag::DISABLED, v)
    }

    pub fn set_inherit(&mut self, v: bool) -> &mut Self {
        self.set_flag(attr_flag::INHERIT, v)
    }

    pub fn set_pinned(&mut self, v: bool) -> &mut Self {
        self.set_flag(attr_flag::PINNED, v)
    }

    pub fn set_enable_on_exec(&mut self, v: bool) -> &mut Self {
        self.set_flag(attr_flag::ENABLE_ON_EXEC, v)
    }

    fn set_flag(&mut self, bit: u64, v: bool) -> &mut Self {
        if v {
            self.flags |= bit;
        } else {
            self.flags &= !bit;
        }
        self
    }

    pub fn set_sample_period(&mut self, period: u64) -> &mut Self {
        self.sample_period_or_freq = period;
        self
    }

    pub fn set_wakeup_events(&mut self, events: u32) -> &mut Self {
        self.wakeup_events_or_watermark = events;
        self
    }
}

/// The fixed header prepended to every ring-buffer record
/// (`struct perf_event_header`).
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct perf_event_header {
    pub ty: u32,
    pub misc: u16,
    pub size: u16,
}

/// The portion of `struct perf_event_mmap_page` this crate reads: the
/// lock-free ring-buffer head/tail and the data region bounds, plus the
/// TSC conversion fields used to recover an approximate cycle count from
/// a sample's nanosecond timestamp.
#[repr(C)]
pub struct perf_event_mmap_page {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub reserved_1: u32,
    pub time_cycles: u64,
    pub time_mask: u64,
    pub reserved: [u8; 928],
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_head: u64,
    pub aux_tail: u64,
    pub aux_offset: u64,
    pub aux_size: u64,
}
