//! Event-name resolution: turns the fixed permanent-event names and
//! user-supplied rotating-event names from `-e` into `perf_event_attr`
//! type/config pairs.
//!
//! Ported from `perf_setup_list_events`'s libpfm-backed name lookup. This
//! crate only needs a small, fixed vocabulary (the three permanent
//! events) plus a pass-through for raw PMU event codes, so it resolves
//! names itself instead of carrying a libpfm binding.

use crate::error::{Error, Result};
use crate::ffi::bindings as b;

/// A resolved PMU event: which `perf_event_attr.type` and `.config` to
/// program.
#[derive(Debug, Clone, Copy)]
pub struct EventSpec {
    pub ty: u32,
    pub config: u64,
}

/// `UNHALTED_REFERENCE_CYCLES`: the group leader, armed with a sample
/// period so it fires the overflow signal every phase.
pub const CLOCK_EVENT: &str = "UNHALTED_REFERENCE_CYCLES";

/// The two followers every group carries regardless of `-e`.
pub const PERMANENT_EVENTS: [&str; 2] = ["INST_RETIRED", "CPU_CLK_UNHALTED"];

/// Resolves an event name to a type/config pair.
///
/// Recognizes the three named hardware events used throughout this
/// crate, plus two raw-event syntaxes: `r<hex>` (a raw PMU event code,
/// the common `perf stat -e rNNN` convention) and a bare hex literal.
pub fn resolve(name: &str) -> Result<EventSpec> {
    match name {
        "UNHALTED_REFERENCE_CYCLES" => Ok(EventSpec {
            ty: b::PERF_TYPE_HARDWARE,
            config: b::PERF_COUNT_HW_REF_CPU_CYCLES,
        }),
        "INST_RETIRED" => Ok(EventSpec {
            ty: b::PERF_TYPE_HARDWARE,
            config: b::PERF_COUNT_HW_INSTRUCTIONS,
        }),
        "CPU_CLK_UNHALTED" => Ok(EventSpec {
            ty: b::PERF_TYPE_HARDWARE,
            config: b::PERF_COUNT_HW_CPU_CYCLES,
        }),
        other => parse_raw(other).ok_or_else(|| Error::UnknownEvent(other.to_string())),
    }
}

fn parse_raw(name: &str) -> Option<EventSpec> {
    let hex = name
        .strip_prefix("r0x")
        .or_else(|| name.strip_prefix("r"))
        .or_else(|| name.strip_prefix("0x"))?;
    let config = u64::from_str_radix(hex, 16).ok()?;
    Some(EventSpec {
        ty: b::PERF_TYPE_RAW,
        config,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resolves_named_hardware_events() {
        let clock = resolve(CLOCK_EVENT).unwrap();
        assert_eq!(clock.ty, b::PERF_TYPE_HARDWARE);
        assert_eq!(clock.config, b::PERF_COUNT_HW_REF_CPU_CYCLES);

        for name in PERMANENT_EVENTS {
            assert!(resolve(name).is_ok());
        }
    }

    #[test]
    fn resolves_raw_hex_events() {
        let spec = resolve("r412e").unwrap();
        assert_eq!(spec.ty, b::PERF_TYPE_RAW);
        assert_eq!(spec.config, 0x412e);
    }

    #[test]
    fn rejects_unknown_names() {
        assert!(matches!(resolve("NOT_A_REAL_EVENT"), Err(Error::UnknownEvent(_))));
    }
}
