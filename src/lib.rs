//! Online per-thread last-level-cache (LLC) profiler.
//!
//! Attaches to a running, unmodified multi-threaded workload and, for each
//! profiled thread, estimates two curves as functions of allocated cache
//! ways: a miss-rate curve (MPKI) and a throughput curve (IPC). It does
//! this by driving a [`plan::SamplingPlanner`] over [`cache::CacheController`]
//! allocations, synchronized with a phase-based PMU overflow stream
//! ([`counters::CounterGroup`]) delivered as asynchronous real-time
//! signals, while a [`filler::FillerThread`] keeps the co-runner's ways
//! saturated so the profiled thread only ever sees the ways it was
//! actually assigned. Samples are reduced into interpolated,
//! monotonicity-corrected curves by [`curve::CurveBuilder`].
//!
//! The entire state machine ([`coordinator::Coordinator`]) runs inside the
//! overflow signal handler; see its module docs for the concurrency model.

pub mod attach;
pub mod cache;
pub mod cli;
pub mod coordinator;
pub mod counters;
pub mod curve;
mod ffi;
pub mod filler;
pub mod logging;
pub mod output;
pub mod plan;

mod error;
pub use error::{Error, Result};
