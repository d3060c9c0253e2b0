use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Every error kind the profiler can raise, each carrying enough context
/// to log a useful message. `main` maps these to an exit code:
/// argument/init errors exit 1, everything else that reaches `main` as an
/// `Err` is a bug (the steady-state error kinds here are handled in place
/// by the coordinator and never propagate that far).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("argument error: {0}")]
    Argument(String),

    #[error("initialization failed: {0}")]
    Init(String),

    #[error("invalid cache way count {ways}: must be in 3..=16")]
    InvalidWayCount { ways: u32 },

    #[error("{profiled} profiled threads exceed {assignable} assignable cores minus filler and main")]
    TooManyThreads { profiled: usize, assignable: usize },

    #[error("perf_event_open failed for event {event:?}: {source}")]
    PerfOpen {
        event: String,
        #[source]
        source: io::Error,
    },

    #[error("unknown event {0:?}")]
    UnknownEvent(String),

    #[error("ring buffer produced an unexpected record type {0}")]
    UnexpectedRecordType(u32),

    #[error("waitpid returned an unexpected status for pid {pid}: {status:#x}")]
    UnexpectedWaitStatus { pid: i32, status: i32 },

    #[error("cache control backend does not support this operation: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// 1 for argument/init/library failures. 2 is reserved for the
    /// SIGINT path, which exits directly rather than unwinding through a
    /// `Result`.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Argument(_) => 1,
            _ => 1,
        }
    }
}
