use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Broad classes of [`Error`], used to decide how a caller recovers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before anything was applied, fix the call and retry.
    Config,
    /// Memory for metadata or the ring buffer could not be obtained.
    Allocation,
    /// The sampling engine dropped samples, the affected dump is invalid.
    DataLoss,
    /// Firmware or bus failure, only a device reset clears it.
    Unrecoverable,
    /// The operation does not apply to the current backend state.
    State,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("ring buffer count {0} is not a power of two")]
    NotPowerOfTwo(u32),
    #[error("raw dump is {actual} bytes, metadata expects {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("enable map, dump buffer and backend do not share the same metadata")]
    MetadataMismatch,
    #[error("{0} clock domains exceed the supported maximum")]
    TooManyClockDomains(u8),
    #[error("counter metadata has not been initialised")]
    NoMetadata,
    #[error("allocation failed: {0}")]
    Alloc(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The ring overflowed `overflows` times since the last read, the last
    /// time with the indices at `extract` and `insert`.
    #[error("samples lost, ring overflowed {overflows} times (extract {extract}, insert {insert})")]
    SamplesLost {
        extract: u32,
        insert: u32,
        overflows: u32,
    },
    #[error("backend is in an unrecoverable error state, reset required")]
    Unrecoverable,
    #[error("`{op}` is not valid in state {state}")]
    InvalidState { op: &'static str, state: &'static str },
    #[error("ring buffer has no free sample slot")]
    RingFull,
    #[error("extract index {extract} would pass insert index {insert}")]
    ExtractBeyondInsert { extract: u32, insert: u32 },
    #[error("no completed dump to read")]
    DumpNotReady,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotPowerOfTwo(_)
            | Error::SizeMismatch { .. }
            | Error::MetadataMismatch
            | Error::TooManyClockDomains(_)
            | Error::NoMetadata => ErrorKind::Config,
            Error::Alloc(_) | Error::Io(_) => ErrorKind::Allocation,
            Error::SamplesLost { .. } => ErrorKind::DataLoss,
            Error::Unrecoverable => ErrorKind::Unrecoverable,
            Error::InvalidState { .. }
            | Error::RingFull
            | Error::ExtractBeyondInsert { .. }
            | Error::DumpNotReady => ErrorKind::State,
        }
    }
}
