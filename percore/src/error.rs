use std::fmt;
use std::io;

use thiserror::Error;

/// Convenience alias used throughout the runtime core.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error taxonomy at the core boundary.
///
/// Everything a future can resolve with, a work item can marshal across
/// shards, or boot can fail with is one of these. Fatal errors abort the
/// process during boot; everything else is surfaced to a waiting future.
#[derive(Debug, Error)]
pub enum Error {
    /// OS error produced by a backend operation.
    #[error("system error: {0}")]
    System(#[from] io::Error),

    /// The destination shard stopped accepting work.
    #[error("request receiver is down")]
    RequestReceiverDown,

    /// Every request in a submitted batch failed admission.
    #[error("all requests failed")]
    AllRequestsFailed,

    /// The predecessor of a continuation was dropped before resolving.
    #[error("abandoned: promise was dropped before it was set")]
    Abandoned,

    /// A timed semaphore wait or an `IoIntent` ran past its deadline.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Configuration parsing failed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Unrecoverable boot or resource-topology failure.
    #[error(transparent)]
    Fatal(#[from] FatalError),

    /// A work item panicked on a remote shard; the payload is the panic
    /// message, re-raised on the originating shard.
    #[error("remote shard panicked: {0}")]
    RemotePanic(String),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }

    pub(crate) fn from_errno(errno: i32) -> Error {
        Error::System(io::Error::from_raw_os_error(errno))
    }
}

// Errors crossing a shard boundary must travel through a `Send` work item.
const _: () = static_assert_send::<Error>();
const fn static_assert_send<T: Send>() {}

/// Typed, positional configuration-parse failure.
///
/// `offset` is the byte position of the offending token inside `input`,
/// and `input` is the erroneous substring itself, not the whole document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("parse error at offset {offset}: {kind} in {input:?}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub offset: usize,
    pub input: String,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, offset: usize, input: impl Into<String>) -> ParseError {
        ParseError {
            kind,
            offset,
            input: input.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Not a number, or a number with trailing garbage.
    InvalidNumber,
    /// A size suffix other than K, M, G (or T for completeness).
    InvalidSuffix,
    /// A throughput field that must be non-zero was zero.
    ZeroRate,
    /// Two entries resolved to the same device id.
    DuplicateMountpoint,
    /// A top-level section other than `disks`.
    UnknownSection,
    /// Malformed cpuset expression.
    InvalidCpuSet,
    /// Structurally invalid document.
    Malformed,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParseErrorKind::InvalidNumber => "invalid number",
            ParseErrorKind::InvalidSuffix => "invalid size suffix",
            ParseErrorKind::ZeroRate => "throughput rate must be non-zero",
            ParseErrorKind::DuplicateMountpoint => "mountpoint already configured",
            ParseErrorKind::UnknownSection => "unsupported section",
            ParseErrorKind::InvalidCpuSet => "invalid cpuset",
            ParseErrorKind::Malformed => "malformed document",
        };
        f.write_str(s)
    }
}

/// Resource-topology impossibilities and unrecoverable allocation failures.
///
/// These terminate the shard (and with it the process) instead of being
/// surfaced to a future.
#[derive(Debug, Clone, Error)]
pub enum FatalError {
    #[error("bad cpuset: {0}")]
    BadCpuSet(String),

    #[error("cannot run with zero shards")]
    ZeroShards,

    #[error("requested memory {requested} exceeds available {available}")]
    ImpossibleMemory { requested: u64, available: u64 },

    #[error("insufficient physical memory")]
    InsufficientMemory,

    #[error("allocation failure with abort-on-failure enabled")]
    AllocationFailure,

    #[error("{0}")]
    Boot(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_carries_position_and_substring() {
        let err = ParseError::new(ParseErrorKind::InvalidSuffix, 3, "100X");
        assert_eq!(err.offset, 3);
        assert_eq!(err.input, "100X");
        let msg = err.to_string();
        assert!(msg.contains("offset 3"), "{msg}");
        assert!(msg.contains("100X"), "{msg}");
    }

    #[test]
    fn fatal_errors_are_recognized() {
        let err = Error::Fatal(FatalError::ZeroShards);
        assert!(err.is_fatal());
        assert!(!Error::DeadlineExceeded.is_fatal());
    }

    #[test]
    fn errno_round_trips() {
        let err = Error::from_errno(libc::EAGAIN);
        match err {
            Error::System(io) => assert_eq!(io.raw_os_error(), Some(libc::EAGAIN)),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
