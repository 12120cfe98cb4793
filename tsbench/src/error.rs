//! Error types of the benchmarking suite.

use std::time::Duration;

use thiserror::Error;

use crate::target::TargetError;

/// Errors that abort a generator, loader or benchmark run.
///
/// There is no recoverable tier: every variant is fatal to the run that produced it and is
/// propagated up to the command that started it.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O error while reading workload input or writing output.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A line of workload input could not be parsed.
    #[error("malformed input on line {line}: {reason}")]
    Malformed {
        /// 1-based line (or record) number within the input stream.
        line: u64,
        /// What was wrong with it.
        reason: String,
    },

    /// A query record could not be decoded from the binary stream.
    #[error("failed to decode query record {record}: {cause}")]
    Decode {
        /// 0-based record index within the stream.
        record: u64,
        /// The decoder's error.
        #[source]
        cause: bincode::error::DecodeError,
    },

    /// A query record could not be encoded.
    #[error("failed to encode query record: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// A random window was requested that does not fit the configured time range.
    #[error("window of {window:?} does not fit into a range of {span:?}")]
    WindowTooLarge {
        /// The requested window length.
        window: Duration,
        /// The length of the range it was drawn from.
        span: Duration,
    },

    /// A query shape asked for more distinct hosts than the simulated fleet has.
    #[error("cannot select {requested} distinct hosts from a fleet of {scale_var}")]
    TooManyHosts {
        /// Number of hosts the shape needs.
        requested: usize,
        /// Size of the simulated fleet.
        scale_var: usize,
    },

    /// A point without fields was handed to a serializer.
    #[error("point `{0}` has no fields")]
    EmptyPoint(String),

    /// The target system rejected or failed an operation.
    #[error("target error: {0}")]
    Target(#[from] TargetError),

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// A work queue was closed while the decode stage was still feeding it.
    #[error("work queue closed while items were still being dispatched")]
    QueueClosed,

    /// A worker, the decode stage or the stats task panicked.
    #[error("worker panicked: {0}")]
    WorkerPanicked(String),
}

impl From<figment::Error> for Error {
    fn from(error: figment::Error) -> Self {
        Error::Config(error.to_string())
    }
}

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
