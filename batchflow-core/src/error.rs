//! Error types for batch preprocessing pipelines

use std::fmt;

use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error category, used to decide whether a failure is retryable
/// and to map errors onto status codes at the C boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed graph, bad parameters, or a feed that violates a slot contract
    Configuration,

    /// API called out of order (output before prefetch, double release, ...)
    Sequencing,

    /// An operator failed while processing an iteration
    Operator,

    /// Memory could not be reserved
    Resource,

    /// Broken internal invariant or terminated worker
    Internal,
}

impl ErrorKind {
    /// Stable non-zero status code for this category
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::Configuration => 1,
            ErrorKind::Sequencing => 2,
            ErrorKind::Operator => 3,
            ErrorKind::Resource => 4,
            ErrorKind::Internal => 5,
        }
    }
}

/// Failure raised by an operator, attached to the iteration it aborted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorFailure {
    /// Name of the failing operator instance
    pub operator: String,

    /// Iteration index the failure belongs to
    pub iteration: u64,

    /// Operator-provided message
    pub message: String,
}

impl fmt::Display for OperatorFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "operator '{}' failed in iteration {}: {}",
            self.operator, self.iteration, self.message
        )
    }
}

/// Error type for pipeline operations
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid pipeline or executor configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Graph is malformed (cycle, dangling input, incompatible backends, ...)
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No operator, input, or output with the given name
    #[error("Unknown name: {0}")]
    UnknownName(String),

    /// Fed data violates the declared contract of an external input
    #[error("Feed rejected for '{slot}': {reason}")]
    FeedMismatch {
        /// External input name
        slot: String,
        /// What was wrong with the data
        reason: String,
    },

    /// External input was not fed enough times before prefetch/run
    #[error("External input '{slot}' was fed {fed} time(s), {required} required")]
    UnderFed {
        /// External input name
        slot: String,
        /// Number of queued feeds
        fed: usize,
        /// Number of feeds required
        required: usize,
    },

    /// External input was fed more times than prefetch consumes
    #[error("External input '{slot}' was fed {fed} time(s), exactly {required} expected before prefetch")]
    OverFed {
        /// External input name
        slot: String,
        /// Number of queued feeds
        fed: usize,
        /// Number of feeds required
        required: usize,
    },

    /// Operation called in an invalid state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Process-wide initialization has not run
    #[error("Library not initialized: call init() before creating pipelines")]
    NotInitialized,

    /// Pipeline has been shut down
    #[error("Pipeline is shut down")]
    ShutDown,

    /// An operator failed
    #[error("{0}")]
    Operator(OperatorFailure),

    /// Memory allocation failed
    #[error("Memory allocation of {requested} bytes on {memory} failed")]
    MemoryAllocationFailed {
        /// Requested size in bytes
        requested: usize,
        /// Memory kind the request targeted
        memory: String,
    },

    /// Memory layout error (alignment, size)
    #[error("Memory layout error: {0}")]
    LayoutError(String),

    /// Checkpointing was not enabled when the pipeline was created
    #[error("Checkpointing is not enabled for this pipeline")]
    CheckpointingDisabled,

    /// Checkpoint does not match this pipeline or is corrupt
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Binary serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Graph description could not be parsed
    #[error("Graph parse error: {0}")]
    GraphParse(#[from] serde_json::Error),

    /// Worker or stream failure
    #[error("Execution error: {0}")]
    Execution(String),
}

impl Error {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidConfig(_)
            | Error::InvalidGraph(_)
            | Error::InvalidArgument(_)
            | Error::UnknownName(_)
            | Error::FeedMismatch { .. }
            | Error::UnderFed { .. }
            | Error::OverFed { .. }
            | Error::CheckpointingDisabled
            | Error::Checkpoint(_)
            | Error::Serialization(_)
            | Error::GraphParse(_) => ErrorKind::Configuration,
            Error::InvalidOperation(_) | Error::NotInitialized | Error::ShutDown => {
                ErrorKind::Sequencing
            }
            Error::Operator(_) => ErrorKind::Operator,
            Error::MemoryAllocationFailed { .. } | Error::LayoutError(_) => ErrorKind::Resource,
            Error::Execution(_) => ErrorKind::Internal,
        }
    }

    /// Shorthand for a sequencing error
    pub(crate) fn sequencing(msg: impl Into<String>) -> Self {
        Error::InvalidOperation(msg.into())
    }
}
