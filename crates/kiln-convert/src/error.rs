use std::fmt;

use kiln_graph::GraphError;
use thiserror::Error;

/// Convenience alias used throughout the translator.
pub type Result<T> = core::result::Result<T, ConversionError>;

/// Semantic failure of a conversion step.
///
/// The variant carries the failure class; the message says what went wrong
/// and usually names the offending node. [`ConversionError::context`] adds a
/// caller-side prefix without changing the class.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConversionError {
    /// The graph asked for something the engine cannot express.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Recognized but not handled yet.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// A named tensor, node, or output slot does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A name was bound twice in the tensor namespace.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A value fell outside the supported range.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// An input arrived in a state the operation cannot start from.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Translator bug, e.g. a layer builder rejected arguments the catalog
    /// had already vetted.
    #[error("internal: {0}")]
    Internal(String),
}

impl ConversionError {
    /// Prepends `prefix` to the message, preserving the failure class.
    pub fn context(self, prefix: impl fmt::Display) -> Self {
        match self {
            Self::InvalidArgument(msg) => Self::InvalidArgument(format!("{prefix}: {msg}")),
            Self::Unimplemented(msg) => Self::Unimplemented(format!("{prefix}: {msg}")),
            Self::NotFound(msg) => Self::NotFound(format!("{prefix}: {msg}")),
            Self::AlreadyExists(msg) => Self::AlreadyExists(format!("{prefix}: {msg}")),
            Self::OutOfRange(msg) => Self::OutOfRange(format!("{prefix}: {msg}")),
            Self::FailedPrecondition(msg) => {
                Self::FailedPrecondition(format!("{prefix}: {msg}"))
            }
            Self::Internal(msg) => Self::Internal(format!("{prefix}: {msg}")),
        }
    }
}

impl From<GraphError> for ConversionError {
    fn from(err: GraphError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}
