use thiserror::Error;

/// Error type for graph IR lookups and parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// A node was asked for an attribute it does not carry.
    #[error("attribute not found: {0}")]
    MissingAttribute(String),

    /// A node attribute exists but holds a different payload kind.
    #[error("attribute {key} is not a {expected}")]
    AttributeType {
        /// Attribute key that was looked up.
        key: String,
        /// Payload kind the caller asked for.
        expected: &'static str,
    },

    /// An input reference string could not be parsed.
    #[error("malformed tensor reference: {0}")]
    MalformedRef(String),
}
