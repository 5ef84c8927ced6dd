//! Error types for the Frameloom runtime.

use thiserror::Error;

/// Main error type for core operations.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("filter error: {0}")]
    Filter(String),

    #[error("plugin error: {0}")]
    Plugin(String),

    #[error("signature error: {0}")]
    Signature(String),

    #[error("format error: {0}")]
    Format(String),

    #[error("request error: {0}")]
    Request(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Runtime error reported by a filter while producing a frame.
///
/// Carries the sticky error text that propagates through dependent
/// requests and ends up in the user callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct FilterError(pub String);

impl From<String> for FilterError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

impl From<&str> for FilterError {
    fn from(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

/// Failure modes for typed property map access.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PropError {
    #[error("no property with the requested key")]
    Unset,

    #[error("property exists but holds a different type")]
    WrongType,

    #[error("index out of bounds for property array")]
    Index,

    #[error("invalid property key")]
    InvalidKey,

    #[error("map carries an error: {0}")]
    MapError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_error_from_str() {
        let e = FilterError::from("boom");
        assert_eq!(e.0, "boom");
        assert_eq!(e.to_string(), "boom");
    }

    #[test]
    fn prop_error_display() {
        let e = PropError::MapError("bad input".into());
        assert!(e.to_string().contains("bad input"));
    }
}
