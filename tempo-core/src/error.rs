//! Error types for the runtime.

use thiserror::Error;

use crate::reactive::TagId;

/// Errors surfaced by fallible runtime operations.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The tag was destroyed before the operation ran.
    #[error("tag {id} has been destroyed")]
    Destroyed { id: TagId },

    /// A flush was requested inside a no-scheduling window.
    #[error("flush requested while scheduling is forbidden")]
    SchedulingForbidden,

    /// The runtime configuration could not be parsed.
    #[error("invalid runtime configuration: {0}")]
    Config(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = GraphError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroyed_error_names_the_tag() {
        let err = GraphError::Destroyed { id: TagId::from(7) };
        assert_eq!(err.to_string(), "tag #7 has been destroyed");
    }
}
