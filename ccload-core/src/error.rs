//! Error types for ccload-core

use thiserror::Error;

/// Main error type for the ccload-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Schema migration error
    #[error("migration error: {0}")]
    Migration(String),

    /// Entity not found
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind ("channel", "api key", ...)
        entity: &'static str,
        /// Identifier that missed
        id: String,
    },

    /// Unique-constraint violation
    #[error("conflict: {0}")]
    Conflict(String),

    /// Startup restore error (hybrid mode)
    #[error("restore error: {0}")]
    Restore(String),
}

impl Error {
    /// Build a not-found error for an entity kind and id
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// True if this is the distinguished not-found kind
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Remap driver-level unique violations to [`Error::Conflict`].
    ///
    /// Constraint text from the driver is preserved so callers see the
    /// offending column.
    pub fn from_db(err: sqlx::Error, context: &str) -> Self {
        if let sqlx::Error::Database(ref dbe) = err {
            if dbe.is_unique_violation() {
                return Error::Conflict(format!("{context}: {}", dbe.message()));
            }
        }
        Error::Database(err)
    }
}

/// Result type alias for ccload-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_kind() {
        let err = Error::not_found("channel", 42);
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "channel not found: 42");
    }

    #[test]
    fn test_config_display() {
        let err = Error::Config("bad journal mode".into());
        assert_eq!(err.to_string(), "configuration error: bad journal mode");
    }
}
