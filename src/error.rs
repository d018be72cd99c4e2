use thiserror::Error;

/// Error kinds surfaced by the results access and calculation engine.
///
/// Every fallible entry point in this crate returns `Result<T, Error>`;
/// the Orchestrator passes these through unchanged (it never wraps or
/// downgrades an error from a collaborator).
#[derive(Debug, Error)]
pub enum Error {
    /// Model/run/entity/attribute/dimension/parameter not resolvable by the given key.
    #[error("not found: {0}")]
    NotFound(String),

    /// Empty required argument, conflicting run-id vs run-name, unknown filter column,
    /// derived accumulator aggregated, or a non-scalar/non-numeric parameter used.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Read attempted on a run that is not in a terminal status, or a microdata
    /// read attempted on a run that did not finish successfully.
    #[error("incomplete run: {0}")]
    IncompleteRun(String),

    /// Database is not recognised, or its schema version is below the supported minimum.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Calculation expression contains a forbidden SQL token or comment sequence.
    #[error("unsafe expression: {0}")]
    UnsafeExpression(String),

    /// The Deleter observed an unexpected status transition, e.g. the run was
    /// removed by another actor mid-sequence.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Database driver error, wrapped with the originating statement context.
    #[error("io error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: sqlx::Error,
    },
}

impl Error {
    /// Wrap a driver error with the statement or operation that produced it.
    pub fn io(context: impl Into<String>, source: sqlx::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    pub fn incomplete_run(msg: impl Into<String>) -> Self {
        Error::IncompleteRun(msg.into())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
