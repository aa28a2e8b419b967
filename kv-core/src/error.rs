//! Error taxonomy for the data/consistency engine.
//!
//! Every engine operation returns `CResult<T>`. Only [`Error::Fatal`] is meant
//! to cross the HTTP boundary as an opaque 500; the other variants carry
//! enough detail for the adapter to build the `{status, error, message}`
//! body described by the external interface.

use thiserror::Error;

pub type CResult<T> = Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(&'static str),

    #[error("cas-conflict: expected revision did not match")]
    CasConflict,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unsatisfiable range")]
    UnsatisfiableRange,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("fatal error: {0}")]
    Fatal(#[from] anyhow::Error),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound,
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                Error::Conflict("unique constraint violated")
            }
            other => Error::Fatal(anyhow::anyhow!(other)),
        }
    }
}

impl Error {
    /// Stable machine-readable tag, used by the HTTP adapter's error body
    /// and by watch-protocol error frames.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound => "not-found",
            Error::Conflict(_) => "conflict",
            Error::CasConflict => "cas-conflict",
            Error::Validation(_) => "validation",
            Error::UnsatisfiableRange => "unsatisfiable-range",
            Error::Internal(_) => "internal",
            Error::Fatal(_) => "fatal",
        }
    }
}
