//! Error types for resarb.

use thiserror::Error;

/// Result type alias using resarb's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for arbiter operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The control store could not be created, sized, mapped, or locked.
    #[error("control store unavailable: {0}")]
    StoreUnavailable(String),

    /// A request id was used against the wrong resource class.
    #[error("resource class mismatch: {0}")]
    TypeMismatch(String),

    /// Caller-supplied argument is invalid for the target class.
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
