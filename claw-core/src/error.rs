//! Domain error taxonomy. Variants map onto the error-handling design: each
//! one is either surfaced to a caller as a status code / close code, or
//! caught and logged at the site that must never propagate it (broadcast
//! dispatch, WLED events, hardware calls made from timer callbacks).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("you already have an active queue entry")]
    DuplicateEntry,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("missing or invalid token")]
    Unauthorized,

    #[error("no matching entry")]
    NotFound,

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("store pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("hardware call timed out")]
    HardwareTimeout,

    #[error("hardware gate is locked")]
    HardwareLocked,

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
