//! Error types for the Rategate service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Rategate operations.
#[derive(Error, Debug)]
pub enum RategateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Coordination store errors surfaced outside of an acquire call
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// HTTP server errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Rategate operations.
pub type Result<T> = std::result::Result<T, RategateError>;

/// Reasons an admission decision could not be made.
///
/// A denial is not an error: acquirers report it as `Ok(false)`.
#[derive(Error, Debug)]
pub enum AcquireError {
    /// The caller's cancellation token fired.
    #[error("acquire cancelled")]
    Cancelled,

    /// The coordination store could not be reached or timed out.
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),

    /// The stored counter for an interval key is not an unsigned integer.
    #[error("invalid counter value {value:?} at {key}")]
    InvalidCounter { key: String, value: String },

    /// Conditional writes kept losing races past the configured retry cap.
    #[error("gave up on {key} after {attempts} conflicting writes")]
    Contention { key: String, attempts: u32 },
}

impl AcquireError {
    /// Whether this error means the caller went away rather than the
    /// decision being impossible.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AcquireError::Cancelled)
    }
}
