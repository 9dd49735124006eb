//! Error types for the Turnstile service.

use thiserror::Error;

use crate::ratelimit::AdmitError;
use crate::store::StoreError;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Admission errors
    #[error("Admission error: {0}")]
    Admit(#[from] AdmitError),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
