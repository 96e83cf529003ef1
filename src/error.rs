//! Custom error types for the controller.
//!
//! This module defines the primary error type, `ControlError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to classify failures, from configuration validation to
//! hardware faults and unreachable backends.
//!
//! ## Error Hierarchy
//!
//! `ControlError` is an enum that consolidates the failure kinds the rest of
//! the system reasons about:
//!
//! - **`Validation`**: a configuration document or a request body fails the
//!   schema or a semantic check (unknown rule source, duplicate GPIO line).
//!   Surfaced to the API as 4xx.
//! - **`NotFound`**: an unknown relay id, config section or sensor id.
//! - **`Unauthorized` / `Forbidden`**: missing/invalid credentials vs. a
//!   valid principal whose role is insufficient.
//! - **`Hardware`**: wraps [`HardwareError`] from the hardware layer; the
//!   controller keeps running, callers see a 5xx.
//! - **`Backend`**: the time-series store or KV cache is unreachable. Never
//!   allowed to propagate into the hardware control path.
//! - **`Timeout`**: a cross-component deadline fired before the operation
//!   confirmed. The underlying mutation may still have completed, so callers
//!   must re-read state.
//! - **`Conflict`**: reserved; currently unused by any caller.
//!
//! Component-internal errors are handled where continuation is safe; only
//! caller-initiated commands that cannot be completed reach the API surface.

use crate::hardware::HardwareError;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, ControlError>;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error("Backend unavailable: {0}")]
    Backend(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// True when the failure came from an external store rather than the
    /// device itself.
    pub fn is_backend(&self) -> bool {
        matches!(self, ControlError::Backend(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ControlError::NotFound("relay_9".to_string());
        assert_eq!(err.to_string(), "Not found: relay_9");
    }

    #[test]
    fn test_hardware_error_passthrough() {
        let err: ControlError = HardwareError::Unavailable("gpiochip0".into()).into();
        assert!(err.to_string().contains("gpiochip0"));
    }
}
