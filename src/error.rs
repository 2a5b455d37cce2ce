//! Error taxonomy shared across the engine.
//!
//! Gateway-facing and hot-path code returns [`AppError`] so callers can match
//! on error kind (retry, halt, surface). Glue code (config loading, file
//! I/O at startup) uses `anyhow::Result` instead, matching the split already
//! present in the upstream client code this crate grew out of.

use thiserror::Error;

/// The error kinds a caller must be able to distinguish and react to.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("market data unavailable for {symbol}")]
    DataUnavailable { symbol: String },

    #[error("rate limited by exchange")]
    RateLimited,

    #[error("authentication failed")]
    AuthFailed,

    #[error("clock drift {drift_ms}ms exceeds tolerance")]
    ClockDrift { drift_ms: i64 },

    #[error("invalid order: {reason}")]
    InvalidOrder { reason: String },

    #[error("insufficient margin: need {required}, have {available}")]
    InsufficientMargin { required: f64, available: f64 },

    #[error("exchange rejected order, code {code}: {message}")]
    ExchangeReject { code: i64, message: String },

    #[error("network transient error: {0}")]
    NetworkTransient(String),

    #[error("operation timed out")]
    Timeout,

    #[error("invariant violated: {0}")]
    InvariantViolated(String),
}

impl AppError {
    /// §7 propagation policy: whether the Gateway's retry loop should retry
    /// this kind of failure at all.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::NetworkTransient(_) | AppError::RateLimited | AppError::Timeout
        )
    }

    /// Whether this error is fatal and should trigger process shutdown.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::AuthFailed | AppError::InvariantViolated(_))
    }

    /// Known exchange error codes with an automatic one-shot recovery path
    /// (§6: 330005/330006/330008).
    pub fn known_recovery_code(&self) -> Option<i64> {
        match self {
            AppError::ExchangeReject { code, .. } if [330005, 330006, 330008].contains(code) => {
                Some(*code)
            }
            _ => None,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
