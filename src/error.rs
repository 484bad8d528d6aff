//! Shared error classification.
//!
//! Every module owns its own `thiserror` enum. This trait gives callers a
//! uniform way to pick a grepable code and decide whether a failure is worth
//! retrying (transient network/backend trouble) or should be surfaced as-is
//! (validation, not-found, rate limiting).

/// Grepable error code and retryable flag.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}
