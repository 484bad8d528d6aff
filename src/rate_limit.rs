//! In-memory rate limiting for admin authentication attempts.
//!
//! DESIGN
//! ======
//! Sliding-window counters backed by `HashMap<String, VecDeque<Instant>>`,
//! keyed by whatever identifies the actor (email, username). Default limit
//! is 5 attempts per 15 minutes. Timestamps older than the window are pruned
//! lazily on every check.
//!
//! Checking and recording are separate: `is_allowed` never records, and the
//! caller records every attempt it actually makes (success or failure) right
//! after the check passes. `check_and_record` does both under one lock.
//!
//! TRADE-OFFS
//! ==========
//! State lives only in this process. Restarting or clearing it resets every
//! window, so this is a UX deterrent, not a security boundary; brute-force
//! protection has to be enforced server-side.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::ErrorCode;

pub const DEFAULT_MAX_ATTEMPTS: usize = 5;
pub const DEFAULT_WINDOW_SECS: u64 = 15 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_attempts: usize,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { max_attempts: DEFAULT_MAX_ATTEMPTS, window: Duration::from_secs(DEFAULT_WINDOW_SECS) }
    }
}

// =============================================================================
// ERROR TYPE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("too many attempts; try again in {}s", retry_after.as_secs().max(1))]
    Locked { retry_after: Duration },
}

impl ErrorCode for RateLimitError {
    fn error_code(&self) -> &'static str {
        "E_RATE_LIMITED"
    }
}

// =============================================================================
// RATE LIMITER
// =============================================================================

#[derive(Clone)]
pub struct AuthRateLimiter {
    attempts: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
    config: RateLimitConfig,
}

impl AuthRateLimiter {
    /// `max_attempts` is clamped to at least 1; a limiter that admits
    /// nothing could never report when it unlocks.
    #[must_use]
    pub fn new(mut config: RateLimitConfig) -> Self {
        config.max_attempts = config.max_attempts.max(1);
        Self { attempts: Arc::new(Mutex::new(HashMap::new())), config }
    }

    #[must_use]
    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// True when another attempt for `key` fits in the window. Does not record.
    #[must_use]
    pub fn is_allowed(&self, key: &str) -> bool {
        self.is_allowed_at(key, Instant::now())
    }

    fn is_allowed_at(&self, key: &str, now: Instant) -> bool {
        let mut attempts = self.lock();
        let Some(deque) = attempts.get_mut(key) else {
            return true;
        };
        prune_window(deque, now, self.config.window);
        deque.len() < self.config.max_attempts
    }

    /// Record one attempt for `key`, whatever its outcome.
    pub fn record_attempt(&self, key: &str) {
        self.record_attempt_at(key, Instant::now());
    }

    fn record_attempt_at(&self, key: &str, now: Instant) {
        let mut attempts = self.lock();
        let deque = attempts.entry(key.to_owned()).or_default();
        prune_window(deque, now, self.config.window);
        deque.push_back(now);
    }

    /// Check the window, then record the attempt if it fits.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Locked`] with the remaining lock time when
    /// the window is full. Nothing is recorded in that case.
    pub fn check_and_record(&self, key: &str) -> Result<(), RateLimitError> {
        self.check_and_record_at(key, Instant::now())
    }

    fn check_and_record_at(&self, key: &str, now: Instant) -> Result<(), RateLimitError> {
        let mut attempts = self.lock();
        let deque = attempts.entry(key.to_owned()).or_default();
        prune_window(deque, now, self.config.window);
        if deque.len() >= self.config.max_attempts {
            return Err(RateLimitError::Locked { retry_after: remaining(deque, now, self.config) });
        }
        deque.push_back(now);
        Ok(())
    }

    /// Time until an attempt slot frees up; zero when currently allowed.
    #[must_use]
    pub fn remaining_lock(&self, key: &str) -> Duration {
        self.remaining_lock_at(key, Instant::now())
    }

    fn remaining_lock_at(&self, key: &str, now: Instant) -> Duration {
        let mut attempts = self.lock();
        let Some(deque) = attempts.get_mut(key) else {
            return Duration::ZERO;
        };
        prune_window(deque, now, self.config.window);
        remaining(deque, now, self.config)
    }

    /// Forget all attempts for `key`, e.g. after an administrator unlock.
    pub fn reset(&self, key: &str) {
        self.lock().remove(key);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<Instant>>> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for AuthRateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Drop timestamps that have aged out. An attempt exactly `window` old no
/// longer counts.
fn prune_window(deque: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&front) = deque.front() {
        if now.saturating_duration_since(front) >= window {
            deque.pop_front();
        } else {
            break;
        }
    }
}

/// Assumes `deque` was pruned at `now`.
fn remaining(deque: &VecDeque<Instant>, now: Instant, config: RateLimitConfig) -> Duration {
    if deque.len() < config.max_attempts {
        return Duration::ZERO;
    }
    // EDGE: the slot frees when the oldest attempt still counted expires.
    let idx = deque.len() - config.max_attempts;
    deque
        .get(idx)
        .map_or(Duration::ZERO, |&oldest| (oldest + config.window).saturating_duration_since(now))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "rate_limit_test.rs"]
mod tests;
