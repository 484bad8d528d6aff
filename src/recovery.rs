//! Error recovery controller: bounded retry around a recovery action.
//!
//! DESIGN
//! ======
//! Called from a failure path with the error that just happened and,
//! optionally, an action that tries to restore service (reconnect, refetch).
//! One call runs at most one recovery attempt; the controller never
//! schedules retries on its own. The caller decides whether to call again,
//! typically gated on [`ErrorRecovery::can_retry`].
//!
//! Transitions:
//! - disabled, no action, or non-retryable error -> terminal `Failed` notice
//! - attempts below max -> `Recovering`, wait the backoff delay, run action
//! - action ok -> attempts reset, `Recovered`
//! - action err -> `Failed` only once the attempt budget is spent
//!
//! The wait comes from a [`BackoffPolicy`]; the default is a fixed delay.

use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use crate::error::ErrorCode;
use crate::notice::{Notice, Notifier};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2000;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

// =============================================================================
// BACKOFF
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    Fixed(Duration),
    /// `step * attempt`.
    Linear { step: Duration },
    /// `base * 2^(attempt - 1)`, capped at `max`. With `jitter`, a uniform
    /// draw from zero up to that value.
    Exponential { base: Duration, max: Duration, jitter: bool },
}

impl BackoffPolicy {
    /// Parse a policy name (`fixed`, `linear`, `exponential`).
    #[must_use]
    pub fn from_name(name: &str, delay: Duration, max: Duration) -> Option<Self> {
        match name {
            "fixed" => Some(Self::Fixed(delay)),
            "linear" => Some(Self::Linear { step: delay }),
            "exponential" => Some(Self::Exponential { base: delay, max, jitter: true }),
            _ => None,
        }
    }

    /// Delay before the given 1-based attempt.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Linear { step } => step.saturating_mul(attempt.max(1)),
            Self::Exponential { base, max, jitter } => {
                let exp = attempt.saturating_sub(1).min(20);
                let capped = base.saturating_mul(1u32 << exp).min(max);
                if jitter {
                    let ceiling = u64::try_from(capped.as_millis()).unwrap_or(u64::MAX);
                    Duration::from_millis(rand::rng().random_range(0..=ceiling))
                } else {
                    capped
                }
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Fixed(Duration::from_millis(DEFAULT_RETRY_DELAY_MS))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryConfig {
    /// When false every failure is terminal.
    pub enabled: bool,
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self { enabled: true, max_retries: DEFAULT_MAX_RETRIES, backoff: BackoffPolicy::default() }
    }
}

// =============================================================================
// STATE
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempt_count: u32,
    pub is_recovering: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Recovered,
    /// The action failed but the attempt budget is not spent.
    RetryAvailable,
    /// The action failed on the last allowed attempt, or the budget was
    /// already spent. A terminal notice was emitted.
    Exhausted,
    /// Recovery was not tried (disabled, no action, non-retryable error).
    NotAttempted,
    /// Another recovery is running; this call did nothing.
    AlreadyRecovering,
}

/// Clears `is_recovering` even if the guarded future is dropped mid-wait.
struct RecoveringFlag<'a>(&'a Mutex<RetryState>);

impl Drop for RecoveringFlag<'_> {
    fn drop(&mut self) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_recovering = false;
    }
}

// =============================================================================
// CONTROLLER
// =============================================================================

#[derive(Clone)]
pub struct ErrorRecovery {
    config: RecoveryConfig,
    state: Arc<Mutex<RetryState>>,
    notifier: Notifier,
}

impl ErrorRecovery {
    #[must_use]
    pub fn new(config: RecoveryConfig, notifier: Notifier) -> Self {
        Self { config, state: Arc::new(Mutex::new(RetryState::default())), notifier }
    }

    #[must_use]
    pub fn state(&self) -> RetryState {
        self.lock().clone()
    }

    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.lock().attempt_count < self.config.max_retries
    }

    pub fn reset(&self) {
        *self.lock() = RetryState::default();
    }

    /// Handle `error`, attempting `recovery` when allowed.
    pub async fn guard<E, F, Fut, T, RE>(&self, error: &E, recovery: Option<F>) -> RecoveryOutcome
    where
        E: ErrorCode + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RE>>,
        RE: Display,
    {
        let Some(action) = recovery else {
            return self.fail(error);
        };
        if !self.config.enabled || !error.retryable() {
            return self.fail(error);
        }

        let message = error.to_string();
        let max = self.config.max_retries;
        let attempt = {
            let mut state = self.lock();
            if state.is_recovering {
                return RecoveryOutcome::AlreadyRecovering;
            }
            state.last_error = Some(message.clone());
            if state.attempt_count >= max {
                None
            } else {
                state.attempt_count += 1;
                state.is_recovering = true;
                Some(state.attempt_count)
            }
        };
        let Some(attempt) = attempt else {
            self.notifier.notify(Notice::Failed { message });
            return RecoveryOutcome::Exhausted;
        };

        warn!(attempt, max, error = %message, code = error.error_code(), "recovery: attempting");
        self.notifier.notify(Notice::Recovering { attempt, max });

        let result = {
            let _flag = RecoveringFlag(&self.state);
            tokio::time::sleep(self.config.backoff.delay(attempt)).await;
            action().await
        };

        match result {
            Ok(_) => {
                {
                    let mut state = self.lock();
                    state.attempt_count = 0;
                    state.last_error = None;
                }
                info!(attempt, "recovery: succeeded");
                self.notifier.notify(Notice::Recovered);
                RecoveryOutcome::Recovered
            }
            Err(e) => {
                let message = e.to_string();
                let exhausted = {
                    let mut state = self.lock();
                    state.last_error = Some(message.clone());
                    state.attempt_count >= max
                };
                if exhausted {
                    warn!(attempt, max, error = %message, "recovery: attempts exhausted");
                    self.notifier.notify(Notice::Failed { message });
                    RecoveryOutcome::Exhausted
                } else {
                    warn!(attempt, max, error = %message, "recovery: attempt failed");
                    RecoveryOutcome::RetryAvailable
                }
            }
        }
    }

    /// Terminal failure without any retry.
    pub fn fail<E>(&self, error: &E) -> RecoveryOutcome
    where
        E: Display + ?Sized,
    {
        let message = error.to_string();
        self.lock().last_error = Some(message.clone());
        self.notifier.notify(Notice::Failed { message });
        RecoveryOutcome::NotAttempted
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RetryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "recovery_test.rs"]
mod tests;
