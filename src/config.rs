//! Runtime configuration parsed from environment variables.
//!
//! Every knob has a typed default; unset or unparsable numeric values fall
//! back to it. Only values with no sensible fallback (an unknown backoff
//! policy name) are errors.

use std::str::FromStr;
use std::time::Duration;

use crate::presence::PresenceConfig;
use crate::rate_limit::RateLimitConfig;
use crate::recovery::{BackoffPolicy, DEFAULT_MAX_BACKOFF_MS, DEFAULT_RETRY_DELAY_MS, RecoveryConfig};
use crate::telemetry::TelemetryConfig;
use crate::translation::TranslationCacheConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {var}: {value:?} (expected fixed, linear or exponential)")]
    InvalidBackoff { var: &'static str, value: String },
}

impl crate::error::ErrorCode for ConfigError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidBackoff { .. } => "E_INVALID_CONFIG",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncConfig {
    pub presence: PresenceConfig,
    pub telemetry: TelemetryConfig,
    pub rate_limit: RateLimitConfig,
    pub recovery: RecoveryConfig,
    pub translation: TranslationCacheConfig,
    /// Enables the drone telemetry surface.
    pub uav_mode: bool,
}

impl SyncConfig {
    /// Build from environment variables.
    ///
    /// Optional:
    /// - `TIGER_PRESENCE_HEARTBEAT_SECS`: default 300
    /// - `TIGER_TELEMETRY_HEALTH_THRESHOLD_SECS`: default 30
    /// - `TIGER_TELEMETRY_HEALTH_CHECK_SECS`: default 5
    /// - `TIGER_AUTH_MAX_ATTEMPTS`: default 5
    /// - `TIGER_AUTH_WINDOW_SECS`: default 900
    /// - `TIGER_RECOVERY_ENABLED`: default true
    /// - `TIGER_RECOVERY_MAX_RETRIES`: default 3
    /// - `TIGER_RECOVERY_DELAY_MS`: default 2000
    /// - `TIGER_RECOVERY_MAX_BACKOFF_MS`: default 30000
    /// - `TIGER_RECOVERY_BACKOFF`: `fixed` (default), `linear` or `exponential`
    /// - `TIGER_TRANSLATION_CACHE_CAPACITY`: default 1000
    /// - `TIGER_TRANSLATION_CACHE_TTL_SECS`: default 3600
    /// - `TIGER_UAV_MODE`: default false
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBackoff`] for an unknown backoff policy.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`] with an injectable variable source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBackoff`] for an unknown backoff policy.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| Duration::from_secs(env_parse(&lookup, key, default.as_secs()));

        let presence = PresenceConfig {
            heartbeat_interval: secs("TIGER_PRESENCE_HEARTBEAT_SECS", defaults.presence.heartbeat_interval),
        };

        let telemetry = TelemetryConfig {
            health_threshold: secs("TIGER_TELEMETRY_HEALTH_THRESHOLD_SECS", defaults.telemetry.health_threshold),
            health_check_interval: secs("TIGER_TELEMETRY_HEALTH_CHECK_SECS", defaults.telemetry.health_check_interval),
            ..defaults.telemetry.clone()
        };

        let rate_limit = RateLimitConfig {
            max_attempts: env_parse(&lookup, "TIGER_AUTH_MAX_ATTEMPTS", defaults.rate_limit.max_attempts),
            window: secs("TIGER_AUTH_WINDOW_SECS", defaults.rate_limit.window),
        };

        let delay = Duration::from_millis(env_parse(&lookup, "TIGER_RECOVERY_DELAY_MS", DEFAULT_RETRY_DELAY_MS));
        let max_backoff = Duration::from_millis(env_parse(
            &lookup,
            "TIGER_RECOVERY_MAX_BACKOFF_MS",
            DEFAULT_MAX_BACKOFF_MS,
        ));
        let backoff = match lookup("TIGER_RECOVERY_BACKOFF") {
            None => BackoffPolicy::Fixed(delay),
            Some(name) => BackoffPolicy::from_name(name.trim(), delay, max_backoff)
                .ok_or(ConfigError::InvalidBackoff { var: "TIGER_RECOVERY_BACKOFF", value: name })?,
        };
        let recovery = RecoveryConfig {
            enabled: env_flag(&lookup, "TIGER_RECOVERY_ENABLED", defaults.recovery.enabled),
            max_retries: env_parse(&lookup, "TIGER_RECOVERY_MAX_RETRIES", defaults.recovery.max_retries),
            backoff,
        };

        let translation = TranslationCacheConfig {
            capacity: env_parse(&lookup, "TIGER_TRANSLATION_CACHE_CAPACITY", defaults.translation.capacity),
            ttl: secs("TIGER_TRANSLATION_CACHE_TTL_SECS", defaults.translation.ttl),
        };

        Ok(Self {
            presence,
            telemetry,
            rate_limit,
            recovery,
            translation,
            uav_mode: env_flag(&lookup, "TIGER_UAV_MODE", defaults.uav_mode),
        })
    }
}

pub(crate) fn env_parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// `1/true/yes/on` and `0/false/no/off`, case-insensitive.
pub(crate) fn env_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key).map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
