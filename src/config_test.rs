use super::*;
use std::collections::HashMap;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
    move |key: &str| vars.get(key).cloned()
}

#[test]
fn empty_environment_yields_defaults() {
    let config = SyncConfig::from_lookup(|_| None).unwrap();
    assert_eq!(config, SyncConfig::default());
    assert_eq!(config.presence.heartbeat_interval, Duration::from_secs(300));
    assert_eq!(config.telemetry.health_threshold, Duration::from_secs(30));
    assert_eq!(config.telemetry.health_check_interval, Duration::from_secs(5));
    assert_eq!(config.rate_limit.max_attempts, 5);
    assert_eq!(config.rate_limit.window, Duration::from_secs(900));
    assert!(config.recovery.enabled);
    assert_eq!(config.recovery.max_retries, 3);
    assert_eq!(config.recovery.backoff, BackoffPolicy::Fixed(Duration::from_millis(2000)));
    assert_eq!(config.translation.capacity, 1000);
    assert_eq!(config.translation.ttl, Duration::from_secs(3600));
    assert!(!config.uav_mode);
}

#[test]
fn overrides_are_applied() {
    let config = SyncConfig::from_lookup(lookup_from(&[
        ("TIGER_PRESENCE_HEARTBEAT_SECS", "60"),
        ("TIGER_AUTH_MAX_ATTEMPTS", "3"),
        ("TIGER_RECOVERY_MAX_RETRIES", " 5 "),
        ("TIGER_RECOVERY_DELAY_MS", "100"),
        ("TIGER_RECOVERY_BACKOFF", "linear"),
        ("TIGER_TRANSLATION_CACHE_CAPACITY", "10"),
        ("TIGER_UAV_MODE", "TRUE"),
    ]))
    .unwrap();
    assert_eq!(config.presence.heartbeat_interval, Duration::from_secs(60));
    assert_eq!(config.rate_limit.max_attempts, 3);
    assert_eq!(config.recovery.max_retries, 5);
    assert_eq!(config.recovery.backoff, BackoffPolicy::Linear { step: Duration::from_millis(100) });
    assert_eq!(config.translation.capacity, 10);
    assert!(config.uav_mode);
}

#[test]
fn unparsable_numbers_fall_back_to_defaults() {
    let config = SyncConfig::from_lookup(lookup_from(&[
        ("TIGER_AUTH_WINDOW_SECS", "fifteen minutes"),
        ("TIGER_RECOVERY_ENABLED", "maybe"),
    ]))
    .unwrap();
    assert_eq!(config.rate_limit.window, Duration::from_secs(900));
    assert!(config.recovery.enabled);
}

#[test]
fn recovery_can_be_disabled() {
    let config = SyncConfig::from_lookup(lookup_from(&[("TIGER_RECOVERY_ENABLED", "off")])).unwrap();
    assert!(!config.recovery.enabled);
}

#[test]
fn unknown_backoff_is_rejected() {
    let err = SyncConfig::from_lookup(lookup_from(&[("TIGER_RECOVERY_BACKOFF", "random")])).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidBackoff { ref value, .. } if value == "random"));
}

#[test]
fn env_parse_missing_returns_default() {
    let val: usize = env_parse(&|_: &str| -> Option<String> { None }, "__MISSING__", 42);
    assert_eq!(val, 42);
}
