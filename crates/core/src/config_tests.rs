// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn valid() -> WorkerConfig {
    WorkerConfig::default()
}

#[test]
fn default_config_validates() {
    assert!(valid().validate().is_ok());
}

#[test]
fn zero_concurrency_is_rejected() {
    let config = WorkerConfig {
        concurrency: 0,
        ..valid()
    };
    assert_eq!(config.validate(), Err(ConfigError::Concurrency));
}

#[yare::parameterized(
    just_below = { 119, false },
    at_minimum = { 120, true },
    above = { 600, true },
)]
fn lock_ttl_bound(secs: u64, ok: bool) {
    let config = WorkerConfig {
        lock_ttl: Duration::from_secs(secs),
        renew_every: Duration::from_secs(10),
        ..valid()
    };
    assert_eq!(config.validate().is_ok(), ok);
}

#[test]
fn renew_every_must_be_at_least_ten_seconds() {
    let config = WorkerConfig {
        renew_every: Duration::from_secs(9),
        ..valid()
    };
    assert!(matches!(
        config.validate(),
        Err(ConfigError::RenewTooShort { .. })
    ));
}

#[test]
fn renew_every_must_fit_half_the_lock_ttl() {
    let config = WorkerConfig {
        lock_ttl: Duration::from_secs(120),
        renew_every: Duration::from_secs(61),
        ..valid()
    };
    assert!(matches!(
        config.validate(),
        Err(ConfigError::RenewTooLong { .. })
    ));
}

#[test]
fn stack_timeout_must_be_at_least_one_second() {
    let config = WorkerConfig {
        stack_timeout: Duration::from_millis(500),
        ..valid()
    };
    assert!(matches!(
        config.validate(),
        Err(ConfigError::StackTimeout { .. })
    ));
}

#[test]
fn retry_once_derives_max_retries() {
    assert_eq!(valid().max_retries(), 0);
    let config = WorkerConfig {
        retry_once: true,
        ..valid()
    };
    assert_eq!(config.max_retries(), 1);
}

#[test]
fn trigger_policy_defaults_to_supersede() {
    assert!(TriggerPolicy::default().cancel_inflight_on_new_trigger);

    // Empty TOML table picks up the serde default too.
    let policy: TriggerPolicy = toml_like_default();
    assert!(policy.cancel_inflight_on_new_trigger);
}

fn toml_like_default() -> TriggerPolicy {
    serde_json::from_str("{}").unwrap_or_default()
}
