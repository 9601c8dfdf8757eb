mod common;

use std::io::Write;

use common::clean_env;
use once_cell::sync::Lazy;
use recipient_guard::recipients::RecipientCounts;
use recipient_guard::{AppConfig, UnknownAddress};
use std::sync::Mutex;

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[test]
fn rejects_invalid_boolean_env_values() {
    let _guard = ENV_MUTEX.lock().unwrap();
    let mut env = clean_env();

    env.set("LOG_ROTATE_COMPRESS", "maybe");
    let err = AppConfig::from_env().expect_err("expected invalid boolean to error");
    assert!(format!("{}", err).contains("LOG_ROTATE_COMPRESS"));
}

#[test]
fn rejects_zero_external_threshold() {
    let _guard = ENV_MUTEX.lock().unwrap();
    let mut env = clean_env();

    env.set("GUARD_EXTERNAL_THRESHOLD", "0");
    let err = AppConfig::from_env().expect_err("zero threshold must be rejected");
    assert!(format!("{:#}", err).contains("externalThreshold"));
}

#[test]
fn rejects_unknown_address_mode() {
    let _guard = ENV_MUTEX.lock().unwrap();
    let mut env = clean_env();

    env.set("GUARD_UNKNOWN_ADDRESS", "sometimes");
    let err = AppConfig::from_env().unwrap_err();
    assert!(format!("{}", err).contains("GUARD_UNKNOWN_ADDRESS"));
}

#[test]
fn recipient_threshold_can_be_disabled() {
    let _guard = ENV_MUTEX.lock().unwrap();
    let mut env = clean_env();

    env.set("GUARD_RECIPIENT_THRESHOLD", "off");
    let cfg = AppConfig::from_env().unwrap();
    assert_eq!(cfg.guard.recipient_threshold, None);
    assert!(cfg.guard.policy().thresholds().recipient_threshold.is_none());
}

#[test]
fn zero_recipient_threshold_disables_the_rule_from_file_and_env() {
    let _guard = ENV_MUTEX.lock().unwrap();
    let one_external = RecipientCounts {
        total_to_cc: 1,
        external_in_to_cc: 1,
        external_in_bcc: 0,
    };

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", serde_json::json!({ "recipientThreshold": 0 })).unwrap();
    let from_file = {
        let mut env = clean_env();
        env.set("GUARD_POLICY_CONFIG", file.path().to_str().unwrap());
        AppConfig::from_env().unwrap()
    };

    let from_env = {
        let mut env = clean_env();
        env.set("GUARD_RECIPIENT_THRESHOLD", "0");
        AppConfig::from_env().unwrap()
    };

    for cfg in [from_file, from_env] {
        assert_eq!(cfg.guard.recipient_threshold, None);
        assert!(!cfg.guard.policy().evaluate_counts(one_external).block);
    }
}

#[test]
fn env_overrides_policy_file() {
    let _guard = ENV_MUTEX.lock().unwrap();
    let mut env = clean_env();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        "{}",
        serde_json::json!({
            "internalDomains": ["@BCC.no"],
            "externalThreshold": 3,
            "unknownAddress": "internal",
            "debounceMs": 500
        })
    )
    .unwrap();

    env.set_many(&[
        ("GUARD_POLICY_CONFIG", file.path().to_str().unwrap()),
        ("GUARD_EXTERNAL_THRESHOLD", "4"),
        ("STRICT_AUTH_ALLOWED_TOKENS", " a, ,b "),
        ("GUARD_AUDIT_ONLY", "yes"),
        ("GUARD_MAX_REQUEST_BYTES", "4096"),
    ]);
    let cfg = AppConfig::from_env().unwrap();

    assert_eq!(cfg.guard.external_threshold, 4);
    assert_eq!(cfg.guard.recipient_threshold, Some(10));
    assert_eq!(cfg.guard.unknown_address, UnknownAddress::Internal);
    assert_eq!(cfg.guard.debounce().as_millis(), 500);
    assert!(cfg.guard.classifier().is_external("x@bcc.no.evil.com"));
    assert!(!cfg.guard.classifier().is_external("Ola@Bcc.No"));
    assert!(!cfg.guard.classifier().is_external(""));
    assert_eq!(cfg.allowed_tokens.unwrap().len(), 2);
    assert!(cfg.audit_only);
    assert_eq!(cfg.max_request_bytes, Some(4096));
}

#[test]
fn unreadable_policy_file_is_reported() {
    let _guard = ENV_MUTEX.lock().unwrap();
    let mut env = clean_env();

    env.set("GUARD_POLICY_CONFIG", "/nonexistent/guard-policy.json");
    let err = AppConfig::from_env().unwrap_err();
    assert!(format!("{}", err).contains("GUARD_POLICY_CONFIG"));
}
