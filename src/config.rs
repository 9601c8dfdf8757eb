use std::collections::HashSet;
use std::env;
use std::fs;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Deserializer};

use crate::classify::{DomainAllowList, DomainClassifier, UnknownAddress};
use crate::policy::{
    PolicyThresholds, RiskPolicy, DEFAULT_EXTERNAL_THRESHOLD, DEFAULT_RECIPIENT_THRESHOLD,
};

/// Recipient policy configuration. Loaded once at start-up from an optional
/// JSON file (`GUARD_POLICY_CONFIG`) with environment overrides applied on
/// top, then shared read-only.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardConfig {
    /// Organisation-owned domains. Case-insensitive; a leading `@` is ignored.
    #[serde(default = "default_internal_domains")]
    pub internal_domains: Vec<String>,
    /// `null` or `0` disables the total-recipients rule.
    #[serde(
        default = "default_recipient_threshold",
        deserialize_with = "deserialize_threshold"
    )]
    pub recipient_threshold: Option<usize>,
    #[serde(default = "default_external_threshold")]
    pub external_threshold: usize,
    #[serde(default)]
    pub unknown_address: UnknownAddress,
    /// Budget for a gating evaluation before the send is allowed anyway.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Quiet window for collapsing recipient-change notifications.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_internal_domains() -> Vec<String> {
    vec!["yourcompany.com".to_owned()]
}

fn default_recipient_threshold() -> Option<usize> {
    Some(DEFAULT_RECIPIENT_THRESHOLD)
}

fn deserialize_threshold<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<usize>::deserialize(deserializer)?.filter(|n| *n > 0))
}

fn default_external_threshold() -> usize {
    DEFAULT_EXTERNAL_THRESHOLD
}

fn default_send_timeout_ms() -> u64 {
    5000
}

fn default_debounce_ms() -> u64 {
    crate::live::DEFAULT_DEBOUNCE.as_millis() as u64
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            internal_domains: default_internal_domains(),
            recipient_threshold: default_recipient_threshold(),
            external_threshold: default_external_threshold(),
            unknown_address: UnknownAddress::default(),
            send_timeout_ms: default_send_timeout_ms(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl GuardConfig {
    pub fn classifier(&self) -> DomainClassifier {
        DomainClassifier::new(
            DomainAllowList::new(&self.internal_domains),
            self.unknown_address,
        )
    }

    pub fn policy(&self) -> RiskPolicy {
        RiskPolicy::new(PolicyThresholds {
            recipient_threshold: self.recipient_threshold.filter(|n| *n > 0),
            external_threshold: self.external_threshold,
        })
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.external_threshold == 0 {
            bail!("externalThreshold must be at least 1");
        }
        if self.send_timeout_ms == 0 {
            bail!("sendTimeoutMs must be greater than zero");
        }
        if DomainAllowList::new(&self.internal_domains).is_empty() {
            tracing::warn!("no internal domains configured; every recipient counts as external");
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(raw) = non_empty_env("GUARD_INTERNAL_DOMAINS")? {
            self.internal_domains = raw
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect();
        }
        if let Some(raw) = non_empty_env("GUARD_RECIPIENT_THRESHOLD")? {
            self.recipient_threshold = parse_threshold(&raw)
                .ok_or_else(|| anyhow!("GUARD_RECIPIENT_THRESHOLD must be a positive integer or 'off'"))?;
        }
        if let Some(v) = parse_optional_u64("GUARD_EXTERNAL_THRESHOLD")? {
            self.external_threshold = v as usize;
        }
        if let Some(raw) = non_empty_env("GUARD_UNKNOWN_ADDRESS")? {
            self.unknown_address = UnknownAddress::parse(&raw)
                .ok_or_else(|| anyhow!("GUARD_UNKNOWN_ADDRESS must be 'internal' or 'external'"))?;
        }
        if let Some(v) = parse_optional_u64("GUARD_SEND_TIMEOUT_MS")? {
            self.send_timeout_ms = v;
        }
        if let Some(v) = parse_optional_u64("GUARD_DEBOUNCE_MS")? {
            self.debounce_ms = v;
        }
        Ok(())
    }
}

/// `off`/`none`/`0` disable the rule, any other positive integer sets it.
fn parse_threshold(raw: &str) -> Option<Option<usize>> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "off" | "none" | "disabled" | "0" => Some(None),
        other => other.parse::<usize>().ok().map(Some),
    }
}

#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
    pub compress: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_bytes: None,
            keep: 1,
            compress: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub guard: GuardConfig,
    pub log_file: Option<String>,
    pub audit_log_file: Option<String>,
    pub allowed_tokens: Option<HashSet<String>>,
    pub rotation: RotationConfig,
    pub log_stdout: bool,
    pub log_sample_n: Option<u64>,
    pub max_request_bytes: Option<usize>,
    pub audit_only: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let mut guard = if let Ok(path) = env::var("GUARD_POLICY_CONFIG") {
            let content = fs::read_to_string(&path).with_context(|| {
                format!(
                    "Failed to read GUARD_POLICY_CONFIG '{}': file unreadable",
                    path
                )
            })?;
            serde_json::from_str::<GuardConfig>(&content).with_context(|| {
                format!(
                    "Failed to parse GUARD_POLICY_CONFIG '{}': invalid JSON configuration",
                    path
                )
            })?
        } else {
            GuardConfig::default()
        };
        guard.apply_env_overrides()?;
        guard.validate()?;

        let log_file = env::var("LOG_FILE").ok();
        let audit_log_file = env::var("AUDIT_LOG_FILE").ok();

        let allowed_tokens = env::var("STRICT_AUTH_ALLOWED_TOKENS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect::<HashSet<_>>()
            })
            .filter(|set: &HashSet<String>| !set.is_empty());

        let rotation = RotationConfig {
            max_bytes: parse_optional_u64("LOG_MAX_BYTES")?,
            keep: parse_optional_u64("LOG_ROTATE_KEEP")?.unwrap_or(1) as usize,
            compress: parse_bool_env("LOG_ROTATE_COMPRESS")?.unwrap_or(false),
        };

        let log_stdout = parse_bool_env("GUARD_LOG_STDOUT")?.unwrap_or(false);
        let log_sample_n = parse_optional_u64("GUARD_LOG_SAMPLE_N")?.filter(|n| *n > 1);
        let max_request_bytes = parse_optional_u64("GUARD_MAX_REQUEST_BYTES")?.map(|v| v as usize);
        let audit_only = parse_bool_env("GUARD_AUDIT_ONLY")?.unwrap_or(false);

        Ok(Self {
            guard,
            log_file,
            audit_log_file,
            allowed_tokens,
            rotation,
            log_stdout,
            log_sample_n,
            max_request_bytes,
            audit_only,
        })
    }
}

fn non_empty_env(var: &str) -> Result<Option<String>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(Some(value)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match non_empty_env(var)? {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        None => Ok(None),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match non_empty_env(var)? {
        Some(value) => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        None => Ok(None),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    const VARS: &[&str] = &[
        "GUARD_POLICY_CONFIG",
        "GUARD_INTERNAL_DOMAINS",
        "GUARD_RECIPIENT_THRESHOLD",
        "GUARD_EXTERNAL_THRESHOLD",
        "GUARD_UNKNOWN_ADDRESS",
        "GUARD_SEND_TIMEOUT_MS",
        "GUARD_DEBOUNCE_MS",
        "STRICT_AUTH_ALLOWED_TOKENS",
        "LOG_FILE",
        "AUDIT_LOG_FILE",
        "LOG_MAX_BYTES",
        "LOG_ROTATE_KEEP",
        "LOG_ROTATE_COMPRESS",
        "GUARD_LOG_STDOUT",
        "GUARD_LOG_SAMPLE_N",
        "GUARD_MAX_REQUEST_BYTES",
        "GUARD_AUDIT_ONLY",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn parses_environment_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.guard, GuardConfig::default());
        assert_eq!(cfg.guard.recipient_threshold, Some(10));
        assert_eq!(cfg.guard.external_threshold, 5);
        assert_eq!(cfg.guard.send_timeout_ms, 5000);
        assert_eq!(cfg.guard.debounce_ms, 300);
        assert!(cfg.log_file.is_none());
        assert_eq!(cfg.rotation.keep, 1);
        assert!(!cfg.log_stdout);
        assert!(!cfg.audit_only);
    }

    #[test]
    fn parses_policy_file_with_env_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        let mut temp = NamedTempFile::new().unwrap();
        let config = serde_json::json!({
            "internalDomains": ["bcc.no", "bcc.media"],
            "recipientThreshold": null,
            "externalThreshold": 6,
            "unknownAddress": "internal",
            "sendTimeoutMs": 10000
        });
        use std::io::Write;
        write!(temp, "{}", config).unwrap();

        std::env::set_var("GUARD_POLICY_CONFIG", temp.path());
        std::env::set_var("GUARD_EXTERNAL_THRESHOLD", "4");
        std::env::set_var("STRICT_AUTH_ALLOWED_TOKENS", "a,b");
        std::env::set_var("LOG_FILE", "/tmp/telemetry.log");
        std::env::set_var("LOG_MAX_BYTES", "1024");
        std::env::set_var("LOG_ROTATE_KEEP", "5");
        std::env::set_var("LOG_ROTATE_COMPRESS", "true");
        std::env::set_var("GUARD_AUDIT_ONLY", "1");
        std::env::set_var("GUARD_LOG_SAMPLE_N", "4");

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.guard.internal_domains, vec!["bcc.no", "bcc.media"]);
        assert_eq!(cfg.guard.recipient_threshold, None);
        assert_eq!(cfg.guard.external_threshold, 4);
        assert_eq!(cfg.guard.unknown_address, UnknownAddress::Internal);
        assert_eq!(cfg.guard.send_timeout(), Duration::from_millis(10000));
        assert_eq!(cfg.guard.debounce_ms, 300);
        assert_eq!(cfg.rotation.max_bytes, Some(1024));
        assert_eq!(cfg.rotation.keep, 5);
        assert!(cfg.rotation.compress);
        assert!(cfg.audit_only);
        assert_eq!(cfg.log_sample_n, Some(4));
        let tokens = cfg.allowed_tokens.unwrap();
        assert!(tokens.contains("a") && tokens.contains("b"));

        clear_env();
    }

    #[test]
    fn env_can_disable_recipient_threshold_and_set_domains() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        std::env::set_var("GUARD_RECIPIENT_THRESHOLD", "off");
        std::env::set_var("GUARD_INTERNAL_DOMAINS", " corp.no, ,corp.com ");
        std::env::set_var("GUARD_UNKNOWN_ADDRESS", "external");

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.guard.recipient_threshold, None);
        assert_eq!(cfg.guard.internal_domains, vec!["corp.no", "corp.com"]);
        assert!(cfg.guard.classifier().is_external(""));

        clear_env();
    }

    #[test]
    fn rejects_invalid_values() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        std::env::set_var("GUARD_EXTERNAL_THRESHOLD", "0");
        assert!(AppConfig::from_env().is_err());
        std::env::remove_var("GUARD_EXTERNAL_THRESHOLD");

        std::env::set_var("GUARD_UNKNOWN_ADDRESS", "sometimes");
        assert!(AppConfig::from_env().is_err());
        std::env::remove_var("GUARD_UNKNOWN_ADDRESS");

        std::env::set_var("GUARD_SEND_TIMEOUT_MS", "soon");
        assert!(AppConfig::from_env().is_err());

        clear_env();
    }

    #[test]
    fn threshold_parsing() {
        assert_eq!(parse_threshold("off"), Some(None));
        assert_eq!(parse_threshold("0"), Some(None));
        assert_eq!(parse_threshold("12"), Some(Some(12)));
        assert_eq!(parse_threshold("-3"), None);
    }

    #[test]
    fn zero_threshold_in_file_disables_the_rule() {
        let cfg: GuardConfig = serde_json::from_str(r#"{"recipientThreshold":0}"#).unwrap();
        assert_eq!(cfg.recipient_threshold, None);

        let cfg: GuardConfig = serde_json::from_str(r#"{"recipientThreshold":12}"#).unwrap();
        assert_eq!(cfg.recipient_threshold, Some(12));

        let cfg: GuardConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.recipient_threshold, Some(10));

        let built = GuardConfig {
            recipient_threshold: Some(0),
            ..GuardConfig::default()
        };
        assert_eq!(built.policy().thresholds().recipient_threshold, None);
    }
}
