//! Configuration for instances and the sync engine.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, SyncError};

/// Default Akahu lookback in days.
pub const DEFAULT_SYNC_DAYS: u32 = 20;

/// A credential string.
///
/// Debug output is redacted and the memory is cleared on drop. There is no
/// `Serialize` impl so a secret cannot end up in a persisted record.
#[derive(Clone, Default, PartialEq, Eq, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the raw value. Only call this when building a request.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Setup fields for one ledger instance.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    /// Ledger service URL
    pub endpoint: String,
    /// Server password
    pub password: Secret,
    /// Budget file encryption passphrase (empty for unencrypted files)
    #[serde(default)]
    pub encrypt_password: Secret,
    /// Budget file id
    pub file: String,
    /// Disable peer certificate verification
    #[serde(default)]
    pub skip_validate_cert: bool,
    /// PEM certificate pinned in place of the system trust store
    #[serde(default)]
    pub cert: Option<String>,
    /// Display currency unit
    #[serde(default = "default_unit")]
    pub unit: String,
    /// Sensor name prefix (empty for none)
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Akahu app token (`app_token_...`)
    #[serde(default)]
    pub akahu_app_id: Option<String>,
    /// Akahu user token (`Bearer user_token...`)
    #[serde(default)]
    pub akahu_auth_token: Option<Secret>,
}

fn default_unit() -> String {
    "€".to_string()
}

fn default_prefix() -> String {
    "actualbudget".to_string()
}

impl InstanceConfig {
    /// Minimal config for an endpoint and file.
    pub fn new(
        endpoint: impl Into<String>,
        password: impl Into<String>,
        file: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            password: Secret::new(password),
            encrypt_password: Secret::default(),
            file: file.into(),
            skip_validate_cert: false,
            cert: None,
            unit: default_unit(),
            prefix: default_prefix(),
            akahu_app_id: None,
            akahu_auth_token: None,
        }
    }

    /// Attach Akahu credentials.
    pub fn with_akahu(mut self, app_id: impl Into<String>, auth_token: impl Into<String>) -> Self {
        self.akahu_app_id = Some(app_id.into());
        self.akahu_auth_token = Some(Secret::new(auth_token));
        self
    }

    /// Set the file encryption passphrase.
    pub fn with_encrypt_password(mut self, passphrase: impl Into<String>) -> Self {
        self.encrypt_password = Secret::new(passphrase);
        self
    }
}

/// Engine-wide tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// TCP/TLS connect timeout (seconds)
    pub connect_timeout_secs: u64,
    /// Per-request timeout (seconds)
    pub request_timeout_secs: u64,
    /// Attempts per sync run, including the first
    pub max_attempts: u32,
    /// First retry delay (ms)
    pub backoff_base_ms: u64,
    /// Retry delay cap (ms)
    pub backoff_max_ms: u64,
    /// Ledger session lifetime before it is re-established (seconds)
    pub session_timeout_secs: u64,
    /// Interval of the scheduled budget refresh (seconds)
    pub scan_interval_secs: u64,
    /// Runs allowed in parallel across all instances
    pub max_concurrent_runs: usize,
    /// Runs kept per instance
    pub run_history: usize,
    /// Transactions per import batch
    pub batch_size: usize,
    /// Lookback for the linked-bank feed when an account has no cursor (days)
    pub initial_lookback_days: u32,
    /// Overlap re-fetched before an existing cursor (days)
    pub cursor_overlap_days: u32,
    /// Akahu API base URL
    pub akahu_base_url: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            session_timeout_secs: 30 * 60,
            scan_interval_secs: 60 * 60,
            max_concurrent_runs: 4,
            run_history: 20,
            batch_size: 200,
            initial_lookback_days: 90,
            cursor_overlap_days: 3,
            akahu_base_url: "https://api.akahu.io/v1".to_string(),
        }
    }
}

impl SyncSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }

    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

/// Top-level config file: settings plus the configured instances.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LedgerSyncConfig {
    #[serde(default)]
    pub settings: SyncSettings,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

impl LedgerSyncConfig {
    /// Load config from YAML.
    pub fn from_yaml(yaml: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Load config from a YAML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Unknown(format!("Cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
            .map_err(|e| SyncError::Unknown(format!("Invalid config {}: {}", path.display(), e)))
    }
}

/// Akahu lookback window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDays {
    /// The last N days
    Days(u32),
    /// Everything the provider has
    All,
}

impl Default for SyncDays {
    fn default() -> Self {
        SyncDays::Days(DEFAULT_SYNC_DAYS)
    }
}

impl SyncDays {
    /// Parse a user-supplied value, falling back to the default window when
    /// it is missing or unparsable.
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") => Self::default(),
            Some(value) => value.parse().unwrap_or_else(|_| {
                warn!(
                    sync_days = value,
                    "Could not parse Akahu sync days, defaulting to {}", DEFAULT_SYNC_DAYS
                );
                Self::default()
            }),
        }
    }

    /// Start of the window relative to `now`; `None` means unbounded.
    ///
    /// A window reaching past the earliest representable date is unbounded.
    pub fn start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            SyncDays::Days(days) => ChronoDuration::try_days(i64::from(*days))
                .and_then(|window| now.checked_sub_signed(window)),
            SyncDays::All => None,
        }
    }
}

impl FromStr for SyncDays {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            return Ok(SyncDays::All);
        }
        match s.trim().parse::<u32>() {
            Ok(days) if days > 0 => Ok(SyncDays::Days(days)),
            _ => Err(format!("expected a positive number of days or ALL, got {:?}", s)),
        }
    }
}

impl std::fmt::Display for SyncDays {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncDays::Days(days) => write!(f, "{}", days),
            SyncDays::All => f.write_str("ALL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_default_settings() {
        let settings = SyncSettings::default();
        assert_eq!(settings.max_attempts, 3);
        assert_eq!(settings.session_timeout(), Duration::from_secs(1800));
        assert_eq!(settings.scan_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let settings = SyncSettings {
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            ..Default::default()
        };
        assert_eq!(settings.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(settings.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(settings.backoff_delay(4), Duration::from_millis(800));
        assert_eq!(settings.backoff_delay(5), Duration::from_millis(1_000));
        assert_eq!(settings.backoff_delay(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_sync_days_parsing() {
        assert_eq!("ALL".parse::<SyncDays>().unwrap(), SyncDays::All);
        assert_eq!("all".parse::<SyncDays>().unwrap(), SyncDays::All);
        assert_eq!("45".parse::<SyncDays>().unwrap(), SyncDays::Days(45));
        assert!("0".parse::<SyncDays>().is_err());
        assert!("soon".parse::<SyncDays>().is_err());

        assert_eq!(SyncDays::parse_lenient(None), SyncDays::Days(20));
        assert_eq!(SyncDays::parse_lenient(Some("soon")), SyncDays::Days(20));
        assert_eq!(SyncDays::parse_lenient(Some(" All ")), SyncDays::All);
    }

    #[test]
    fn test_sync_days_window() {
        let now = Utc.with_ymd_and_hms(2024, 3, 21, 12, 0, 0).unwrap();
        assert_eq!(
            SyncDays::Days(20).start(now),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
        );
        assert_eq!(SyncDays::All.start(now), None);
    }

    #[test]
    fn test_huge_window_is_unbounded() {
        let now = Utc.with_ymd_and_hms(2024, 3, 21, 12, 0, 0).unwrap();
        let days = SyncDays::parse_lenient(Some("4000000000"));
        assert_eq!(days, SyncDays::Days(4_000_000_000));
        assert_eq!(days.start(now), None);
        assert_eq!(SyncDays::Days(u32::MAX).start(now), None);
    }

    #[test]
    fn test_secret_is_redacted() {
        let config = InstanceConfig::new("https://ledger.local", "hunter2", "budget")
            .with_akahu("app_token_abc", "Bearer user_token_xyz");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("user_token_xyz"));
        assert!(debug.contains("Secret(***)"));
    }

    #[test]
    fn test_yaml_config() {
        let yaml = r#"
settings:
  max_attempts: 5
instances:
  - endpoint: https://ledger.local:5006
    password: pw
    encrypt_password: ""
    file: household
    akahu_app_id: app_token_1
    akahu_auth_token: Bearer user_token_1
"#;
        let config = LedgerSyncConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.settings.max_attempts, 5);
        assert_eq!(config.settings.request_timeout_secs, 30);
        let instance = &config.instances[0];
        assert_eq!(instance.unit, "€");
        assert_eq!(instance.prefix, "actualbudget");
        assert!(!instance.skip_validate_cert);
        assert_eq!(instance.password.expose(), "pw");
        assert!(instance.encrypt_password.is_empty());
    }
}
