//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{GuardOptions, KeyStrategy, LimitConfig, RegistrySettings};

/// Prefix of environment variables overriding file configuration, e.g.
/// `TURNSTILE_RATE_LIMITING__GLOBAL__ENABLED=true`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Idle time in seconds after which an identity's bucket is evicted
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,

    /// Seconds between eviction passes
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Process-wide per-address limit
    #[serde(default)]
    pub global: GlobalLimitConfig,

    /// Named guards
    #[serde(default)]
    pub policies: BTreeMap<String, PolicyConfig>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            global: GlobalLimitConfig::default(),
            policies: BTreeMap::new(),
        }
    }
}

fn default_idle_ttl() -> u64 {
    600
}

fn default_sweep_interval() -> u64 {
    300
}

/// The global per-address limit applied to every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalLimitConfig {
    /// Whether the global limit is applied
    #[serde(default)]
    pub enabled: bool,

    /// Permits per second
    #[serde(default = "default_global_rate")]
    pub rate: f64,

    /// Maximum instantaneous permits
    #[serde(default = "default_global_burst")]
    pub burst: u32,
}

impl Default for GlobalLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rate: default_global_rate(),
            burst: default_global_burst(),
        }
    }
}

fn default_global_rate() -> f64 {
    100.0
}

fn default_global_burst() -> u32 {
    200
}

impl GlobalLimitConfig {
    pub fn limit(&self) -> Result<LimitConfig> {
        LimitConfig::new(self.rate, self.burst)
    }
}

/// How a policy derives identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    #[default]
    ClientAddress,
    Principal,
    Header,
}

/// A named admission guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Permits per second
    pub rate: f64,

    /// Maximum instantaneous permits
    pub burst: u32,

    /// Identity source
    #[serde(default)]
    pub key: KeyKind,

    /// Header to key by; required when `key` is `header`
    #[serde(default)]
    pub header: Option<String>,

    /// Message surfaced on rejection
    #[serde(default)]
    pub message: Option<String>,

    /// Isolates this policy's state from others with the same rate and burst
    #[serde(default)]
    pub namespace: Option<String>,
}

impl PolicyConfig {
    /// Convert into guard options, validating rate, burst and key.
    pub fn to_options(&self) -> Result<GuardOptions> {
        let limit = LimitConfig::new(self.rate, self.burst)?;
        let key = match self.key {
            KeyKind::ClientAddress => KeyStrategy::ClientAddress,
            KeyKind::Principal => KeyStrategy::Principal,
            KeyKind::Header => match self.header.as_deref() {
                Some(header) if !header.is_empty() => KeyStrategy::Header {
                    header: header.to_string(),
                },
                _ => {
                    return Err(TurnstileError::Config(
                        "header key requires a header name".into(),
                    ))
                }
            },
        };

        let mut options = GuardOptions::new(limit).key(key);
        options.message = self.message.clone();
        options.namespace = self.namespace.clone();
        Ok(options)
    }
}

impl From<&RateLimitingConfig> for RegistrySettings {
    fn from(config: &RateLimitingConfig) -> Self {
        RegistrySettings {
            idle_ttl: Duration::from_secs(config.idle_ttl_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
        }
    }
}

impl RateLimitingConfig {
    /// Eviction settings for the limiter registry.
    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings::from(self)
    }
}

impl TurnstileConfig {
    /// Load configuration from an optional YAML file, overridden by
    /// `TURNSTILE_`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let config: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would fail when guards are built.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limiting;
        if rl.idle_ttl_secs == 0 {
            return Err(TurnstileError::Config("idle_ttl_secs must be greater than zero".into()));
        }
        if rl.sweep_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "sweep_interval_secs must be greater than zero".into(),
            ));
        }
        rl.registry_settings().validate()?;
        if rl.global.enabled {
            rl.global.limit()?;
        }
        for (name, policy) in &rl.policies {
            policy
                .to_options()
                .map_err(|e| TurnstileError::Config(format!("policy '{}': {}", name, e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::default();
        let rl = &config.rate_limiting;

        assert_eq!(rl.idle_ttl_secs, 600);
        assert_eq!(rl.sweep_interval_secs, 300);
        assert!(!rl.global.enabled);
        assert_eq!(rl.global.rate, 100.0);
        assert_eq!(rl.global.burst, 200);
        assert_eq!(rl.registry_settings(), RegistrySettings::default());
    }

    #[test]
    fn test_parse_policies() {
        let yaml = r#"
rate_limiting:
  idle_ttl_secs: 120
  global:
    enabled: true
    rate: 50
    burst: 100
  policies:
    login:
      rate: 5
      burst: 10
      message: Too many login attempts
    api:
      rate: 50
      burst: 100
      key: header
      header: X-API-Key
    account:
      rate: 100
      burst: 200
      key: principal
      namespace: account
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        let rl = &config.rate_limiting;

        assert_eq!(rl.idle_ttl_secs, 120);
        assert_eq!(rl.sweep_interval_secs, 300);
        assert!(rl.global.enabled);
        assert_eq!(rl.global.limit().unwrap(), LimitConfig::moderate());
        assert_eq!(rl.policies.len(), 3);

        let login = rl.policies["login"].to_options().unwrap();
        assert_eq!(login.limit, LimitConfig::strict());
        assert_eq!(login.message.as_deref(), Some("Too many login attempts"));

        assert_eq!(rl.policies["api"].key, KeyKind::Header);
        assert_eq!(rl.policies["account"].key, KeyKind::Principal);
        let account = rl.policies["account"].to_options().unwrap();
        assert_eq!(account.namespace.as_deref(), Some("account"));
    }

    #[test]
    fn test_invalid_policy_is_rejected() {
        let yaml = r#"
rate_limiting:
  policies:
    broken:
      rate: 0
      burst: 10
"#;
        let err = TurnstileConfig::from_yaml(yaml).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_header_key_requires_header_name() {
        let yaml = r#"
rate_limiting:
  policies:
    api:
      rate: 10
      burst: 10
      key: header
"#;
        assert!(TurnstileConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_zero_durations_are_rejected() {
        assert!(TurnstileConfig::from_yaml("rate_limiting:\n  idle_ttl_secs: 0\n").is_err());
        assert!(TurnstileConfig::from_yaml("rate_limiting:\n  sweep_interval_secs: 0\n").is_err());
    }

    #[test]
    fn test_oversized_sweep_interval_is_rejected() {
        let yaml = "rate_limiting:\n  sweep_interval_secs: 18446744073709551615\n";
        let err = TurnstileConfig::from_yaml(yaml).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("too large"));

        let yaml = "rate_limiting:\n  sweep_interval_secs: 31536000\n";
        assert!(TurnstileConfig::from_yaml(yaml).is_ok());
    }

    #[test]
    fn test_registry_settings_from_config() {
        let config = TurnstileConfig::from_yaml(
            "rate_limiting:\n  idle_ttl_secs: 90\n  sweep_interval_secs: 15\n",
        )
        .unwrap();
        let settings = RegistrySettings::from(&config.rate_limiting);

        assert_eq!(settings.idle_ttl, Duration::from_secs(90));
        assert_eq!(settings.sweep_interval, Duration::from_secs(15));
        assert_eq!(config.rate_limiting.registry_settings(), settings);
    }

    #[test]
    fn test_disabled_global_limit_is_not_validated() {
        let yaml = r#"
rate_limiting:
  global:
    enabled: false
    rate: 0
"#;
        assert!(TurnstileConfig::from_yaml(yaml).is_ok());
    }

    #[test]
    fn test_load_layers_environment_over_file() {
        let path = std::env::temp_dir().join(format!("turnstile-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "rate_limiting:\n  idle_ttl_secs: 120\n  sweep_interval_secs: 60\n",
        )
        .unwrap();
        std::env::set_var("TURNSTILE_RATE_LIMITING__SWEEP_INTERVAL_SECS", "30");

        let config = TurnstileConfig::load(Some(&path));
        std::env::remove_var("TURNSTILE_RATE_LIMITING__SWEEP_INTERVAL_SECS");
        std::fs::remove_file(&path).unwrap();

        let config = config.unwrap();
        assert_eq!(config.rate_limiting.idle_ttl_secs, 120);
        assert_eq!(config.rate_limiting.sweep_interval_secs, 30);
    }
}
