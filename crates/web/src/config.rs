//! Broker configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// HTTP listen address
    pub listen: String,

    /// SQLite database path
    pub db_path: PathBuf,

    /// Log output format
    pub log_format: LogFormat,

    /// Identity token validation
    pub auth: AuthConfig,

    /// Stored-secret key
    pub security: SecurityConfig,

    /// Hypervisor API client
    pub hypervisor: HypervisorConfig,

    /// Relay behaviour
    pub relay: RelayConfig,

    /// Health metrics and maintenance
    pub metrics: MetricsConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            db_path: vmrelay_common::default_db_path(),
            log_format: LogFormat::Text,
            auth: AuthConfig::default(),
            security: SecurityConfig::default(),
            hypervisor: HypervisorConfig::default(),
            relay: RelayConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Identity token (HS256 JWT) validation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared HMAC secret. Empty means a random secret is generated at startup.
    pub jwt_secret: String,

    /// Required `iss` claim, if set
    pub issuer: Option<String>,

    /// Required `aud` claim, if set
    pub audience: Option<String>,
}

/// Key for the registry's masked secrets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub secret_key: String,
}

/// Hypervisor API client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Use https/wss towards the hypervisor
    pub tls: bool,

    /// Verify hypervisor certificates (Proxmox ships self-signed ones)
    pub verify_tls: bool,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            tls: true,
            verify_tls: false,
        }
    }
}

impl HypervisorConfig {
    pub fn http_scheme(&self) -> &'static str {
        if self.tls { "https" } else { "http" }
    }

    pub fn ws_scheme(&self) -> &'static str {
        if self.tls { "wss" } else { "ws" }
    }
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// How long teardown waits for the surviving leg to close
    pub close_grace_ms: u64,

    /// Maximum Relaying duration; 0 means unlimited
    pub max_session_secs: u64,

    /// Frames in flight per direction
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            close_grace_ms: 5_000,
            max_session_secs: 0,
            channel_capacity: 64,
        }
    }
}

impl RelayConfig {
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn max_session(&self) -> Option<Duration> {
        (self.max_session_secs > 0).then(|| Duration::from_secs(self.max_session_secs))
    }
}

/// Health metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Samples considered per recomputation
    pub window: usize,

    /// Successful samples required before latency fields are derived
    pub min_samples: usize,

    /// Sample retention in days
    pub retention_days: i64,

    /// Health probe interval; 0 disables probing
    pub probe_interval_secs: u64,

    /// Retention sweep interval; 0 disables the sweeper
    pub purge_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window: 100,
            min_samples: 10,
            retention_days: 30,
            probe_interval_secs: 300,
            purge_interval_secs: 24 * 60 * 60,
        }
    }
}

impl BrokerConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `VMRELAY_*` environment overrides
    pub fn apply_env(&mut self) {
        if let Some(v) = env_nonempty("VMRELAY_LISTEN") {
            self.listen = v;
        }
        if let Some(v) = env_nonempty("VMRELAY_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = env_nonempty("VMRELAY_JWT_SECRET") {
            self.auth.jwt_secret = v;
        }
        if let Some(v) = env_nonempty("VMRELAY_SECRET_KEY") {
            self.security.secret_key = v;
        }
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .and_then(|v| if v.trim().is_empty() { None } else { Some(v) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: BrokerConfig = toml::from_str(
            r#"
            listen = "0.0.0.0:9443"

            [relay]
            max_session_secs = 3600

            [hypervisor]
            tls = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.listen, "0.0.0.0:9443");
        assert_eq!(cfg.relay.max_session(), Some(Duration::from_secs(3600)));
        assert_eq!(cfg.relay.close_grace_ms, 5_000);
        assert_eq!(cfg.hypervisor.ws_scheme(), "ws");
        assert_eq!(cfg.metrics.window, 100);
        assert_eq!(cfg.metrics.min_samples, 10);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = BrokerConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.metrics.retention_days, 30);
        assert_eq!(cfg.relay.max_session(), None);
        assert_eq!(cfg.hypervisor.http_scheme(), "https");
    }
}
