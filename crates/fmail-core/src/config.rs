//! Optional configuration for tunables.
//!
//! Forge Mail is zero-configuration: every knob has a default matching the
//! engine constants, and no file needs to exist. Operators who want to pin
//! intervals can drop a `config.toml` either globally
//! (`~/.config/fmail/config.toml`) or per project (`.fmail/config.toml`);
//! the project file wins field-group by field-group.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// TOML parsing error
    #[error("TOML parse error in {path}: {source}")]
    TomlParse {
        path: std::path::PathBuf,
        source: toml::de::Error,
    },

    /// Duration string did not parse
    #[error("invalid duration '{0}': use e.g. \"24h\" or \"7d\"")]
    BadDuration(String),
}

/// Complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Provider tunables
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Broker tunables
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Retention policy
    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Provider-side tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Poll interval floor for file subscriptions, milliseconds
    pub poll_min_ms: u64,
    /// Poll interval ceiling, milliseconds
    pub poll_max_ms: u64,
    /// One-shot query cache TTL, milliseconds
    pub cache_ttl_ms: u64,
    /// Default `limit` applied to unbounded one-shot queries
    pub default_limit: usize,
    /// Pause between broker reconnection attempts, milliseconds
    pub reconnect_ms: u64,
    /// Recently-emitted id window for hybrid deduplication
    pub dedupe_capacity: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            poll_min_ms: 100,
            poll_max_ms: 2_000,
            cache_ttl_ms: 500,
            default_limit: 500,
            reconnect_ms: 2_000,
            dedupe_capacity: 2_048,
        }
    }
}

impl ProviderConfig {
    pub fn poll_min(&self) -> Duration {
        Duration::from_millis(self.poll_min_ms)
    }

    pub fn poll_max(&self) -> Duration {
        Duration::from_millis(self.poll_max_ms.max(self.poll_min_ms))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_ms)
    }
}

/// Broker-side tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Serve the TCP loopback listener in addition to the Unix socket
    pub tcp: bool,
    /// TCP loopback port
    pub tcp_port: u16,
    /// Replay ring buffer capacity, messages
    pub ring_capacity: usize,
    /// Per-subscriber channel capacity, messages
    pub channel_capacity: usize,
    /// Seconds a subscriber's channel may stay full before it is dropped
    pub slow_client_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            tcp: true,
            tcp_port: crate::proto::DEFAULT_TCP_PORT,
            ring_capacity: 4_096,
            channel_capacity: 256,
            slow_client_timeout_secs: 5,
        }
    }
}

impl BrokerConfig {
    pub fn slow_client_timeout(&self) -> Duration {
        Duration::from_secs(self.slow_client_timeout_secs)
    }
}

/// Retention policy for `gc`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Maximum message age before a sweep removes it, e.g. `"7d"`, `"24h"`.
    /// Absent means sweeps delete nothing unless an age is given explicitly.
    pub max_age: Option<String>,
}

impl RetentionConfig {
    pub fn max_age_duration(&self) -> Result<Option<chrono::Duration>, ConfigError> {
        self.max_age
            .as_deref()
            .map(parse_duration)
            .transpose()
    }
}

/// Load configuration for a project rooted at `root`.
///
/// Priority (highest wins): project `.fmail/config.toml`, then global
/// `~/.config/fmail/config.toml`, then defaults. A missing file is fine; a
/// malformed file is an error rather than being silently ignored.
pub fn load(root: &Path) -> Result<Config, ConfigError> {
    let mut config = Config::default();
    if let Some(home) = dirs::home_dir() {
        let global = home.join(".config/fmail/config.toml");
        if let Some(file) = load_file(&global)? {
            config = file;
        }
    }
    let project = root.join(crate::root::MAIL_DIR_NAME).join("config.toml");
    if let Some(file) = load_file(&project)? {
        merge(&mut config, file);
    }
    Ok(config)
}

fn load_file(path: &Path) -> Result<Option<Config>, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };
    toml::from_str(&content)
        .map(Some)
        .map_err(|e| ConfigError::TomlParse {
            path: path.to_path_buf(),
            source: e,
        })
}

fn merge(base: &mut Config, project: Config) {
    let defaults = Config::default();
    if project.provider != defaults.provider {
        base.provider = project.provider;
    }
    if project.broker != defaults.broker {
        base.broker = project.broker;
    }
    if project.retention != defaults.retention {
        base.retention = project.retention;
    }
}

/// Parse a duration string: `"24h"` for hours, `"7d"` for days.
pub fn parse_duration(s: &str) -> Result<chrono::Duration, ConfigError> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| ConfigError::BadDuration(s.to_string()))?;
    let (num_part, unit) = s.split_at(split);
    let num: i64 = num_part
        .parse()
        .map_err(|_| ConfigError::BadDuration(s.to_string()))?;
    match unit {
        "h" => Ok(chrono::Duration::hours(num)),
        "d" => Ok(chrono::Duration::days(num)),
        _ => Err(ConfigError::BadDuration(s.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_engine_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.provider.poll_min(), Duration::from_millis(100));
        assert_eq!(cfg.provider.poll_max(), Duration::from_secs(2));
        assert_eq!(cfg.provider.cache_ttl(), Duration::from_millis(500));
        assert_eq!(cfg.provider.default_limit, 500);
        assert_eq!(cfg.provider.dedupe_capacity, 2048);
        assert_eq!(cfg.broker.tcp_port, 7463);
        assert_eq!(cfg.broker.ring_capacity, 4096);
        assert_eq!(cfg.broker.channel_capacity, 256);
        assert_eq!(cfg.broker.slow_client_timeout(), Duration::from_secs(5));
        assert!(cfg.retention.max_age.is_none());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let cfg = load(tmp.path()).unwrap();
        assert_eq!(cfg.provider, ProviderConfig::default());
    }

    #[test]
    fn project_file_overrides() {
        let tmp = TempDir::new().unwrap();
        let mail_dir = tmp.path().join(".fmail");
        std::fs::create_dir_all(&mail_dir).unwrap();
        std::fs::write(
            mail_dir.join("config.toml"),
            "[provider]\npoll_min_ms = 50\npoll_max_ms = 1000\ncache_ttl_ms = 500\ndefault_limit = 500\nreconnect_ms = 2000\ndedupe_capacity = 2048\n\n[retention]\nmax_age = \"7d\"\n",
        )
        .unwrap();
        let cfg = load(tmp.path()).unwrap();
        assert_eq!(cfg.provider.poll_min(), Duration::from_millis(50));
        assert_eq!(
            cfg.retention.max_age_duration().unwrap(),
            Some(chrono::Duration::days(7))
        );
    }

    #[test]
    fn malformed_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let mail_dir = tmp.path().join(".fmail");
        std::fs::create_dir_all(&mail_dir).unwrap();
        std::fs::write(mail_dir.join("config.toml"), "not [valid toml").unwrap();
        assert!(matches!(
            load(tmp.path()),
            Err(ConfigError::TomlParse { .. })
        ));
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("24h").unwrap(), chrono::Duration::hours(24));
        assert_eq!(parse_duration("7d").unwrap(), chrono::Duration::days(7));
        assert!(parse_duration("7").is_err());
        assert!(parse_duration("7m").is_err());
        assert!(parse_duration("").is_err());
    }
}
