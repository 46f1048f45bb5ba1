//! Bridge configuration – reads/writes `~/.linkbridge/config.toml`.
//!
//! The file is optional; every field has a default.  After loading,
//! `LINKBRIDGE_*` environment variables override individual fields (see
//! [`apply_env_overrides`]).  The library crates never see this type: it is
//! converted into [`ProtocolSettings`], [`EngineConfig`] and
//! [`ServerSettings`] here.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use linkbridge_middleware::{NameFilter, ProtocolSettings};
use linkbridge_notify::EngineConfig;
use linkbridge_server::ServerSettings;
use linkbridge_types::BridgeError;

/// Persisted bridge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Address both servers bind to.
    #[serde(default = "default_address")]
    pub address: String,

    /// HTTP port of the `/lrt` resource surface.
    #[serde(default = "default_resource_port")]
    pub resource_port: u16,

    /// Seconds to wait before retrying a failed bind.
    #[serde(default = "default_retry_startup_delay")]
    pub retry_startup_delay_secs: f64,

    /// Seconds an incomplete fragment group is kept.
    #[serde(default = "default_fragment_timeout")]
    pub fragment_timeout_secs: u64,

    #[serde(default)]
    pub delay_between_messages_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<usize>,

    /// Close WebSocket connections silent for this many seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment_size: Option<usize>,

    /// Refuse text frames and answer in binary only.
    #[serde(default)]
    pub binary_only: bool,

    /// Topic allow-list globs; empty allows every topic.
    #[serde(default)]
    pub topics_glob: Vec<String>,

    /// Service allow-list globs; empty allows every service.
    #[serde(default)]
    pub services_glob: Vec<String>,

    #[serde(default)]
    pub notification: NotificationConfig,
}

/// The `[notification]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_backpressure_multiplier")]
    pub backpressure_multiplier: usize,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_concurrent_deliveries")]
    pub max_concurrent_deliveries: usize,
}

fn default_port() -> u16 {
    9090
}
fn default_address() -> String {
    "0.0.0.0".to_string()
}
fn default_resource_port() -> u16 {
    8080
}
fn default_retry_startup_delay() -> f64 {
    2.0
}
fn default_fragment_timeout() -> u64 {
    600
}
fn default_backpressure_multiplier() -> usize {
    5
}
fn default_poll_interval() -> u64 {
    10
}
fn default_max_concurrent_deliveries() -> usize {
    64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            address: default_address(),
            resource_port: default_resource_port(),
            retry_startup_delay_secs: default_retry_startup_delay(),
            fragment_timeout_secs: default_fragment_timeout(),
            delay_between_messages_ms: 0,
            max_message_size: None,
            idle_timeout_secs: None,
            fragment_size: None,
            binary_only: false,
            topics_glob: Vec::new(),
            services_glob: Vec::new(),
            notification: NotificationConfig::default(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            backpressure_multiplier: default_backpressure_multiplier(),
            poll_interval_ms: default_poll_interval(),
            max_concurrent_deliveries: default_max_concurrent_deliveries(),
        }
    }
}

impl Config {
    /// Fails when a glob does not compile.
    pub fn protocol_settings(&self) -> Result<ProtocolSettings, BridgeError> {
        Ok(ProtocolSettings {
            fragment_size: self.fragment_size,
            max_message_size: self.max_message_size,
            binary_only: self.binary_only,
            fragment_timeout: Duration::from_secs(self.fragment_timeout_secs),
            topics: NameFilter::new(&self.topics_glob)?,
            services: NameFilter::new(&self.services_glob)?,
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            backpressure_multiplier: self.notification.backpressure_multiplier,
            poll_interval: Duration::from_millis(self.notification.poll_interval_ms),
            max_concurrent_deliveries: self.notification.max_concurrent_deliveries.max(1),
        }
    }

    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            address: self.address.clone(),
            port: self.port,
            resource_port: self.resource_port,
            delay_between_messages: Duration::from_millis(self.delay_between_messages_ms),
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
        }
    }

    /// Negative or non-finite values fall back to the default.
    pub fn retry_startup_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.retry_startup_delay_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_retry_startup_delay()))
    }
}

/// Return the path to `~/.linkbridge/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".linkbridge").join("config.toml")
}

/// Load the config file, or defaults when it does not exist, then apply the
/// environment overrides.
pub fn load() -> Result<Config, String> {
    let mut cfg = load_from(&config_path())?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Parse the config at `path`.  Returns `None` if the file does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config at {}: {}", path.display(), e))?;
    Ok(Some(cfg))
}

/// Apply `LINKBRIDGE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `LINKBRIDGE_PORT` | `port` |
/// | `LINKBRIDGE_ADDRESS` | `address` |
/// | `LINKBRIDGE_RESOURCE_PORT` | `resource_port` |
/// | `LINKBRIDGE_BINARY_ONLY` | `binary_only` (`true` / `false`) |
/// | `LINKBRIDGE_FRAGMENT_SIZE` | `fragment_size` |
/// | `LINKBRIDGE_MAX_MESSAGE_SIZE` | `max_message_size` |
/// | `LINKBRIDGE_TOPICS_GLOB` | `topics_glob`, comma separated |
/// | `LINKBRIDGE_SERVICES_GLOB` | `services_glob`, comma separated |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Some(port) = env_parsed::<u16>("LINKBRIDGE_PORT") {
        cfg.port = port;
    }
    if let Ok(v) = std::env::var("LINKBRIDGE_ADDRESS") {
        cfg.address = v;
    }
    if let Some(port) = env_parsed::<u16>("LINKBRIDGE_RESOURCE_PORT") {
        cfg.resource_port = port;
    }
    if let Some(binary_only) = env_parsed::<bool>("LINKBRIDGE_BINARY_ONLY") {
        cfg.binary_only = binary_only;
    }
    if let Some(size) = env_parsed::<usize>("LINKBRIDGE_FRAGMENT_SIZE") {
        cfg.fragment_size = Some(size);
    }
    if let Some(size) = env_parsed::<usize>("LINKBRIDGE_MAX_MESSAGE_SIZE") {
        cfg.max_message_size = Some(size);
    }
    if let Ok(v) = std::env::var("LINKBRIDGE_TOPICS_GLOB") {
        cfg.topics_glob = split_globs(&v);
    }
    if let Ok(v) = std::env::var("LINKBRIDGE_SERVICES_GLOB") {
        cfg.services_glob = split_globs(&v);
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

fn split_globs(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(str::to_string)
        .collect()
}

/// Save the config to disk, creating `~/.linkbridge/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let cfg = Config::default();
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, cfg);
        assert_eq!(loaded.port, 9090);
        assert_eq!(loaded.resource_port, 8080);
        assert_eq!(loaded.notification.poll_interval_ms, 10);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "port = 9191\ntopics_glob = [\"/robot/*\"]\n\n[notification]\nbackpressure_multiplier = 2\n",
        )
        .expect("write");

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.port, 9191);
        assert_eq!(cfg.address, "0.0.0.0");
        assert_eq!(cfg.topics_glob, vec!["/robot/*".to_string()]);
        assert_eq!(cfg.notification.backpressure_multiplier, 2);
        assert_eq!(cfg.notification.max_concurrent_deliveries, 64);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = \"not a number\"").expect("write");
        assert!(load_from(&path).is_err());
    }

    #[test]
    fn config_path_points_to_linkbridge_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".linkbridge"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        let result = load_from(&path).expect("no error");
        assert!(result.is_none());
    }

    #[test]
    fn settings_conversion() {
        let cfg = Config {
            fragment_size: Some(1000),
            idle_timeout_secs: Some(30),
            services_glob: vec!["/safe/*".into()],
            ..Config::default()
        };
        let protocol = cfg.protocol_settings().expect("globs compile");
        assert_eq!(protocol.fragment_size, Some(1000));
        assert!(protocol.topics.allows("/anything"));
        assert!(protocol.services.allows("/safe/reset"));
        assert!(!protocol.services.allows("/arm/move"));

        let server = cfg.server_settings();
        assert_eq!(server.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(cfg.engine_config().poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn invalid_glob_is_rejected() {
        let cfg = Config {
            topics_glob: vec!["/robot/[".into()],
            ..Config::default()
        };
        assert!(cfg.protocol_settings().is_err());
    }

    #[test]
    fn negative_retry_delay_falls_back() {
        let cfg = Config {
            retry_startup_delay_secs: -1.0,
            ..Config::default()
        };
        assert_eq!(cfg.retry_startup_delay(), Duration::from_secs(2));
    }

    #[test]
    fn apply_env_overrides_changes_port() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("LINKBRIDGE_PORT", "9999") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.port, 9999);
        unsafe { std::env::remove_var("LINKBRIDGE_PORT") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_resource_port() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("LINKBRIDGE_RESOURCE_PORT", "not-a-port") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.resource_port, 8080);
        unsafe { std::env::remove_var("LINKBRIDGE_RESOURCE_PORT") };
    }

    #[test]
    fn apply_env_overrides_splits_globs() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("LINKBRIDGE_TOPICS_GLOB", "/a/*, /b ,") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.topics_glob, vec!["/a/*".to_string(), "/b".to_string()]);
        unsafe { std::env::remove_var("LINKBRIDGE_TOPICS_GLOB") };
    }

    #[test]
    fn apply_env_overrides_binary_only() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("LINKBRIDGE_BINARY_ONLY", "true") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert!(cfg.binary_only);
        unsafe { std::env::remove_var("LINKBRIDGE_BINARY_ONLY") };
    }
}
