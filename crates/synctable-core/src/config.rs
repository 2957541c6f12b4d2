//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/synctable/config.toml)
//! 3. Environment variables (SYNCTABLE_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::client::WebsocketConfig;
use crate::table::TableOptions;

/// Environment variable prefix
const ENV_PREFIX: &str = "SYNCTABLE";

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Websocket URL of the changefeed server
    #[serde(default = "default_url")]
    pub url: String,

    /// Address `serve` listens on
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Delay before a batch of writes is sent
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// How long `save` waits for acknowledgements
    #[serde(default = "default_save_timeout_ms")]
    pub save_timeout_ms: u64,

    /// First reconnect delay
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    /// Maximum reconnect delay
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// Frames buffered per connection direction
    #[serde(default = "default_write_buffer")]
    pub write_buffer: usize,

    /// Log level used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: default_url(),
            bind: default_bind(),
            flush_interval_ms: default_flush_interval_ms(),
            save_timeout_ms: default_save_timeout_ms(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            write_buffer: default_write_buffer(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (SYNCTABLE_URL, SYNCTABLE_BIND, ...)
    /// 2. Config file (~/.config/synctable/config.toml or SYNCTABLE_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Some(val) = env_var("URL") {
            self.url = val;
        }
        if let Some(val) = env_var("BIND") {
            self.bind = val;
        }
        if let Some(val) = env_parse("FLUSH_MS") {
            self.flush_interval_ms = val;
        }
        if let Some(val) = env_parse("SAVE_TIMEOUT_MS") {
            self.save_timeout_ms = val;
        }
        if let Some(val) = env_parse("RECONNECT_INITIAL_MS") {
            self.reconnect_initial_ms = val;
        }
        if let Some(val) = env_parse("RECONNECT_MAX_MS") {
            self.reconnect_max_ms = val;
        }
        if let Some(val) = env_parse("WRITE_BUFFER") {
            self.write_buffer = val;
        }
        if let Some(val) = env_var("LOG_LEVEL") {
            self.log_level = val;
        }
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to `path`, creating parent directories
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with SYNCTABLE_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("synctable")
            .join("config.toml")
    }

    /// Timing knobs for tables
    pub fn table_options(&self) -> TableOptions {
        TableOptions {
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            save_timeout: Duration::from_millis(self.save_timeout_ms),
            reconnect_initial: Duration::from_millis(self.reconnect_initial_ms),
            reconnect_max: Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms)),
            ..TableOptions::default()
        }
    }

    /// Settings for the persistent websocket link
    pub fn websocket_config(&self) -> WebsocketConfig {
        WebsocketConfig {
            url: self.url.clone(),
            initial_reconnect_delay: Duration::from_millis(self.reconnect_initial_ms),
            max_reconnect_delay: Duration::from_millis(
                self.reconnect_max_ms.max(self.reconnect_initial_ms),
            ),
            write_buffer: self.write_buffer,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}_{}", ENV_PREFIX, name))
        .ok()
        .filter(|val| !val.is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env_var(name)?;
    match raw.parse() {
        Ok(val) => Some(val),
        Err(_) => {
            warn!("Ignoring {}_{}={:?}: not a number", ENV_PREFIX, name, raw);
            None
        }
    }
}

fn default_url() -> String {
    "ws://127.0.0.1:7878".to_string()
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_flush_interval_ms() -> u64 {
    50
}

fn default_save_timeout_ms() -> u64 {
    30_000
}

fn default_reconnect_initial_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_write_buffer() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "SYNCTABLE_URL",
        "SYNCTABLE_BIND",
        "SYNCTABLE_FLUSH_MS",
        "SYNCTABLE_SAVE_TIMEOUT_MS",
        "SYNCTABLE_RECONNECT_INITIAL_MS",
        "SYNCTABLE_RECONNECT_MAX_MS",
        "SYNCTABLE_WRITE_BUFFER",
        "SYNCTABLE_LOG_LEVEL",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.url, "ws://127.0.0.1:7878");
        assert_eq!(config.flush_interval_ms, 50);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_table_options() {
        let config = Config {
            flush_interval_ms: 10,
            save_timeout_ms: 2_000,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 100,
            ..Config::default()
        };
        let options = config.table_options();
        assert_eq!(options.flush_interval, Duration::from_millis(10));
        assert_eq!(options.save_timeout, Duration::from_secs(2));
        // The maximum never undercuts the initial delay
        assert_eq!(options.reconnect_max, Duration::from_millis(500));

        let ws = config.websocket_config();
        assert_eq!(ws.url, config.url);
        assert_eq!(ws.initial_reconnect_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_env_override_url() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("SYNCTABLE_URL", "ws://example.com:9000");
        config.apply_env_overrides();
        assert_eq!(config.url, "ws://example.com:9000");

        // Empty string leaves the value alone
        env::set_var("SYNCTABLE_URL", "");
        config.apply_env_overrides();
        assert_eq!(config.url, "ws://example.com:9000");
    }

    #[test]
    fn test_env_override_numbers() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("SYNCTABLE_FLUSH_MS", "5");
        env::set_var("SYNCTABLE_SAVE_TIMEOUT_MS", "not-a-number");
        config.apply_env_overrides();

        assert_eq!(config.flush_interval_ms, 5);
        assert_eq!(config.save_timeout_ms, default_save_timeout_ms());
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            url = "ws://sync.example.com"
            flush_interval_ms = 200
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.url, "ws://sync.example.com");
        assert_eq!(config.flush_interval_ms, 200);
        // Missing fields fall back to defaults
        assert_eq!(config.bind, default_bind());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let _guard = EnvGuard::new(ENV_VARS);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config {
            url: "ws://10.0.0.1:1".to_string(),
            write_buffer: 8,
            ..Config::default()
        };

        config.save_to_path(&path).unwrap();
        assert_eq!(Config::load_from_path(&path).unwrap(), config);
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);

        let path = PathBuf::from("/nonexistent/config.toml");
        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config, Config::default());
    }
}
