use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sandbox::BridgeOptions;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub bridge: BridgeConfig,

    #[serde(default)]
    pub filesystem: FilesystemConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// When false, `run` executes commands directly without a jail.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory for jail roots, bridge sockets and scratch files.
    /// Empty means the system temp directory.
    #[serde(default)]
    pub temp_dir: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Isolate the jail's network and route traffic through the bridges.
    #[serde(default)]
    pub restricted: bool,

    /// Host TCP port of the HTTP proxy the HTTP bridge forwards to.
    #[serde(default = "default_http_proxy_port")]
    pub http_proxy_port: u16,

    /// Host TCP port of the SOCKS proxy the SOCKS bridge forwards to.
    #[serde(default = "default_socks_proxy_port")]
    pub socks_proxy_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_socat_path")]
    pub socat_path: String,

    #[serde(default = "default_readiness_attempts")]
    pub readiness_attempts: u32,

    #[serde(default = "default_readiness_step_ms")]
    pub readiness_step_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilesystemConfig {
    #[serde(default)]
    pub restricted: bool,

    /// Paths hidden inside the jail.
    #[serde(default = "default_deny_read")]
    pub deny_read: Vec<String>,

    /// Paths writable inside the jail. Everything else bound in is read-only.
    #[serde(default = "default_allow_write")]
    pub allow_write: Vec<String>,

    /// Read-only carve-outs within `allow_write`.
    #[serde(default)]
    pub deny_write: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_true() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_max_output_bytes() -> u64 {
    1_048_576 // 1MB
}
fn default_http_proxy_port() -> u16 {
    8080
}
fn default_socks_proxy_port() -> u16 {
    1080
}
fn default_socat_path() -> String {
    "socat".to_string()
}
fn default_readiness_attempts() -> u32 {
    5
}
fn default_readiness_step_ms() -> u64 {
    100
}
fn default_deny_read() -> Vec<String> {
    vec!["~/.ssh".into(), "~/.gnupg".into(), "~/.aws".into()]
}
fn default_allow_write() -> Vec<String> {
    vec![".".into()]
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            temp_dir: String::new(),
            timeout_secs: default_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            restricted: false,
            http_proxy_port: default_http_proxy_port(),
            socks_proxy_port: default_socks_proxy_port(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            socat_path: default_socat_path(),
            readiness_attempts: default_readiness_attempts(),
            readiness_step_ms: default_readiness_step_ms(),
        }
    }
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            restricted: false,
            deny_read: default_deny_read(),
            allow_write: default_allow_write(),
            deny_write: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load the config file, creating it from the template on first run.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            let config = Config::default();
            config.save_with_template()?;
            return Ok(config);
        }

        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;

        Ok(())
    }

    /// Save config with a helpful template (for first-time setup)
    pub fn save_with_template(&self) -> Result<()> {
        let path = Self::config_path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        eprintln!("Created default config at {}", path.display());

        Ok(())
    }

    /// `JAILWRAP_CONFIG` if set, otherwise `~/.jailwrap/config.toml`.
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("JAILWRAP_CONFIG") {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                return Ok(PathBuf::from(shellexpand::tilde(trimmed).to_string()));
            }
        }

        let base = directories::BaseDirs::new()
            .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;

        Ok(base.home_dir().join(".jailwrap").join("config.toml"))
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["sandbox", "enabled"] => Ok(self.sandbox.enabled.to_string()),
            ["sandbox", "temp_dir"] => Ok(self.sandbox.temp_dir.clone()),
            ["sandbox", "timeout_secs"] => Ok(self.sandbox.timeout_secs.to_string()),
            ["sandbox", "max_output_bytes"] => Ok(self.sandbox.max_output_bytes.to_string()),
            ["network", "restricted"] => Ok(self.network.restricted.to_string()),
            ["network", "http_proxy_port"] => Ok(self.network.http_proxy_port.to_string()),
            ["network", "socks_proxy_port"] => Ok(self.network.socks_proxy_port.to_string()),
            ["bridge", "socat_path"] => Ok(self.bridge.socat_path.clone()),
            ["bridge", "readiness_attempts"] => Ok(self.bridge.readiness_attempts.to_string()),
            ["bridge", "readiness_step_ms"] => Ok(self.bridge.readiness_step_ms.to_string()),
            ["filesystem", "restricted"] => Ok(self.filesystem.restricted.to_string()),
            ["filesystem", "deny_read"] => Ok(self.filesystem.deny_read.join(",")),
            ["filesystem", "allow_write"] => Ok(self.filesystem.allow_write.join(",")),
            ["filesystem", "deny_write"] => Ok(self.filesystem.deny_write.join(",")),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    /// Set a value by dotted key. List values are comma-separated.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["sandbox", "enabled"] => self.sandbox.enabled = value.parse()?,
            ["sandbox", "temp_dir"] => self.sandbox.temp_dir = value.to_string(),
            ["sandbox", "timeout_secs"] => self.sandbox.timeout_secs = value.parse()?,
            ["sandbox", "max_output_bytes"] => self.sandbox.max_output_bytes = value.parse()?,
            ["network", "restricted"] => self.network.restricted = value.parse()?,
            ["network", "http_proxy_port"] => self.network.http_proxy_port = value.parse()?,
            ["network", "socks_proxy_port"] => self.network.socks_proxy_port = value.parse()?,
            ["bridge", "socat_path"] => self.bridge.socat_path = value.to_string(),
            ["bridge", "readiness_attempts"] => self.bridge.readiness_attempts = value.parse()?,
            ["bridge", "readiness_step_ms"] => self.bridge.readiness_step_ms = value.parse()?,
            ["filesystem", "restricted"] => self.filesystem.restricted = value.parse()?,
            ["filesystem", "deny_read"] => self.filesystem.deny_read = split_list(value),
            ["filesystem", "allow_write"] => self.filesystem.allow_write = split_list(value),
            ["filesystem", "deny_write"] => self.filesystem.deny_write = split_list(value),
            ["logging", "level"] => self.logging.level = value.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }

    /// Resolved `sandbox.temp_dir`, tilde-expanded.
    pub fn temp_dir(&self) -> PathBuf {
        let trimmed = self.sandbox.temp_dir.trim();
        if trimmed.is_empty() {
            std::env::temp_dir()
        } else {
            PathBuf::from(shellexpand::tilde(trimmed).to_string())
        }
    }

    pub fn bridge_options(&self) -> BridgeOptions {
        BridgeOptions {
            socat: PathBuf::from(shellexpand::tilde(&self.bridge.socat_path).to_string()),
            temp_dir: self.temp_dir(),
            readiness_attempts: self.bridge.readiness_attempts,
            readiness_step: Duration::from_millis(self.bridge.readiness_step_ms),
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Default config template with helpful comments (used for first-time setup)
const DEFAULT_CONFIG_TEMPLATE: &str = r#"# jailwrap configuration
# Auto-created on first run. Edit as needed.

[sandbox]
# Set to false to run commands without a jail.
enabled = true
# Where jail roots, bridge sockets and scratch files go (default: system temp dir)
# temp_dir = "/var/tmp/jailwrap"
timeout_secs = 120
max_output_bytes = 1048576

[network]
# Give the jail a private vnet stack; traffic leaves only through the
# HTTP and SOCKS proxies below, bridged in over unix sockets with socat.
restricted = false
http_proxy_port = 8080
socks_proxy_port = 1080

[bridge]
socat_path = "socat"
# Socket readiness polling: attempt i waits i * readiness_step_ms
readiness_attempts = 5
readiness_step_ms = 100

[filesystem]
restricted = false
# Hidden inside the jail (directories get an empty tmpfs, files an empty file)
deny_read = ["~/.ssh", "~/.gnupg", "~/.aws"]
# Writable inside the jail; "." is the working directory
allow_write = ["."]
# Read-only carve-outs within allow_write. Shell rc files, .git/hooks,
# .git/config and editor settings in the working directory are always added.
# deny_write = ["./.env"]

[logging]
level = "info"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_parses_to_defaults() {
        let config: Config = toml::from_str(DEFAULT_CONFIG_TEMPLATE).unwrap();
        let defaults = Config::default();

        assert_eq!(config.sandbox.enabled, defaults.sandbox.enabled);
        assert_eq!(config.sandbox.timeout_secs, defaults.sandbox.timeout_secs);
        assert_eq!(config.sandbox.max_output_bytes, defaults.sandbox.max_output_bytes);
        assert_eq!(config.network.http_proxy_port, defaults.network.http_proxy_port);
        assert_eq!(config.network.socks_proxy_port, defaults.network.socks_proxy_port);
        assert_eq!(config.bridge.readiness_attempts, defaults.bridge.readiness_attempts);
        assert_eq!(config.filesystem, defaults.filesystem);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.sandbox.enabled);
        assert!(!config.network.restricted);
        assert_eq!(config.bridge.socat_path, "socat");
        assert_eq!(config.filesystem.allow_write, vec!["."]);
    }

    #[test]
    fn test_partial_section() {
        let config: Config = toml::from_str(
            r#"
[network]
restricted = true
http_proxy_port = 3129
"#,
        )
        .unwrap();
        assert!(config.network.restricted);
        assert_eq!(config.network.http_proxy_port, 3129);
        assert_eq!(config.network.socks_proxy_port, 1080);
    }

    #[test]
    fn test_get_set_roundtrip() {
        let mut config = Config::default();
        config.set_value("network.restricted", "true").unwrap();
        config.set_value("bridge.readiness_step_ms", "25").unwrap();
        config
            .set_value("filesystem.deny_write", " ./.env, ./secrets ,")
            .unwrap();

        assert_eq!(config.get_value("network.restricted").unwrap(), "true");
        assert_eq!(config.get_value("bridge.readiness_step_ms").unwrap(), "25");
        assert_eq!(config.filesystem.deny_write, vec!["./.env", "./secrets"]);
        assert_eq!(
            config.get_value("filesystem.deny_write").unwrap(),
            "./.env,./secrets"
        );
    }

    #[test]
    fn test_unknown_key_and_bad_value() {
        let mut config = Config::default();
        assert!(config.get_value("agent.default_model").is_err());
        assert!(config.set_value("sandbox", "true").is_err());
        assert!(config.set_value("network.http_proxy_port", "70000").is_err());
        assert!(config.set_value("sandbox.enabled", "maybe").is_err());
    }

    #[test]
    fn test_bridge_options_from_config() {
        let mut config = Config::default();
        config.sandbox.temp_dir = "/var/tmp/jw".to_string();
        config.bridge.readiness_attempts = 3;
        config.bridge.readiness_step_ms = 10;

        let options = config.bridge_options();
        assert_eq!(options.socat, PathBuf::from("socat"));
        assert_eq!(options.temp_dir, PathBuf::from("/var/tmp/jw"));
        assert_eq!(options.readiness_attempts, 3);
        assert_eq!(options.readiness_step, Duration::from_millis(10));
    }

    #[test]
    fn test_empty_temp_dir_is_system_temp() {
        assert_eq!(Config::default().temp_dir(), std::env::temp_dir());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[filesystem]\nrestricted = true\ndeny_read = []\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert!(config.filesystem.restricted);
        assert!(config.filesystem.deny_read.is_empty());
        assert_eq!(config.filesystem.allow_write, vec!["."]);
    }

    #[test]
    fn test_load_from_rejects_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[sandbox\nenabled = ").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
