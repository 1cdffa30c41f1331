use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub zeromq: ZeroMqConfig,
    #[serde(default)]
    pub pipe: PipeConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub copier: CopierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Enable file logging
    #[serde(default = "default_logging_enabled")]
    pub enabled: bool,
    /// Directory for log files (relative to executable or absolute path)
    #[serde(default = "default_log_directory")]
    pub directory: String,
    /// Prefix for log file names
    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,
    /// Rotation strategy: "daily", "hourly", or "never"
    #[serde(default = "default_log_rotation")]
    pub rotation: String,
    /// Maximum number of log files to keep (0 = unlimited)
    #[serde(default = "default_max_files")]
    pub max_files: u32,
    /// Maximum age of log files in days (0 = unlimited)
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
}

fn default_logging_enabled() -> bool {
    true
}
fn default_log_directory() -> String {
    "logs".to_string()
}
fn default_log_file_prefix() -> String {
    "hedge-edge-core".to_string()
}
fn default_log_rotation() -> String {
    "daily".to_string()
}
fn default_max_files() -> u32 {
    30
}
fn default_max_age_days() -> u32 {
    90
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: default_logging_enabled(),
            directory: default_log_directory(),
            file_prefix: default_log_file_prefix(),
            rotation: default_log_rotation(),
            max_files: default_max_files(),
            max_age_days: default_max_age_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Directory where terminal-side agents drop their registration files
    #[serde(default = "default_registration_dir")]
    pub registration_dir: String,
    /// How long a scan result stays cached before a rescan is allowed
    #[serde(default = "default_scan_cache_ms")]
    pub scan_cache_ms: u64,
    /// Known (data, command) port pairs probed when no registration files exist
    #[serde(default = "default_fallback_pairs")]
    pub fallback_port_pairs: Vec<(u16, u16)>,
}

#[cfg(windows)]
fn default_registration_dir() -> String {
    match std::env::var("APPDATA") {
        Ok(appdata) => format!("{}\\MetaQuotes\\Terminal\\Common\\Files\\HedgeEdge", appdata),
        Err(_) => "HedgeEdge".to_string(),
    }
}

#[cfg(not(windows))]
fn default_registration_dir() -> String {
    "HedgeEdge".to_string()
}

fn default_scan_cache_ms() -> u64 {
    2_000
}

fn default_fallback_pairs() -> Vec<(u16, u16)> {
    crate::port_manager::ZMQ_DATA_PORTS
        .iter()
        .map(|&d| (d, d + 1))
        .collect()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            registration_dir: default_registration_dir(),
            scan_cache_ms: default_scan_cache_ms(),
            fallback_port_pairs: default_fallback_pairs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZeroMqConfig {
    /// Per-request REQ/REP timeout in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Delay before a failed bridge recreates its sockets
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    /// A bridge with no traffic for this long is no longer "alive"
    #[serde(default = "default_staleness_ms")]
    pub staleness_ms: u64,
    /// TCP liveness probe timeout in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_command_timeout_ms() -> u64 {
    5_000
}
fn default_reconnect_interval_ms() -> u64 {
    5_000
}
fn default_staleness_ms() -> u64 {
    15_000
}
fn default_probe_timeout_ms() -> u64 {
    50
}

impl Default for ZeroMqConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            staleness_ms: default_staleness_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeConfig {
    /// Prefix of the per-terminal pipe endpoints
    #[serde(default = "default_pipe_prefix")]
    pub name_prefix: String,
    /// Delay before a closed data pipe reconnects
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    /// Per-request command pipe timeout in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

fn default_pipe_prefix() -> String {
    "hedgeedge-ct".to_string()
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            name_prefix: default_pipe_prefix(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// ENABLE frame re-send interval in seconds (first-connect race safety net)
    #[serde(default = "default_enable_resend_secs")]
    pub enable_resend_secs: u64,
}

fn default_enable_resend_secs() -> u64 {
    30
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enable_resend_secs: default_enable_resend_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopierConfig {
    /// Directory for persisted copier/session/daily-limit state files
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Debounce window for persistence writes, in seconds
    #[serde(default = "default_save_debounce_secs")]
    pub save_debounce_secs: u64,
}

fn default_data_dir() -> String {
    "data".to_string()
}
fn default_save_debounce_secs() -> u64 {
    5
}

impl Default for CopierConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            save_debounce_secs: default_save_debounce_secs(),
        }
    }
}

impl Config {
    /// Load config from layered TOML files
    ///
    /// Loads configuration files in the following order (later files override earlier):
    /// 1. {base_name}.toml (optional, e.g., config.toml)
    /// 2. {base_name}.{CONFIG_ENV}.toml (optional, only if CONFIG_ENV is set)
    /// 3. {base_name}.local.toml (optional, for personal overrides, git-ignored)
    pub fn from_file(base_name: &str) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name(base_name).required(false));

        if let Ok(env) = std::env::var("CONFIG_ENV") {
            builder = builder.add_source(
                config::File::with_name(&format!("{}.{}", base_name, env)).required(false),
            );
        }

        builder = builder
            .add_source(config::File::with_name(&format!("{}.local", base_name)).required(false));

        let settings = builder.build().context("Failed to build configuration")?;
        settings
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_complete() {
        let cfg = Config::default();
        assert!(cfg.logging.enabled);
        assert_eq!(cfg.zeromq.command_timeout_ms, 5_000);
        assert_eq!(cfg.zeromq.probe_timeout_ms, 50);
        assert_eq!(cfg.discovery.scan_cache_ms, 2_000);
        assert_eq!(cfg.copier.save_debounce_secs, 5);
        assert!(!cfg.discovery.fallback_port_pairs.is_empty());
    }

    #[test]
    fn test_fallback_pairs_are_adjacent() {
        let cfg = DiscoveryConfig::default();
        for (data, command) in cfg.fallback_port_pairs {
            assert_eq!(command, data + 1);
        }
    }

    #[test]
    fn test_config_from_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("config");
        let cfg = Config::from_file(base.to_str().unwrap()).unwrap();
        assert_eq!(cfg.logging.file_prefix, "hedge-edge-core");
    }

    #[test]
    fn test_config_from_toml_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[zeromq]\ncommand_timeout_ms = 1234\n[copier]\ndata_dir = \"state\"\n",
        )
        .unwrap();
        let base = dir.path().join("config");
        let cfg = Config::from_file(base.to_str().unwrap()).unwrap();
        assert_eq!(cfg.zeromq.command_timeout_ms, 1234);
        assert_eq!(cfg.copier.data_dir, "state");
        // untouched sections keep defaults
        assert_eq!(cfg.zeromq.reconnect_interval_ms, 5_000);
    }
}
