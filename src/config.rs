//! Configuration system for fleetlink hosts
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. Join arguments (`--fleetlink-*`) and CLI flags
//! 2. Environment variables (FLEETLINK_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::codec::{CompressionPolicy, MIN_COMPRESS_SIZE};
use crate::dispatch::{TaskSendMode, DEFAULT_MAX_TASK_SIZE};
use crate::error::{Error, Result};
use crate::manager::ManagerSettings;
use crate::tag::MAX_LOCAL_DEVICE_ID;
use crate::transport::{TcpSettings, MAX_MESSAGE_SIZE};

/// Room for the echo task envelope around its payload
const ECHO_TASK_OVERHEAD: usize = 64;

/// Main host configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Identity of this host within the group
    pub host: HostSettings,

    /// Transport backend and its tunables
    pub transport: TransportSettings,

    /// Devices this host contributes
    pub devices: DeviceSettings,

    /// Built-in workload parameters
    pub workload: WorkloadSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Host identity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    /// Index of this host in `addresses` (0 is the master)
    pub id: usize,

    /// Listen address of every host, indexed by host id (tcp backend)
    pub addresses: Vec<String>,

    /// Number of in-process hosts (local backend)
    pub local_hosts: usize,

    /// Identifier shared by all hosts of one job
    pub job_id: String,
}

/// Transport backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// All hosts are threads of this process
    #[default]
    Local,
    /// One process per host, connected over TCP
    Tcp,
}

/// Compression applied by packed transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    #[default]
    None,
    Zlib,
}

/// Transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub backend: Backend,

    /// Deadline for the whole mesh to form, in milliseconds
    pub connect_timeout_ms: u64,

    /// How long shutdown waits for peers to leave, in milliseconds
    pub linger_ms: u64,

    /// Frames buffered per peer before a send blocks
    pub send_queue_depth: usize,

    /// Worker threads of the network runtime (0 = one per core, at most 4)
    pub io_threads: usize,

    /// How tasks are handed to the transport: buffered or synchronous
    pub task_send_mode: TaskSendMode,

    /// Largest task payload in bytes
    pub max_task_size: usize,

    /// Largest single message of a chunked transfer in bytes
    pub max_block_bytes: usize,

    pub compression: CompressionKind,

    /// zlib level, 0-9
    pub compression_level: u32,

    /// Payloads below this size are sent uncompressed
    pub min_compress_size: usize,
}

/// Device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Probe for Vulkan compute devices
    pub detect: bool,

    /// Number of simulated devices to add
    pub simulated: u32,

    /// Memory reported by each simulated device in MB
    pub simulated_memory_mb: u64,
}

/// Built-in workload settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadSettings {
    /// Payload size of each echo task
    pub echo_bytes: usize,

    /// Size of the bulk transfer to each worker host (0 disables it)
    pub bulk_bytes: usize,

    /// Block size of the bulk transfer (0 uses the transport limit)
    pub block_bytes: usize,

    /// Polling interval of device loops in milliseconds
    pub poll_interval_ms: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// ─────────────────────────────────────────────────────────────────
// Defaults
// ─────────────────────────────────────────────────────────────────

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            id: 0,
            addresses: Vec::new(),
            local_hosts: 1,
            job_id: "fleetlink".to_string(),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            backend: Backend::Local,
            connect_timeout_ms: 30_000,
            linger_ms: 10_000,
            send_queue_depth: 64,
            io_threads: 0,
            task_send_mode: TaskSendMode::Buffered,
            max_task_size: DEFAULT_MAX_TASK_SIZE,
            max_block_bytes: MAX_MESSAGE_SIZE,
            compression: CompressionKind::None,
            compression_level: 6,
            min_compress_size: MIN_COMPRESS_SIZE,
        }
    }
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            detect: true,
            simulated: 0,
            simulated_memory_mb: 1024,
        }
    }
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        Self {
            echo_bytes: 64 * 1024,
            bulk_bytes: 4 * 1024 * 1024,
            block_bytes: 1024 * 1024,
            poll_interval_ms: 1,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

/// Group membership handed to a host on its command line by a launcher
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinArgs {
    pub host_id: Option<usize>,
    pub hosts: Option<Vec<String>>,
    pub job_id: Option<String>,
}

impl JoinArgs {
    pub fn is_empty(&self) -> bool {
        self.host_id.is_none() && self.hosts.is_none() && self.job_id.is_none()
    }

    /// Override the configured identity; a host list selects the tcp backend
    pub fn apply(&self, config: &mut FleetConfig) {
        if let Some(id) = self.host_id {
            config.host.id = id;
        }
        if let Some(ref hosts) = self.hosts {
            config.host.addresses = hosts.clone();
            config.transport.backend = Backend::Tcp;
        }
        if let Some(ref job_id) = self.job_id {
            config.host.job_id = job_id.clone();
        }
    }
}

impl FleetConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        Self::load_with_join(config_path, &JoinArgs::default())
    }

    /// Like [`FleetConfig::load`], with join arguments applied last
    pub fn load_with_join(config_path: Option<&str>, join: &JoinArgs) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        if let Some(path) = Self::find_config_file(config_path)? {
            config = Self::from_file(&path)?;
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Join arguments from the launcher
        join.apply(&mut config);

        // 4. Expand paths
        config.expand_paths();

        // 5. Validate
        config.validate()?;

        Ok(config)
    }

    /// Parse one configuration file without overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading configuration file");
        let content = fs::read_to_string(path).map_err(|e| Error::IoRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
            message: format!("{}: {}", path.display(), e),
            source: Some(e),
        })?;
        info!(path = %path.display(), "Configuration loaded from file");
        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // An explicit path must exist
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        for path in search_paths() {
            if path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Host settings
        if let Some(n) = env_parse("FLEETLINK_HOST_ID") {
            self.host.id = n;
        }
        if let Ok(val) = std::env::var("FLEETLINK_HOSTS") {
            self.host.addresses = split_addresses(&val);
        }
        if let Some(n) = env_parse("FLEETLINK_LOCAL_HOSTS") {
            self.host.local_hosts = n;
        }
        if let Ok(val) = std::env::var("FLEETLINK_JOB_ID") {
            self.host.job_id = val;
        }

        // Transport settings
        if let Ok(val) = std::env::var("FLEETLINK_BACKEND") {
            match val.to_lowercase().as_str() {
                "local" => self.transport.backend = Backend::Local,
                "tcp" => self.transport.backend = Backend::Tcp,
                _ => {}
            }
        }
        if let Some(n) = env_parse("FLEETLINK_CONNECT_TIMEOUT_MS") {
            self.transport.connect_timeout_ms = n;
        }
        if let Ok(val) = std::env::var("FLEETLINK_TASK_SEND_MODE") {
            match val.to_lowercase().as_str() {
                "buffered" => self.transport.task_send_mode = TaskSendMode::Buffered,
                "synchronous" => self.transport.task_send_mode = TaskSendMode::Synchronous,
                _ => {}
            }
        }
        if let Some(n) = env_parse("FLEETLINK_MAX_TASK_SIZE") {
            self.transport.max_task_size = n;
        }

        // Device settings
        if let Ok(val) = std::env::var("FLEETLINK_DETECT_DEVICES") {
            self.devices.detect = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(n) = env_parse("FLEETLINK_SIMULATED_DEVICES") {
            self.devices.simulated = n;
        }

        // Logging settings
        if let Ok(val) = std::env::var("FLEETLINK_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("FLEETLINK_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("FLEETLINK_LOG_JSON") {
            self.logging.json_format = val == "1" || val.to_lowercase() == "true";
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.transport.backend {
            Backend::Tcp => {
                if self.host.addresses.is_empty() {
                    return Err(Error::config_field_invalid(
                        "host.addresses",
                        "the tcp backend needs the address of every host",
                    ));
                }
                if self.host.id >= self.host.addresses.len() {
                    return Err(Error::config_field_invalid(
                        "host.id",
                        format!(
                            "host id {} is out of range for {} addresses",
                            self.host.id,
                            self.host.addresses.len()
                        ),
                    ));
                }
                self.socket_addresses()?;
            }
            Backend::Local => {
                if self.host.local_hosts == 0 {
                    return Err(Error::config_field_invalid(
                        "host.local_hosts",
                        "at least one host is required",
                    ));
                }
            }
        }

        if self.host.job_id.is_empty() {
            return Err(Error::config_field_invalid("host.job_id", "job id cannot be empty"));
        }

        if self.transport.max_task_size == 0 {
            return Err(Error::config_field_invalid(
                "transport.max_task_size",
                "task buffer size must be positive",
            ));
        }
        if self.transport.max_block_bytes == 0 || self.transport.max_block_bytes > MAX_MESSAGE_SIZE {
            return Err(Error::config_field_invalid(
                "transport.max_block_bytes",
                format!("must be between 1 and {}", MAX_MESSAGE_SIZE),
            ));
        }
        if self.transport.max_task_size > self.transport.max_block_bytes {
            return Err(Error::config_field_invalid(
                "transport.max_task_size",
                "a task must fit in a single message",
            ));
        }
        if self.transport.send_queue_depth == 0 {
            return Err(Error::config_field_invalid(
                "transport.send_queue_depth",
                "queue depth must be positive",
            ));
        }
        if self.transport.compression_level > 9 {
            return Err(Error::config_field_invalid(
                "transport.compression_level",
                "zlib level must be between 0 and 9",
            ));
        }

        if self.devices.simulated > MAX_LOCAL_DEVICE_ID + 1 {
            return Err(Error::config_field_invalid(
                "devices.simulated",
                format!("a host can expose at most {} devices", MAX_LOCAL_DEVICE_ID + 1),
            ));
        }

        if self.workload.echo_bytes + ECHO_TASK_OVERHEAD > self.transport.max_task_size {
            return Err(Error::config_field_invalid(
                "workload.echo_bytes",
                "an echo task must fit in transport.max_task_size",
            ));
        }
        if self.workload.block_bytes > self.transport.max_block_bytes {
            return Err(Error::config_field_invalid(
                "workload.block_bytes",
                "bulk block size cannot exceed transport.max_block_bytes",
            ));
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Parsed `host.addresses`
    pub fn socket_addresses(&self) -> Result<Vec<SocketAddr>> {
        self.host
            .addresses
            .iter()
            .map(|a| {
                a.parse().map_err(|e| {
                    Error::config_field_invalid("host.addresses", format!("'{}': {}", a, e))
                })
            })
            .collect()
    }

    /// Settings for joining the TCP group as this host
    pub fn tcp_settings(&self) -> Result<TcpSettings> {
        let mut settings = TcpSettings::new(
            self.host.id,
            self.socket_addresses()?,
            self.host.job_id.clone(),
        );
        settings.connect_timeout = Duration::from_millis(self.transport.connect_timeout_ms);
        settings.linger = Duration::from_millis(self.transport.linger_ms);
        settings.send_queue_depth = self.transport.send_queue_depth;
        settings.io_threads = match self.transport.io_threads {
            0 => num_cpus::get().clamp(1, 4),
            n => n,
        };
        Ok(settings)
    }

    /// Settings for the host manager
    pub fn manager_settings(&self) -> ManagerSettings {
        let t = &self.transport;
        let compression = match t.compression {
            CompressionKind::None => CompressionPolicy::disabled(),
            CompressionKind::Zlib => CompressionPolicy::zlib(t.compression_level, t.min_compress_size),
        };
        ManagerSettings {
            task_send_mode: t.task_send_mode,
            max_task_size: t.max_task_size,
            max_block_size: t.max_block_bytes,
            compression,
        }
    }

    /// Number of hosts in the group
    pub fn host_count(&self) -> usize {
        match self.transport.backend {
            Backend::Local => self.host.local_hosts,
            Backend::Tcp => self.host.addresses.len(),
        }
    }
}

/// Standard configuration file locations, in search order
pub fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("fleetlink.toml")];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("fleetlink").join("fleetlink.toml"));
    }
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".fleetlink").join("fleetlink.toml"));
    }
    paths.push(PathBuf::from("/etc/fleetlink/fleetlink.toml"));
    paths
}

/// Split a comma separated host list
pub fn split_addresses(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file, returning where it was written
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".fleetlink")
                .join("fleetlink.toml")
        });

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    info!(path = %config_path.display(), "Configuration file created");
    Ok(config_path)
}

/// Generate default configuration content with comments
pub fn generate_default_config() -> String {
    r#"# fleetlink host configuration

[host]
# Index of this host in 'addresses'; host 0 is the master
id = 0

# Listen address of every host, indexed by host id (tcp backend)
# addresses = ["10.0.0.1:7070", "10.0.0.2:7070"]

# Number of hosts run as threads of one process (local backend)
local_hosts = 1

# Shared by every host of one job; connections from other jobs are refused
job_id = "fleetlink"

[transport]
# Backend: local or tcp
backend = "local"

# Deadline for every host to join, in milliseconds
connect_timeout_ms = 30000

# How long shutdown waits for peers to leave, in milliseconds
linger_ms = 10000

# Frames buffered per peer before a send blocks
send_queue_depth = 64

# Worker threads of the network runtime (0 = one per core, at most 4)
io_threads = 0

# Task hand-off: buffered or synchronous
task_send_mode = "buffered"

# Largest task payload in bytes (32 MiB)
max_task_size = 33554432

# Largest single message in bytes (1 GiB)
max_block_bytes = 1073741824

# Compression of packed transfers: none or zlib
compression = "none"
compression_level = 6
min_compress_size = 10000

[devices]
# Probe for Vulkan compute devices
detect = true

# Simulated devices added after detected ones
simulated = 0
simulated_memory_mb = 1024

[workload]
# Payload of each echo task in bytes
echo_bytes = 65536

# Bulk transfer to each worker host in bytes (0 disables it)
bulk_bytes = 4194304

# Block size of the bulk transfer in bytes
block_bytes = 1048576

# Device loop polling interval in milliseconds
poll_interval_ms = 1

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.fleetlink/logs/fleetlink.log"

# Maximum log file size in MB before rotation
max_file_size_mb = 100

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = FleetConfig::default();
        assert_eq!(config.transport.backend, Backend::Local);
        assert_eq!(config.transport.max_task_size, 32 * 1024 * 1024);
        assert_eq!(config.transport.max_block_bytes, 1 << 30);
        assert_eq!(config.host.local_hosts, 1);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.host_count(), 1);
    }

    #[test]
    fn test_env_override() {
        env::set_var("FLEETLINK_HOST_ID", "2");
        env::set_var("FLEETLINK_HOSTS", "127.0.0.1:7000, 127.0.0.1:7001,127.0.0.1:7002");
        env::set_var("FLEETLINK_TASK_SEND_MODE", "synchronous");
        env::set_var("FLEETLINK_SIMULATED_DEVICES", "3");

        let mut config = FleetConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.host.id, 2);
        assert_eq!(config.host.addresses.len(), 3);
        assert_eq!(config.host.addresses[1], "127.0.0.1:7001");
        assert_eq!(config.transport.task_send_mode, TaskSendMode::Synchronous);
        assert_eq!(config.devices.simulated, 3);

        env::remove_var("FLEETLINK_HOST_ID");
        env::remove_var("FLEETLINK_HOSTS");
        env::remove_var("FLEETLINK_TASK_SEND_MODE");
        env::remove_var("FLEETLINK_SIMULATED_DEVICES");
    }

    #[test]
    fn test_join_args_select_tcp() {
        let join = JoinArgs {
            host_id: Some(1),
            hosts: Some(vec!["127.0.0.1:7000".into(), "127.0.0.1:7001".into()]),
            job_id: Some("job-7".into()),
        };
        assert!(!join.is_empty());

        let mut config = FleetConfig::default();
        join.apply(&mut config);
        assert_eq!(config.transport.backend, Backend::Tcp);
        assert_eq!(config.host.id, 1);
        assert_eq!(config.host.job_id, "job-7");
        assert!(config.validate().is_ok());
        assert!(JoinArgs::default().is_empty());
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(FleetConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_tcp_without_addresses() {
        let mut config = FleetConfig::default();
        config.transport.backend = Backend::Tcp;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::ConfigValidation { field: Some(ref f), .. } if f == "host.addresses"));
    }

    #[test]
    fn test_validation_host_id_out_of_range() {
        let mut config = FleetConfig::default();
        config.transport.backend = Backend::Tcp;
        config.host.addresses = vec!["127.0.0.1:7000".into(), "127.0.0.1:7001".into()];
        config.host.id = 2;
        assert!(config.validate().is_err());

        config.host.id = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_bad_address() {
        let mut config = FleetConfig::default();
        config.transport.backend = Backend::Tcp;
        config.host.addresses = vec!["not-an-address".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_block_size_limits() {
        let mut config = FleetConfig::default();
        config.transport.max_block_bytes = MAX_MESSAGE_SIZE + 1;
        assert!(config.validate().is_err());

        let mut config = FleetConfig::default();
        config.transport.max_block_bytes = 1024;
        config.transport.max_task_size = 1024;
        config.workload.block_bytes = 2048;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let mut config = FleetConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_manager_settings() {
        let mut config = FleetConfig::default();
        config.transport.compression = CompressionKind::Zlib;
        config.transport.min_compress_size = 128;
        config.transport.max_task_size = 4096;

        let settings = config.manager_settings();
        assert_eq!(settings.max_task_size, 4096);
        assert_eq!(settings.compression.min_size(), 128);
        assert!(settings.compression.should_compress(128));
    }

    #[test]
    fn test_tcp_settings() {
        let mut config = FleetConfig::default();
        config.host.addresses = vec!["127.0.0.1:7000".into(), "127.0.0.1:7001".into()];
        config.host.id = 1;
        config.transport.connect_timeout_ms = 2500;

        let settings = config.tcp_settings().unwrap();
        assert_eq!(settings.host_id, 1);
        assert_eq!(settings.addresses.len(), 2);
        assert_eq!(settings.connect_timeout, Duration::from_millis(2500));
        assert!((1..=4).contains(&settings.io_threads));
    }

    #[test]
    fn test_path_expansion() {
        let mut config = FleetConfig::default();
        config.logging.file = Some("~/logs/fleetlink.log".to_string());
        config.expand_paths();
        assert!(!config.logging.file.unwrap().contains('~'));
    }

    #[test]
    fn test_default_config_text_parses() {
        let config: FleetConfig = toml::from_str(&generate_default_config()).unwrap();
        assert_eq!(config.transport.max_task_size, DEFAULT_MAX_TASK_SIZE);
        assert_eq!(config.transport.min_compress_size, MIN_COMPRESS_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = FleetConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: FleetConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.host.job_id, parsed.host.job_id);
        assert_eq!(config.transport.task_send_mode, parsed.transport.task_send_mode);
    }

    #[test]
    fn test_parse_config_file() {
        let config_str = r#"
[host]
id = 1
addresses = ["127.0.0.1:7000", "127.0.0.1:7001"]
job_id = "nightly"

[transport]
backend = "tcp"
task_send_mode = "synchronous"
compression = "zlib"

[devices]
detect = false
simulated = 4
"#;

        let config: FleetConfig = toml::from_str(config_str).unwrap();

        assert_eq!(config.host.id, 1);
        assert_eq!(config.host.job_id, "nightly");
        assert_eq!(config.transport.backend, Backend::Tcp);
        assert_eq!(config.transport.task_send_mode, TaskSendMode::Synchronous);
        assert_eq!(config.transport.compression, CompressionKind::Zlib);
        assert!(!config.devices.detect);
        assert_eq!(config.devices.simulated, 4);
        assert_eq!(config.host_count(), 2);
        // untouched sections keep their defaults
        assert_eq!(config.workload.echo_bytes, 64 * 1024);
    }
}
