//! Configuration system tests
//!
//! Tests configuration loading, validation, and the settings derived from it

mod common;

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use fleetlink::config::{generate_default_config, Backend, CompressionKind, FleetConfig, JoinArgs};
use fleetlink::dispatch::TaskSendMode;
use fleetlink::error::Error;
use tempfile::TempDir;

/// Test fixture for configuration testing
struct ConfigFixture {
    _temp_dir: TempDir,
    config_path: PathBuf,
}

impl ConfigFixture {
    fn new(content: &str) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("fleetlink.toml");
        fs::write(&config_path, content).unwrap();
        Self {
            _temp_dir: temp_dir,
            config_path,
        }
    }

    fn path(&self) -> &str {
        self.config_path.to_str().unwrap()
    }

    /// Parse and validate without environment overrides
    fn parse(&self) -> fleetlink::Result<FleetConfig> {
        let config = FleetConfig::from_file(&self.config_path)?;
        config.validate()?;
        Ok(config)
    }
}

// ─────────────────────────────────────────────────────────────────
// Valid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_fixture_config() {
    let config = FleetConfig::from_file(&common::valid_config_fixture()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.host.id, 1);
    assert_eq!(config.host.job_id, "fixture");
    assert_eq!(config.transport.backend, Backend::Tcp);
    assert_eq!(config.transport.task_send_mode, TaskSendMode::Synchronous);
    assert_eq!(config.transport.compression, CompressionKind::Zlib);
    assert_eq!(config.host_count(), 2);
    assert!(!config.devices.detect);
    assert_eq!(config.devices.simulated, 2);
    assert_eq!(config.logging.level, "debug");
}

#[test]
fn test_fixture_derived_settings() {
    let config = FleetConfig::from_file(&common::valid_config_fixture()).unwrap();

    let tcp = config.tcp_settings().unwrap();
    assert_eq!(tcp.host_id, 1);
    assert_eq!(tcp.addresses.len(), 2);
    assert_eq!(tcp.job_id, "fixture");

    let manager = config.manager_settings();
    assert_eq!(manager.max_task_size, 1_048_576);
    assert_eq!(manager.task_send_mode, TaskSendMode::Synchronous);
    assert!(manager.compression.should_compress(manager.compression.min_size()));
}

#[test]
fn test_minimal_config() {
    let fixture = ConfigFixture::new("");
    let config = fixture.parse().unwrap();
    assert_eq!(config.transport.backend, Backend::Local);
    assert_eq!(config.host_count(), 1);
}

#[test]
fn test_local_group_config() {
    let fixture = ConfigFixture::new(
        r#"
[host]
local_hosts = 4

[devices]
detect = false
simulated = 3

[workload]
echo_bytes = 1024
bulk_bytes = 0
"#,
    );
    let config = fixture.parse().unwrap();
    assert_eq!(config.host_count(), 4);
    assert_eq!(config.devices.simulated, 3);
    assert_eq!(config.workload.bulk_bytes, 0);
}

#[test]
fn test_load_with_join_args() {
    let fixture = ConfigFixture::new(
        r#"
[host]
job_id = "from-file"
"#,
    );
    let join = JoinArgs {
        host_id: Some(2),
        hosts: Some(vec![
            "127.0.0.1:7000".into(),
            "127.0.0.1:7001".into(),
            "127.0.0.1:7002".into(),
        ]),
        job_id: Some("from-launcher".into()),
    };

    let config = FleetConfig::load_with_join(Some(fixture.path()), &join).unwrap();
    assert_eq!(config.transport.backend, Backend::Tcp);
    assert_eq!(config.host.id, 2);
    assert_eq!(config.host.job_id, "from-launcher");
    assert_eq!(config.host_count(), 3);
}

#[test]
fn test_default_config_text_is_valid() {
    let fixture = ConfigFixture::new(&generate_default_config());
    let config = fixture.parse().unwrap();
    assert_eq!(config.transport.connect_timeout_ms, 30_000);
}

#[test]
fn test_tcp_timeouts() {
    let fixture = ConfigFixture::new(
        r#"
[host]
addresses = ["127.0.0.1:7000", "127.0.0.1:7001"]

[transport]
backend = "tcp"
connect_timeout_ms = 1500
linger_ms = 250
"#,
    );
    let tcp = fixture.parse().unwrap().tcp_settings().unwrap();
    assert_eq!(tcp.connect_timeout, Duration::from_millis(1500));
    assert_eq!(tcp.linger, Duration::from_millis(250));
}

// ─────────────────────────────────────────────────────────────────
// Invalid Configuration Tests
// ─────────────────────────────────────────────────────────────────

fn invalid_field(content: &str) -> String {
    match ConfigFixture::new(content).parse() {
        Err(Error::ConfigValidation { field: Some(field), .. }) => field,
        other => panic!("expected a validation error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_invalid_fixture() {
    let config = FleetConfig::from_file(&common::invalid_config_fixture()).unwrap();
    assert!(matches!(config.validate(), Err(Error::ConfigValidation { .. })));
}

#[test]
fn test_host_id_out_of_range() {
    let field = invalid_field(
        r#"
[host]
id = 2
addresses = ["127.0.0.1:7000", "127.0.0.1:7001"]

[transport]
backend = "tcp"
"#,
    );
    assert_eq!(field, "host.id");
}

#[test]
fn test_unparseable_address() {
    let field = invalid_field(
        r#"
[host]
addresses = ["localhost-without-port"]

[transport]
backend = "tcp"
"#,
    );
    assert_eq!(field, "host.addresses");
}

#[test]
fn test_task_size_above_block_size() {
    let field = invalid_field(
        r#"
[transport]
max_task_size = 2048
max_block_bytes = 1024

[workload]
echo_bytes = 512
block_bytes = 1024
"#,
    );
    assert_eq!(field, "transport.max_task_size");
}

#[test]
fn test_echo_larger_than_task_buffer() {
    let field = invalid_field(
        r#"
[transport]
max_task_size = 1024

[workload]
echo_bytes = 1024
"#,
    );
    assert_eq!(field, "workload.echo_bytes");
}

#[test]
fn test_compression_level_out_of_range() {
    let field = invalid_field(
        r#"
[transport]
compression = "zlib"
compression_level = 12
"#,
    );
    assert_eq!(field, "transport.compression_level");
}

#[test]
fn test_invalid_log_level() {
    let field = invalid_field(
        r#"
[logging]
level = "loud"
"#,
    );
    assert_eq!(field, "logging.level");
}

#[test]
fn test_unknown_backend_is_a_parse_error() {
    let result = ConfigFixture::new(
        r#"
[transport]
backend = "carrier-pigeon"
"#,
    )
    .parse();
    assert!(matches!(result, Err(Error::ConfigParse { .. })));
}

#[test]
fn test_missing_explicit_file() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("absent.toml");
    let result = FleetConfig::load(missing.to_str());
    assert!(matches!(result, Err(Error::ConfigNotFound { .. })));
}
