//! Common test utilities and fixtures

#![allow(dead_code)]

use std::any::Any;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fleetlink::device::simulated_device;
use fleetlink::manager::{HostManager, ManagerSettings};
use fleetlink::topology::DeviceProperties;
use fleetlink::transport::{AbortMode, LocalGroup, TcpSettings, TcpTransport, Transport};

/// Get the path to the test fixtures directory
pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

pub fn fixture_path(name: &str) -> PathBuf {
    fixtures_dir().join(name)
}

pub fn valid_config_fixture() -> PathBuf {
    fixture_path("valid_config.toml")
}

pub fn invalid_config_fixture() -> PathBuf {
    fixture_path("invalid_config.toml")
}

/// `count` simulated devices
pub fn devices(count: u32) -> Vec<DeviceProperties> {
    (0..count).map(|i| simulated_device(i, 256)).collect()
}

/// Text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic>".to_string()
    }
}

/// Run `host` once per host of an in-process group, each on its own
/// thread with `devices_per_host[i]` simulated devices. Transport failures
/// panic instead of exiting. Returns each host's result in host order.
pub fn run_local_group<R, F>(
    devices_per_host: &[u32],
    settings: ManagerSettings,
    host: F,
) -> Vec<thread::Result<R>>
where
    R: Send + 'static,
    F: Fn(HostManager) -> R + Send + Sync + 'static,
{
    let host = Arc::new(host);
    let endpoints = LocalGroup::with_abort_mode(devices_per_host.len(), AbortMode::Panic);
    let handles: Vec<_> = endpoints
        .into_iter()
        .zip(devices_per_host.iter().copied())
        .map(|(endpoint, count)| {
            let host = Arc::clone(&host);
            let settings = settings.clone();
            thread::spawn(move || {
                let transport: Arc<dyn Transport> = endpoint;
                host(HostManager::start(settings, transport, devices(count)))
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join()).collect()
}

/// Like [`run_local_group`], but every host must succeed
pub fn run_local_group_ok<R, F>(devices_per_host: &[u32], settings: ManagerSettings, host: F) -> Vec<R>
where
    R: Send + 'static,
    F: Fn(HostManager) -> R + Send + Sync + 'static,
{
    run_local_group(devices_per_host, settings, host)
        .into_iter()
        .enumerate()
        .map(|(i, r)| r.unwrap_or_else(|p| panic!("host {} failed: {}", i, panic_message(p.as_ref()))))
        .collect()
}

/// Same as [`run_local_group_ok`] over a loopback TCP mesh
pub fn run_tcp_group<R, F>(devices_per_host: &[u32], settings: ManagerSettings, host: F) -> Vec<R>
where
    R: Send + 'static,
    F: Fn(HostManager) -> R + Send + Sync + 'static,
{
    let listeners: Vec<TcpListener> = devices_per_host
        .iter()
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    let addresses: Vec<_> = listeners.iter().map(|l| l.local_addr().unwrap()).collect();

    let host = Arc::new(host);
    let handles: Vec<_> = listeners
        .into_iter()
        .zip(devices_per_host.iter().copied())
        .enumerate()
        .map(|(host_id, (listener, count))| {
            let host = Arc::clone(&host);
            let settings = settings.clone();
            let mut tcp = TcpSettings::new(host_id, addresses.clone(), "test-job");
            tcp.connect_timeout = Duration::from_secs(10);
            tcp.linger = Duration::from_secs(2);
            thread::spawn(move || {
                let transport = TcpTransport::connect_with(tcp, listener).unwrap();
                host(HostManager::start(settings, Arc::new(transport), devices(count)))
            })
        })
        .collect();

    handles
        .into_iter()
        .enumerate()
        .map(|(i, h)| h.join().unwrap_or_else(|p| panic!("host {} failed: {}", i, panic_message(p.as_ref()))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixtures_exist() {
        assert!(valid_config_fixture().exists());
        assert!(invalid_config_fixture().exists());
    }
}
