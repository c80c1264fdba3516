//! Built-in smoke workload run by `fleetlink run`
//!
//! Every host serves its local devices from scoped threads, one inbox loop
//! per device. The master then drives three phases:
//!
//! 1. echo: one `Echo` task per device in the group. The device answers on
//!    the task's reply tag with a [`TaskReport`] followed by the payload,
//!    packed through the compression policy.
//! 2. bulk: one chunked transfer to every worker host, announced on
//!    [`WORKLOAD_CONTROL_TAG`] and confirmed with a report.
//! 3. shutdown: one `Shutdown` task per device, acknowledged with the number
//!    of tasks the device served.
//!
//! Checksum mismatches do not stop the protocol; they are collected and
//! reported once every host has been shut down cleanly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, info_span, warn};

use crate::config::{Backend, FleetConfig, WorkloadSettings};
use crate::device::local_devices;
use crate::dispatch::{DeviceInbox, SerializedTask};
use crate::error::{Error, Result};
use crate::manager::{HostManager, PendingValue};
use crate::request::wait_all;
use crate::tag::{Tag, DISCOVERY_TAG};
use crate::topology::{DeviceId, DeviceProperties, HostId, MASTER_HOST};
use crate::transport::{LocalGroup, TcpTransport, Transport};

/// Master to worker host announcements; outside both the inbox range and
/// the allocated tag space
pub const WORKLOAD_CONTROL_TAG: Tag = DISCOVERY_TAG + 1;

/// Work understood by the device loops
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadTask {
    /// Checksum `payload` and send it back
    Echo { reply_tag: Tag, payload: Vec<u8> },
    /// Leave the loop and acknowledge with the task count
    Shutdown { reply_tag: Tag },
}

/// What a device or host observed about a payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub device: Option<DeviceId>,
    pub bytes: u64,
    pub sha256: String,
}

/// Announces a chunked transfer to a worker host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkHeader {
    pub tag: Tag,
    pub total: u64,
    pub block: u64,
}

crate::serialized_value!(TaskReport, BulkHeader);

/// Outcome of the workload on one host
#[derive(Debug, Clone, Default)]
pub struct WorkloadSummary {
    pub host_id: HostId,
    pub host_count: usize,
    /// Devices in the whole group (master only)
    pub group_devices: usize,
    /// Tasks served by this host's devices
    pub tasks_served: u64,
    /// Echo round trips verified (master only)
    pub echoes_verified: usize,
    /// Bulk bytes received (workers) or sent (master)
    pub bulk_bytes: u64,
    pub elapsed: Duration,
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Deterministic filler so every device gets distinct bytes
fn test_pattern(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────
// Entry Points
// ─────────────────────────────────────────────────────────────────

/// Run the workload as configured: every in-process host for the local
/// backend, this host only for tcp
pub fn run(config: &FleetConfig) -> Result<Vec<WorkloadSummary>> {
    match config.transport.backend {
        Backend::Local => run_local_group(config),
        Backend::Tcp => {
            let transport = TcpTransport::connect(config.tcp_settings()?)?;
            let devices = local_devices(&config.devices)?;
            run_host(config, Arc::new(transport), devices).map(|s| vec![s])
        }
    }
}

/// All hosts as threads of this process
pub fn run_local_group(config: &FleetConfig) -> Result<Vec<WorkloadSummary>> {
    let devices = local_devices(&config.devices)?;
    let endpoints = LocalGroup::new(config.host.local_hosts);

    std::thread::scope(|scope| -> Result<Vec<WorkloadSummary>> {
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|endpoint| {
                let devices = devices.clone();
                std::thread::Builder::new()
                    .name(format!("host-{}", endpoint.host_id()))
                    .spawn_scoped(scope, move || run_host(config, endpoint, devices))
            })
            .collect::<std::io::Result<_>>()?;

        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(Error::Internal("host thread panicked".to_string())))
            })
            .collect()
    })
}

/// Join the group through `transport` and play this host's part
pub fn run_host(
    config: &FleetConfig,
    transport: Arc<dyn Transport>,
    devices: Vec<DeviceProperties>,
) -> Result<WorkloadSummary> {
    let span = info_span!("host", id = transport.host_id());
    let _guard = span.enter();

    let started = Instant::now();
    let manager = HostManager::start(config.manager_settings(), transport, devices);
    let interval = Duration::from_millis(config.workload.poll_interval_ms);

    let (outcome, tasks_served) = std::thread::scope(|scope| {
        let loops: Vec<_> = (0..manager.local_devices().len() as u32)
            .map(|local_id| {
                let manager = &manager;
                scope.spawn(move || serve_device(manager, local_id, interval))
            })
            .collect();

        let outcome = if manager.is_master() {
            drive_master(&manager, &config.workload)
        } else {
            serve_bulk(&manager)
        };

        let served = loops
            .into_iter()
            .map(|l| l.join().unwrap_or_else(|p| std::panic::resume_unwind(p)))
            .sum::<u64>();
        (outcome, served)
    });

    let mut summary = WorkloadSummary {
        host_id: manager.host_id(),
        host_count: manager.host_count(),
        tasks_served,
        ..Default::default()
    };
    manager.stop();

    let outcome = outcome?;
    summary.group_devices = outcome.group_devices;
    summary.echoes_verified = outcome.echoes_verified;
    summary.bulk_bytes = outcome.bulk_bytes;
    summary.elapsed = started.elapsed();

    info!(
        tasks = summary.tasks_served,
        echoes = summary.echoes_verified,
        bulk_bytes = summary.bulk_bytes,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "Workload finished"
    );
    Ok(summary)
}

#[derive(Debug, Default)]
struct Outcome {
    group_devices: usize,
    echoes_verified: usize,
    bulk_bytes: u64,
}

// ─────────────────────────────────────────────────────────────────
// Device Loop
// ─────────────────────────────────────────────────────────────────

/// Serve one device's inbox until `Shutdown`; returns the tasks served
fn serve_device(manager: &HostManager, local_id: u32, interval: Duration) -> u64 {
    let inbox = DeviceInbox::new(manager, local_id);
    let device = inbox.device();
    let _span = info_span!("device", %device).entered();
    let mut served = 0u64;

    loop {
        let task: WorkloadTask = inbox
            .next_task(interval)
            .decode()
            .unwrap_or_else(|e| panic!("device {} received an unreadable task: {}", device, e));

        match task {
            WorkloadTask::Echo { reply_tag, payload } => {
                let report = TaskReport {
                    device: Some(device),
                    bytes: payload.len() as u64,
                    sha256: sha256_hex(&payload),
                };
                manager.send_value(&report, MASTER_HOST, reply_tag);
                manager.send_packed(&payload, MASTER_HOST, reply_tag);
                served += 1;
                debug!(bytes = payload.len(), reply_tag, "Echo served");
            }
            WorkloadTask::Shutdown { reply_tag } => {
                manager.send_pod(&served, MASTER_HOST, reply_tag);
                debug!(served, "Device loop stopped");
                return served;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Master
// ─────────────────────────────────────────────────────────────────

fn drive_master(manager: &HostManager, settings: &WorkloadSettings) -> Result<Outcome> {
    let devices = manager.devices().to_vec();
    let mut failures = Vec::new();
    info!(devices = devices.len(), hosts = manager.host_count(), "Starting workload");

    // Echo phase
    let mut echoes = Vec::with_capacity(devices.len());
    for (i, &device) in devices.iter().enumerate() {
        let reply_tag = manager.next_communication_tag();
        let payload = test_pattern(settings.echo_bytes, i as u64 + 1);
        let task = SerializedTask::encode(&WorkloadTask::Echo {
            reply_tag,
            payload: payload.clone(),
        })?;
        manager.send_task(&task, device);
        echoes.push((device, reply_tag, payload));
    }

    let mut verified = 0;
    for (device, reply_tag, payload) in &echoes {
        let report: TaskReport = manager.receive_value(device.host_id, *reply_tag);
        let echoed = manager.receive_packed(device.host_id, *reply_tag);
        if report.sha256 != sha256_hex(payload) || report.bytes != payload.len() as u64 {
            failures.push(format!("device {} reported a different checksum", device));
        } else if echoed.as_ref() != payload.as_slice() {
            failures.push(format!("device {} echoed different bytes", device));
        } else {
            verified += 1;
        }
    }
    info!(verified, total = echoes.len(), "Echo phase finished");

    // Bulk phase
    let mut bulk_sent = 0u64;
    for host in 1..manager.host_count() {
        let tag = manager.next_communication_tag();
        let data = test_pattern(settings.bulk_bytes, 1000 + host as u64);
        let block = match settings.block_bytes {
            0 => data.len().min(manager.settings().max_block_size),
            n => n,
        };
        let expected = sha256_hex(&data);

        manager.send_value(
            &BulkHeader {
                tag,
                total: data.len() as u64,
                block: block as u64,
            },
            host,
            WORKLOAD_CONTROL_TAG,
        );
        let mut sends = manager.send_async_chunked(data, host, tag, Some(block));
        debug!(host, tag, blocks = sends.len(), "Bulk transfer started");
        wait_all(&mut sends);

        let report: TaskReport = manager.receive_value(host, tag);
        if report.sha256 != expected {
            failures.push(format!("host {} reassembled different bulk bytes", host));
        }
        bulk_sent += report.bytes;
    }
    if manager.host_count() > 1 {
        info!(bytes = bulk_sent, hosts = manager.host_count() - 1, "Bulk phase finished");
    }

    // Shutdown phase; every ack receive is posted before its task leaves
    let shutdowns = devices
        .iter()
        .map(|&device| {
            let reply_tag = manager.next_communication_tag();
            let task = SerializedTask::encode(&WorkloadTask::Shutdown { reply_tag })?;
            Ok((device, reply_tag, task))
        })
        .collect::<Result<Vec<_>>>()?;

    let acks: Vec<(DeviceId, PendingValue<u64>)> = shutdowns
        .iter()
        .map(|(device, reply_tag, task)| {
            let ack = manager.receive_pod_async::<u64>(device.host_id, *reply_tag);
            manager.send_task(task, *device);
            (*device, ack)
        })
        .collect();

    for (device, ack) in acks {
        let served = ack.wait();
        if served != 1 {
            warn!(%device, served, "Unexpected task count");
        }
    }

    if !failures.is_empty() {
        for failure in &failures {
            error!(failure = %failure, "Workload check failed");
        }
        return Err(Error::workload(failures.join("; ")));
    }

    Ok(Outcome {
        group_devices: devices.len(),
        echoes_verified: verified,
        bulk_bytes: bulk_sent,
    })
}

// ─────────────────────────────────────────────────────────────────
// Worker
// ─────────────────────────────────────────────────────────────────

/// Receive the master's bulk transfer and report its checksum
fn serve_bulk(manager: &HostManager) -> Result<Outcome> {
    let header: BulkHeader = manager.receive_value(MASTER_HOST, WORKLOAD_CONTROL_TAG);
    let receive = manager.receive_async_chunked(
        header.total as usize,
        MASTER_HOST,
        header.tag,
        Some(header.block as usize),
    );
    let data = receive.into_bytes();

    let report = TaskReport {
        device: None,
        bytes: data.len() as u64,
        sha256: sha256_hex(&data),
    };
    manager.send_value(&report, MASTER_HOST, header.tag);
    debug!(bytes = data.len(), tag = header.tag, "Bulk transfer received");

    Ok(Outcome {
        bulk_bytes: data.len() as u64,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::{is_allocated, MAX_LOCAL_DEVICE_ID};

    fn small_config(hosts: usize, devices: u32) -> FleetConfig {
        let mut config = FleetConfig::default();
        config.host.local_hosts = hosts;
        config.devices.detect = false;
        config.devices.simulated = devices;
        config.workload.echo_bytes = 2048;
        config.workload.bulk_bytes = 10_000;
        config.workload.block_bytes = 3000;
        config
    }

    #[test]
    fn test_control_tag_is_reserved() {
        assert!(!is_allocated(WORKLOAD_CONTROL_TAG));
        assert!(WORKLOAD_CONTROL_TAG > MAX_LOCAL_DEVICE_ID as Tag + 1);
        assert_ne!(WORKLOAD_CONTROL_TAG, DISCOVERY_TAG);
    }

    #[test]
    fn test_pattern_is_deterministic() {
        assert_eq!(test_pattern(64, 7), test_pattern(64, 7));
        assert_ne!(test_pattern(64, 7), test_pattern(64, 8));
        assert!(test_pattern(0, 1).is_empty());
    }

    #[test]
    fn test_task_encoding() {
        let task = WorkloadTask::Echo {
            reply_tag: 2047,
            payload: vec![1, 2, 3],
        };
        let encoded = SerializedTask::encode(&task).unwrap();
        assert_eq!(encoded.decode::<WorkloadTask>().unwrap(), task);
    }

    #[test]
    fn test_single_host() {
        let summaries = run_local_group(&small_config(1, 2)).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].group_devices, 2);
        assert_eq!(summaries[0].echoes_verified, 2);
        assert_eq!(summaries[0].tasks_served, 2);
        assert_eq!(summaries[0].bulk_bytes, 0);
    }

    #[test]
    fn test_three_hosts_with_compression() {
        let mut config = small_config(3, 2);
        config.transport.compression = crate::config::CompressionKind::Zlib;
        config.transport.min_compress_size = 1024;

        let summaries = run_local_group(&config).unwrap();
        let master = &summaries[0];
        assert_eq!(master.group_devices, 6);
        assert_eq!(master.echoes_verified, 6);
        assert_eq!(master.bulk_bytes, 20_000);
        for worker in &summaries[1..] {
            assert_eq!(worker.tasks_served, 2);
            assert_eq!(worker.bulk_bytes, 10_000);
        }
    }

    #[test]
    fn test_host_without_devices() {
        let summaries = run_local_group(&small_config(2, 0)).unwrap();
        assert_eq!(summaries[0].group_devices, 0);
        assert_eq!(summaries[1].bulk_bytes, 10_000);
    }
}
