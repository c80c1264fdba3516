//! Multi-host scenarios on the in-process transport
//!
//! Every test runs each host of a group on its own thread. Transport
//! failures panic instead of exiting the test binary.

mod common;

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use common::{panic_message, run_local_group, run_local_group_ok};
use fleetlink::dispatch::{DeviceInbox, SerializedTask, TaskSendMode};
use fleetlink::manager::{HostManager, ManagerSettings};
use fleetlink::request::{are_requests_complete, wait_all, Request, RequestState};
use fleetlink::tag::{is_allocated, Tag};
use fleetlink::topology::{DeviceId, MASTER_HOST};
use fleetlink::CompressionPolicy;

/// Fixed tag the master uses to tell a worker which tag comes next
const ANNOUNCE_TAG: Tag = 7;
const READY_TAG: Tag = 8;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 253) as u8).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, IntoBytes, FromBytes, Immutable)]
#[repr(C)]
struct Sample {
    id: u64,
    value: f64,
    flags: u32,
    count: u32,
}

fleetlink::fixed_layout_value!(Sample);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Job {
    name: String,
    shards: Vec<u32>,
    weight: Option<f32>,
}

fleetlink::serialized_value!(Job);

// ─────────────────────────────────────────────────────────────────
// Chunked Transport
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_chunked_transfer_of_three_blocks() {
    const CAP: usize = 4096;
    let settings = ManagerSettings {
        max_block_size: CAP,
        ..Default::default()
    };

    let results = run_local_group_ok(&[0, 0], settings, |m| {
        let data = pattern(3 * CAP);
        if m.is_master() {
            let tag = m.next_communication_tag();
            m.send_value(&tag, 1, ANNOUNCE_TAG);
            let mut sends = m.send_async_chunked(data, 1, tag, None);
            assert_eq!(sends.len(), 3);
            wait_all(&mut sends);
            m.stop();
            true
        } else {
            let tag: Tag = m.receive_value(MASTER_HOST, ANNOUNCE_TAG);
            assert!(is_allocated(tag));
            let mut receive = m.receive_async_chunked(3 * CAP, MASTER_HOST, tag, None);
            assert_eq!(receive.requests_mut().len(), 3);
            receive.wait();

            let mut buf = vec![0u8; 3 * CAP];
            receive.assemble_into(&mut buf);
            m.stop();
            buf == data
        }
    });

    assert!(results.iter().all(|ok| *ok));
}

#[test]
fn test_chunked_round_trip_for_uneven_sizes() {
    const CAP: usize = 1000;
    // (size, block) pairs; blocks divide evenly or leave a short tail
    const CASES: &[(usize, usize)] = &[
        (1, 1000),
        (999, 1000),
        (1000, 1000),
        (1001, 1000),
        (4000, 1000),
        (3999, 700),
        (2500, 500),
    ];
    let settings = ManagerSettings {
        max_block_size: CAP,
        ..Default::default()
    };

    let results = run_local_group_ok(&[0, 0], settings, |m| {
        let mut matched = Vec::new();
        for (i, &(size, block)) in CASES.iter().enumerate() {
            let tag = 100 + i as Tag;
            let data = pattern(size);
            if m.is_master() {
                let mut sends = m.send_async_chunked(data, 1, tag, Some(block));
                assert_eq!(sends.len(), size.div_ceil(block));
                wait_all(&mut sends);
            } else {
                let received = m.receive_async_chunked(size, MASTER_HOST, tag, Some(block)).into_bytes();
                matched.push(received == data);
            }
        }
        m.stop();
        matched
    });

    assert_eq!(results[1].len(), CASES.len());
    assert!(results[1].iter().all(|ok| *ok));
}

#[test]
fn test_zero_length_chunked_transfer() {
    let results = run_local_group_ok(&[0], ManagerSettings::default(), |m| {
        let sends = m.send_async_chunked(Bytes::new(), 0, 3, None);
        let mut receive = m.receive_async_chunked(0, 0, 3, None);
        let ok = sends.is_empty() && receive.requests_mut().is_empty() && receive.is_complete();
        m.stop();
        ok
    });
    assert!(results[0]);
}

// ─────────────────────────────────────────────────────────────────
// Typed Values
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_fixed_layout_values_are_bit_exact() {
    let results = run_local_group_ok(&[0, 0], ManagerSettings::default(), |m| {
        let sample = Sample {
            id: u64::MAX,
            value: f64::from_bits(0x7ff8_0000_0000_0001),
            flags: 0xa5a5_a5a5,
            count: 3,
        };
        if m.is_master() {
            m.send_value(&sample, 1, 10);
            m.send_pod(&-1.5f32, 1, 11);
            m.send_value(&0x0102_0304_0506_0708u64, 1, 12);
            m.stop();
            true
        } else {
            let got: Sample = m.receive_value(MASTER_HOST, 10);
            let float = m.receive_pod_async::<f32>(MASTER_HOST, 11).wait();
            let word: u64 = m.receive_value(MASTER_HOST, 12);
            m.stop();
            got.as_bytes() == sample.as_bytes()
                && got.value.to_bits() == sample.value.to_bits()
                && float == -1.5
                && word == 0x0102_0304_0506_0708
        }
    });
    assert!(results[1]);
}

#[test]
fn test_serialized_values_round_trip() {
    let results = run_local_group_ok(&[0, 0], ManagerSettings::default(), |m| {
        let job = Job {
            name: "reduce".to_string(),
            shards: vec![1, 2, 3, 5, 8],
            weight: Some(0.25),
        };
        let names = vec!["alpha".to_string(), String::new(), "γ".to_string()];
        if m.is_master() {
            m.send_value(&job, 1, 20);
            m.send_value(&names, 1, 21);
            m.send_value(&None::<u32>, 1, 22);
            m.send_serialized(&42u16, 1, 23);
            m.stop();
            true
        } else {
            let got_job: Job = m.receive_value(MASTER_HOST, 20);
            let got_names: Vec<String> = m.receive_value(MASTER_HOST, 21);
            let nothing: Option<u32> = m.receive_value(MASTER_HOST, 22);
            let forced: u16 = m.receive_serialized(MASTER_HOST, 23);
            m.stop();
            got_job == job && got_names == names && nothing.is_none() && forced == 42
        }
    });
    assert!(results[1]);
}

#[test]
fn test_packed_payloads_with_compression() {
    let settings = ManagerSettings {
        compression: CompressionPolicy::zlib(6, 1024),
        ..Default::default()
    };
    let results = run_local_group_ok(&[0, 0], settings, |m| {
        let small = b"tiny".to_vec();
        let large = vec![42u8; 64 * 1024];
        if m.is_master() {
            m.send_packed(&small, 1, 30);
            m.send_packed(&large, 1, 30);
            m.stop();
            true
        } else {
            let a = m.receive_packed(MASTER_HOST, 30);
            let b = m.receive_packed(MASTER_HOST, 30);
            m.stop();
            a.as_ref() == small.as_slice() && b.as_ref() == large.as_slice()
        }
    });
    assert!(results[1]);
}

// ─────────────────────────────────────────────────────────────────
// Ordering, Probing, Cancellation
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_messages_on_one_tag_keep_their_order() {
    let results = run_local_group_ok(&[0, 0], ManagerSettings::default(), |m| {
        if m.is_master() {
            for i in 0..200u32 {
                m.send_value(&i, 1, 40);
            }
            m.stop();
            Vec::new()
        } else {
            let got: Vec<u32> = (0..200).map(|_| m.receive_value(MASTER_HOST, 40)).collect();
            m.stop();
            got
        }
    });
    assert_eq!(results[1], (0..200).collect::<Vec<u32>>());
}

#[test]
fn test_dynamic_receive_after_probe() {
    let results = run_local_group_ok(&[0, 0], ManagerSettings::default(), |m| {
        if m.is_master() {
            m.send(pattern(12_345), 1, 50);
            m.stop();
            0
        } else {
            m.wait_message(MASTER_HOST, 50, Duration::from_millis(1));
            assert!(m.has_message(MASTER_HOST, 50));
            let data = m.receive_dynamic(MASTER_HOST, 50);
            assert!(!m.has_message(MASTER_HOST, 50));
            m.stop();
            data.len()
        }
    });
    assert_eq!(results[1], 12_345);
}

#[test]
fn test_cancelled_receive_is_skipped() {
    let results = run_local_group_ok(&[0, 0], ManagerSettings::default(), |m| {
        if m.is_master() {
            let _: u8 = m.receive_value(1, READY_TAG);
            m.send(Bytes::from_static(b"after cancel"), 1, 60);
            m.stop();
            true
        } else {
            let mut cancelled = m.receive_async(64, MASTER_HOST, 60);
            assert!(cancelled.cancel());
            assert_eq!(cancelled.state(), RequestState::Empty);
            m.send_value(&1u8, MASTER_HOST, READY_TAG);

            let mut live = m.receive_async(64, MASTER_HOST, 60);
            live.wait();
            let data = live.take_data().unwrap();
            m.stop();
            data.as_ref() == b"after cancel"
        }
    });
    assert!(results[1]);
}

#[test]
fn test_wait_timeout_then_completion() {
    let results = run_local_group_ok(&[0, 0], ManagerSettings::default(), |m| {
        if m.is_master() {
            let _: u8 = m.receive_value(1, READY_TAG);
            m.send(vec![9u8; 16], 1, 70);
            m.stop();
            true
        } else {
            let mut requests = vec![m.receive_async(16, MASTER_HOST, 70)];
            let timed_out = !requests[0].wait_timeout(Duration::from_millis(20), Duration::from_millis(1));
            let still_pending = !are_requests_complete(&mut requests);
            m.send_value(&1u8, MASTER_HOST, READY_TAG);

            wait_all(&mut requests);
            let done = requests[0].is_complete() && requests[0].bytes_received() == 16;
            m.stop();
            timed_out && still_pending && done
        }
    });
    assert!(results[1]);
}

#[test]
#[should_panic(expected = "wait called on an empty request")]
fn test_wait_on_unbound_request() {
    let mut request = Request::empty();
    request.wait();
}

// ─────────────────────────────────────────────────────────────────
// Topology and Roles
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_discovery_orders_devices_by_host() {
    let results = run_local_group_ok(&[1, 2, 0], ManagerSettings::default(), |m| {
        let seen = if m.is_master() {
            assert_eq!(HostManager::master_id(), 0);
            assert_eq!(m.device_properties().len(), 3);
            m.devices().to_vec()
        } else {
            Vec::new()
        };
        let local = m.local_devices().len();
        m.stop();
        (seen, local)
    });

    assert_eq!(
        results[0].0,
        vec![DeviceId::new(0, 0), DeviceId::new(1, 0), DeviceId::new(1, 1)]
    );
    assert_eq!(results[1].1, 2);
    assert_eq!(results[2].1, 0);
}

#[test]
fn test_worker_cannot_allocate_tags() {
    let results = run_local_group(&[0, 0], ManagerSettings::default(), |m| {
        if !m.is_master() {
            let _ = m.next_communication_tag();
        }
        m.stop();
    });

    assert!(results[0].is_ok());
    let err = results[1].as_ref().unwrap_err();
    assert!(panic_message(err.as_ref()).contains("only the master allocates tags"));
}

#[test]
fn test_worker_cannot_read_group_devices() {
    let results = run_local_group(&[1, 1], ManagerSettings::default(), |m| {
        if !m.is_master() {
            let _ = m.devices();
        }
        m.stop();
    });

    let err = results[1].as_ref().unwrap_err();
    assert!(panic_message(err.as_ref()).contains("only available on the master"));
}

// ─────────────────────────────────────────────────────────────────
// Task Dispatch
// ─────────────────────────────────────────────────────────────────

fn dispatch_across_hosts(mode: TaskSendMode) -> Vec<usize> {
    let settings = ManagerSettings {
        task_send_mode: mode,
        max_task_size: 4096,
        ..Default::default()
    };
    let results = run_local_group_ok(&[1, 2], settings, |m| {
        if m.is_master() {
            m.send_task(&SerializedTask::new(vec![1u8; 4096]), DeviceId::new(1, 1));
            m.send_task(&SerializedTask::new(vec![2u8; 10]), DeviceId::new(1, 0));
            m.send_task(&SerializedTask::new(vec![3u8; 1]), DeviceId::new(0, 0));
            let own = DeviceInbox::new(&m, 0).next_task(Duration::from_millis(1)).len();
            let _: u8 = m.receive_value(1, READY_TAG);
            m.stop();
            vec![own]
        } else {
            let first = DeviceInbox::new(&m, 0);
            let second = DeviceInbox::new(&m, 1);
            assert_eq!((first.tag(), second.tag()), (1, 2));
            let sizes = vec![
                second.next_task(Duration::from_millis(1)).len(),
                first.next_task(Duration::from_millis(1)).len(),
            ];
            assert!(first.poll_task().is_none());
            m.send_value(&1u8, MASTER_HOST, READY_TAG);
            m.stop();
            sizes
        }
    });
    results.concat()
}

#[test]
fn test_buffered_dispatch_across_hosts() {
    assert_eq!(dispatch_across_hosts(TaskSendMode::Buffered), vec![1, 4096, 10]);
}

#[test]
fn test_synchronous_dispatch_across_hosts() {
    assert_eq!(dispatch_across_hosts(TaskSendMode::Synchronous), vec![1, 4096, 10]);
}

#[test]
fn test_task_size_limits() {
    let settings = ManagerSettings {
        max_task_size: 256,
        ..Default::default()
    };
    let results = run_local_group(&[1], settings, |m| {
        let device = DeviceId::new(0, 0);
        m.send_task(&SerializedTask::new(vec![0u8; 256]), device);
        assert_eq!(DeviceInbox::new(&m, 0).poll_task().map(|t| t.len()), Some(256));

        let empty = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            m.send_task(&SerializedTask::new(Bytes::new()), device)
        }));
        let over = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            m.send_task(&SerializedTask::new(vec![0u8; 257]), device)
        }));
        m.stop();
        (
            panic_message(empty.unwrap_err().as_ref()),
            panic_message(over.unwrap_err().as_ref()),
        )
    });

    let (empty, over) = results.into_iter().next().unwrap().unwrap();
    assert!(empty.contains("empty task payload"));
    assert!(over.contains("exceeds the 256-byte task buffer"));
}
