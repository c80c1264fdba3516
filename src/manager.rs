//! Per-process entry point to the group
//!
//! [`HostManager`] owns the transport endpoint, the frozen [`Topology`] and
//! the tag allocator. It offers:
//! - Raw sends and receives, single-message and chunked
//! - Typed sends and receives through [`crate::codec`]
//! - Task dispatch to device inboxes (see [`crate::dispatch`])
//!
//! Transport failures are never returned: they are logged and the whole
//! group is aborted. Misuse (worker-only calls on the master, bad block
//! sizes, codec mismatches) panics.

use std::marker::PhantomData;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::codec::{self, CompressionPolicy, Encoding, Serialized, WireValue};
use crate::dispatch::{TaskSendMode, DEFAULT_MAX_TASK_SIZE};
use crate::request::{spin_wait, Request};
use crate::tag::{self, Tag, TagAllocator, DISCOVERY_TAG};
use crate::topology::{DeviceId, DeviceProperties, HostId, Topology, MASTER_HOST};
use crate::transport::{fail_group, Transport, TransportError, MAX_MESSAGE_SIZE};

// ─────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────

/// Tunables of a [`HostManager`]
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// How tasks are handed to the transport
    pub task_send_mode: TaskSendMode,

    /// Largest accepted task payload
    pub max_task_size: usize,

    /// Largest single message of a chunked transfer
    pub max_block_size: usize,

    /// Applied by the packed send/receive calls
    pub compression: CompressionPolicy,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            task_send_mode: TaskSendMode::Buffered,
            max_task_size: DEFAULT_MAX_TASK_SIZE,
            max_block_size: MAX_MESSAGE_SIZE,
            compression: CompressionPolicy::disabled(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Host Manager
// ─────────────────────────────────────────────────────────────────

/// One host's handle on the group
pub struct HostManager {
    pub(crate) transport: Arc<dyn Transport>,
    topology: Topology,
    local_devices: Vec<DeviceProperties>,
    tags: TagAllocator,
    pub(crate) settings: ManagerSettings,
}

impl HostManager {
    /// Join the group through `transport` and run device discovery.
    ///
    /// Workers report `local_devices` to the master; the master registers
    /// its own devices first, then every worker's in host order. Every host
    /// of the group must call this, once per transport endpoint.
    pub fn start(
        settings: ManagerSettings,
        transport: Arc<dyn Transport>,
        local_devices: Vec<DeviceProperties>,
    ) -> Self {
        assert!(
            settings.max_block_size > 0 && settings.max_block_size <= MAX_MESSAGE_SIZE,
            "block size {} outside 1..={}",
            settings.max_block_size,
            MAX_MESSAGE_SIZE
        );
        assert!(
            transport.claim(),
            "host {} already started a manager on this transport",
            transport.host_id()
        );

        let topology = Topology::new(transport.host_id(), transport.host_count());
        let mut manager = Self {
            transport,
            topology,
            local_devices: Vec::new(),
            tags: TagAllocator::new(),
            settings,
        };
        manager.discover(local_devices);

        info!(
            host_id = manager.host_id(),
            host_count = manager.host_count(),
            backend = manager.transport.backend(),
            local_devices = manager.local_devices.len(),
            "Host manager started"
        );
        manager
    }

    fn discover(&mut self, local_devices: Vec<DeviceProperties>) {
        if self.is_master() {
            self.topology.register_host(MASTER_HOST, local_devices.clone());
            for host in 1..self.host_count() {
                let devices: Vec<DeviceProperties> = self.receive_value(host, DISCOVERY_TAG);
                debug!(host, devices = devices.len(), "Registered host devices");
                self.topology.register_host(host, devices);
            }
            info!(
                hosts = self.host_count(),
                devices = self.topology.devices().len(),
                "Device discovery finished"
            );
        } else {
            self.send_value(&local_devices, MASTER_HOST, DISCOVERY_TAG);
        }
        self.local_devices = local_devices;
    }

    /// Leave the group. Outstanding sends are flushed first.
    pub fn stop(self) {
        let host_id = self.host_id();
        if let Err(err) = self.transport.shutdown() {
            self.fatal(&err);
        }
        info!(host_id, "Host manager stopped");
    }

    // ─────────────────────────────────────────────────────────────
    // Topology
    // ─────────────────────────────────────────────────────────────

    pub fn host_id(&self) -> HostId {
        self.topology.host_id()
    }

    pub fn host_count(&self) -> usize {
        self.topology.host_count()
    }

    pub fn is_master(&self) -> bool {
        self.topology.is_master()
    }

    pub const fn master_id() -> HostId {
        MASTER_HOST
    }

    /// Every device of the group, master only
    pub fn devices(&self) -> &[DeviceId] {
        self.topology.devices()
    }

    /// Properties matching [`HostManager::devices`], master only
    pub fn device_properties(&self) -> &[DeviceProperties] {
        self.topology.device_properties()
    }

    /// This host's own devices, indexed by local id
    pub fn local_devices(&self) -> &[DeviceProperties] {
        &self.local_devices
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Mint a fresh exchange tag, master only
    pub fn next_communication_tag(&self) -> Tag {
        assert!(self.is_master(), "only the master allocates tags");
        self.tags.next()
    }

    /// Inbox tag of a device
    pub fn task_tag(&self, device: DeviceId) -> Tag {
        tag::task_tag(device)
    }

    // ─────────────────────────────────────────────────────────────
    // Raw Transfers
    // ─────────────────────────────────────────────────────────────

    /// Send one message and wait until it has left this host
    pub fn send(&self, data: impl Into<Bytes>, dest: HostId, tag: Tag) {
        self.send_async(data, dest, tag).wait();
    }

    /// Start sending one message
    pub fn send_async(&self, data: impl Into<Bytes>, dest: HostId, tag: Tag) -> Request {
        let data = data.into();
        let size = data.len();
        match self.transport.send(dest, tag, data) {
            Ok(completion) => {
                debug!(dest, tag, size, "Send started");
                Request::send(completion, Arc::clone(&self.transport))
            }
            Err(err) => self.fatal(&err),
        }
    }

    /// Send `data` as consecutive blocks of `block_size` bytes on one tag.
    /// Defaults to the largest block that fits one message.
    pub fn send_async_chunked(
        &self,
        data: impl Into<Bytes>,
        dest: HostId,
        tag: Tag,
        block_size: Option<usize>,
    ) -> Vec<Request> {
        let data = data.into();
        let block = self.block_size(data.len(), block_size);
        chunk_ranges(data.len(), block)
            .map(|range| self.send_async(data.slice(range), dest, tag))
            .collect()
    }

    /// Receive one message of at most `buf.len()` bytes into `buf`.
    /// Returns the message size.
    pub fn receive(&self, buf: &mut [u8], source: HostId, tag: Tag) -> usize {
        let mut request = self.receive_async(buf.len(), source, tag);
        request.wait();
        request.copy_to(buf)
    }

    /// Post a receive of at most `capacity` bytes
    pub fn receive_async(&self, capacity: usize, source: HostId, tag: Tag) -> Request {
        if source >= self.host_count() {
            self.fatal(&TransportError::InvalidHost {
                host_id: source,
                host_count: self.host_count(),
            });
        }
        if tag <= 0 {
            self.fatal(&TransportError::InvalidTag(tag));
        }
        let completion = self.transport.mailbox().post_receive(source, tag, capacity);
        Request::receive(completion, Arc::clone(&self.transport))
    }

    /// Receive the blocks of a chunked send of `total` bytes. Sender and
    /// receiver must use the same block size.
    pub fn receive_async_chunked(
        &self,
        total: usize,
        source: HostId,
        tag: Tag,
        block_size: Option<usize>,
    ) -> ChunkedReceive {
        let block = self.block_size(total, block_size);
        let ranges: Vec<Range<usize>> = chunk_ranges(total, block).collect();
        let requests = ranges
            .iter()
            .map(|r| self.receive_async(r.len(), source, tag))
            .collect();
        ChunkedReceive {
            total,
            ranges,
            requests,
        }
    }

    /// Receive a message whose size is not known in advance
    pub fn receive_dynamic(&self, source: HostId, tag: Tag) -> Bytes {
        let size = match self.transport.mailbox().probe(source, tag) {
            Ok(size) => size,
            Err(err) => self.fatal(&err),
        };
        let mut request = self.receive_async(size, source, tag);
        request.wait();
        request.take_data().unwrap_or_default()
    }

    /// Whether a message from `source` on `tag` is waiting
    pub fn has_message(&self, source: HostId, tag: Tag) -> bool {
        self.transport.mailbox().iprobe(source, tag).is_some()
    }

    /// Poll every `interval` until a message from `source` on `tag` is waiting
    pub fn wait_message(&self, source: HostId, tag: Tag, interval: Duration) {
        spin_wait(interval, None, || self.has_message(source, tag));
    }

    fn block_size(&self, total: usize, requested: Option<usize>) -> usize {
        let cap = self.settings.max_block_size;
        let block = requested.unwrap_or_else(|| total.min(cap));
        if total > 0 {
            assert!(block > 0, "block size must be positive");
        }
        assert!(
            block <= cap,
            "block size {} exceeds the {}-byte message limit",
            block,
            cap
        );
        block
    }

    // ─────────────────────────────────────────────────────────────
    // Typed Transfers
    // ─────────────────────────────────────────────────────────────

    /// Send a value with its type's wire encoding
    pub fn send_value<T: WireValue>(&self, value: &T, dest: HostId, tag: Tag) {
        let bytes = codec::encode(value)
            .unwrap_or_else(|e| panic!("cannot encode value for tag {}: {}", tag, e));
        self.send(bytes, dest, tag);
    }

    /// Receive a value sent with [`HostManager::send_value`]
    pub fn receive_value<T: WireValue>(&self, source: HostId, tag: Tag) -> T {
        let bytes = match codec::fixed_size::<T>() {
            Some(size) => {
                let mut request = self.receive_async(size, source, tag);
                request.wait();
                request.take_data().unwrap_or_default()
            }
            None => self.receive_dynamic(source, tag),
        };
        codec::decode(&bytes).unwrap_or_else(|e| {
            panic!(
                "codec mismatch receiving from host {} on tag {}: {}",
                source, tag, e
            )
        })
    }

    /// Send a fixed-layout value's raw bytes
    pub fn send_pod<T>(&self, value: &T, dest: HostId, tag: Tag)
    where
        T: WireValue<Encoding = codec::FixedLayout>,
    {
        self.send_value(value, dest, tag);
    }

    /// Start receiving a fixed-layout value
    pub fn receive_pod_async<T>(&self, source: HostId, tag: Tag) -> PendingValue<T>
    where
        T: WireValue<Encoding = codec::FixedLayout>,
    {
        let size = codec::fixed_size::<T>().unwrap_or(0);
        PendingValue {
            request: self.receive_async(size, source, tag),
            source,
            tag,
            _marker: PhantomData,
        }
    }

    /// Send any serde value bincode-encoded, regardless of its [`WireValue`]
    pub fn send_serialized<T: Serialize + DeserializeOwned>(&self, value: &T, dest: HostId, tag: Tag) {
        let bytes = <Serialized as Encoding<T>>::encode(value)
            .unwrap_or_else(|e| panic!("cannot encode value for tag {}: {}", tag, e));
        self.send(bytes, dest, tag);
    }

    /// Receive a value sent with [`HostManager::send_serialized`]
    pub fn receive_serialized<T: Serialize + DeserializeOwned>(&self, source: HostId, tag: Tag) -> T {
        let bytes = self.receive_dynamic(source, tag);
        <Serialized as Encoding<T>>::decode(&bytes).unwrap_or_else(|e| {
            panic!(
                "codec mismatch receiving from host {} on tag {}: {}",
                source, tag, e
            )
        })
    }

    /// Send bytes through the compression policy
    pub fn send_packed(&self, data: &[u8], dest: HostId, tag: Tag) {
        let packed = self
            .settings
            .compression
            .pack(data)
            .unwrap_or_else(|e| panic!("cannot pack payload for tag {}: {}", tag, e));
        debug!(dest, tag, raw = data.len(), packed = packed.len(), "Sending packed payload");
        self.send(packed, dest, tag);
    }

    /// Receive bytes sent with [`HostManager::send_packed`]
    pub fn receive_packed(&self, source: HostId, tag: Tag) -> Bytes {
        let packed = self.receive_dynamic(source, tag);
        self.settings
            .compression
            .unpack(&packed)
            .unwrap_or_else(|e| panic!("cannot unpack payload from host {} on tag {}: {}", source, tag, e))
    }

    // ─────────────────────────────────────────────────────────────
    // Failure
    // ─────────────────────────────────────────────────────────────

    pub(crate) fn fatal(&self, err: &TransportError) -> ! {
        fail_group(self.transport.as_ref(), err)
    }
}

impl std::fmt::Debug for HostManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostManager")
            .field("host_id", &self.host_id())
            .field("host_count", &self.host_count())
            .field("backend", &self.transport.backend())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────
// Chunking
// ─────────────────────────────────────────────────────────────────

/// Byte ranges of the blocks of a `total`-byte transfer
pub fn chunk_ranges(total: usize, block: usize) -> impl Iterator<Item = Range<usize>> {
    let step = block.max(1);
    (0..total)
        .step_by(step)
        .map(move |offset| offset..(offset + step).min(total))
}

/// Blocks of an in-flight chunked receive
#[derive(Debug)]
pub struct ChunkedReceive {
    total: usize,
    ranges: Vec<Range<usize>>,
    requests: Vec<Request>,
}

impl ChunkedReceive {
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn requests_mut(&mut self) -> &mut [Request] {
        &mut self.requests
    }

    /// Poll every block once
    pub fn is_complete(&mut self) -> bool {
        crate::request::are_requests_complete(&mut self.requests)
    }

    /// Block until every block has arrived
    pub fn wait(&mut self) {
        crate::request::wait_all(&mut self.requests);
    }

    /// Copy every block to its position in `dst`
    pub fn assemble_into(&mut self, dst: &mut [u8]) {
        assert!(
            dst.len() >= self.total,
            "destination of {} bytes cannot hold a {}-byte transfer",
            dst.len(),
            self.total
        );
        for (range, request) in self.ranges.iter().zip(self.requests.iter()) {
            assert!(request.is_complete(), "assemble_into called before every block arrived");
            let copied = request.copy_to(&mut dst[range.clone()]);
            assert_eq!(copied, range.len(), "block at offset {} has the wrong size", range.start);
        }
    }

    /// Wait for every block and return the reassembled payload
    pub fn into_bytes(mut self) -> Vec<u8> {
        self.wait();
        let mut out = vec![0u8; self.total];
        self.assemble_into(&mut out);
        out
    }
}

/// A fixed-layout value on its way in
#[derive(Debug)]
pub struct PendingValue<T> {
    request: Request,
    source: HostId,
    tag: Tag,
    _marker: PhantomData<T>,
}

impl<T> PendingValue<T>
where
    T: WireValue<Encoding = codec::FixedLayout>,
{
    pub fn poll(&mut self) -> bool {
        self.request.poll()
    }

    /// Block until the value has arrived and decode it
    pub fn wait(mut self) -> T {
        self.request.wait();
        let bytes = self.request.take_data().unwrap_or_default();
        codec::decode(&bytes).unwrap_or_else(|e| {
            panic!(
                "codec mismatch receiving from host {} on tag {}: {}",
                self.source, self.tag, e
            )
        })
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AbortMode, LocalGroup};

    fn single_host() -> HostManager {
        let transport = LocalGroup::with_abort_mode(1, AbortMode::Panic).remove(0);
        HostManager::start(ManagerSettings::default(), transport, Vec::new())
    }

    #[test]
    #[should_panic(expected = "already started a manager on this transport")]
    fn test_second_start_on_same_endpoint() {
        let transport = LocalGroup::with_abort_mode(1, AbortMode::Panic).remove(0);
        let first = HostManager::start(ManagerSettings::default(), transport.clone(), Vec::new());
        assert!(first.next_communication_tag() > 0);
        let _second = HostManager::start(ManagerSettings::default(), transport, Vec::new());
    }

    #[test]
    fn test_chunk_ranges() {
        let ranges: Vec<_> = chunk_ranges(10, 4).collect();
        assert_eq!(ranges, vec![0..4, 4..8, 8..10]);

        let ranges: Vec<_> = chunk_ranges(8, 4).collect();
        assert_eq!(ranges, vec![0..4, 4..8]);

        assert_eq!(chunk_ranges(0, 4).count(), 0);
        assert_eq!(chunk_ranges(5, 5).count(), 1);
    }

    #[test]
    fn test_self_send_receive() {
        let m = single_host();
        m.send(Bytes::from_static(b"ping"), 0, 5);
        assert!(m.has_message(0, 5));

        let mut buf = [0u8; 16];
        let n = m.receive(&mut buf, 0, 5);
        assert_eq!(&buf[..n], b"ping");
        assert!(!m.has_message(0, 5));
        m.stop();
    }

    #[test]
    fn test_chunked_self_roundtrip() {
        let m = single_host();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

        let mut sends = m.send_async_chunked(data.clone(), 0, 9, Some(64));
        assert_eq!(sends.len(), 16);
        let mut recv = m.receive_async_chunked(data.len(), 0, 9, Some(64));
        crate::request::wait_all(&mut sends);
        recv.wait();

        let mut out = vec![0u8; data.len()];
        recv.assemble_into(&mut out);
        assert_eq!(out, data);
        m.stop();
    }

    #[test]
    fn test_typed_self_roundtrip() {
        let m = single_host();
        m.send_value(&0xdead_beef_u32, 0, 3);
        assert_eq!(m.receive_value::<u32>(0, 3), 0xdead_beef);

        m.send_value(&vec!["a".to_string(), "b".to_string()], 0, 4);
        assert_eq!(m.receive_value::<Vec<String>>(0, 4), vec!["a", "b"]);

        m.send_pod(&-7i64, 0, 6);
        assert_eq!(m.receive_pod_async::<i64>(0, 6).wait(), -7);

        m.send_serialized(&(1u8, "x".to_string()), 0, 7);
        assert_eq!(m.receive_serialized::<(u8, String)>(0, 7), (1, "x".to_string()));
        m.stop();
    }

    #[test]
    fn test_packed_roundtrip() {
        let transport = LocalGroup::with_abort_mode(1, AbortMode::Panic).remove(0);
        let settings = ManagerSettings {
            compression: CompressionPolicy::zlib(6, 100),
            ..Default::default()
        };
        let m = HostManager::start(settings, transport, Vec::new());
        let data = vec![3u8; 5000];
        m.send_packed(&data, 0, 2);
        assert_eq!(&m.receive_packed(0, 2)[..], &data[..]);
        m.stop();
    }

    #[test]
    fn test_master_allocates_tags() {
        let m = single_host();
        let a = m.next_communication_tag();
        let b = m.next_communication_tag();
        assert_ne!(a, b);
        assert!(tag::is_allocated(a));
        m.stop();
    }

    #[test]
    #[should_panic(expected = "exceeds the 1024-byte message limit")]
    fn test_block_size_above_cap() {
        let transport = LocalGroup::with_abort_mode(1, AbortMode::Panic).remove(0);
        let settings = ManagerSettings {
            max_block_size: 1024,
            ..Default::default()
        };
        let m = HostManager::start(settings, transport, Vec::new());
        let _ = m.send_async_chunked(vec![0u8; 4096], 0, 1, Some(2048));
    }

    #[test]
    #[should_panic(expected = "codec mismatch")]
    fn test_codec_mismatch_panics() {
        let m = single_host();
        m.send_value(&7u32, 0, 8);
        let _ = m.receive_value::<u64>(0, 8);
    }

    #[test]
    #[should_panic(expected = "group aborted")]
    fn test_truncation_aborts() {
        let m = single_host();
        m.send(vec![0u8; 32], 0, 1);
        let mut buf = [0u8; 8];
        m.receive(&mut buf, 0, 1);
    }

    #[test]
    #[should_panic(expected = "group aborted")]
    fn test_invalid_destination_aborts() {
        let m = single_host();
        m.send(Bytes::new(), 3, 1);
    }
}
