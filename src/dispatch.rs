//! Task delivery to device inboxes
//!
//! The master sends opaque, already serialized tasks to a device's inbox tag
//! (`local_id + 1`) on the owning host. The host side reads them through a
//! [`DeviceInbox`]. This layer never looks inside a task.

use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::codec::{CodecError, Encoding, Serialized};
use crate::manager::HostManager;
use crate::tag::Tag;
use crate::topology::{DeviceId, MASTER_HOST};

/// Default ceiling for a single task payload (32 MiB)
pub const DEFAULT_MAX_TASK_SIZE: usize = 32 * 1024 * 1024;

/// How `send_task` hands a task to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSendMode {
    /// Return once the transport holds the payload
    #[default]
    Buffered,
    /// Return once the payload has left this host
    Synchronous,
}

impl std::fmt::Display for TaskSendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskSendMode::Buffered => write!(f, "buffered"),
            TaskSendMode::Synchronous => write!(f, "synchronous"),
        }
    }
}

/// Task payload as produced by whoever defines the task format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedTask(Bytes);

impl SerializedTask {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Serialize a task description with bincode
    pub fn encode<T: Serialize + DeserializeOwned>(task: &T) -> Result<Self, CodecError> {
        <Serialized as Encoding<T>>::encode(task).map(Self)
    }

    /// Reverse [`SerializedTask::encode`]
    pub fn decode<T: Serialize + DeserializeOwned>(&self) -> Result<T, CodecError> {
        <Serialized as Encoding<T>>::decode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl HostManager {
    /// Send a task to a device's inbox, master only.
    ///
    /// Panics on an empty payload or one larger than the configured task
    /// size. The payload is shared with the transport, not copied.
    pub fn send_task(&self, task: &SerializedTask, device: DeviceId) {
        assert!(self.is_master(), "only the master dispatches tasks");
        let size = task.len();
        let max = self.settings.max_task_size;
        assert!(size > 0, "empty task payload for device {}", device);
        assert!(
            size <= max,
            "task payload of {} bytes for device {} exceeds the {}-byte task buffer",
            size,
            device,
            max
        );

        let tag = self.task_tag(device);
        let mut request = self.send_async(task.0.clone(), device.host_id, tag);
        match self.settings.task_send_mode {
            TaskSendMode::Synchronous => request.wait(),
            TaskSendMode::Buffered => request.detach(),
        }
        trace!(%device, tag, size, mode = %self.settings.task_send_mode, "Task sent");
    }
}

// ─────────────────────────────────────────────────────────────────
// Device Inbox
// ─────────────────────────────────────────────────────────────────

/// Receiving end of one local device's task stream
#[derive(Debug)]
pub struct DeviceInbox<'a> {
    manager: &'a HostManager,
    device: DeviceId,
    tag: Tag,
}

impl<'a> DeviceInbox<'a> {
    pub fn new(manager: &'a HostManager, local_id: u32) -> Self {
        assert!(
            (local_id as usize) < manager.local_devices().len(),
            "host {} has no device {}",
            manager.host_id(),
            local_id
        );
        let device = DeviceId::new(manager.host_id(), local_id);
        Self {
            manager,
            device,
            tag: manager.task_tag(device),
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Next task if one is waiting
    pub fn poll_task(&self) -> Option<SerializedTask> {
        if self.manager.has_message(MASTER_HOST, self.tag) {
            Some(self.receive())
        } else {
            None
        }
    }

    /// Wait for the next task, checking every `interval`
    pub fn next_task(&self, interval: Duration) -> SerializedTask {
        self.manager.wait_message(MASTER_HOST, self.tag, interval);
        self.receive()
    }

    fn receive(&self) -> SerializedTask {
        SerializedTask(self.manager.receive_dynamic(MASTER_HOST, self.tag))
    }
}
