//! Message transport between the hosts of a group
//!
//! A [`Transport`] moves opaque byte payloads to a `(host, tag)` address.
//! Receiving is the same for every backend: inbound messages land in the
//! host's [`Mailbox`], which matches them against posted receives.
//!
//! Backends:
//! - [`LocalGroup`]: all hosts live in one process
//! - [`TcpTransport`]: one process per host, full TCP mesh

mod completion;
mod local;
mod mailbox;
mod tcp;
pub mod wire;

pub use completion::{Completion, Finished};
pub use local::{AbortMode, LocalGroup};
pub use mailbox::Mailbox;
pub use tcp::{TcpSettings, TcpTransport};

use bytes::Bytes;
use thiserror::Error;
use tracing::error;

use crate::tag::Tag;
use crate::topology::HostId;

/// Largest payload a single message may carry (1 GiB)
pub const MAX_MESSAGE_SIZE: usize = 1 << 30;

// ─────────────────────────────────────────────────────────────────
// Transport Errors
// ─────────────────────────────────────────────────────────────────

/// Failure reported by the substrate. Never recovered from.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection to host {host_id} lost: {message}")]
    ConnectionLost { host_id: HostId, message: String },

    #[error("message of {actual} bytes from host {from_host} (tag {tag}) does not fit a {capacity}-byte receive")]
    Truncated {
        from_host: HostId,
        tag: Tag,
        capacity: usize,
        actual: usize,
    },

    #[error("host {host_id} is not part of a group of {host_count} hosts")]
    InvalidHost { host_id: HostId, host_count: usize },

    #[error("tag {0} is not a positive integer")]
    InvalidTag(Tag),

    #[error("message of {size} bytes exceeds the {max}-byte limit")]
    MessageTooLarge { size: usize, max: usize },

    #[error("write to host {host_id} failed: {message}")]
    WriteFailed { host_id: HostId, message: String },

    #[error("transport is shut down")]
    ShutDown,

    #[error("group aborted by host {host_id} with code {code}")]
    Aborted { host_id: HostId, code: i32 },
}

impl TransportError {
    /// Process exit code used when this error aborts the group
    pub fn code(&self) -> i32 {
        match self {
            TransportError::ConnectionLost { .. } => 51,
            TransportError::Truncated { .. } => 52,
            TransportError::InvalidHost { .. } => 53,
            TransportError::InvalidTag(_) => 54,
            TransportError::MessageTooLarge { .. } => 55,
            TransportError::WriteFailed { .. } => 56,
            TransportError::ShutDown => 57,
            TransportError::Aborted { code, .. } => *code,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Transport Trait
// ─────────────────────────────────────────────────────────────────

/// Endpoint of one host in a group
pub trait Transport: Send + Sync {
    /// This host's index
    fn host_id(&self) -> HostId;

    /// Number of hosts in the group
    fn host_count(&self) -> usize;

    /// Inbound messages addressed to this host
    fn mailbox(&self) -> &Mailbox;

    /// Queue `payload` for `(dest, tag)`. The completion fires once the
    /// payload has left this host's buffers.
    fn send(&self, dest: HostId, tag: Tag, payload: Bytes) -> Result<Completion, TransportError>;

    /// Terminate every host of the group.
    fn abort(&self, code: i32, reason: &str) -> !;

    /// Leave the group after flushing outstanding sends
    fn shutdown(&self) -> Result<(), TransportError>;

    /// Mark the endpoint as owned by a host manager. Returns `false` if it
    /// was already claimed.
    fn claim(&self) -> bool;

    /// Backend name for logs
    fn backend(&self) -> &'static str;
}

/// Validate a send before handing it to a backend
pub(crate) fn check_send(
    host_count: usize,
    dest: HostId,
    tag: Tag,
    size: usize,
) -> Result<(), TransportError> {
    if dest >= host_count {
        return Err(TransportError::InvalidHost {
            host_id: dest,
            host_count,
        });
    }
    if tag <= 0 {
        return Err(TransportError::InvalidTag(tag));
    }
    if size > MAX_MESSAGE_SIZE {
        return Err(TransportError::MessageTooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

/// Log a transport failure and take the whole group down.
pub fn fail_group(transport: &dyn Transport, err: &TransportError) -> ! {
    error!(
        host_id = transport.host_id(),
        backend = transport.backend(),
        code = err.code(),
        "Transport failure: {}",
        err
    );
    transport.abort(err.code(), &err.to_string())
}
