//! In-process transport group
//!
//! All hosts share one address space, so a send is a mailbox delivery and
//! completes immediately. Used for single-machine runs and tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error};

use super::{check_send, Completion, Mailbox, Transport, TransportError};
use crate::tag::Tag;
use crate::topology::HostId;

/// What `abort` does in an in-process group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbortMode {
    /// Exit the process, which ends every host of the group
    #[default]
    Exit,
    /// Panic on the calling thread
    Panic,
}

#[derive(Debug)]
struct Shared {
    mailboxes: Vec<Mailbox>,
    abort_mode: AbortMode,
}

/// Endpoint of one host inside a [`LocalGroup`]
#[derive(Debug)]
pub struct LocalGroup {
    host_id: HostId,
    shared: Arc<Shared>,
    shut_down: AtomicBool,
    claimed: AtomicBool,
}

impl LocalGroup {
    /// Create a group of `host_count` endpoints, indexed by host id
    pub fn new(host_count: usize) -> Vec<Arc<LocalGroup>> {
        Self::with_abort_mode(host_count, AbortMode::Exit)
    }

    pub fn with_abort_mode(host_count: usize, abort_mode: AbortMode) -> Vec<Arc<LocalGroup>> {
        assert!(host_count > 0, "a group needs at least one host");
        let shared = Arc::new(Shared {
            mailboxes: (0..host_count).map(|_| Mailbox::new()).collect(),
            abort_mode,
        });
        (0..host_count)
            .map(|host_id| {
                Arc::new(LocalGroup {
                    host_id,
                    shared: Arc::clone(&shared),
                    shut_down: AtomicBool::new(false),
                    claimed: AtomicBool::new(false),
                })
            })
            .collect()
    }
}

impl Transport for LocalGroup {
    fn host_id(&self) -> HostId {
        self.host_id
    }

    fn host_count(&self) -> usize {
        self.shared.mailboxes.len()
    }

    fn mailbox(&self) -> &Mailbox {
        &self.shared.mailboxes[self.host_id]
    }

    fn send(&self, dest: HostId, tag: Tag, payload: Bytes) -> Result<Completion, TransportError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(TransportError::ShutDown);
        }
        check_send(self.host_count(), dest, tag, payload.len())?;

        let size = payload.len();
        self.shared.mailboxes[dest].deliver(self.host_id, tag, payload);
        Ok(Completion::finished(None, size))
    }

    fn abort(&self, code: i32, reason: &str) -> ! {
        error!(host_id = self.host_id, code, "Aborting local group: {}", reason);
        match self.shared.abort_mode {
            AbortMode::Exit => std::process::exit(code),
            AbortMode::Panic => panic!("group aborted with code {code}: {reason}"),
        }
    }

    fn shutdown(&self) -> Result<(), TransportError> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let leftover = self.mailbox().unexpected_count();
        debug!(host_id = self.host_id, leftover, "Local endpoint shut down");
        self.mailbox().close(TransportError::ShutDown);
        Ok(())
    }

    fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}
