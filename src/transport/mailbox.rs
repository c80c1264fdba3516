//! Tag matching for inbound messages
//!
//! Every `(source, tag)` pair has two FIFOs: messages that arrived before
//! anyone asked for them, and receives posted before their message arrived.
//! At most one of the two holds live entries at any time, so arrival order
//! per pair is the order in which receives are satisfied.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use super::{Completion, TransportError};
use crate::tag::Tag;
use crate::topology::HostId;

type Key = (HostId, Tag);

#[derive(Debug)]
struct PostedReceive {
    capacity: usize,
    completion: Completion,
}

#[derive(Debug, Default)]
struct MailboxState {
    unexpected: HashMap<Key, VecDeque<Bytes>>,
    posted: HashMap<Key, VecDeque<PostedReceive>>,
    closed: Option<TransportError>,
}

/// Inbound message store of one host
#[derive(Debug, Default)]
pub struct Mailbox {
    state: Mutex<MailboxState>,
    arrived: Condvar,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand an inbound message to the oldest live receive for its key,
    /// or queue it.
    pub fn deliver(&self, source: HostId, tag: Tag, payload: Bytes) {
        let key = (source, tag);
        let mut state = self.state.lock();
        if state.closed.is_some() {
            trace!(source, tag, "Dropping message for closed mailbox");
            return;
        }

        if let Some(queue) = state.posted.get_mut(&key) {
            while let Some(posted) = queue.pop_front() {
                let size = payload.len();
                let matched = if size > posted.capacity {
                    posted.completion.fail(TransportError::Truncated {
                        from_host: source,
                        tag,
                        capacity: posted.capacity,
                        actual: size,
                    })
                } else {
                    posted.completion.complete(Some(payload.clone()), size)
                };
                if matched {
                    if queue.is_empty() {
                        state.posted.remove(&key);
                    }
                    trace!(source, tag, size, "Matched posted receive");
                    return;
                }
                // cancelled receive, try the next one
            }
            state.posted.remove(&key);
        }

        trace!(source, tag, size = payload.len(), "Queued unexpected message");
        state.unexpected.entry(key).or_default().push_back(payload);
        self.arrived.notify_all();
    }

    /// Post a receive of at most `capacity` bytes
    pub fn post_receive(&self, source: HostId, tag: Tag, capacity: usize) -> Completion {
        let key = (source, tag);
        let mut state = self.state.lock();

        if let Some(queue) = state.unexpected.get_mut(&key) {
            if let Some(payload) = queue.pop_front() {
                if queue.is_empty() {
                    state.unexpected.remove(&key);
                }
                let size = payload.len();
                if size > capacity {
                    let completion = Completion::new();
                    completion.fail(TransportError::Truncated {
                        from_host: source,
                        tag,
                        capacity,
                        actual: size,
                    });
                    return completion;
                }
                return Completion::finished(Some(payload), size);
            }
        }

        let completion = Completion::new();
        if let Some(err) = &state.closed {
            completion.fail(err.clone());
            return completion;
        }
        state.posted.entry(key).or_default().push_back(PostedReceive {
            capacity,
            completion: completion.clone(),
        });
        completion
    }

    /// Size of the oldest queued message for the key, without consuming it
    pub fn iprobe(&self, source: HostId, tag: Tag) -> Option<usize> {
        let state = self.state.lock();
        Self::peek(&state, source, tag)
    }

    /// Block until a message is queued for the key and return its size
    pub fn probe(&self, source: HostId, tag: Tag) -> Result<usize, TransportError> {
        let mut state = self.state.lock();
        loop {
            if let Some(size) = Self::peek(&state, source, tag) {
                return Ok(size);
            }
            if let Some(err) = &state.closed {
                return Err(err.clone());
            }
            self.arrived.wait(&mut state);
        }
    }

    /// [`Mailbox::probe`] bounded by `timeout`
    pub fn probe_for(
        &self,
        source: HostId,
        tag: Tag,
        timeout: Duration,
    ) -> Result<Option<usize>, TransportError> {
        let mut state = self.state.lock();
        if let Some(size) = Self::peek(&state, source, tag) {
            return Ok(Some(size));
        }
        if let Some(err) = &state.closed {
            return Err(err.clone());
        }
        self.arrived.wait_for(&mut state, timeout);
        Ok(Self::peek(&state, source, tag))
    }

    fn peek(state: &MailboxState, source: HostId, tag: Tag) -> Option<usize> {
        state
            .unexpected
            .get(&(source, tag))
            .and_then(|q| q.front())
            .map(|p| p.len())
    }

    /// Fail every outstanding receive and refuse new ones
    pub fn close(&self, err: TransportError) {
        let mut state = self.state.lock();
        if state.closed.is_some() {
            return;
        }
        for (_, queue) in state.posted.drain() {
            for posted in queue {
                posted.completion.fail(err.clone());
            }
        }
        state.closed = Some(err);
        self.arrived.notify_all();
    }

    /// Number of queued messages nobody asked for yet
    pub fn unexpected_count(&self) -> usize {
        self.state.lock().unexpected.values().map(|q| q.len()).sum()
    }
}
