//! Handles to in-flight transfers
//!
//! A [`Request`] is created pending by an asynchronous send or receive and
//! must be driven to completion (or cancelled) before it is dropped.
//! Dropping a pending request is a usage error and panics. Any transport
//! failure observed while polling or waiting aborts the whole group.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::trace;

use crate::transport::{fail_group, Completion, Finished, Transport};

/// Lifecycle state of a [`Request`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Never bound to a transfer, or cancelled
    Empty,
    /// Transfer in flight
    Pending,
    /// Transfer finished
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Send,
    Receive,
}

/// Handle to one non-blocking transfer
pub struct Request {
    state: RequestState,
    direction: Direction,
    completion: Option<Completion>,
    transport: Option<Arc<dyn Transport>>,
    bytes: usize,
    data: Option<Bytes>,
}

impl Request {
    /// A request not bound to any transfer
    pub fn empty() -> Self {
        Self {
            state: RequestState::Empty,
            direction: Direction::Send,
            completion: None,
            transport: None,
            bytes: 0,
            data: None,
        }
    }

    pub(crate) fn send(completion: Completion, transport: Arc<dyn Transport>) -> Self {
        Self::pending(Direction::Send, completion, transport)
    }

    pub(crate) fn receive(completion: Completion, transport: Arc<dyn Transport>) -> Self {
        Self::pending(Direction::Receive, completion, transport)
    }

    fn pending(direction: Direction, completion: Completion, transport: Arc<dyn Transport>) -> Self {
        Self {
            state: RequestState::Pending,
            direction,
            completion: Some(completion),
            transport: Some(transport),
            bytes: 0,
            data: None,
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Complete as of the last poll or wait
    pub fn is_complete(&self) -> bool {
        self.assert_bound("is_complete");
        self.state == RequestState::Complete
    }

    /// Check once for completion without blocking
    pub fn poll(&mut self) -> bool {
        self.assert_bound("poll");
        if self.state == RequestState::Complete {
            return true;
        }

        let outcome = self.completion.as_ref().and_then(|c| c.try_take());
        match outcome {
            Some(outcome) => {
                self.finish(outcome);
                true
            }
            None => false,
        }
    }

    /// Block until the transfer finishes
    pub fn wait(&mut self) {
        self.assert_bound("wait");
        if self.state == RequestState::Complete {
            return;
        }

        if let Some(completion) = self.completion.clone() {
            let outcome = completion.wait();
            self.finish(outcome);
        }
    }

    /// Poll every `interval` until complete or `timeout` has passed.
    /// Returns whether the request completed; running out of time is not
    /// an error.
    pub fn wait_timeout(&mut self, timeout: Duration, interval: Duration) -> bool {
        self.assert_bound("wait_timeout");
        spin_wait(interval, Some(timeout), || self.poll())
    }

    /// Size of the received message
    pub fn bytes_received(&self) -> u64 {
        self.assert_bound("bytes_received");
        assert!(
            self.direction == Direction::Receive,
            "bytes_received called on a send request"
        );
        assert!(
            self.state == RequestState::Complete,
            "bytes_received called before the receive completed"
        );
        self.bytes as u64
    }

    /// Received payload, once
    pub fn take_data(&mut self) -> Option<Bytes> {
        self.assert_bound("take_data");
        assert!(
            self.state == RequestState::Complete,
            "take_data called before the receive completed"
        );
        self.data.take()
    }

    /// Copy the received payload to the front of `dst`, returning its length
    pub fn copy_to(&self, dst: &mut [u8]) -> usize {
        self.assert_bound("copy_to");
        assert!(
            self.state == RequestState::Complete,
            "copy_to called before the receive completed"
        );
        let data = self
            .data
            .as_ref()
            .unwrap_or_else(|| panic!("request holds no received payload"));
        dst[..data.len()].copy_from_slice(data);
        data.len()
    }

    /// Try to withdraw a pending transfer. The request ends up empty either
    /// way. Returns whether the transfer was withdrawn before any data moved;
    /// on `false` the transfer has already taken place.
    pub fn cancel(&mut self) -> bool {
        assert!(
            self.state == RequestState::Pending,
            "cancel called on a {:?} request",
            self.state
        );
        let withdrawn = self.completion.as_ref().map(|c| c.cancel()).unwrap_or(false);
        trace!(withdrawn, "Request cancelled");

        self.state = RequestState::Empty;
        self.completion = None;
        self.transport = None;
        self.data = None;
        withdrawn
    }

    /// Stop tracking a send; the transport still delivers it
    pub(crate) fn detach(mut self) {
        assert!(
            self.direction == Direction::Send,
            "only sends can be detached"
        );
        self.state = RequestState::Empty;
    }

    fn finish(&mut self, outcome: Result<Finished, crate::transport::TransportError>) {
        match outcome {
            Ok(finished) => {
                self.bytes = finished.bytes;
                self.data = finished.data;
                self.state = RequestState::Complete;
                self.completion = None;
            }
            Err(err) => match &self.transport {
                Some(transport) => fail_group(transport.as_ref(), &err),
                None => panic!("transfer failed without a transport: {}", err),
            },
        }
    }

    fn assert_bound(&self, op: &str) {
        assert!(
            self.state != RequestState::Empty,
            "{} called on an empty request",
            op
        );
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("state", &self.state)
            .field("direction", &self.direction)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if self.state == RequestState::Pending && !std::thread::panicking() {
            panic!("request dropped while its transfer is still pending");
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────

/// True when every request has completed; polls the ones that have not
pub fn are_requests_complete(requests: &mut [Request]) -> bool {
    requests.iter_mut().all(|r| r.poll())
}

/// Block until every request has completed
pub fn wait_all(requests: &mut [Request]) {
    for r in requests.iter_mut() {
        r.wait();
    }
}

/// Call `done` every `interval` until it returns true or `timeout` runs
/// out. Returns the last answer of `done`.
pub fn spin_wait(interval: Duration, timeout: Option<Duration>, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    loop {
        if done() {
            return true;
        }
        if let Some(limit) = timeout {
            if start.elapsed() >= limit {
                return false;
            }
        }
        if interval.is_zero() {
            std::thread::yield_now();
        } else {
            std::thread::sleep(interval);
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
