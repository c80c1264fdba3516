//! Completion slot shared by a transfer and the request that tracks it

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use super::TransportError;

/// Outcome of a finished transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finished {
    /// Received payload (receives only)
    pub data: Option<Bytes>,

    /// Bytes moved by the transfer
    pub bytes: usize,
}

#[derive(Debug)]
enum SlotState {
    Pending,
    Cancelled,
    Done(Finished),
    Failed(TransportError),
    Taken,
}

#[derive(Debug)]
struct Slot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

/// Handle to a transfer's completion. Cloned between the producer side
/// (mailbox, writer task) and the consumer side (the request).
#[derive(Debug, Clone)]
pub struct Completion {
    slot: Arc<Slot>,
}

impl Completion {
    pub fn new() -> Self {
        Self::with_state(SlotState::Pending)
    }

    /// Completion of a transfer that finished before it was handed out
    pub fn finished(data: Option<Bytes>, bytes: usize) -> Self {
        Self::with_state(SlotState::Done(Finished { data, bytes }))
    }

    fn with_state(state: SlotState) -> Self {
        Self {
            slot: Arc::new(Slot {
                state: Mutex::new(state),
                ready: Condvar::new(),
            }),
        }
    }

    /// Mark the transfer done. Returns false if it was cancelled or
    /// already resolved.
    pub fn complete(&self, data: Option<Bytes>, bytes: usize) -> bool {
        self.resolve(SlotState::Done(Finished { data, bytes }))
    }

    /// Mark the transfer failed. Returns false if it was cancelled or
    /// already resolved.
    pub fn fail(&self, err: TransportError) -> bool {
        self.resolve(SlotState::Failed(err))
    }

    fn resolve(&self, next: SlotState) -> bool {
        let mut state = self.slot.state.lock();
        if !matches!(*state, SlotState::Pending) {
            return false;
        }
        *state = next;
        self.slot.ready.notify_all();
        true
    }

    /// Withdraw a transfer that has not been resolved yet
    pub fn cancel(&self) -> bool {
        let mut state = self.slot.state.lock();
        if !matches!(*state, SlotState::Pending) {
            return false;
        }
        *state = SlotState::Cancelled;
        self.slot.ready.notify_all();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.slot.state.lock(), SlotState::Cancelled)
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.slot.state.lock(), SlotState::Pending)
    }

    /// Take the outcome if the transfer is resolved
    pub fn try_take(&self) -> Option<Result<Finished, TransportError>> {
        let mut state = self.slot.state.lock();
        Self::take_resolved(&mut state)
    }

    /// Block until the transfer is resolved and take the outcome
    pub fn wait(&self) -> Result<Finished, TransportError> {
        let mut state = self.slot.state.lock();
        loop {
            if let Some(outcome) = Self::take_resolved(&mut state) {
                return outcome;
            }
            self.slot.ready.wait(&mut state);
        }
    }

    /// Like [`Completion::wait`] but gives up after `timeout`
    pub fn wait_for(&self, timeout: Duration) -> Option<Result<Finished, TransportError>> {
        let mut state = self.slot.state.lock();
        if let Some(outcome) = Self::take_resolved(&mut state) {
            return Some(outcome);
        }
        self.slot.ready.wait_for(&mut state, timeout);
        Self::take_resolved(&mut state)
    }

    fn take_resolved(state: &mut SlotState) -> Option<Result<Finished, TransportError>> {
        match state {
            SlotState::Pending => None,
            SlotState::Done(_) | SlotState::Failed(_) => {
                match std::mem::replace(state, SlotState::Taken) {
                    SlotState::Done(f) => Some(Ok(f)),
                    SlotState::Failed(e) => Some(Err(e)),
                    _ => unreachable!(),
                }
            }
            SlotState::Cancelled => panic!("outcome of a cancelled transfer requested"),
            SlotState::Taken => panic!("outcome of a transfer requested twice"),
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}
