//! Quiesce gate: stall and drain logical I/O across all workers.
//!
//! Every logical I/O enters the gate before dispatch and leaves it on
//! completion. `quiesce` closes the gate and waits for in-flight I/O to
//! drain; `unquiesce` reopens it and wakes parked submitters.

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{BdevError, BdevResult};

#[derive(Default)]
struct GateState {
    closed: bool,
    inflight: u64,
}

/// Gate stalling logical I/O while a member mutation is in progress.
#[derive(Default)]
pub struct QuiesceGate {
    state: Mutex<GateState>,
    changed: Notify,
}

/// Permit for one in-flight logical I/O. Dropping it releases the slot.
pub struct IoPermit<'a> {
    gate: &'a QuiesceGate,
}

impl Drop for IoPermit<'_> {
    fn drop(&mut self) {
        self.gate.state.lock().inflight -= 1;
        self.gate.changed.notify_waiters();
    }
}

impl QuiesceGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the gate, waiting while it is quiesced.
    pub async fn enter(&self) -> IoPermit<'_> {
        loop {
            let notified = self.changed.notified();
            {
                let mut state = self.state.lock();
                if !state.closed {
                    state.inflight += 1;
                    return IoPermit { gate: self };
                }
            }
            notified.await;
        }
    }

    /// Close the gate and wait for in-flight I/O to drain.
    ///
    /// Fails with [`BdevError::AlreadyQuiesced`] if the gate is already
    /// closed; the state is left untouched in that case.
    pub async fn quiesce(&self) -> BdevResult<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(BdevError::AlreadyQuiesced);
            }
            state.closed = true;
        }
        loop {
            let notified = self.changed.notified();
            if self.state.lock().inflight == 0 {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Reopen the gate and wake parked submitters.
    pub fn unquiesce(&self) {
        self.state.lock().closed = false;
        self.changed.notify_waiters();
    }

    /// Whether the gate is currently closed.
    pub fn is_quiesced(&self) -> bool {
        self.state.lock().closed
    }
}
