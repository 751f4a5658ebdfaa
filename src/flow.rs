//! Credit-based flow control (§4.3, §9).
//!
//! Two independent accumulators live on every session: an outbound window
//! bounding how many DATA/TERM_OUTPUT bytes may be in flight toward the
//! peer, and an inbound counter tracking how many bytes we've consumed from
//! the peer without yet returning credit. Only `STREAM_DATA` and
//! `TERM_OUTPUT`/`TERM_INPUT` payload bytes are charged; every other packet
//! type is exempt (§4.3).

use std::sync::Mutex;

use log::trace;
use tokio::sync::Notify;

/// Window credit emitted once `bytes_received_unacked` reaches this many
/// bytes (§3).
pub const WINDOW_UPDATE_THRESHOLD: u64 = 8 * 1024;

/// Default initial window advertised by this relay in HELLO_ACK (§3).
pub const INITIAL_WINDOW: u32 = 256 * 1024;

/// Outbound credit accounting: blocks senders until the peer's advertised
/// window has room, and wakes them when a `WINDOW_UPDATE` arrives.
///
/// Multiple tool calls (and the PTY forwarder) may be blocked on this at
/// once; `credit` wakes all of them so each can re-check its own reservation
/// rather than hard-coding a single waiter (§9).
pub struct OutboundWindow {
    window: u64,
    in_flight: Mutex<u64>,
    notify: Notify,
}

impl OutboundWindow {
    pub fn new(window: u32) -> Self {
        Self {
            window: window as u64,
            in_flight: Mutex::new(0),
            notify: Notify::new(),
        }
    }

    /// Block until `n` more bytes fit under the window, then commit them as
    /// in-flight. Never holds the lock across an `.await`.
    pub async fn reserve(&self, n: u64) {
        loop {
            let notified = self.notify.notified();
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                if *in_flight + n <= self.window {
                    *in_flight += n;
                    return;
                }
            }
            notified.await;
        }
    }

    /// Apply a `WINDOW_UPDATE` increment of `k` bytes, clamping at zero, and
    /// wake any senders blocked in [`Self::reserve`].
    pub fn credit(&self, k: u64) {
        let mut in_flight = self.in_flight.lock().unwrap();
        *in_flight = in_flight.saturating_sub(k);
        drop(in_flight);
        self.notify.notify_waiters();
        trace!("outbound window credited {k} bytes");
    }

    /// Current in-flight byte count (used by tests and diagnostics).
    pub fn in_flight(&self) -> u64 {
        *self.in_flight.lock().unwrap()
    }

    /// The fixed window ceiling itself. Callers that split application data
    /// into outbound chunks must cap each chunk at this (§4.3: a single
    /// `reserve` can never succeed for `n` larger than the window, since the
    /// window never grows — only `in_flight` moves within it).
    pub fn capacity(&self) -> u64 {
        self.window
    }
}

/// Inbound credit accounting: every consumed `STREAM_DATA`/`TERM_INPUT` byte
/// is charged here; once the threshold is crossed the caller is told to
/// flush a `WINDOW_UPDATE` and the accumulator resets to zero.
pub struct InboundWindow {
    unacked: Mutex<u64>,
}

impl InboundWindow {
    pub fn new() -> Self {
        Self {
            unacked: Mutex::new(0),
        }
    }

    /// Charge `n` consumed bytes. Returns `Some(credit)` once the threshold
    /// is reached, in which case the caller must send
    /// `WINDOW_UPDATE(credit)` and the internal accumulator has already been
    /// reset.
    pub fn consume(&self, n: u64) -> Option<u64> {
        let mut unacked = self.unacked.lock().unwrap();
        *unacked += n;
        if *unacked >= WINDOW_UPDATE_THRESHOLD {
            let credit = *unacked;
            *unacked = 0;
            Some(credit)
        } else {
            None
        }
    }

    /// Whatever remains unacknowledged when the session ends — exposed so
    /// tests can assert invariant 4 from §8 (every consumed byte eventually
    /// credited) does not leave a dangling balance mid-session.
    pub fn outstanding(&self) -> u64 {
        *self.unacked.lock().unwrap()
    }
}

impl Default for InboundWindow {
    fn default() -> Self {
        Self::new()
    }
}
