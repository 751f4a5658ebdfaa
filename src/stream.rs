//! Stream multiplexer (§4.4): id allocation, completion registration, and
//! fan-out of inbound `STREAM_*` packets to whichever operation is waiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::warn;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::sync::oneshot;

use crate::error::ErrorKind;

/// Stream type tag sent in `STREAM_OPEN` metadata (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum StreamType {
    FileRead = 0x01,
    FileWrite = 0x02,
    Exec = 0x03,
    DirList = 0x04,
    FileStat = 0x05,
    FileFind = 0x06,
    FileSearch = 0x07,
    Mkdir = 0x08,
    Remove = 0x09,
    Move = 0x0A,
    FileExists = 0x0B,
    Realpath = 0x0C,
}

/// Status byte carried by `STREAM_END` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0x00,
    Error = 0x01,
    Cancelled = 0x02,
}

/// How a stream's single completion event resolved (§8 invariant 5: exactly
/// one of these ever fires per opened stream).
#[derive(Debug)]
pub enum StreamOutcome {
    /// A `STREAM_END` arrived from the peer.
    End { status: StatusCode, extra: Vec<u8> },
    /// A `STREAM_ERROR` arrived from the peer.
    Error { kind: ErrorKind, message: String },
    /// `wait_stream` timed out locally; a `STREAM_CANCEL` was sent.
    Cancelled,
}

/// Per-stream mutable state: the ordered chunk list (preserving packet
/// boundaries, per §4.4) and the one-shot completion slot.
///
/// The chunk list and the completion slot are two separate interfaces onto
/// the same registry entry rather than a single "concatenate vs list" mode
/// flag (§9) — callers choose `take_concat` or `take_chunks` depending on
/// whether their stream type needs channel demultiplexing (EXEC) or not.
pub struct StreamEntry {
    pub stream_type: StreamType,
    chunks: Mutex<Vec<Vec<u8>>>,
    completion: Mutex<Option<oneshot::Sender<StreamOutcome>>>,
}

impl StreamEntry {
    fn new(stream_type: StreamType, completion: oneshot::Sender<StreamOutcome>) -> Self {
        Self {
            stream_type,
            chunks: Mutex::new(Vec::new()),
            completion: Mutex::new(Some(completion)),
        }
    }

    fn push_chunk(&self, data: Vec<u8>) {
        self.chunks.lock().unwrap().push(data);
    }

    /// Resolve the completion slot exactly once; a second call (which should
    /// never happen because the registry removes the entry on first
    /// resolution) is a silent no-op.
    fn resolve(&self, outcome: StreamOutcome) {
        if let Some(tx) = self.completion.lock().unwrap().take() {
            let _ = tx.send(outcome);
        }
    }

    /// Consume accumulated chunks as one concatenated buffer — the shape
    /// every operation except EXEC wants.
    pub fn take_concat(&self) -> Vec<u8> {
        self.chunks.lock().unwrap().concat()
    }

    /// Consume accumulated chunks as an ordered list, preserving the packet
    /// boundaries EXEC uses to tag each chunk with a channel byte.
    pub fn take_chunks(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.chunks.lock().unwrap())
    }
}

/// The live stream table for one session, plus monotonic id allocation.
///
/// Mutated only from the inbound reader task and from operation initiators,
/// both of which run on the same single-threaded runtime, so the map itself
/// only needs a short-held `std::sync::Mutex` for cross-task visibility —
/// never held across an `.await` (§5).
pub struct StreamRegistry {
    next_id: AtomicU32,
    live: Mutex<HashMap<u32, Arc<StreamEntry>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(0),
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next even stream id and register it as live, returning
    /// the id, a handle operations can read chunks from, and the receiver
    /// half of its completion.
    pub fn open(
        &self,
        stream_type: StreamType,
    ) -> (u32, Arc<StreamEntry>, oneshot::Receiver<StreamOutcome>) {
        let id = self.next_id.fetch_add(2, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let entry = Arc::new(StreamEntry::new(stream_type, tx));
        self.live.lock().unwrap().insert(id, entry.clone());
        (id, entry, rx)
    }

    /// Route an inbound `STREAM_DATA` payload. Returns the chunk length so
    /// the caller can charge inbound flow-control credit, or `None` if the
    /// id is not (or no longer) live — per §4.4, such data is silently
    /// dropped, not an error.
    pub fn on_data(&self, id: u32, data: Vec<u8>) -> Option<usize> {
        let live = self.live.lock().unwrap();
        match live.get(&id) {
            Some(entry) => {
                let len = data.len();
                entry.push_chunk(data);
                Some(len)
            }
            None => {
                warn!("dropping STREAM_DATA for retired/unknown stream {id}");
                None
            }
        }
    }

    /// Route an inbound `STREAM_END`, retiring the stream and resolving its
    /// waiter. A duplicate or late arrival (id already retired) is dropped.
    pub fn on_end(&self, id: u32, status: StatusCode, extra: Vec<u8>) {
        if let Some(entry) = self.live.lock().unwrap().remove(&id) {
            entry.resolve(StreamOutcome::End { status, extra });
        } else {
            warn!("dropping STREAM_END for retired/unknown stream {id}");
        }
    }

    /// Route an inbound `STREAM_ERROR`, retiring the stream and resolving
    /// its waiter as a failure.
    pub fn on_error(&self, id: u32, kind: ErrorKind, message: String) {
        if let Some(entry) = self.live.lock().unwrap().remove(&id) {
            entry.resolve(StreamOutcome::Error { kind, message });
        } else {
            warn!("dropping STREAM_ERROR for retired/unknown stream {id}");
        }
    }

    /// Remove a stream from the live table without resolving it — used when
    /// a local timeout has already resolved the waiter with `Cancelled` and
    /// any subsequent END/ERROR for that id must be ignored (§5
    /// cancellation semantics).
    pub fn retire(&self, id: u32) {
        self.live.lock().unwrap().remove(&id);
    }

    /// Cancel every still-live stream with `StreamOutcome::Cancelled`, used
    /// during orderly shutdown (§4.2, §9 shutdown ordering).
    pub fn cancel_all(&self) {
        let mut live = self.live.lock().unwrap();
        for (_, entry) in live.drain() {
            entry.resolve(StreamOutcome::Cancelled);
        }
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Default timeout for [`wait_stream`]-style waits (§4.4).
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(300);
