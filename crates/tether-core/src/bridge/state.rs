//! Per-connection bookkeeping.

use crate::protocol::{Frame, RequestId};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Lifecycle of one bridged connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgePhase {
    Initializing,
    Bridging,
    Closing,
    Closed,
}

impl fmt::Display for BridgePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BridgePhase::Initializing => "initializing",
            BridgePhase::Bridging => "bridging",
            BridgePhase::Closing => "closing",
            BridgePhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Requests forwarded to the subprocess that have not been answered yet.
///
/// Entries are never replayed. After a subprocess restart the whole table is
/// stale and gets cleared.
#[derive(Debug, Default)]
pub struct PendingRequestTable {
    entries: HashMap<RequestId, Frame>,
}

impl PendingRequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: RequestId, frame: Frame) {
        self.entries.insert(id, frame);
    }

    /// Remove an entry; true if it was pending.
    pub fn remove(&mut self, id: &RequestId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Drop every entry, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// State owned by the activities of a single bridged connection.
#[derive(Debug)]
pub struct ConnectionState {
    pub phase: BridgePhase,
    pub connected: bool,
    pub client_supports_heartbeat: bool,
    /// Set once an `initialize` request has been forwarded; reset on restart.
    pub mcp_initialized: bool,
    pub last_heartbeat_sent: Instant,
    pub last_heartbeat_received: Instant,
    pub pending: PendingRequestTable,
}

impl ConnectionState {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            phase: BridgePhase::Initializing,
            connected: true,
            client_supports_heartbeat: false,
            mcp_initialized: false,
            last_heartbeat_sent: now,
            last_heartbeat_received: now,
            pending: PendingRequestTable::new(),
        }
    }

    /// A `heartbeat` arrived from the peer.
    pub fn record_heartbeat(&mut self) {
        self.last_heartbeat_received = Instant::now();
        self.client_supports_heartbeat = true;
    }

    /// How long it has been since the peer's last heartbeat, if that exceeds `timeout`.
    pub fn heartbeat_overdue(&self, timeout: Duration) -> Option<Duration> {
        let silence = self.last_heartbeat_received.elapsed();
        (silence > timeout).then_some(silence)
    }

    /// Reset after the subprocess came back: the peer must initialize again
    /// and nothing in flight will be answered. Returns the purged count.
    pub fn reset_after_restart(&mut self) -> usize {
        self.mcp_initialized = false;
        self.pending.clear()
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}
