//! Client-side session bookkeeping and local frame routing.

use crate::protocol::{initialization_pending, Frame, METHOD_INITIALIZE, METHOD_INITIALIZED};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// What to do with one line read from the local caller.
#[derive(Debug, PartialEq)]
pub enum LocalRoute {
    /// Send the line to the bridge.
    Forward,
    /// Replay the previously buffered lines in order, then send the line.
    ReplayThenForward(Vec<String>),
    /// Hold the line until initialization completes. `reply` is the local
    /// retry hint to write back, present only when the request had an id.
    Buffer { reply: Option<Frame> },
}

/// State of one client connection to the bridge.
#[derive(Debug)]
pub struct ClientState {
    pub connected: bool,
    pub server_supports_heartbeat: bool,
    pub mcp_initialized: bool,
    pub initialization_in_progress: bool,
    pub pending_initialize_id: Option<Value>,
    pub last_heartbeat_sent: Instant,
    pub last_heartbeat_received: Instant,
    buffered: VecDeque<String>,
}

impl ClientState {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            connected: false,
            server_supports_heartbeat: false,
            mcp_initialized: false,
            initialization_in_progress: false,
            pending_initialize_id: None,
            last_heartbeat_sent: now,
            last_heartbeat_received: now,
            buffered: VecDeque::new(),
        }
    }

    /// Fresh connection: nothing is initialized and nothing is buffered.
    pub fn reset_for_connection(&mut self) {
        let now = Instant::now();
        self.connected = true;
        self.mcp_initialized = false;
        self.initialization_in_progress = false;
        self.pending_initialize_id = None;
        self.last_heartbeat_sent = now;
        self.last_heartbeat_received = now;
        self.buffered.clear();
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Decide how to route a line from the local caller.
    ///
    /// Lines that are not JSON are forwarded untouched.
    pub fn route_local(&mut self, line: &str) -> LocalRoute {
        let frame = match Frame::parse(line) {
            Ok(frame) => frame,
            Err(_) => return LocalRoute::Forward,
        };

        match frame.method() {
            Some(METHOD_INITIALIZE) => {
                debug!("Detected initialize request");
                self.initialization_in_progress = true;
                self.pending_initialize_id = frame.id_value().cloned();
                LocalRoute::Forward
            }
            Some(METHOD_INITIALIZED) => {
                debug!("Detected initialized notification");
                self.mcp_initialized = true;
                self.initialization_in_progress = false;
                LocalRoute::ReplayThenForward(self.buffered.drain(..).collect())
            }
            Some(method) if !self.mcp_initialized => {
                warn!(
                    "Buffering request '{}' until initialization complete",
                    method
                );
                self.buffered.push_back(line.to_string());
                LocalRoute::Buffer {
                    // A null id counts as a notification and gets no hint
                    reply: frame.id_value().cloned().map(initialization_pending),
                }
            }
            _ => LocalRoute::Forward,
        }
    }

    /// True when `frame` answers the outstanding `initialize` request.
    pub fn is_initialize_response(&self, frame: &Frame) -> bool {
        self.initialization_in_progress
            && self.pending_initialize_id.is_some()
            && frame.id_value() == self.pending_initialize_id.as_ref()
    }

    pub fn record_heartbeat_response(&mut self) {
        self.last_heartbeat_received = Instant::now();
        self.server_supports_heartbeat = true;
    }

    /// Silence since the last `heartbeat_response`, if the server is known
    /// to answer heartbeats and the silence exceeds `timeout`.
    pub fn heartbeat_overdue(&self, timeout: Duration) -> Option<Duration> {
        if !self.server_supports_heartbeat {
            return None;
        }
        let silence = self.last_heartbeat_received.elapsed();
        (silence > timeout).then_some(silence)
    }
}

impl Default for ClientState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn line(value: Value) -> String {
        value.to_string()
    }

    #[test]
    fn test_requests_buffered_until_initialized() {
        let mut state = ClientState::new();
        state.reset_for_connection();

        let r1 = line(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}));
        let note = line(json!({"jsonrpc": "2.0", "method": "notifications/progress"}));

        match state.route_local(&r1) {
            LocalRoute::Buffer { reply: Some(reply) } => {
                assert_eq!(reply.value()["id"], 1);
                assert_eq!(reply.value()["error"]["code"], -32002);
            }
            other => panic!("expected buffered request, got {:?}", other),
        }
        // Notifications are held too, but never answered
        assert_eq!(state.route_local(&note), LocalRoute::Buffer { reply: None });
        assert_eq!(state.buffered_len(), 2);

        let init = line(json!({"jsonrpc": "2.0", "id": 0, "method": "initialize"}));
        assert_eq!(state.route_local(&init), LocalRoute::Forward);
        assert!(state.initialization_in_progress);

        let initialized = line(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}));
        assert_eq!(
            state.route_local(&initialized),
            LocalRoute::ReplayThenForward(vec![r1, note])
        );
        assert!(state.mcp_initialized);
        assert_eq!(state.buffered_len(), 0);

        let r2 = line(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call"}));
        assert_eq!(state.route_local(&r2), LocalRoute::Forward);
    }

    #[test]
    fn test_null_id_is_buffered_without_hint() {
        let mut state = ClientState::new();
        state.reset_for_connection();

        let request = line(json!({"jsonrpc": "2.0", "id": null, "method": "tools/list"}));
        assert_eq!(state.route_local(&request), LocalRoute::Buffer { reply: None });
        assert_eq!(state.buffered_len(), 1);
    }

    #[test]
    fn test_responses_and_garbage_pass_through() {
        let mut state = ClientState::new();
        state.reset_for_connection();

        // A reply to a server-initiated request has no method
        let reply = line(json!({"jsonrpc": "2.0", "id": 5, "result": {}}));
        assert_eq!(state.route_local(&reply), LocalRoute::Forward);
        assert_eq!(state.route_local("not json at all"), LocalRoute::Forward);
        assert_eq!(state.buffered_len(), 0);
    }

    #[test]
    fn test_reset_clears_buffer_and_flags() {
        let mut state = ClientState::new();
        state.reset_for_connection();
        state.route_local(&line(json!({"id": 1, "method": "initialize"})));
        state.route_local(&line(json!({"id": 2, "method": "tools/list"})));
        assert_eq!(state.buffered_len(), 1);

        state.reset_for_connection();
        assert!(state.connected);
        assert!(!state.mcp_initialized);
        assert!(state.pending_initialize_id.is_none());
        assert_eq!(state.buffered_len(), 0);
    }

    #[test]
    fn test_initialize_response_matching() {
        let mut state = ClientState::new();
        state.reset_for_connection();
        state.route_local(&line(json!({"id": "init-1", "method": "initialize"})));

        let response = Frame::from_value(json!({"id": "init-1", "result": {}}));
        let other = Frame::from_value(json!({"id": "init-2", "result": {}}));
        assert!(state.is_initialize_response(&response));
        assert!(!state.is_initialize_response(&other));
    }

    #[test]
    fn test_heartbeat_overdue_needs_server_support() {
        let timeout = Duration::from_millis(10);
        let mut state = ClientState::new();
        std::thread::sleep(Duration::from_millis(30));
        assert!(state.heartbeat_overdue(timeout).is_none());

        state.server_supports_heartbeat = true;
        assert!(state.heartbeat_overdue(timeout).is_some());

        state.record_heartbeat_response();
        assert!(state.heartbeat_overdue(timeout).is_none());
    }
}
