//! One TCP connection bridged to one supervised subprocess.

use super::state::{BridgePhase, ConnectionState};
use crate::codec::{self, SharedWriter};
use crate::config::{heartbeat_timeout, CodecConfig, ServerOptions};
use crate::protocol::{
    restart_notification, ControlFrame, Frame, METHOD_INITIALIZE, RESTART_REASON_TERMINATED,
};
use crate::supervisor::ProcessSupervisor;
use crate::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Identifies a bridged connection in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a bridged connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// The TCP peer closed its side.
    PeerClosed,
    /// Reading from the TCP peer failed.
    PeerReadFailed,
    /// Writing to the TCP peer failed.
    PeerWriteFailed,
    /// The subprocess died and could not be restarted.
    SubprocessLost,
    /// The server is shutting down.
    Cancelled,
}

impl fmt::Display for BridgeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            BridgeOutcome::PeerClosed => "peer closed",
            BridgeOutcome::PeerReadFailed => "peer read failed",
            BridgeOutcome::PeerWriteFailed => "peer write failed",
            BridgeOutcome::SubprocessLost => "subprocess lost",
            BridgeOutcome::Cancelled => "cancelled",
        };
        f.write_str(reason)
    }
}

/// Pumps frames between a TCP peer and a dedicated subprocess.
///
/// Four activities run concurrently for the life of the connection: the
/// inbound pump, the outbound pump, the heartbeat loop and the process
/// monitor. The first one to finish decides the [`BridgeOutcome`]; the
/// others are dropped before the subprocess and socket are released.
pub struct ConnectionBridge {
    id: ConnectionId,
    options: Arc<ServerOptions>,
    state: Mutex<ConnectionState>,
}

impl ConnectionBridge {
    pub fn new(options: Arc<ServerOptions>) -> Self {
        Self {
            id: ConnectionId::new(),
            options,
            state: Mutex::new(ConnectionState::new()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub async fn phase(&self) -> BridgePhase {
        self.state.lock().await.phase
    }

    /// Requests forwarded to the current subprocess and not yet answered.
    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Bridge `reader`/`writer` to a freshly started subprocess until one side
    /// gives up or `shutdown` fires.
    ///
    /// Fails only if the subprocess cannot be spawned at all.
    pub async fn run<R, W>(
        &self,
        reader: R,
        writer: W,
        shutdown: CancellationToken,
    ) -> Result<BridgeOutcome>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let out = SharedWriter::new(writer);
        let supervisor =
            ProcessSupervisor::new(self.options.command.clone(), self.options.supervisor.clone());

        if let Err(e) = supervisor.start().await {
            error!("Failed to start subprocess: {}", e);
            let _ = out.shutdown().await;
            return Err(e);
        }

        // The peer drives the RPC handshake; nothing is sent to the subprocess here
        info!("Subprocess started, waiting for client initialization...");

        let state = &self.state;
        *state.lock().await = ConnectionState::new();
        self.enter_phase(BridgePhase::Bridging).await;

        let outcome = tokio::select! {
            outcome = self.inbound_pump(reader, &supervisor, state) => outcome,
            outcome = self.outbound_pump(&supervisor, &out, state) => outcome,
            outcome = self.heartbeat_loop(&supervisor, &out, state) => outcome,
            outcome = self.process_monitor(&supervisor, &out, state) => outcome,
            _ = shutdown.cancelled() => BridgeOutcome::Cancelled,
        };

        self.enter_phase(BridgePhase::Closing).await;
        state.lock().await.connected = false;
        supervisor.close().await;
        if let Err(e) = out.shutdown().await {
            debug!("Error closing TCP stream: {}", e);
        }
        self.enter_phase(BridgePhase::Closed).await;

        Ok(outcome)
    }

    async fn enter_phase(&self, phase: BridgePhase) {
        self.state.lock().await.phase = phase;
        debug!("Connection {} is {}", self.id, phase);
    }

    /// TCP -> subprocess. Consumes control frames, forwards everything else.
    async fn inbound_pump<R>(
        &self,
        reader: R,
        supervisor: &ProcessSupervisor,
        state: &Mutex<ConnectionState>,
    ) -> BridgeOutcome
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::with_capacity(CodecConfig::READ_BUFFER_SIZE, reader);
        let mut generations = supervisor.subscribe();

        loop {
            let line = match codec::read_line(&mut reader).await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("TCP connection closed by client");
                    return BridgeOutcome::PeerClosed;
                }
                Err(e) => {
                    error!("Error reading from TCP: {}", e);
                    return BridgeOutcome::PeerReadFailed;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let frame = match Frame::parse(line) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Invalid JSON from TCP client: {}", e);
                    continue;
                }
            };

            if frame.is_control() {
                self.handle_control(&frame, state).await;
                continue;
            }

            debug!("TCP -> subprocess: {}", frame.raw());

            self.wait_for_subprocess(supervisor, &mut generations).await;

            if let Some(id) = frame.id() {
                state.lock().await.pending.insert(id, frame.clone());
            }

            match supervisor.send_message(&frame).await {
                Ok(()) => {
                    if frame.method() == Some(METHOD_INITIALIZE) {
                        state.lock().await.mcp_initialized = true;
                    }
                }
                Err(e) => error!("Error forwarding to subprocess: {}", e),
            }
        }
    }

    async fn handle_control(&self, frame: &Frame, state: &Mutex<ConnectionState>) {
        match frame.as_control() {
            Some(ControlFrame::Heartbeat { .. }) => {
                state.lock().await.record_heartbeat();
            }
            Some(ControlFrame::Handshake { client_version, .. }) => {
                debug!("Client handshake (version {})", client_version);
                state.lock().await.client_supports_heartbeat = true;
            }
            Some(ControlFrame::HeartbeatResponse { .. }) => {
                debug!("Ignoring heartbeat_response from client");
            }
            None => warn!("Malformed control frame from client: {}", frame.raw()),
        }
    }

    /// Suspend until the subprocess is alive again. The process monitor owns
    /// restarts; this only waits for the next generation, with a fallback
    /// recheck in case it was missed.
    async fn wait_for_subprocess(
        &self,
        supervisor: &ProcessSupervisor,
        generations: &mut watch::Receiver<u64>,
    ) {
        let mut warned = false;
        while !supervisor.is_alive().await {
            if !warned {
                warn!("Subprocess is not running, waiting for monitor to restart it...");
                warned = true;
            }
            tokio::select! {
                changed = generations.changed() => {
                    if changed.is_err() {
                        tokio::time::sleep(self.options.dead_process_retry).await;
                    }
                }
                _ = tokio::time::sleep(self.options.dead_process_retry) => {}
            }
        }
    }

    /// Subprocess -> TCP. Never restarts the process itself.
    async fn outbound_pump<W>(
        &self,
        supervisor: &ProcessSupervisor,
        out: &SharedWriter<W>,
        state: &Mutex<ConnectionState>,
    ) -> BridgeOutcome
    where
        W: AsyncWrite + Unpin,
    {
        let mut generations = supervisor.subscribe();

        loop {
            let frame = match supervisor.read_message().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!("Subprocess output closed, letting monitor handle restart");
                    tokio::select! {
                        _ = generations.changed() => {}
                        _ = tokio::time::sleep(self.options.dead_process_retry) => {}
                    }
                    continue;
                }
                Err(e) => {
                    error!("Error reading from subprocess: {}", e);
                    return BridgeOutcome::SubprocessLost;
                }
            };

            if frame.is_control() {
                debug!("Dropping control frame from subprocess: {}", frame.raw());
                continue;
            }

            if let Some(id) = frame.id() {
                if state.lock().await.pending.remove(&id) {
                    debug!("Cleared pending request {}", id);
                }
            }

            debug!("Subprocess -> TCP: {}", frame.raw());
            if let Err(e) = out.send_line(frame.raw()).await {
                error!("Error forwarding to TCP: {}", e);
                return BridgeOutcome::PeerWriteFailed;
            }
        }
    }

    /// Periodic `heartbeat_response`. Silence from the peer is only logged;
    /// dead peers are left to the transport to detect.
    async fn heartbeat_loop<W>(
        &self,
        supervisor: &ProcessSupervisor,
        out: &SharedWriter<W>,
        state: &Mutex<ConnectionState>,
    ) -> BridgeOutcome
    where
        W: AsyncWrite + Unpin,
    {
        let interval = self.options.heartbeat_interval;
        let timeout = heartbeat_timeout(interval);

        loop {
            tokio::time::sleep(interval).await;

            if !state.lock().await.client_supports_heartbeat {
                continue;
            }

            let response = Frame::from(ControlFrame::heartbeat_response(
                supervisor.is_alive().await,
            ));
            if let Err(e) = out.send_line(response.raw()).await {
                error!("Error sending heartbeat: {}", e);
                return BridgeOutcome::PeerWriteFailed;
            }

            let mut state = state.lock().await;
            state.last_heartbeat_sent = Instant::now();
            if let Some(silence) = state.heartbeat_overdue(timeout) {
                warn!(
                    "Client heartbeat timeout ({:.1}s since last heartbeat)",
                    silence.as_secs_f64()
                );
            }
        }
    }

    /// Poll subprocess liveness and restart it when it dies.
    async fn process_monitor<W>(
        &self,
        supervisor: &ProcessSupervisor,
        out: &SharedWriter<W>,
        state: &Mutex<ConnectionState>,
    ) -> BridgeOutcome
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            tokio::time::sleep(self.options.monitor_interval).await;

            if supervisor.is_alive().await {
                continue;
            }

            if !supervisor.auto_restart() {
                warn!("Subprocess exited and auto-restart is disabled, closing connection");
                state.lock().await.connected = false;
                return BridgeOutcome::SubprocessLost;
            }

            info!("Subprocess terminated, restarting to maintain session...");
            if let Err(e) = supervisor.restart().await {
                error!("Failed to restart subprocess ({}), closing connection", e);
                state.lock().await.connected = false;
                return BridgeOutcome::SubprocessLost;
            }

            let stale = state.lock().await.reset_after_restart();
            supervisor.forgive_restart();
            if stale > 0 {
                info!("Cleared {} stale pending requests after restart", stale);
            }

            let notification = restart_notification(RESTART_REASON_TERMINATED);
            if let Err(e) = out.send_line(notification.raw()).await {
                error!("Failed to notify client of restart: {}", e);
                return BridgeOutcome::PeerWriteFailed;
            }
            info!("Notified client of server restart, waiting for it to reinitialize");
        }
    }
}
