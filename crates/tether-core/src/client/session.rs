//! Reconnecting stdio <-> TCP client.
//!
//! # Thread Safety
//!
//! All activities of a connection run as futures inside the caller's task;
//! the only spawned task is the local input reader, which lives for the whole
//! [`ReconnectingClient::run`] call and feeds lines through a channel.

use super::state::{ClientState, LocalRoute};
use crate::codec::{self, SharedWriter};
use crate::config::{heartbeat_timeout, ClientConfig, ClientOptions, CodecConfig};
use crate::protocol::{ControlFrame, Frame, METHOD_SERVER_RESTARTED};
use crate::{Result, TetherError};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why [`ReconnectingClient::run`] returned normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientExit {
    /// The local caller closed its input.
    InputClosed,
    /// The local caller stopped reading our output.
    OutputClosed,
    /// The connection dropped and reconnection is disabled.
    ReconnectDisabled,
    /// Shutdown was requested.
    Cancelled,
}

impl fmt::Display for ClientExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ClientExit::InputClosed => "input closed",
            ClientExit::OutputClosed => "output closed",
            ClientExit::ReconnectDisabled => "connection lost, reconnect disabled",
            ClientExit::Cancelled => "cancelled",
        };
        f.write_str(reason)
    }
}

/// How one connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    InputClosed,
    OutputClosed,
    ServerClosed,
    Cancelled,
}

/// Bridges a local stdio-style stream pair to a remote bridge server,
/// redialing whenever the connection drops.
pub struct ReconnectingClient {
    options: ClientOptions,
    state: Mutex<ClientState>,
}

impl ReconnectingClient {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            state: Mutex::new(ClientState::new()),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Run until the local side goes away, reconnection is given up, or
    /// `shutdown` fires.
    ///
    /// Returns [`TetherError::ReconnectExhausted`] when no connection could be
    /// made within `max_reconnect_attempts`.
    pub async fn run<I, O>(
        &self,
        input: I,
        output: O,
        shutdown: CancellationToken,
    ) -> Result<ClientExit>
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send,
    {
        let out = SharedWriter::new(output);
        let (line_tx, mut lines) = mpsc::channel(ClientConfig::INPUT_CHANNEL_CAPACITY);
        let input_task = tokio::spawn(read_input(input, line_tx));

        let result = self.run_sessions(&mut lines, &out, &shutdown).await;

        input_task.abort();
        result
    }

    async fn run_sessions<O>(
        &self,
        lines: &mut mpsc::Receiver<String>,
        out: &SharedWriter<O>,
        shutdown: &CancellationToken,
    ) -> Result<ClientExit>
    where
        O: AsyncWrite + Unpin,
    {
        loop {
            let stream = tokio::select! {
                stream = self.connect() => stream?,
                _ = shutdown.cancelled() => return Ok(ClientExit::Cancelled),
            };

            match self.session(stream, lines, out, shutdown).await {
                SessionEnd::InputClosed => return Ok(ClientExit::InputClosed),
                SessionEnd::OutputClosed => return Ok(ClientExit::OutputClosed),
                SessionEnd::Cancelled => return Ok(ClientExit::Cancelled),
                SessionEnd::ServerClosed => {}
            }

            if !self.options.reconnect {
                info!("Connection lost and reconnection is disabled");
                return Ok(ClientExit::ReconnectDisabled);
            }

            info!(
                "Connection lost, reconnecting in {:.1}s...",
                self.options.reconnect_delay.as_secs_f64()
            );
            tokio::select! {
                _ = tokio::time::sleep(self.options.reconnect_delay) => {}
                _ = shutdown.cancelled() => return Ok(ClientExit::Cancelled),
            }
        }
    }

    /// Dial the server, retrying up to `max_reconnect_attempts` times.
    async fn connect(&self) -> Result<TcpStream> {
        let addr = self.options.addr();
        let max_attempts = self.options.max_reconnect_attempts.max(1);
        let mut attempts = 0;

        loop {
            info!(
                "Connecting to {} (attempt {}/{})",
                addr,
                attempts + 1,
                max_attempts
            );

            match dial(&addr, self.options.connect_timeout).await {
                Ok(stream) => {
                    info!("Connected to {}", addr);
                    return Ok(stream);
                }
                Err(e) => {
                    attempts += 1;
                    error!("Connection failed: {}", e);

                    if !e.is_retryable() {
                        return Err(e);
                    }
                    if attempts >= max_attempts {
                        error!("Max reconnection attempts reached");
                        return Err(TetherError::ReconnectExhausted { addr, attempts });
                    }

                    info!(
                        "Retrying in {:.1}s...",
                        self.options.reconnect_delay.as_secs_f64()
                    );
                    tokio::time::sleep(self.options.reconnect_delay).await;
                }
            }
        }
    }

    /// Drive one connection until any of its activities ends.
    async fn session<O>(
        &self,
        stream: TcpStream,
        lines: &mut mpsc::Receiver<String>,
        out: &SharedWriter<O>,
        shutdown: &CancellationToken,
    ) -> SessionEnd
    where
        O: AsyncWrite + Unpin,
    {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY: {}", e);
        }
        let (reader, writer) = stream.into_split();
        let tcp = SharedWriter::new(writer);

        self.state.lock().await.reset_for_connection();

        let handshake = Frame::from(ControlFrame::handshake(ClientConfig::CLIENT_VERSION));
        let end = match tcp.send_line(handshake.raw()).await {
            Ok(()) => {
                tokio::select! {
                    end = self.input_pump(lines, &tcp, out) => end,
                    end = self.server_pump(reader, out) => end,
                    end = self.heartbeat_loop(&tcp) => end,
                    _ = shutdown.cancelled() => SessionEnd::Cancelled,
                }
            }
            Err(e) => {
                error!("Failed to send handshake: {}", e);
                SessionEnd::ServerClosed
            }
        };

        self.state.lock().await.connected = false;
        if let Err(e) = tcp.shutdown().await {
            debug!("Error closing TCP stream: {}", e);
        }
        end
    }

    /// Local input -> TCP, holding back requests until initialization completes.
    async fn input_pump<W, O>(
        &self,
        lines: &mut mpsc::Receiver<String>,
        tcp: &SharedWriter<W>,
        out: &SharedWriter<O>,
    ) -> SessionEnd
    where
        W: AsyncWrite + Unpin,
        O: AsyncWrite + Unpin,
    {
        loop {
            let Some(line) = lines.recv().await else {
                info!("Stdin closed");
                return SessionEnd::InputClosed;
            };

            let route = self.state.lock().await.route_local(&line);
            match route {
                LocalRoute::Forward => {
                    if let Err(e) = tcp.send_line(&line).await {
                        warn!("Connection closed, unable to send: {}", e);
                        return SessionEnd::ServerClosed;
                    }
                }
                LocalRoute::ReplayThenForward(buffered) => {
                    if !buffered.is_empty() {
                        info!("Replaying {} buffered requests", buffered.len());
                    }
                    for buffered_line in buffered {
                        if let Err(e) = tcp.send_line(&buffered_line).await {
                            warn!("Connection closed during replay: {}", e);
                            return SessionEnd::ServerClosed;
                        }
                        tokio::time::sleep(self.options.replay_pacing).await;
                    }
                    if let Err(e) = tcp.send_line(&line).await {
                        warn!("Connection closed, unable to send: {}", e);
                        return SessionEnd::ServerClosed;
                    }
                }
                LocalRoute::Buffer { reply } => {
                    if let Some(reply) = reply {
                        if let Err(e) = out.send_line(reply.raw()).await {
                            error!("Failed to write to stdout: {}", e);
                            return SessionEnd::OutputClosed;
                        }
                    }
                }
            }
        }
    }

    /// TCP -> local output. Heartbeat responses are consumed here.
    async fn server_pump<O>(&self, reader: OwnedReadHalf, out: &SharedWriter<O>) -> SessionEnd
    where
        O: AsyncWrite + Unpin,
    {
        let mut reader = BufReader::with_capacity(CodecConfig::READ_BUFFER_SIZE, reader);

        loop {
            let line = match codec::read_line(&mut reader).await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("TCP connection closed");
                    return SessionEnd::ServerClosed;
                }
                Err(e) => {
                    error!("Error forwarding TCP: {}", e);
                    return SessionEnd::ServerClosed;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            if let Ok(frame) = Frame::parse(line.as_str()) {
                if let Some(ControlFrame::HeartbeatResponse { mcp_alive, .. }) = frame.as_control()
                {
                    self.state.lock().await.record_heartbeat_response();
                    if !mcp_alive {
                        warn!("Server reports MCP process is not alive");
                    }
                    continue;
                }

                if self.state.lock().await.is_initialize_response(&frame) {
                    debug!("Received initialize response");
                } else if frame.method() == Some(METHOD_SERVER_RESTARTED) {
                    info!("Server restarted its subprocess");
                }
            }

            if let Err(e) = out.send_line(&line).await {
                error!("Failed to write to stdout: {}", e);
                return SessionEnd::OutputClosed;
            }
        }
    }

    /// Send `heartbeat` frames; silence from the server is only logged.
    async fn heartbeat_loop<W>(&self, tcp: &SharedWriter<W>) -> SessionEnd
    where
        W: AsyncWrite + Unpin,
    {
        let interval = self.options.heartbeat_interval;
        let timeout = heartbeat_timeout(interval);

        tokio::time::sleep(self.options.initial_heartbeat_delay).await;

        loop {
            let heartbeat = Frame::from(ControlFrame::heartbeat());
            if let Err(e) = tcp.send_line(heartbeat.raw()).await {
                error!("Error in heartbeat loop: {}", e);
                return SessionEnd::ServerClosed;
            }
            self.state.lock().await.last_heartbeat_sent = Instant::now();

            tokio::time::sleep(interval).await;

            if let Some(silence) = self.state.lock().await.heartbeat_overdue(timeout) {
                warn!(
                    "Server heartbeat timeout ({:.1}s since last response)",
                    silence.as_secs_f64()
                );
            }
        }
    }
}

async fn dial(addr: &str, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(TetherError::ConnectionFailed {
            addr: addr.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Err(TetherError::Timeout(timeout)),
    }
}

/// Feed local input lines into `tx` until EOF. Dropping `tx` signals EOF.
async fn read_input<I>(input: I, tx: mpsc::Sender<String>)
where
    I: AsyncRead + Unpin,
{
    let mut reader = BufReader::with_capacity(CodecConfig::READ_BUFFER_SIZE, input);
    loop {
        match codec::read_line(&mut reader).await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                if tx.send(line).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                error!("Error reading stdin: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;

    fn fast_options(port: u16) -> ClientOptions {
        ClientOptions::new("127.0.0.1", port)
            .with_reconnect_delay(Duration::from_millis(50))
            .with_initial_heartbeat_delay(Duration::from_secs(60))
    }

    async fn next_frame<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> Value {
        tokio::time::timeout(Duration::from_secs(5), codec::read_frame(reader))
            .await
            .expect("timed out waiting for frame")
            .unwrap()
            .expect("stream closed")
    }

    /// Start the client over in-memory stdio and return the caller's ends.
    fn spawn_client(
        options: ClientOptions,
    ) -> (
        DuplexStream,
        BufReader<DuplexStream>,
        CancellationToken,
        tokio::task::JoinHandle<Result<ClientExit>>,
    ) {
        let (stdin_caller, stdin_client) = tokio::io::duplex(64 * 1024);
        let (stdout_client, stdout_caller) = tokio::io::duplex(64 * 1024);
        let token = CancellationToken::new();
        let client_token = token.clone();

        let handle = tokio::spawn(async move {
            ReconnectingClient::new(options)
                .run(stdin_client, stdout_client, client_token)
                .await
        });
        (stdin_caller, BufReader::new(stdout_caller), token, handle)
    }

    #[tokio::test]
    async fn test_handshake_sent_on_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (_stdin, _stdout, token, handle) = spawn_client(fast_options(port));

        let (mut server, _) = listener.accept().await.unwrap();
        let (reader, _writer) = server.split();
        let mut reader = BufReader::new(reader);
        let handshake = next_frame(&mut reader).await;
        assert_eq!(
            handshake,
            json!({"type": "handshake", "client_version": "1.0", "supports_heartbeat": true})
        );

        token.cancel();
        assert_eq!(handle.await.unwrap().unwrap(), ClientExit::Cancelled);
    }

    #[tokio::test]
    async fn test_heartbeat_response_not_forwarded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (_stdin, mut stdout, token, handle) = spawn_client(fast_options(port));

        let (mut server, _) = listener.accept().await.unwrap();
        let (_reader, mut writer) = server.split();
        codec::write_frame(&mut writer, &json!({"type": "heartbeat_response", "mcp_alive": false}))
            .await
            .unwrap();
        codec::write_frame(&mut writer, &json!({"jsonrpc": "2.0", "id": 1, "result": "ok"}))
            .await
            .unwrap();

        let frame = next_frame(&mut stdout).await;
        assert_eq!(frame["result"], "ok");

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_buffered_requests_reach_server_before_initialized() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (mut stdin, mut stdout, token, handle) = spawn_client(fast_options(port));

        let (mut server, _) = listener.accept().await.unwrap();
        let (reader, _writer) = server.split();
        let mut reader = BufReader::new(reader);
        assert_eq!(next_frame(&mut reader).await["type"], "handshake");

        for id in 1..=3 {
            codec::write_frame(&mut stdin, &json!({"jsonrpc": "2.0", "id": id, "method": "tools/list"}))
                .await
                .unwrap();
        }
        for id in 1..=3 {
            let hint = next_frame(&mut stdout).await;
            assert_eq!(hint["id"], id);
            assert_eq!(hint["error"]["code"], -32002);
        }

        codec::write_frame(&mut stdin, &json!({"jsonrpc": "2.0", "id": 0, "method": "initialize"}))
            .await
            .unwrap();
        codec::write_frame(&mut stdin, &json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await
            .unwrap();

        assert_eq!(next_frame(&mut reader).await["method"], "initialize");
        for id in 1..=3 {
            let replayed = next_frame(&mut reader).await;
            assert_eq!(replayed["id"], id);
            assert_eq!(replayed["method"], "tools/list");
        }
        assert_eq!(
            next_frame(&mut reader).await["method"],
            "notifications/initialized"
        );

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_input_eof_ends_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (mut stdin, _stdout, _token, handle) = spawn_client(fast_options(port));

        let (_server, _) = listener.accept().await.unwrap();
        stdin.shutdown().await.unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, ClientExit::InputClosed);
    }

    #[tokio::test]
    async fn test_no_reconnect_exits_when_server_drops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (_stdin, _stdout, _token, handle) = spawn_client(fast_options(port).without_reconnect());

        let (server, _) = listener.accept().await.unwrap();
        drop(server);

        let exit = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, ClientExit::ReconnectDisabled);
    }

    #[tokio::test]
    async fn test_reconnects_after_server_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (_stdin, _stdout, token, handle) = spawn_client(fast_options(port));

        let (first, _) = listener.accept().await.unwrap();
        drop(first);

        let (mut second, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("client should redial")
            .unwrap();
        let (reader, _writer) = second.split();
        let mut reader = BufReader::new(reader);
        assert_eq!(next_frame(&mut reader).await["type"], "handshake");

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        // Grab a free port, then close it so nothing is listening
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let options = fast_options(port).with_max_reconnect_attempts(3);
        let (_stdin, _stdout, _token, handle) = spawn_client(options);

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            result,
            Err(TetherError::ReconnectExhausted { attempts: 3, .. })
        ));
    }
}
