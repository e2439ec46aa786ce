//! Helpers shared by the integration tests.

#![allow(dead_code)]

use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tether_core::codec;
use tether_core::config::SupervisorOptions;
use tether_core::{BridgeServer, BridgeServerHandle, ServerOptions};
use tokio::io::AsyncBufRead;

/// Answers every request carrying a numeric id with `"result":"ok"` and
/// exits when it sees an `exit` method.
const RESPONDER: &str = r#"#!/bin/sh
while IFS= read -r line; do
  case "$line" in
    *'"method":"exit"'*) exit 0 ;;
  esac
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  if [ -n "$id" ]; then
    printf '{"jsonrpc":"2.0","id":%s,"result":"ok"}\n' "$id"
  fi
done
"#;

/// Write the responder script into `dir` and return the command running it.
pub fn responder_command(dir: &Path) -> Vec<String> {
    let path = dir.join("responder.sh");
    std::fs::write(&path, RESPONDER).unwrap();
    vec!["sh".to_string(), path.to_string_lossy().into_owned()]
}

/// Server options with timings short enough for tests.
pub fn fast_server_options(command: Vec<String>) -> ServerOptions {
    ServerOptions::new(command)
        .with_bind("127.0.0.1", 0)
        .with_heartbeat_interval(Duration::from_secs(60))
        .with_monitor_interval(Duration::from_millis(50))
        .with_supervisor(
            SupervisorOptions::default()
                .with_cooldowns(Duration::from_millis(100), Duration::from_millis(50))
                .with_terminate_grace(Duration::from_secs(1)),
        )
}

/// Start a bridge in front of the responder script.
pub async fn start_responder_bridge() -> (TempDir, BridgeServerHandle) {
    let dir = tempfile::tempdir().unwrap();
    let options = fast_server_options(responder_command(dir.path()));
    let handle = BridgeServer::bind(options).await.unwrap();
    (dir, handle)
}

/// Next frame, failing the test after five seconds.
pub async fn next_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> Value {
    tokio::time::timeout(Duration::from_secs(5), codec::read_frame(reader))
        .await
        .expect("timed out waiting for frame")
        .unwrap()
        .expect("stream closed")
}

/// True if nothing arrives within `window`.
pub async fn stays_quiet<R: AsyncBufRead + Unpin>(reader: &mut R, window: Duration) -> bool {
    tokio::time::timeout(window, codec::read_frame(reader))
        .await
        .is_err()
}

/// True if the stream reaches EOF within five seconds.
pub async fn closes<R: AsyncBufRead + Unpin>(reader: &mut R) -> bool {
    matches!(
        tokio::time::timeout(Duration::from_secs(5), codec::read_frame(reader)).await,
        Ok(Ok(None)) | Ok(Err(_))
    )
}
