//! Newline-delimited JSON framing.
//!
//! Used on both hops (TCP socket and subprocess stdio) in both directions:
//!
//! ```text
//! {"jsonrpc":"2.0","id":1,"method":"ping"}\n
//! ```
//!
//! No length prefix. A frame never contains an unescaped `\n`, so the newline
//! is the only delimiter. A trailing `\r` is treated as part of the delimiter.

use crate::config::CodecConfig;
use crate::{Result, TetherError};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Read one line from a buffered reader, without its terminator.
///
/// Returns `None` on clean EOF. An unterminated final line is still returned.
/// Lines longer than [`CodecConfig::MAX_FRAME_SIZE`] fail with
/// [`TetherError::FrameTooLarge`].
pub async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut line = Vec::new();

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            break;
        }

        let (complete, used) = match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                line.extend_from_slice(&available[..pos]);
                (true, pos + 1)
            }
            None => {
                line.extend_from_slice(available);
                (false, available.len())
            }
        };
        reader.consume(used);

        if line.len() > CodecConfig::MAX_FRAME_SIZE {
            return Err(TetherError::FrameTooLarge {
                size: line.len(),
                max: CodecConfig::MAX_FRAME_SIZE,
            });
        }
        if complete {
            break;
        }
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }

    String::from_utf8(line).map(Some).map_err(|e| {
        TetherError::from(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })
}

fn decode_frame(line: &str) -> Result<Value> {
    Ok(serde_json::from_str(line)?)
}

/// Read the next non-blank line and decode it as JSON.
///
/// Returns `None` on clean EOF. Malformed JSON is returned as an error so the
/// caller can decide whether to drop the line or end the stream.
pub async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Value>> {
    loop {
        match read_line(reader).await? {
            None => return Ok(None),
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => return decode_frame(&line).map(Some),
        }
    }
}

/// Write a raw line, appending `\n` if it is missing, then flush.
pub async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    writer.write_all(line.as_bytes()).await?;
    if !line.ends_with('\n') {
        writer.write_all(b"\n").await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Serialize a frame onto one line and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Value) -> Result<()> {
    let mut bytes = serde_json::to_vec(frame)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// A writer shared by the activities of a single connection.
///
/// Each call writes one whole frame under the lock, so frames from different
/// activities never interleave on the wire.
pub struct SharedWriter<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> Clone for SharedWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: AsyncWrite + Unpin> SharedWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    pub async fn send_line(&self, line: &str) -> Result<()> {
        let mut writer = self.inner.lock().await;
        write_line(&mut *writer, line).await
    }

    /// Flush and shut down the write side.
    pub async fn shutdown(&self) -> Result<()> {
        let mut writer = self.inner.lock().await;
        writer.flush().await?;
        writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_frame_write_then_read() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &json!({"id": 1, "method": "ping"}))
            .await
            .unwrap();
        assert_eq!(buf.last(), Some(&b'\n'));

        let mut reader = BufReader::new(std::io::Cursor::new(buf));
        let frame = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(frame["method"], "ping");
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_empty_stream_returns_none() {
        let mut reader = BufReader::new(std::io::Cursor::new(Vec::<u8>::new()));
        assert!(read_line(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_line_splits_and_strips_crlf() {
        let data = b"{\"a\":1}\r\n{\"b\":2}\n{\"c\":3}".to_vec();
        let mut reader = BufReader::new(std::io::Cursor::new(data));

        assert_eq!(read_line(&mut reader).await.unwrap().unwrap(), "{\"a\":1}");
        assert_eq!(read_line(&mut reader).await.unwrap().unwrap(), "{\"b\":2}");
        // Unterminated tail at EOF is still a line
        assert_eq!(read_line(&mut reader).await.unwrap().unwrap(), "{\"c\":3}");
        assert!(read_line(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_line_across_small_buffers() {
        let data = b"{\"key\":\"a fairly long value\"}\n".to_vec();
        let mut reader = BufReader::with_capacity(4, std::io::Cursor::new(data));
        let line = read_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(line, "{\"key\":\"a fairly long value\"}");
    }

    #[tokio::test]
    async fn test_read_frame_skips_blank_lines() {
        let data = b"\n   \n{\"id\":7}\n".to_vec();
        let mut reader = BufReader::new(std::io::Cursor::new(data));
        let frame = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(frame["id"], 7);
    }

    #[tokio::test]
    async fn test_read_frame_malformed_json_is_error() {
        let data = b"not json\n{\"id\":1}\n".to_vec();
        let mut reader = BufReader::new(std::io::Cursor::new(data));
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(TetherError::Json { .. })
        ));
        // The stream stays usable after a bad line
        let frame = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(frame["id"], 1);
    }

    #[tokio::test]
    async fn test_oversized_line_returns_error() {
        let data = vec![b'x'; CodecConfig::MAX_FRAME_SIZE + 2];
        let mut reader = BufReader::new(std::io::Cursor::new(data));
        assert!(matches!(
            read_line(&mut reader).await,
            Err(TetherError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_write_line_is_verbatim() {
        let raw = r#"{"z":1,  "a":[1,2]}"#;
        let mut buf = Vec::new();
        write_line(&mut buf, raw).await.unwrap();
        write_line(&mut buf, "{}\n").await.unwrap();
        assert_eq!(buf, format!("{}\n{{}}\n", raw).into_bytes());
    }

    #[tokio::test]
    async fn test_shared_writer_clones_write_whole_frames() {
        let (client, server) = tokio::io::duplex(1024);
        let writer = SharedWriter::new(client);
        let other = writer.clone();

        writer.send_line(r#"{"n":1}"#).await.unwrap();
        other.send_line(r#"{"n":2}"#).await.unwrap();
        writer.shutdown().await.unwrap();

        let mut reader = BufReader::new(server);
        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap()["n"], 1);
        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap()["n"], 2);
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }
}
