//! Stratum v1 message types and the newline-delimited JSON line codec.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Longest accepted JSON-RPC line. Caps memory against a client streaming
/// an endless unterminated line.
pub const MAX_LINE_SIZE: usize = 16 * 1024;

/// Per-message write deadline.
pub const WRITE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line exceeds {MAX_LINE_SIZE} bytes")]
    LineTooLong,

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("write deadline exceeded")]
    WriteTimeout,
}

/// A client request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// A server response to a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: Value,
    pub result: Value,
    pub error: Value,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result,
            error: Value::Null,
        }
    }

    /// Stratum error payload: `[code, message, traceback]`.
    pub fn err(id: Value, code: i64, message: &str) -> Self {
        Self {
            id,
            result: Value::Null,
            error: serde_json::json!([code, message, Value::Null]),
        }
    }
}

/// A server-to-client notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Value,
    pub method: String,
    pub params: Vec<Value>,
}

impl Notification {
    pub fn new(method: &str, params: Vec<Value>) -> Self {
        Self {
            id: Value::Null,
            method: method.to_string(),
            params,
        }
    }
}

/// Read one newline-terminated line, enforcing [`MAX_LINE_SIZE`]. Returns
/// `None` on a clean EOF. Empty lines are skipped.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut line = Vec::new();
        loop {
            let buf = reader.fill_buf().await?;
            if buf.is_empty() {
                // EOF; a partial trailing line is discarded.
                return Ok(None);
            }
            if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                line.extend_from_slice(&buf[..pos]);
                reader.consume(pos + 1);
                break;
            }
            line.extend_from_slice(buf);
            let n = buf.len();
            reader.consume(n);
            if line.len() > MAX_LINE_SIZE {
                return Err(ProtocolError::LineTooLong);
            }
        }
        if line.len() > MAX_LINE_SIZE {
            return Err(ProtocolError::LineTooLong);
        }

        let trimmed = String::from_utf8_lossy(&line).trim().to_string();
        if !trimmed.is_empty() {
            return Ok(Some(trimmed));
        }
    }
}

/// Parse one request line.
pub fn parse_request(line: &str) -> Result<Request, ProtocolError> {
    Ok(serde_json::from_str(line)?)
}

/// Serialize a message and write it with a trailing newline under the
/// write deadline.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut payload = serde_json::to_vec(message)?;
    payload.push(b'\n');

    tokio::time::timeout(WRITE_TIMEOUT, async {
        writer.write_all(&payload).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| ProtocolError::WriteTimeout)??;
    Ok(())
}
