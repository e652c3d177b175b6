//! Wire protocol between clients and the build server
//!
//! One request and one response per connection, each a single line of JSON:
//!
//! ```text
//! -> {"type":"build","data":{"script":"/s/hello.c","debug":true}}
//! <- {"type":"built","data":{"success":true,"artifact":"...","cached":false}}
//! ```

use crate::build::{BuildRequest, BuildResult};
use crate::error::{KilnError, KilnResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted from a peer
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Build(BuildRequest),
    Stop,
}

/// Identity of a live server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub pid: u32,
    pub port: u16,
    pub started_at: DateTime<Utc>,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Response {
    Pong(Pong),
    Built(BuildResult),
    Stopping,
    Error { message: String },
}

/// Write one newline-terminated JSON frame
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> KilnResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .await
        .map_err(|e| KilnError::io("writing frame", e))?;
    writer
        .flush()
        .await
        .map_err(|e| KilnError::io("flushing frame", e))
}

/// Read one frame. `Ok(None)` when the peer closed without sending anything.
pub async fn read_frame<R, T>(reader: &mut R) -> KilnResult<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = Vec::new();
    let mut limited = reader.take(MAX_FRAME_BYTES as u64 + 1);
    let read = limited
        .read_until(b'\n', &mut line)
        .await
        .map_err(|e| KilnError::io("reading frame", e))?;

    if read == 0 {
        return Ok(None);
    }
    if line.len() > MAX_FRAME_BYTES {
        return Err(KilnError::ServerProtocol(format!(
            "frame exceeds {} bytes",
            MAX_FRAME_BYTES
        )));
    }

    serde_json::from_slice(&line)
        .map(Some)
        .map_err(|e| KilnError::ServerProtocol(format!("malformed frame: {}", e)))
}
