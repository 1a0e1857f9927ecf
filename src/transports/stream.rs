use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

use crate::errors::UtcpError;

/// Metadata attached to every chunk of a stream: identifies the sequence position
/// and the call it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub sequence: u64,
    pub tool: String,
    pub provider: String,
    pub transport: &'static str,
}

/// One element of a lazy stream. `sequence` is strictly increasing from 0 within a
/// single stream; exactly one of `Error`/`End` ever terminates it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum StreamChunk {
    Data {
        data: Value,
        metadata: ChunkMetadata,
        timestamp: u64,
        sequence: u64,
    },
    Error {
        error: String,
        code: Option<i64>,
        metadata: ChunkMetadata,
    },
    End {
        metadata: ChunkMetadata,
    },
}

impl StreamChunk {
    pub fn sequence(&self) -> u64 {
        match self {
            StreamChunk::Data { metadata, .. } => metadata.sequence,
            StreamChunk::Error { metadata, .. } => metadata.sequence,
            StreamChunk::End { metadata, .. } => metadata.sequence,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamChunk::Error { .. } | StreamChunk::End { .. })
    }
}

/// Builds chunks for one stream, stamping a strictly increasing sequence number and
/// shared metadata. Transports construct one of these per producer task.
pub struct ChunkBuilder {
    next_sequence: u64,
    tool: String,
    provider: String,
    transport: &'static str,
}

impl ChunkBuilder {
    pub fn new(tool: impl Into<String>, provider: impl Into<String>, transport: &'static str) -> Self {
        Self {
            next_sequence: 0,
            tool: tool.into(),
            provider: provider.into(),
            transport,
        }
    }

    fn metadata(&mut self) -> ChunkMetadata {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        ChunkMetadata {
            sequence,
            tool: self.tool.clone(),
            provider: self.provider.clone(),
            transport: self.transport,
        }
    }

    pub fn data(&mut self, data: Value, timestamp: u64) -> StreamChunk {
        let metadata = self.metadata();
        StreamChunk::Data {
            data,
            sequence: metadata.sequence,
            metadata,
            timestamp,
        }
    }

    pub fn error(&mut self, error: impl Into<String>, code: Option<i64>) -> StreamChunk {
        StreamChunk::Error {
            error: error.into(),
            code,
            metadata: self.metadata(),
        }
    }

    pub fn end(&mut self) -> StreamChunk {
        StreamChunk::End {
            metadata: self.metadata(),
        }
    }
}

/// Current time in milliseconds since the epoch, for chunk timestamps.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A lazy sequence of `StreamChunk`s. Consumers may abandon the stream early by
/// dropping it; `close` is idempotent and releases the underlying connection back
/// to its pool exactly once.
#[async_trait]
pub trait StreamResult: Send {
    /// Pull the next chunk. Returns `Ok(None)` only after a terminal chunk has
    /// already been yielded and consumed.
    async fn next(&mut self) -> Result<Option<StreamChunk>, UtcpError>;
    /// Release resources. Safe to call more than once; only the first call acts.
    async fn close(&mut self) -> Result<(), UtcpError>;
}

/// `StreamResult` backed by a channel fed by a producer task. `close_fn` runs at
/// most once even if `close` is called repeatedly.
pub struct ChannelStreamResult {
    rx: mpsc::Receiver<Result<StreamChunk, UtcpError>>,
    close_fn: Option<Box<dyn FnOnce() -> Result<(), UtcpError> + Send>>,
    done: bool,
}

impl ChannelStreamResult {
    pub fn new(
        rx: mpsc::Receiver<Result<StreamChunk, UtcpError>>,
        close_fn: Option<Box<dyn FnOnce() -> Result<(), UtcpError> + Send>>,
    ) -> Self {
        Self {
            rx,
            close_fn,
            done: false,
        }
    }
}

#[async_trait]
impl StreamResult for ChannelStreamResult {
    async fn next(&mut self) -> Result<Option<StreamChunk>, UtcpError> {
        if self.done {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(Ok(chunk)) => {
                if chunk.is_terminal() {
                    self.done = true;
                }
                Ok(Some(chunk))
            }
            Some(Err(e)) => {
                self.done = true;
                Err(e)
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    async fn close(&mut self) -> Result<(), UtcpError> {
        if let Some(close_fn) = self.close_fn.take() {
            close_fn()?;
        }
        Ok(())
    }
}

/// `StreamResult` backed by an already-known vector of data values, terminated by
/// a single synthesized `End` chunk. Used to adapt eager responses (e.g. GraphQL
/// subscriptions) into the lazy stream contract.
pub struct VecStreamResult {
    chunks: std::vec::IntoIter<StreamChunk>,
    close_fn: Option<Box<dyn FnOnce() -> Result<(), UtcpError> + Send>>,
}

impl VecStreamResult {
    pub fn new(
        items: Vec<Value>,
        tool: impl Into<String>,
        provider: impl Into<String>,
        transport: &'static str,
        close_fn: Option<Box<dyn FnOnce() -> Result<(), UtcpError> + Send>>,
    ) -> Self {
        let mut builder = ChunkBuilder::new(tool, provider, transport);
        let mut chunks: Vec<StreamChunk> = items
            .into_iter()
            .map(|item| builder.data(item, now_millis()))
            .collect();
        chunks.push(builder.end());
        Self {
            chunks: chunks.into_iter(),
            close_fn,
        }
    }
}

#[async_trait]
impl StreamResult for VecStreamResult {
    async fn next(&mut self) -> Result<Option<StreamChunk>, UtcpError> {
        Ok(self.chunks.next())
    }

    async fn close(&mut self) -> Result<(), UtcpError> {
        if let Some(close_fn) = self.close_fn.take() {
            close_fn()?;
        }
        Ok(())
    }
}

pub fn boxed_channel_stream(
    rx: mpsc::Receiver<Result<StreamChunk, UtcpError>>,
    close_fn: Option<Box<dyn FnOnce() -> Result<(), UtcpError> + Send>>,
) -> Box<dyn StreamResult> {
    Box::new(ChannelStreamResult::new(rx, close_fn))
}

pub fn boxed_vec_stream(
    items: Vec<Value>,
    tool: impl Into<String>,
    provider: impl Into<String>,
    transport: &'static str,
) -> Box<dyn StreamResult> {
    Box::new(VecStreamResult::new(items, tool, provider, transport, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    #[tokio::test]
    async fn vec_stream_ends_with_single_terminal_and_increasing_sequence() {
        let closed = Arc::new(AtomicBool::new(false));
        let closed_clone = closed.clone();
        let mut stream = VecStreamResult::new(
            vec![json!(1), json!({"two": 2})],
            "echo",
            "api",
            "http",
            Some(Box::new(move || {
                closed_clone.store(true, Ordering::SeqCst);
                Ok(())
            })),
        );

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.sequence(), 0);
        assert!(!first.is_terminal());

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.sequence(), 1);

        let third = stream.next().await.unwrap().unwrap();
        assert_eq!(third.sequence(), 2);
        assert!(third.is_terminal());
        assert!(matches!(third, StreamChunk::End { .. }));

        assert!(stream.next().await.unwrap().is_none());
        stream.close().await.unwrap();
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn channel_stream_stops_after_error_chunk() {
        let (tx, rx) = mpsc::channel(4);
        let mut builder = ChunkBuilder::new("echo", "api", "websocket");
        tx.send(Ok(builder.data(json!("ok"), now_millis())))
            .await
            .unwrap();
        tx.send(Ok(builder.error("boom", Some(500)))).await.unwrap();
        tx.send(Ok(builder.data(json!("never seen"), now_millis())))
            .await
            .unwrap();
        drop(tx);

        let mut stream = ChannelStreamResult::new(rx, None);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.sequence(), 0);

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.is_terminal());
        assert_eq!(second.sequence(), 1);

        assert!(stream.next().await.unwrap().is_none());
    }

    #[test]
    fn chunk_builder_sequence_strictly_increases() {
        let mut builder = ChunkBuilder::new("t", "p", "tcp");
        let a = builder.data(json!(1), 0);
        let b = builder.data(json!(2), 0);
        let c = builder.end();
        assert_eq!(a.sequence(), 0);
        assert_eq!(b.sequence(), 1);
        assert_eq!(c.sequence(), 2);
    }
}
