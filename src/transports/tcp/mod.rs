// TCP Transport - persistent, pooled connections framed as one JSON message per line.
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::providers::tcp::TcpProvider;
use crate::telemetry::{EventSink, NoopEventSink};
use crate::tools::Tool;
use crate::transports::pool::{ConnectionPool, ConnectionState, PoolConfig, PoolKey, PooledConnection};
use crate::transports::stream::{boxed_channel_stream, now_millis, ChunkBuilder, StreamChunk, StreamResult};
use crate::transports::ClientTransport;

/// A blank line on the wire terminates a streamed call without signalling an error.
const STREAM_TERMINATOR: &str = "";

const STATE_CONNECTED: u8 = 0;
const STATE_DISCONNECTED: u8 = 1;

struct TcpConnection {
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    state: AtomicU8,
    closed: AtomicBool,
}

#[async_trait]
impl PooledConnection for TcpConnection {
    fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::SeqCst) {
            STATE_CONNECTED => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
    }
}

impl TcpConnection {
    async fn connect(address: &str) -> Result<Self, UtcpError> {
        let stream = TcpStream::connect(address).await.map_err(|e| UtcpError::ConnectFailed(e.to_string()))?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(write_half),
            state: AtomicU8::new(STATE_CONNECTED),
            closed: AtomicBool::new(false),
        })
    }

    async fn request(&self, payload: &[u8]) -> Result<Value, UtcpError> {
        {
            let mut writer = self.writer.lock().await;
            if writer.write_all(payload).await.is_err() || writer.write_all(b"\n").await.is_err() || writer.flush().await.is_err() {
                self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
                return Err(UtcpError::ConnectFailed("TCP write failed".into()));
            }
        }

        let mut line = String::new();
        let mut reader = self.reader.lock().await;
        let read = reader.read_line(&mut line).await.map_err(|e| {
            self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
            UtcpError::ConnectFailed(e.to_string())
        })?;
        if read == 0 {
            self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
            return Err(UtcpError::ConnectFailed("TCP connection closed by peer".into()));
        }

        serde_json::from_str(line.trim_end()).map_err(|e| UtcpError::DecodeFailed(e.to_string()))
    }

    /// Writes `payload` then reads lines until a blank line (end of stream) or the
    /// peer closes the connection. Each non-blank line is one JSON chunk.
    async fn stream_request(&self, payload: &[u8], tool: String, provider: String, tx: mpsc::Sender<Result<StreamChunk, UtcpError>>) {
        let mut builder = ChunkBuilder::new(tool, provider, "tcp");
        {
            let mut writer = self.writer.lock().await;
            if writer.write_all(payload).await.is_err() || writer.write_all(b"\n").await.is_err() || writer.flush().await.is_err() {
                self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
                let _ = tx.send(Ok(builder.error("TCP write failed", None))).await;
                return;
            }
        }

        let mut reader = self.reader.lock().await;
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
                    let _ = tx.send(Ok(builder.end())).await;
                    return;
                }
                Ok(_) => {
                    let trimmed = line.trim_end();
                    if trimmed == STREAM_TERMINATOR {
                        let _ = tx.send(Ok(builder.end())).await;
                        return;
                    }
                    match serde_json::from_str::<Value>(trimmed) {
                        Ok(value) => {
                            if tx.send(Ok(builder.data(value, now_millis()))).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Ok(builder.error(e.to_string(), None))).await;
                            return;
                        }
                    }
                }
                Err(e) => {
                    self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
                    let _ = tx.send(Ok(builder.error(e.to_string(), None))).await;
                    return;
                }
            }
        }
    }
}

/// Transport that speaks newline-delimited JSON over a pooled, persistent TCP
/// connection per provider address.
pub struct TcpTransport {
    pool: Arc<ConnectionPool<TcpConnection>>,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::with_sink(Arc::new(NoopEventSink))
    }

    pub fn with_sink(sink: Arc<dyn EventSink>) -> Self {
        Self { pool: Arc::new(ConnectionPool::new(PoolConfig::default(), sink, "tcp")) }
    }
}

#[async_trait]
impl ClientTransport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn register_tool_provider(&self, _prov: &dyn Provider) -> Result<Vec<Tool>, UtcpError> {
        Ok(vec![])
    }

    async fn deregister_tool_provider(&self, prov: &dyn Provider) -> Result<(), UtcpError> {
        let tcp_prov = prov
            .as_any()
            .downcast_ref::<TcpProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected a TCP provider".into()))?;
        self.pool.close(&PoolKey::new(format!("{}:{}", tcp_prov.host, tcp_prov.port))).await;
        Ok(())
    }

    async fn call_tool(
        &self,
        _tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Value, UtcpError> {
        let tcp_prov = prov
            .as_any()
            .downcast_ref::<TcpProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected a TCP provider".into()))?;

        let address = format!("{}:{}", tcp_prov.host, tcp_prov.port);
        let key = PoolKey::new(address.clone());
        let conn = self.pool.get(&key, || TcpConnection::connect(&address)).await?;

        let payload = serde_json::to_vec(&args).map_err(|e| UtcpError::EncodeFailed(e.to_string()))?;

        let request = conn.request(&payload);
        let result = match tcp_prov.timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), request)
                .await
                .map_err(|_| UtcpError::Timeout(Duration::from_millis(ms)))??,
            None => request.await?,
        };

        self.pool.release(&key).await;
        Ok(result)
    }

    async fn call_tool_stream(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Box<dyn StreamResult>, UtcpError> {
        let tcp_prov = prov
            .as_any()
            .downcast_ref::<TcpProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected a TCP provider".into()))?;

        let address = format!("{}:{}", tcp_prov.host, tcp_prov.port);
        let key = PoolKey::new(address.clone());
        let conn = self.pool.get(&key, || TcpConnection::connect(&address)).await?;
        let payload = serde_json::to_vec(&args).map_err(|e| UtcpError::EncodeFailed(e.to_string()))?;

        let (tx, rx) = mpsc::channel(16);
        let tool = tool_name.to_string();
        let provider_name = tcp_prov.base.name.clone();
        let pool = self.pool.clone();
        tokio::spawn(async move {
            conn.stream_request(&payload, tool, provider_name, tx).await;
            pool.release(&key).await;
        });

        Ok(boxed_channel_stream(rx, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncBufReadExt as _;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn call_tool_round_trips_newline_delimited_json() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = tokio::io::BufReader::new(read_half);
            loop {
                let mut line = String::new();
                let read = reader.read_line(&mut line).await.unwrap_or(0);
                if read == 0 {
                    break;
                }
                let parsed: Value = serde_json::from_str(line.trim_end()).unwrap();
                let reply = json!({ "echo": parsed });
                let mut bytes = reply.to_string().into_bytes();
                bytes.push(b'\n');
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        let prov = TcpProvider::new("tcp".to_string(), "127.0.0.1".to_string(), addr.port(), None);
        let transport = TcpTransport::new();

        let mut args = HashMap::new();
        args.insert("msg".into(), Value::String("hi".into()));

        let result = transport.call_tool("ignored", args.clone(), &prov).await.expect("call");
        assert_eq!(result, json!({ "echo": json!(args) }));

        let result2 = transport.call_tool("ignored", args.clone(), &prov).await.expect("call reuses connection");
        assert_eq!(result2, json!({ "echo": json!(args) }));
    }

    #[tokio::test]
    async fn call_tool_stream_yields_each_line_then_end() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = tokio::io::BufReader::new(read_half);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            for chunk in [json!({"seq": 0}), json!({"seq": 1})] {
                let mut bytes = chunk.to_string().into_bytes();
                bytes.push(b'\n');
                write_half.write_all(&bytes).await.unwrap();
            }
            write_half.write_all(b"\n").await.unwrap();
        });

        let prov = TcpProvider::new("tcp".to_string(), "127.0.0.1".to_string(), addr.port(), None);
        let transport = TcpTransport::new();

        let mut stream = transport.call_tool_stream("ignored", HashMap::new(), &prov).await.expect("stream");

        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, StreamChunk::Data { .. }));
        let second = stream.next().await.unwrap().unwrap();
        assert!(matches!(second, StreamChunk::Data { .. }));
        let third = stream.next().await.unwrap().unwrap();
        assert!(third.is_terminal());
    }
}
