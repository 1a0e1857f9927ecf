// UDP Transport - connectionless datagrams over a pooled, connected socket per peer.
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::providers::udp::UdpProvider;
use crate::telemetry::{EventSink, NoopEventSink};
use crate::tools::Tool;
use crate::transports::pool::{ConnectionPool, ConnectionState, PoolConfig, PoolKey, PooledConnection};
use crate::transports::stream::{boxed_channel_stream, now_millis, ChunkBuilder, StreamChunk, StreamResult};
use crate::transports::ClientTransport;

const MAX_DATAGRAM: usize = 65535;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// No further datagrams within this window after the first ends the stream.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(5);
const STATE_CONNECTED: u8 = 0;
const STATE_DISCONNECTED: u8 = 1;

struct UdpConnection {
    socket: UdpSocket,
    request_lock: Mutex<()>,
    state: AtomicU8,
    closed: AtomicBool,
}

#[async_trait]
impl PooledConnection for UdpConnection {
    fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::SeqCst) {
            STATE_CONNECTED => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
    }
}

impl UdpConnection {
    async fn connect(address: &str) -> Result<Self, UtcpError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|e| UtcpError::ConnectFailed(e.to_string()))?;
        socket.connect(address).await.map_err(|e| UtcpError::ConnectFailed(e.to_string()))?;
        Ok(Self {
            socket,
            request_lock: Mutex::new(()),
            state: AtomicU8::new(STATE_CONNECTED),
            closed: AtomicBool::new(false),
        })
    }

    async fn request(&self, payload: &[u8]) -> Result<Value, UtcpError> {
        let _guard = self.request_lock.lock().await;

        self.socket.send(payload).await.map_err(|e| {
            self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
            UtcpError::ConnectFailed(e.to_string())
        })?;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let len = self.socket.recv(&mut buf).await.map_err(|e| {
            self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
            UtcpError::ConnectFailed(e.to_string())
        })?;
        buf.truncate(len);

        serde_json::from_slice(&buf).map_err(|e| UtcpError::DecodeFailed(e.to_string()))
    }

    /// Sends one request datagram, then forwards every reply datagram as a chunk
    /// until `idle_timeout` passes with no further datagrams. UDP has no explicit
    /// end-of-stream signal, so idleness is the terminal condition.
    async fn stream_request(&self, payload: &[u8], idle_timeout: Duration, tool: String, provider: String, tx: mpsc::Sender<Result<StreamChunk, UtcpError>>) {
        let _guard = self.request_lock.lock().await;
        let mut builder = ChunkBuilder::new(tool, provider, "udp");

        if let Err(e) = self.socket.send(payload).await {
            self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
            let _ = tx.send(Ok(builder.error(e.to_string(), None))).await;
            return;
        }

        loop {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            match tokio::time::timeout(idle_timeout, self.socket.recv(&mut buf)).await {
                Ok(Ok(len)) => {
                    buf.truncate(len);
                    match serde_json::from_slice::<Value>(&buf) {
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
                Ok(Err(e)) => {
                    self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
                    let _ = tx.send(Ok(builder.error(e.to_string(), None))).await;
                    return;
                }
                Err(_) => {
                    let _ = tx.send(Ok(builder.end())).await;
                    return;
                }
            }
        }
    }
}

/// Transport that speaks JSON-over-datagram on a pooled, connected UDP socket per peer.
pub struct UdpTransport {
    pool: Arc<ConnectionPool<UdpConnection>>,
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpTransport {
    pub fn new() -> Self {
        Self::with_sink(Arc::new(NoopEventSink))
    }

    pub fn with_sink(sink: Arc<dyn EventSink>) -> Self {
        Self { pool: Arc::new(ConnectionPool::new(PoolConfig::default(), sink, "udp")) }
    }
}

#[async_trait]
impl ClientTransport for UdpTransport {
    fn name(&self) -> &'static str {
        "udp"
    }

    async fn register_tool_provider(&self, _prov: &dyn Provider) -> Result<Vec<Tool>, UtcpError> {
        Ok(vec![])
    }

    async fn deregister_tool_provider(&self, prov: &dyn Provider) -> Result<(), UtcpError> {
        let udp_prov = prov
            .as_any()
            .downcast_ref::<UdpProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected a UDP provider".into()))?;
        self.pool.close(&PoolKey::new(format!("{}:{}", udp_prov.host, udp_prov.port))).await;
        Ok(())
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Value, UtcpError> {
        let udp_prov = prov
            .as_any()
            .downcast_ref::<UdpProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected a UDP provider".into()))?;

        let address = format!("{}:{}", udp_prov.host, udp_prov.port);
        let key = PoolKey::new(address.clone());
        let conn = self.pool.get(&key, || UdpConnection::connect(&address)).await?;

        let request = serde_json::json!({ "tool": tool_name, "args": args });
        let payload = serde_json::to_vec(&request).map_err(|e| UtcpError::EncodeFailed(e.to_string()))?;

        let timeout = udp_prov.timeout_ms.map(Duration::from_millis).unwrap_or(DEFAULT_TIMEOUT);
        let result = tokio::time::timeout(timeout, conn.request(&payload))
            .await
            .map_err(|_| UtcpError::Timeout(timeout))??;

        self.pool.release(&key).await;
        Ok(result)
    }

    async fn call_tool_stream(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Box<dyn StreamResult>, UtcpError> {
        let udp_prov = prov
            .as_any()
            .downcast_ref::<UdpProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected a UDP provider".into()))?;

        let address = format!("{}:{}", udp_prov.host, udp_prov.port);
        let key = PoolKey::new(address.clone());
        let conn = self.pool.get(&key, || UdpConnection::connect(&address)).await?;

        let request = serde_json::json!({ "tool": tool_name, "args": args });
        let payload = serde_json::to_vec(&request).map_err(|e| UtcpError::EncodeFailed(e.to_string()))?;
        let idle_timeout = udp_prov.timeout_ms.map(Duration::from_millis).unwrap_or(STREAM_IDLE_TIMEOUT);

        let (tx, rx) = mpsc::channel(16);
        let tool = tool_name.to_string();
        let provider_name = udp_prov.base.name.clone();
        let pool = self.pool.clone();
        tokio::spawn(async move {
            conn.stream_request(&payload, idle_timeout, tool, provider_name, tx).await;
            pool.release(&key).await;
        });

        Ok(boxed_channel_stream(rx, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider(host: String, port: u16) -> UdpProvider {
        UdpProvider::new("udp".to_string(), host, port, None)
    }

    #[tokio::test]
    async fn call_tool_sends_and_receives_datagram() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
            let incoming: Value = serde_json::from_slice(&buf[..len]).unwrap();
            let response = serde_json::to_vec(&json!({
                "received_tool": incoming.get("tool").cloned().unwrap(),
                "args": incoming.get("args").cloned().unwrap()
            }))
            .unwrap();
            socket.send_to(&response, peer).await.unwrap();
        });

        let prov = provider(addr.ip().to_string(), addr.port());

        let mut args = HashMap::new();
        args.insert("value".to_string(), Value::String("ping".to_string()));

        let transport = UdpTransport::new();
        let result = transport.call_tool("echo", args.clone(), &prov).await.unwrap();

        assert_eq!(result.get("received_tool"), Some(&json!("echo")));
        assert_eq!(result.get("args"), Some(&json!(args)));
    }

    #[tokio::test]
    async fn register_returns_empty_tool_list() {
        let prov = provider("127.0.0.1".to_string(), 9);
        let transport = UdpTransport::new();
        assert!(transport.register_tool_provider(&prov).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn call_tool_stream_forwards_datagrams_until_idle() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let (_, peer) = socket.recv_from(&mut buf).await.unwrap();
            for i in 0..2 {
                let datagram = serde_json::to_vec(&json!({ "seq": i })).unwrap();
                socket.send_to(&datagram, peer).await.unwrap();
            }
        });

        let mut prov = provider(addr.ip().to_string(), addr.port());
        prov.timeout_ms = Some(200);
        let transport = UdpTransport::new();

        let mut stream = transport.call_tool_stream("echo", HashMap::new(), &prov).await.expect("stream");
        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, StreamChunk::Data { .. }));
        let second = stream.next().await.unwrap().unwrap();
        assert!(matches!(second, StreamChunk::Data { .. }));
        let third = stream.next().await.unwrap().unwrap();
        assert!(third.is_terminal());
        assert!(matches!(third, StreamChunk::End { .. }));
    }

    #[tokio::test]
    async fn call_tool_respects_timeout_when_no_response() {
        let mut prov = provider("127.0.0.1".to_string(), 9);
        prov.timeout_ms = Some(30);

        let transport = UdpTransport::new();
        let err = transport.call_tool("noop", HashMap::new(), &prov).await.expect_err("expected timeout");
        assert!(matches!(err, UtcpError::Timeout(_)));
    }
}
