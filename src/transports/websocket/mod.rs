// WebSocket Transport - persistent, pooled, bidirectional communication.
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue, Request},
        protocol::Message,
    },
};

use crate::auth::apply::apply_credentials;
use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::providers::websocket::WebSocketProvider;
use crate::telemetry::{Event, EventSink, NoopEventSink};
use crate::tools::Tool;
use crate::transports::pool::{ConnectionPool, ConnectionState, PoolConfig, PoolKey, PooledConnection};
use crate::transports::stream::{boxed_channel_stream, ChunkBuilder, StreamChunk, StreamResult};
use crate::transports::ClientTransport;

const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Headers that are safe to forward verbatim from a provider's `headers` map onto
/// the opening handshake request. Anything else must come from `auth`.
const SAFE_HEADER_NAMES: &[&str] = &[
    "x-custom",
    "x-client-id",
    "x-request-id",
    "user-agent",
    "sec-websocket-protocol",
];

enum Pending {
    Unary(oneshot::Sender<Result<Value, UtcpError>>),
    Stream(mpsc::Sender<Result<Value, UtcpError>>),
}

/// A single open WebSocket connection. A writer loop owns the socket; outbound
/// envelopes are pushed onto `outbound`, inbound replies are dispatched strictly
/// FIFO against `pending` (the connection does not support concurrent in-flight
/// calls interleaving responses out of order).
struct WsConnection {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Arc<Mutex<VecDeque<Pending>>>,
    state: Arc<AtomicU8>,
    closed: AtomicBool,
    /// Binary frames bypass the FIFO call/stream queue; subscribers get them
    /// as they arrive instead of matched against a pending call.
    binary: broadcast::Sender<Vec<u8>>,
    /// Updated whenever the peer answers a ping with a Pong.
    last_ping: Arc<Mutex<Option<Instant>>>,
}

const STATE_CONNECTED: u8 = 0;
const STATE_DISCONNECTED: u8 = 1;
const STATE_ERROR: u8 = 2;

fn decode_state(code: u8) -> ConnectionState {
    match code {
        STATE_CONNECTED => ConnectionState::Connected,
        STATE_ERROR => ConnectionState::Error,
        _ => ConnectionState::Disconnected,
    }
}

#[async_trait]
impl PooledConnection for WsConnection {
    fn state(&self) -> ConnectionState {
        decode_state(self.state.load(Ordering::SeqCst))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.outbound.send(Message::Close(None));
        self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
    }
}

impl WsConnection {
    async fn enqueue(&self, responder: Pending, envelope: Value) -> Result<(), UtcpError> {
        let text = serde_json::to_string(&envelope).map_err(|e| UtcpError::EncodeFailed(e.to_string()))?;
        self.enqueue_raw(responder, text).await
    }

    async fn enqueue_raw(&self, responder: Pending, text: String) -> Result<(), UtcpError> {
        self.pending.lock().await.push_back(responder);
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| UtcpError::ConnectFailed("WebSocket writer task is gone".into()))
    }

    /// Subscribe to binary frames forwarded from this connection. Each subscriber
    /// gets every frame sent after it subscribes; frames sent with no subscribers
    /// are simply dropped.
    fn subscribe_binary(&self) -> broadcast::Receiver<Vec<u8>> {
        self.binary.subscribe()
    }

    async fn last_ping(&self) -> Option<Instant> {
        *self.last_ping.lock().await
    }
}

/// Transport that communicates with tools over pooled, persistent WebSocket
/// connections.
pub struct WebSocketTransport {
    pool: Arc<ConnectionPool<WsConnection>>,
    sink: Arc<dyn EventSink>,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::with_sink(Arc::new(NoopEventSink))
    }

    pub fn with_sink(sink: Arc<dyn EventSink>) -> Self {
        Self {
            pool: Arc::new(ConnectionPool::new(PoolConfig::default(), sink.clone(), "websocket")),
            sink,
        }
    }

    fn build_request(prov: &WebSocketProvider) -> Result<Request<()>, UtcpError> {
        let mut url = prov.url.clone();
        let mut extra_headers: Vec<(String, String)> = Vec::new();

        if let Some(auth) = &prov.base.auth {
            let applied = apply_credentials(auth)?;
            extra_headers.extend(applied.headers);
            if !applied.query.is_empty() {
                let mut parsed = Url::parse(&url)
                    .map_err(|e| UtcpError::InvalidProvider(format!("invalid WebSocket URL: {e}")))?;
                {
                    let mut pairs = parsed.query_pairs_mut();
                    for (k, v) in &applied.query {
                        pairs.append_pair(k, v);
                    }
                }
                url = parsed.to_string();
            }
        }

        let mut req = url
            .into_client_request()
            .map_err(|e| UtcpError::InvalidProvider(format!("invalid WebSocket request: {e}")))?;

        if let Some(headers) = &prov.headers {
            for (k, v) in headers {
                if !SAFE_HEADER_NAMES.contains(&k.to_ascii_lowercase().as_str()) {
                    continue;
                }
                let name = HeaderName::from_str(k)
                    .map_err(|e| UtcpError::InvalidProvider(format!("invalid header name {k}: {e}")))?;
                let value = HeaderValue::from_str(v)
                    .map_err(|e| UtcpError::InvalidProvider(format!("invalid header value for {k}: {e}")))?;
                req.headers_mut().insert(name, value);
            }
        }
        if let Some(proto) = &prov.protocol {
            req.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                HeaderValue::from_str(proto)
                    .map_err(|e| UtcpError::InvalidProvider(format!("invalid protocol header: {e}")))?,
            );
        }
        for (name, value) in extra_headers {
            let header_name = HeaderName::from_str(&name)
                .map_err(|e| UtcpError::InvalidProvider(format!("invalid auth header name {name}: {e}")))?;
            let header_value = HeaderValue::from_str(&value)
                .map_err(|e| UtcpError::InvalidProvider(format!("invalid auth header value: {e}")))?;
            req.headers_mut().insert(header_name, header_value);
        }

        Ok(req)
    }

    async fn connect(prov: &WebSocketProvider, sink: Arc<dyn EventSink>, pool_key: String) -> Result<WsConnection, UtcpError> {
        let req = Self::build_request(prov)?;
        let (ws_stream, _) = connect_async(req)
            .await
            .map_err(|e| UtcpError::ConnectFailed(e.to_string()))?;

        let (mut sink_half, mut stream_half) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let pending: Arc<Mutex<VecDeque<Pending>>> = Arc::new(Mutex::new(VecDeque::new()));
        let state = Arc::new(AtomicU8::new(STATE_CONNECTED));
        let (binary_tx, _binary_rx) = broadcast::channel::<Vec<u8>>(64);
        let last_ping: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));

        let writer_state = state.clone();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if sink_half.send(msg).await.is_err() {
                    writer_state.store(STATE_ERROR, Ordering::SeqCst);
                    return;
                }
                if is_close {
                    return;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_state = state.clone();
        let reader_sink = sink.clone();
        let reader_key = pool_key.clone();
        let reader_binary_tx = binary_tx.clone();
        let reader_last_ping = last_ping.clone();
        tokio::spawn(async move {
            while let Some(msg) = stream_half.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        Self::dispatch(&reader_pending, parse_payload(&text)).await;
                    }
                    Ok(Message::Binary(bin)) => {
                        // Forwarded to subscribers, not matched against a pending call.
                        let _ = reader_binary_tx.send(bin);
                    }
                    Ok(Message::Pong(_)) => {
                        *reader_last_ping.lock().await = Some(Instant::now());
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        reader_state.store(STATE_ERROR, Ordering::SeqCst);
                        Self::dispatch_error(&reader_pending, e.to_string()).await;
                        break;
                    }
                }
            }
            reader_state.store(STATE_DISCONNECTED, Ordering::SeqCst);
            reader_sink.emit(Event::Connection { pool_key: reader_key, action: "disconnect" });
        });

        if prov.keep_alive {
            let ping_tx = out_tx.clone();
            let ping_state = state.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(DEFAULT_PING_INTERVAL);
                loop {
                    ticker.tick().await;
                    if decode_state(ping_state.load(Ordering::SeqCst)) != ConnectionState::Connected {
                        return;
                    }
                    if ping_tx.send(Message::Ping(Vec::new())).is_err() {
                        return;
                    }
                }
            });
        }

        Ok(WsConnection {
            outbound: out_tx,
            pending,
            state,
            closed: AtomicBool::new(false),
            binary: binary_tx,
            last_ping,
        })
    }

    async fn dispatch(pending: &Arc<Mutex<VecDeque<Pending>>>, payload: Value) {
        let is_stream_end = payload.get("type").and_then(|v| v.as_str()) == Some("stream_end");
        let mut guard = pending.lock().await;
        match guard.front_mut() {
            Some(Pending::Unary(_)) => {
                if let Some(Pending::Unary(tx)) = guard.pop_front() {
                    let _ = tx.send(Ok(payload));
                }
            }
            Some(Pending::Stream(tx)) => {
                if is_stream_end {
                    guard.pop_front();
                    return;
                }
                let tx = tx.clone();
                drop(guard);
                let _ = tx.send(Ok(payload)).await;
            }
            None => {}
        }
    }

    async fn dispatch_error(pending: &Arc<Mutex<VecDeque<Pending>>>, message: String) {
        let mut guard = pending.lock().await;
        while let Some(responder) = guard.pop_front() {
            match responder {
                Pending::Unary(tx) => {
                    let _ = tx.send(Err(UtcpError::StreamError { code: None, message: message.clone() }));
                }
                Pending::Stream(tx) => {
                    let _ = tx
                        .send(Err(UtcpError::StreamError { code: None, message: message.clone() }))
                        .await;
                }
            }
        }
    }
}

fn parse_payload(text: &str) -> Value {
    serde_json::from_str::<Value>(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

#[async_trait]
impl ClientTransport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn register_tool_provider(&self, prov: &dyn Provider) -> Result<Vec<Tool>, UtcpError> {
        let ws_prov = prov
            .as_any()
            .downcast_ref::<WebSocketProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected a WebSocket provider".into()))?;

        let key = PoolKey::new(format!("{}:{}", ws_prov.url, ws_prov.base.name));
        let sink = self.sink.clone();
        let conn = self
            .pool
            .get(&key, || {
                let prov = ws_prov.clone();
                let sink = sink.clone();
                let key = key.0.clone();
                Self::connect(&prov, sink, key)
            })
            .await?;

        let (tx, rx) = oneshot::channel();
        conn.enqueue_raw(Pending::Unary(tx), "manual".to_string()).await?;
        let payload = rx
            .await
            .map_err(|_| UtcpError::ConnectFailed("connection closed before manual response".into()))??;

        let tools = payload
            .get("tools")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|t| serde_json::from_value::<Tool>(t.clone()).ok())
                    .map(|mut tool| {
                        tool.provider_name = Some(ws_prov.base.name.clone());
                        tool
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(tools)
    }

    async fn deregister_tool_provider(&self, prov: &dyn Provider) -> Result<(), UtcpError> {
        let ws_prov = prov
            .as_any()
            .downcast_ref::<WebSocketProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected a WebSocket provider".into()))?;
        let key = PoolKey::new(format!("{}:{}", ws_prov.url, ws_prov.base.name));
        self.pool.close(&key).await;
        Ok(())
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Value, UtcpError> {
        let ws_prov = prov
            .as_any()
            .downcast_ref::<WebSocketProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected a WebSocket provider".into()))?;

        let key = PoolKey::new(format!("{}:{}", ws_prov.url, ws_prov.base.name));
        let prov_clone = ws_prov.clone();
        let sink = self.sink.clone();
        let conn = self
            .pool
            .get(&key, || {
                let prov = prov_clone.clone();
                let sink = sink.clone();
                let key = key.0.clone();
                Self::connect(&prov, sink, key)
            })
            .await?;

        let envelope = json!({ "type": "tool_call", "tool": tool_name, "args": args });
        let (tx, rx) = oneshot::channel();
        conn.enqueue(Pending::Unary(tx), envelope).await?;
        self.pool.release(&key).await;
        rx.await
            .map_err(|_| UtcpError::ConnectFailed("connection closed before reply".into()))?
    }

    async fn call_tool_stream(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Box<dyn StreamResult>, UtcpError> {
        let ws_prov = prov
            .as_any()
            .downcast_ref::<WebSocketProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected a WebSocket provider".into()))?;

        let key = PoolKey::new(format!("{}:{}", ws_prov.url, ws_prov.base.name));
        let prov_clone = ws_prov.clone();
        let sink = self.sink.clone();
        let conn = self
            .pool
            .get(&key, || {
                let prov = prov_clone.clone();
                let sink = sink.clone();
                let key = key.0.clone();
                Self::connect(&prov, sink, key)
            })
            .await?;

        let envelope = json!({ "type": "tool_stream", "tool": tool_name, "args": args });
        let (raw_tx, mut raw_rx) = mpsc::channel(64);
        conn.enqueue(Pending::Stream(raw_tx), envelope).await?;

        let (tx, rx) = mpsc::channel(64);
        let tool = tool_name.to_string();
        let provider_name = ws_prov.base.name.clone();
        tokio::spawn(async move {
            let mut builder = ChunkBuilder::new(tool, provider_name, "websocket");
            while let Some(item) = raw_rx.recv().await {
                match item {
                    Ok(data) => {
                        if tx
                            .send(Ok(builder.data(data, crate::transports::stream::now_millis())))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Ok(builder.error(e.to_string(), None))).await;
                        return;
                    }
                }
            }
            let _ = tx.send(Ok(builder.end())).await;
        });

        Ok(boxed_channel_stream(rx, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ApiKeyAuth, AuthType, BasicAuth};
    use crate::providers::base::{BaseProvider, ProviderType};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    fn provider(url: String) -> WebSocketProvider {
        WebSocketProvider {
            base: BaseProvider::new("ws".to_string(), ProviderType::Websocket),
            url,
            protocol: None,
            keep_alive: false,
            headers: None,
        }
    }

    #[test]
    fn build_request_appends_api_key_query_param() {
        let mut prov = provider("ws://example.com/socket".to_string());
        prov.base.auth = Some(crate::auth::AuthConfig::ApiKey(ApiKeyAuth {
            auth_type: AuthType::ApiKey,
            api_key: "token".to_string(),
            var_name: "auth".to_string(),
            location: "query".to_string(),
        }));
        let req = WebSocketTransport::build_request(&prov).unwrap();
        assert!(req.uri().to_string().contains("auth=token"));
    }

    #[test]
    fn build_request_sets_basic_auth_header() {
        let mut prov = provider("ws://example.com".to_string());
        prov.base.auth = Some(crate::auth::AuthConfig::Basic(BasicAuth {
            auth_type: AuthType::Basic,
            username: "user".to_string(),
            password: "pass".to_string(),
        }));
        let req = WebSocketTransport::build_request(&prov).unwrap();
        assert_eq!(req.headers().get("authorization").unwrap(), "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn build_request_drops_unsafe_headers() {
        let mut prov = provider("ws://example.com".to_string());
        prov.headers = Some(HashMap::from([
            ("X-Custom".to_string(), "1".to_string()),
            ("X-Forwarded-Host".to_string(), "evil".to_string()),
        ]));
        let req = WebSocketTransport::build_request(&prov).unwrap();
        assert_eq!(req.headers().get("X-Custom").unwrap(), "1");
        assert!(req.headers().get("X-Forwarded-Host").is_none());
    }

    #[tokio::test]
    async fn register_and_call_over_pooled_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Text(text) if text == "manual" => {
                        let manifest = json!({
                            "tools": [{
                                "name": "echo",
                                "description": "echo tool",
                                "inputs": { "type": "object" },
                                "outputs": { "type": "object" },
                                "tags": []
                            }]
                        });
                        let _ = ws.send(Message::Text(manifest.to_string())).await;
                    }
                    Message::Text(text) => {
                        let parsed: Value = serde_json::from_str(&text).unwrap();
                        let reply = json!({ "echo": parsed.get("args") });
                        let _ = ws.send(Message::Text(reply.to_string())).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });

        let prov = provider(format!("ws://{addr}/tools"));
        let transport = WebSocketTransport::new();

        let tools = transport.register_tool_provider(&prov).await.expect("register");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].provider_name.as_deref(), Some("ws"));

        let mut args = HashMap::new();
        args.insert("msg".into(), Value::String("hi".into()));
        let result = transport.call_tool("echo", args.clone(), &prov).await.expect("call");
        assert_eq!(result, json!({ "echo": json!(args) }));
    }

    #[tokio::test]
    async fn pong_updates_last_ping_and_binary_frames_are_forwarded_unqueued() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // give the client a chance to subscribe before frames go out.
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = ws.send(Message::Pong(Vec::new())).await;
            let _ = ws.send(Message::Binary(b"raw-frame".to_vec())).await;
            while ws.next().await.is_some() {}
        });

        let prov = provider(format!("ws://{addr}/tools"));
        let sink: Arc<dyn EventSink> = Arc::new(crate::telemetry::NoopEventSink);
        let conn = WebSocketTransport::connect(&prov, sink, "k".to_string()).await.expect("connect");

        assert!(conn.last_ping().await.is_none());

        let mut binary_rx = conn.subscribe_binary();
        let frame = tokio::time::timeout(Duration::from_secs(2), binary_rx.recv())
            .await
            .expect("did not time out")
            .expect("binary frame forwarded");
        assert_eq!(frame, b"raw-frame".to_vec());

        assert!(conn.last_ping().await.is_some());
    }
}
