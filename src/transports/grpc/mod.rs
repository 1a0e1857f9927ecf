// gRPC Transport - Protocol Buffers RPC over a pooled tonic channel per host:port.
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tonic::metadata::{MetadataKey, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::Request;

use crate::auth::apply::apply_credentials;
use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::providers::grpc::GrpcProvider;
use crate::telemetry::{EventSink, NoopEventSink};
use crate::tools::{Tool, ToolInputOutputSchema};
use crate::transports::pool::{ConnectionPool, ConnectionState, PoolConfig, PoolKey, PooledConnection};
use crate::transports::{
    stream::{boxed_channel_stream, now_millis, ChunkBuilder, StreamResult},
    ClientTransport,
};

use crate::grpcpb::utcp_client::UtcpClient;
use crate::grpcpb::{CallToolRequest, CallToolStreamRequest, GetManualRequest};

const STATE_CONNECTED: u8 = 0;
const STATE_DISCONNECTED: u8 = 1;

struct GrpcConnection {
    channel: Channel,
    state: AtomicU8,
    closed: AtomicBool,
}

#[async_trait]
impl PooledConnection for GrpcConnection {
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

pub struct GrpcTransport {
    pool: Arc<ConnectionPool<GrpcConnection>>,
}

impl Default for GrpcTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl GrpcTransport {
    pub fn new() -> Self {
        Self::with_sink(Arc::new(NoopEventSink))
    }

    pub fn with_sink(sink: Arc<dyn EventSink>) -> Self {
        Self { pool: Arc::new(ConnectionPool::new(PoolConfig::default(), sink, "grpc")) }
    }

    fn default_schema() -> ToolInputOutputSchema {
        ToolInputOutputSchema {
            type_: "object".to_string(),
            properties: None,
            required: None,
            description: None,
            title: None,
            items: None,
            enum_: None,
            minimum: None,
            maximum: None,
            format: None,
        }
    }

    async fn client(&self, prov: &GrpcProvider) -> Result<UtcpClient<Channel>, UtcpError> {
        if prov.use_ssl {
            return Err(UtcpError::ConnectFailed("TLS for gRPC transport is not configured yet".into()));
        }
        let key = PoolKey::new(format!("{}:{}", prov.host, prov.port));
        let endpoint = format!("http://{}:{}", prov.host, prov.port);
        let conn = self
            .pool
            .get(&key, || async {
                let channel = Endpoint::from_shared(endpoint.clone())
                    .map_err(|e| UtcpError::ConnectFailed(e.to_string()))?
                    .connect()
                    .await
                    .map_err(|e| UtcpError::ConnectFailed(e.to_string()))?;
                Ok(GrpcConnection { channel, state: AtomicU8::new(STATE_CONNECTED), closed: AtomicBool::new(false) })
            })
            .await?;
        Ok(UtcpClient::new(conn.channel.clone()))
    }

    fn apply_auth<T>(&self, prov: &GrpcProvider, req: &mut Request<T>) -> Result<(), UtcpError> {
        let Some(auth) = &prov.base.auth else { return Ok(()) };
        let applied = apply_credentials(auth)?;
        for (name, value) in applied.headers {
            let key = MetadataKey::from_bytes(name.to_lowercase().as_bytes())
                .map_err(|e| UtcpError::Authentication(e.to_string()))?;
            let value = MetadataValue::try_from(value.as_str()).map_err(|e| UtcpError::Authentication(e.to_string()))?;
            req.metadata_mut().insert(key, value);
        }
        Ok(())
    }
}

#[async_trait]
impl ClientTransport for GrpcTransport {
    fn name(&self) -> &'static str {
        "grpc"
    }

    async fn register_tool_provider(&self, prov: &dyn Provider) -> Result<Vec<Tool>, UtcpError> {
        let grpc_prov = prov
            .as_any()
            .downcast_ref::<GrpcProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected a gRPC provider".into()))?;

        let mut client = self.client(grpc_prov).await?;
        let mut request = Request::new(GetManualRequest {});
        self.apply_auth(grpc_prov, &mut request)?;

        let manual = client
            .get_manual(request)
            .await
            .map_err(|status| UtcpError::RemoteError { code: status.code() as i64, message: status.message().to_string() })?
            .into_inner();
        let default_schema = Self::default_schema();

        let tools = manual
            .tools
            .into_iter()
            .map(|t| Tool {
                name: t.name,
                description: t.description,
                inputs: serde_json::from_str(&t.inputs_json).unwrap_or_else(|_| default_schema.clone()),
                outputs: serde_json::from_str(&t.outputs_json).unwrap_or_else(|_| default_schema.clone()),
                tags: t.tags,
                average_response_size: None,
                provider_name: Some(grpc_prov.base.name.clone()),
            })
            .collect();

        Ok(tools)
    }

    async fn deregister_tool_provider(&self, prov: &dyn Provider) -> Result<(), UtcpError> {
        let grpc_prov = prov
            .as_any()
            .downcast_ref::<GrpcProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected a gRPC provider".into()))?;
        self.pool.close(&PoolKey::new(format!("{}:{}", grpc_prov.host, grpc_prov.port))).await;
        Ok(())
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Value, UtcpError> {
        let grpc_prov = prov
            .as_any()
            .downcast_ref::<GrpcProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected a gRPC provider".into()))?;

        let mut client = self.client(grpc_prov).await?;
        let args_json = serde_json::to_string(&args).map_err(|e| UtcpError::EncodeFailed(e.to_string()))?;

        let mut request = Request::new(CallToolRequest { tool_name: tool_name.to_string(), args_json });
        self.apply_auth(grpc_prov, &mut request)?;

        let response = client
            .call_tool(request)
            .await
            .map_err(|status| UtcpError::RemoteError { code: status.code() as i64, message: status.message().to_string() })?
            .into_inner();

        if response.result_json.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&response.result_json).unwrap_or_else(|_| Value::String(response.result_json.clone())))
    }

    async fn call_tool_stream(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Box<dyn StreamResult>, UtcpError> {
        let grpc_prov = prov
            .as_any()
            .downcast_ref::<GrpcProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected a gRPC provider".into()))?;

        let mut client = self.client(grpc_prov).await?;
        let args_json = serde_json::to_string(&args).map_err(|e| UtcpError::EncodeFailed(e.to_string()))?;

        let mut request = Request::new(CallToolStreamRequest { tool_name: tool_name.to_string(), args_json });
        self.apply_auth(grpc_prov, &mut request)?;

        let mut stream = client
            .call_tool_stream(request)
            .await
            .map_err(|status| UtcpError::RemoteError { code: status.code() as i64, message: status.message().to_string() })?
            .into_inner();

        let (tx, rx) = mpsc::channel(16);
        let tool = tool_name.to_string();
        let provider = grpc_prov.base.name.clone();
        tokio::spawn(async move {
            let mut builder = ChunkBuilder::new(tool, provider, "grpc");
            loop {
                match stream.message().await {
                    Ok(Some(chunk)) => {
                        if chunk.is_end {
                            let _ = tx.send(Ok(builder.end())).await;
                            return;
                        }
                        if !chunk.error_message.is_empty() {
                            let _ = tx.send(Ok(builder.error(chunk.error_message, Some(chunk.error_code)))).await;
                            return;
                        }
                        let parsed = serde_json::from_str::<Value>(&chunk.data_json).unwrap_or(Value::Null);
                        if tx.send(Ok(builder.data(parsed, now_millis()))).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send(Ok(builder.end())).await;
                        return;
                    }
                    Err(status) => {
                        let _ = tx
                            .send(Ok(builder.error(status.message().to_string(), Some(status.code() as i64))))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(boxed_channel_stream(rx, None))
    }
}
