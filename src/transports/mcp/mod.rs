// MCP (Model Context Protocol) Transport
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::auth::apply::apply_credentials;
use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::providers::mcp::McpProvider;
use crate::tools::Tool;
use crate::transports::stream::{boxed_channel_stream, now_millis, ChunkBuilder, StreamChunk, StreamResult};
use crate::transports::ClientTransport;

const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport for MCP servers exposed over HTTP, speaking JSON-RPC 2.0.
pub struct McpTransport {
    client: Client,
    next_id: AtomicI64,
}

impl Default for McpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl McpTransport {
    pub fn new() -> Self {
        Self { client: Client::new(), next_id: AtomicI64::new(1) }
    }

    async fn mcp_request(&self, prov: &McpProvider, method: &str, params: Value) -> Result<Value, UtcpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let mut req = self.client.post(&prov.url).json(&request);
        if let Some(headers) = &prov.headers {
            for (k, v) in headers {
                req = req.header(k, v);
            }
        }
        if let Some(auth) = &prov.base.auth {
            let applied = apply_credentials(auth)?;
            for (name, value) in applied.headers {
                req = req.header(name, value);
            }
            for (name, value) in applied.query {
                req = req.query(&[(name, value)]);
            }
        }

        let response = req.send().await.map_err(|e| UtcpError::ConnectFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(UtcpError::RemoteError {
                code: response.status().as_u16() as i64,
                message: format!("MCP request failed: {}", response.status()),
            });
        }

        let result: Value = response.json().await.map_err(|e| UtcpError::DecodeFailed(e.to_string()))?;

        if let Some(error) = result.get("error") {
            let code = error.get("code").and_then(|v| v.as_i64()).unwrap_or(0);
            let message = error.get("message").and_then(|v| v.as_str()).unwrap_or("MCP error").to_string();
            return Err(UtcpError::RemoteError { code, message });
        }

        result
            .get("result")
            .cloned()
            .ok_or_else(|| UtcpError::DecodeFailed("no result in MCP response".into()))
    }

    /// Issues `tools/call` asking for a streamed response (the MCP Streamable HTTP
    /// transport's `text/event-stream` mode) and adapts the SSE body of JSON-RPC
    /// notifications/response into the stream contract.
    async fn mcp_request_stream(
        &self,
        prov: &McpProvider,
        tool_name: &str,
        args: HashMap<String, Value>,
    ) -> Result<Box<dyn StreamResult>, UtcpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "tools/call",
            "params": { "name": tool_name, "arguments": args },
            "id": id,
        });

        let mut req = self.client.post(&prov.url).header("accept", "text/event-stream").json(&request);
        if let Some(headers) = &prov.headers {
            for (k, v) in headers {
                req = req.header(k, v);
            }
        }
        if let Some(auth) = &prov.base.auth {
            let applied = apply_credentials(auth)?;
            for (name, value) in applied.headers {
                req = req.header(name, value);
            }
            for (name, value) in applied.query {
                req = req.query(&[(name, value)]);
            }
        }

        let response = req.send().await.map_err(|e| UtcpError::ConnectFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(UtcpError::RemoteError {
                code: response.status().as_u16() as i64,
                message: format!("MCP request failed: {}", response.status()),
            });
        }

        let byte_stream = response.bytes_stream();
        let rx = self.spawn_sse_reader(byte_stream, tool_name.to_string(), prov.base.name.clone(), id);
        Ok(boxed_channel_stream(rx, None))
    }

    /// Reads the SSE body of an MCP streaming response. Each `data:` frame carries a
    /// JSON-RPC message: progress notifications become data chunks, and the final
    /// response matching `id` (result or error) terminates the stream.
    fn spawn_sse_reader(
        &self,
        mut stream: impl futures::Stream<Item = Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
        tool: String,
        provider: String,
        request_id: i64,
    ) -> mpsc::Receiver<Result<StreamChunk, UtcpError>> {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut builder = ChunkBuilder::new(tool, provider, "mcp");
            let mut buffer = String::new();

            loop {
                let next = tokio::time::timeout(STREAM_IDLE_TIMEOUT, stream.next()).await;
                let chunk_res = match next {
                    Ok(Some(res)) => res,
                    Ok(None) => {
                        let _ = tx.send(Ok(builder.end())).await;
                        return;
                    }
                    Err(_) => {
                        let _ = tx.send(Ok(builder.error("no event within timeout", None))).await;
                        return;
                    }
                };

                let bytes = match chunk_res {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Ok(builder.error(e.to_string(), None))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                loop {
                    let Some(pos) = buffer.find("\n\n") else { break };
                    let event = buffer[..pos].to_string();
                    buffer.drain(..pos + 2);

                    let mut data = String::new();
                    for line in event.lines() {
                        if let Some(payload) = line.strip_prefix("data:") {
                            if !data.is_empty() {
                                data.push('\n');
                            }
                            data.push_str(payload.trim_start());
                        }
                    }
                    if data.is_empty() {
                        continue;
                    }

                    let message: Value = match serde_json::from_str(&data) {
                        Ok(v) => v,
                        Err(e) => {
                            let _ = tx.send(Ok(builder.error(e.to_string(), None))).await;
                            return;
                        }
                    };

                    let is_final = message.get("id").and_then(|v| v.as_i64()) == Some(request_id);
                    if !is_final {
                        // A notification (e.g. `notifications/progress`); forward its
                        // params as an incremental chunk.
                        let payload = message.get("params").cloned().unwrap_or(Value::Null);
                        if tx.send(Ok(builder.data(payload, now_millis()))).await.is_err() {
                            return;
                        }
                        continue;
                    }

                    if let Some(error) = message.get("error") {
                        let code = error.get("code").and_then(|v| v.as_i64());
                        let msg = error.get("message").and_then(|v| v.as_str()).unwrap_or("MCP error").to_string();
                        let _ = tx.send(Ok(builder.error(msg, code))).await;
                        return;
                    }

                    let result = message.get("result").cloned().unwrap_or(Value::Null);
                    if tx.send(Ok(builder.data(result, now_millis()))).await.is_err() {
                        return;
                    }
                    let _ = tx.send(Ok(builder.end())).await;
                    return;
                }
            }
        });
        rx
    }
}

#[async_trait]
impl ClientTransport for McpTransport {
    fn name(&self) -> &'static str {
        "mcp"
    }

    async fn register_tool_provider(&self, prov: &dyn Provider) -> Result<Vec<Tool>, UtcpError> {
        let mcp_prov = prov
            .as_any()
            .downcast_ref::<McpProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected an MCP provider".into()))?;

        let params = serde_json::json!({ "cursor": null });
        let result = self.mcp_request(mcp_prov, "tools/list", params).await?;

        let tools = result
            .get("tools")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|t| serde_json::from_value::<Tool>(t.clone()).ok())
                    .map(|mut tool| {
                        tool.provider_name = Some(mcp_prov.base.name.clone());
                        tool
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(tools)
    }

    async fn deregister_tool_provider(&self, _prov: &dyn Provider) -> Result<(), UtcpError> {
        Ok(())
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Value, UtcpError> {
        let mcp_prov = prov
            .as_any()
            .downcast_ref::<McpProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected an MCP provider".into()))?;

        let params = serde_json::json!({ "name": tool_name, "arguments": args });
        self.mcp_request(mcp_prov, "tools/call", params).await
    }

    async fn call_tool_stream(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Box<dyn StreamResult>, UtcpError> {
        let mcp_prov = prov
            .as_any()
            .downcast_ref::<McpProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected an MCP provider".into()))?;

        self.mcp_request_stream(mcp_prov, tool_name, args).await
    }
}
