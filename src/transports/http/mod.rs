use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{header, Client};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::auth::apply::apply_credentials;
use crate::auth::AuthConfig;
use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::providers::http::HttpProvider;
use crate::tools::Tool;
use crate::transports::stream::{boxed_channel_stream, now_millis, ChunkBuilder, StreamChunk, StreamResult};
use crate::transports::ClientTransport;

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP transport, unary and SSE-streaming. Retries network errors and 5xx with
/// exponential backoff; 4xx responses are never retried.
pub struct HttpClientTransport {
    pub client: Client,
}

impl Default for HttpClientTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClientTransport {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .gzip(true)
            .http2_adaptive_window(true)
            .http2_keep_alive_interval(Some(Duration::from_secs(10)))
            .http2_keep_alive_timeout(Duration::from_secs(20))
            .http2_keep_alive_while_idle(true)
            .build()
            .expect("failed to build HTTP client");

        Self { client }
    }

    fn apply_auth(
        &self,
        mut builder: reqwest::RequestBuilder,
        auth: &AuthConfig,
    ) -> Result<reqwest::RequestBuilder, UtcpError> {
        let applied = apply_credentials(auth)?;
        for (name, value) in applied.headers {
            builder = builder.header(name, value);
        }
        for (name, value) in applied.query {
            builder = builder.query(&[(name, value)]);
        }
        Ok(builder)
    }

    fn substitute_path_params(url: &str, args: &HashMap<String, Value>) -> String {
        let mut out = url.to_string();
        for (key, value) in args {
            let placeholder = format!("{{{key}}}");
            if out.contains(&placeholder) {
                out = out.replace(&placeholder, &value.to_string());
            }
        }
        out
    }

    /// Send `build_request` with exponential backoff for network errors and 5xx
    /// responses; 4xx is returned immediately.
    async fn send_with_retry(
        &self,
        build_request: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, UtcpError> {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 0;
        loop {
            let result = build_request().send().await;
            match result {
                Ok(response) if response.status().is_server_error() => {
                    if attempt >= MAX_RETRIES {
                        return Err(UtcpError::RemoteError {
                            code: response.status().as_u16() as i64,
                            message: response.status().to_string(),
                        });
                    }
                }
                Ok(response) => return Ok(response),
                Err(e) => {
                    if attempt >= MAX_RETRIES {
                        return Err(UtcpError::ConnectFailed(e.to_string()));
                    }
                }
            }
            tokio::time::sleep(delay).await;
            delay *= 2;
            attempt += 1;
        }
    }

    fn spawn_sse_reader(
        &self,
        mut stream: impl futures::Stream<Item = Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
        tool: String,
        provider: String,
    ) -> mpsc::Receiver<Result<StreamChunk, UtcpError>> {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut builder = ChunkBuilder::new(tool, provider, "http");
            let mut buffer = String::new();

            loop {
                let next = tokio::time::timeout(SSE_IDLE_TIMEOUT, stream.next()).await;
                let chunk_res = match next {
                    Ok(Some(res)) => res,
                    Ok(None) => {
                        let _ = tx.send(Ok(builder.end())).await;
                        return;
                    }
                    Err(_) => {
                        let _ = tx
                            .send(Ok(builder.error("no event within timeout", None)))
                            .await;
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
                        if line.starts_with(':')
                            || line.starts_with("event:")
                            || line.starts_with("id:")
                            || line.starts_with("retry:")
                        {
                            continue;
                        }
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
                    if data == "[DONE]" {
                        let _ = tx.send(Ok(builder.end())).await;
                        return;
                    }
                    let value = serde_json::from_str::<Value>(&data)
                        .unwrap_or_else(|_| Value::String(data.clone()));
                    if tx.send(Ok(builder.data(value, now_millis()))).await.is_err() {
                        return;
                    }
                }
            }
        });
        rx
    }
}

#[async_trait]
impl ClientTransport for HttpClientTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn register_tool_provider(&self, prov: &dyn Provider) -> Result<Vec<Tool>, UtcpError> {
        let http_prov = prov
            .as_any()
            .downcast_ref::<HttpProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected an HTTP provider".into()))?;

        let response = self
            .send_with_retry(|| {
                let mut builder = self.client.get(&http_prov.url);
                if let Some(headers) = &http_prov.headers {
                    for (key, value) in headers {
                        builder = builder.header(key, value);
                    }
                }
                if let Some(auth) = &http_prov.base.auth {
                    builder = self.apply_auth(builder, auth).unwrap_or(builder);
                }
                builder
            })
            .await?;

        if !response.status().is_success() {
            return Err(UtcpError::RemoteError {
                code: response.status().as_u16() as i64,
                message: format!("failed to fetch tools from {}", http_prov.url),
            });
        }

        let body_text = response
            .text()
            .await
            .map_err(|e| UtcpError::DecodeFailed(e.to_string()))?;

        if let Ok(manifest) = serde_json::from_str::<Value>(&body_text) {
            if let Some(tools_array) = manifest.get("tools").and_then(|v| v.as_array()) {
                let tools = tools_array
                    .iter()
                    .filter_map(|v| serde_json::from_value::<Tool>(v.clone()).ok())
                    .map(|mut t| {
                        t.provider_name = Some(http_prov.base.name.clone());
                        t
                    })
                    .collect();
                return Ok(tools);
            }
        }

        Ok(vec![])
    }

    async fn deregister_tool_provider(&self, _prov: &dyn Provider) -> Result<(), UtcpError> {
        Ok(())
    }

    async fn call_tool(
        &self,
        _tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Value, UtcpError> {
        let http_prov = prov
            .as_any()
            .downcast_ref::<HttpProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected an HTTP provider".into()))?;

        let url = Self::substitute_path_params(&http_prov.url, &args);
        let method_upper = http_prov.http_method.to_uppercase();

        let build = || -> Result<reqwest::RequestBuilder, UtcpError> {
            let mut builder = match method_upper.as_str() {
                "GET" => self.client.get(&url),
                "POST" => self.client.post(&url),
                "PUT" => self.client.put(&url),
                "DELETE" => self.client.delete(&url),
                "PATCH" => self.client.patch(&url),
                other => return Err(UtcpError::InvalidProvider(format!("unsupported HTTP method: {other}"))),
            };
            if let Some(headers) = &http_prov.headers {
                for (key, value) in headers {
                    builder = builder.header(key, value);
                }
            }
            if let Some(auth) = &http_prov.base.auth {
                builder = self.apply_auth(builder, auth)?;
            }
            if matches!(method_upper.as_str(), "POST" | "PUT" | "PATCH") {
                builder = builder.json(&args);
            } else {
                for (key, value) in &args {
                    builder = builder.query(&[(key, value.to_string())]);
                }
            }
            Ok(builder)
        };

        build()?; // validate method/auth before entering the retry loop
        let response = self
            .send_with_retry(|| build().expect("validated above"))
            .await?;

        if !response.status().is_success() {
            return Err(UtcpError::RemoteError {
                code: response.status().as_u16() as i64,
                message: response.status().to_string(),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| UtcpError::DecodeFailed(e.to_string()))
    }

    async fn call_tool_stream(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Box<dyn StreamResult>, UtcpError> {
        let http_prov = prov
            .as_any()
            .downcast_ref::<HttpProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected an HTTP provider".into()))?;

        let url = Self::substitute_path_params(&http_prov.url, &args);
        let mut builder = self
            .client
            .post(&url)
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .timeout(Duration::MAX);
        if let Some(headers) = &http_prov.headers {
            for (key, value) in headers {
                builder = builder.header(key, value);
            }
        }
        if let Some(auth) = &http_prov.base.auth {
            builder = self.apply_auth(builder, auth)?;
        }

        let response = builder
            .json(&args)
            .send()
            .await
            .map_err(|e| UtcpError::ConnectFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(UtcpError::RemoteError {
                code: response.status().as_u16() as i64,
                message: "SSE request failed".into(),
            });
        }

        let rx = self.spawn_sse_reader(
            response.bytes_stream(),
            tool_name.to_string(),
            http_prov.base.name.clone(),
        );
        Ok(boxed_channel_stream(rx, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ApiKeyAuth, AuthType, BasicAuth};
    use crate::providers::base::{BaseProvider, ProviderType};
    use axum::{body::Body, extract::Json, http::Response, routing::get, routing::post, Router};
    use bytes::Bytes;
    use serde_json::json;
    use std::net::TcpListener;

    #[test]
    fn apply_auth_handles_api_key_header() {
        let transport = HttpClientTransport::new();
        let header_auth = AuthConfig::ApiKey(ApiKeyAuth {
            auth_type: AuthType::ApiKey,
            api_key: "secret".to_string(),
            var_name: "X-Key".to_string(),
            location: "header".to_string(),
        });
        let request = transport
            .apply_auth(reqwest::Client::new().get("http://example.com"), &header_auth)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(request.headers().get("X-Key").unwrap(), "secret");
    }

    #[test]
    fn apply_auth_sets_basic_auth_header() {
        let transport = HttpClientTransport::new();
        let auth = AuthConfig::Basic(BasicAuth {
            auth_type: AuthType::Basic,
            username: "user".to_string(),
            password: "pass".to_string(),
        });

        let request = transport
            .apply_auth(reqwest::Client::new().get("http://example.com"), &auth)
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(
            request.headers().get(header::AUTHORIZATION).unwrap(),
            "Basic dXNlcjpwYXNz"
        );
    }

    #[tokio::test]
    async fn register_and_call_http_transport() {
        async fn manifest_handler() -> Json<Value> {
            Json(json!({
                "tools": [{
                    "name": "greet",
                    "description": "says hello",
                    "inputs": { "type": "object" },
                    "outputs": { "type": "object" },
                    "tags": []
                }]
            }))
        }

        async fn call_handler(Json(payload): Json<Value>) -> Json<Value> {
            Json(json!({ "echo": payload }))
        }

        let app = Router::new()
            .route("/", get(manifest_handler))
            .route("/", post(call_handler));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::Server::from_tcp(listener)
                .unwrap()
                .serve(app.into_make_service())
                .await
                .unwrap();
        });

        let base_url = format!("http://{addr}");
        let provider = HttpProvider {
            base: BaseProvider::new("http".to_string(), ProviderType::Http),
            http_method: "POST".to_string(),
            url: base_url.clone(),
            content_type: None,
            headers: None,
        };

        let transport = HttpClientTransport::new();
        let tools = transport
            .register_tool_provider(&provider)
            .await
            .expect("register tools");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].provider_name.as_deref(), Some("http"));

        let mut args = HashMap::new();
        args.insert("name".into(), Value::String("http".into()));
        let result = transport
            .call_tool("ignored", args.clone(), &provider)
            .await
            .expect("call tool");
        assert_eq!(result, json!({ "echo": json!(args) }));
    }

    #[tokio::test]
    async fn sse_stream_ends_on_done_sentinel() {
        async fn sse_handler() -> Response<Body> {
            let stream = tokio_stream::iter(vec![
                Ok::<Bytes, std::convert::Infallible>(Bytes::from_static(b"data: {\"idx\":1}\n\n")),
                Ok(Bytes::from_static(b"data: [DONE]\n\n")),
            ]);
            Response::builder()
                .header("content-type", "text/event-stream")
                .body(Body::wrap_stream(stream))
                .unwrap()
        }

        let app = Router::new().route("/", post(sse_handler));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::Server::from_tcp(listener)
                .unwrap()
                .serve(app.into_make_service())
                .await
                .unwrap();
        });

        let provider = HttpProvider {
            base: BaseProvider::new("sse".to_string(), ProviderType::Http),
            http_method: "POST".to_string(),
            url: format!("http://{addr}"),
            content_type: None,
            headers: None,
        };

        let transport = HttpClientTransport::new();
        let mut stream = transport
            .call_tool_stream("sse.tool1", HashMap::new(), &provider)
            .await
            .expect("stream");

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.sequence(), 0);
        assert!(!first.is_terminal());

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.is_terminal());
        assert!(matches!(second, StreamChunk::End { .. }));
    }
}
