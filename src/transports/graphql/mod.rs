// GraphQL Transport - queries, mutations, and subscriptions
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::auth::apply::apply_credentials;
use crate::auth::AuthConfig;
use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::providers::graphql::GraphqlProvider;
use crate::tools::{Tool, ToolInputOutputSchema};
use crate::transports::{
    stream::{boxed_channel_stream, now_millis, ChunkBuilder, StreamResult},
    ClientTransport,
};

/// Transport that maps GraphQL operations to UTCP tools. Subscriptions run over a
/// one-shot `graphql-transport-ws` connection per call; unary queries and mutations
/// go through a `reqwest::Client` pooled per provider, so repeated calls against the
/// same provider reuse its idle HTTP connections instead of opening new ones.
pub struct GraphQLTransport {
    clients: RwLock<HashMap<String, Client>>,
}

impl Default for GraphQLTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphQLTransport {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    fn client_for(&self, provider_name: &str) -> Client {
        if let Some(client) = self.clients.read().expect("graphql client pool lock poisoned").get(provider_name) {
            return client.clone();
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .build()
            .expect("failed to build HTTP client");

        self.clients
            .write()
            .expect("graphql client pool lock poisoned")
            .insert(provider_name.to_string(), client.clone());
        client
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

    fn infer_operation(operation_type: &str, tool_name: &str) -> String {
        let op = operation_type.trim().to_lowercase();
        match op.as_str() {
            "query" | "mutation" | "subscription" => return op,
            _ => {}
        }

        let tool = tool_name.to_lowercase();
        if tool.starts_with("subscription") || tool.starts_with("subscribe") || tool.starts_with("on_") {
            return "subscription".to_string();
        }
        if tool.starts_with("mutation")
            || tool.starts_with("create")
            || tool.starts_with("update")
            || tool.starts_with("delete")
        {
            return "mutation".to_string();
        }

        "query".to_string()
    }

    fn normalize_arg_value(key: &str, value: Value) -> (String, Value) {
        match value {
            Value::Bool(_) => ("Boolean!".to_string(), value),
            Value::Number(num) => {
                if let Some(int_val) = num.as_i64() {
                    if int_val >= i64::from(i32::MIN) && int_val <= i64::from(i32::MAX) {
                        return ("Int!".to_string(), Value::Number(num));
                    }
                }
                ("Float!".to_string(), Value::Number(num))
            }
            Value::String(s) => {
                let maybe_id = key.to_ascii_lowercase().ends_with("_id");
                let type_name = if maybe_id { "ID!" } else { "String!" };
                (type_name.to_string(), Value::String(s))
            }
            Value::Array(_) | Value::Object(_) => {
                let serialized = value.to_string();
                ("String!".to_string(), Value::String(serialized))
            }
            Value::Null => ("String".to_string(), Value::Null),
        }
    }

    fn build_operation(operation_type: &str, operation_name: &str, call_name: &str, args: HashMap<String, Value>) -> (String, HashMap<String, Value>) {
        let mut arg_defs = Vec::new();
        let mut arg_uses = Vec::new();
        let mut variables = HashMap::new();

        for (key, value) in args {
            let (type_name, normalized_value) = Self::normalize_arg_value(&key, value);
            arg_defs.push(format!("${key}: {type_name}"));
            arg_uses.push(format!("{key}: ${key}"));
            variables.insert(key, normalized_value);
        }

        let query = if !arg_defs.is_empty() {
            format!(
                "{operation_type} {operation_name}({}) {{ {call_name}({}) }}",
                arg_defs.join(", "),
                arg_uses.join(", ")
            )
        } else {
            format!("{operation_type} {{ {call_name} }}")
        };

        (query, variables)
    }

    async fn execute_query(
        &self,
        prov: &GraphqlProvider,
        query: &str,
        variables: HashMap<String, Value>,
    ) -> Result<Value, UtcpError> {
        let client = self.client_for(&prov.base.name);
        let mut req = client
            .post(&prov.url)
            .json(&json!({ "query": query, "variables": variables }));
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
                message: format!("GraphQL request failed: {}", response.status()),
            });
        }

        let result: Value = response.json().await.map_err(|e| UtcpError::DecodeFailed(e.to_string()))?;
        if let Some(errors) = result.get("errors") {
            return Err(UtcpError::RemoteError { code: 0, message: format!("GraphQL errors: {errors}") });
        }

        result
            .get("data")
            .cloned()
            .ok_or_else(|| UtcpError::DecodeFailed("no data in GraphQL response".into()))
    }
}

#[async_trait]
impl ClientTransport for GraphQLTransport {
    fn name(&self) -> &'static str {
        "graphql"
    }

    async fn register_tool_provider(&self, prov: &dyn Provider) -> Result<Vec<Tool>, UtcpError> {
        let gql_prov = prov
            .as_any()
            .downcast_ref::<GraphqlProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected a GraphQL provider".into()))?;

        let introspection = r#"
        query IntrospectionQuery {
          __schema {
            queryType { fields { name description } }
            mutationType { fields { name description } }
            subscriptionType { fields { name description } }
          }
        }"#;

        let response = match self.execute_query(gql_prov, introspection, HashMap::new()).await {
            Ok(v) => v,
            Err(_) => return Ok(vec![]),
        };

        let mut tools = Vec::new();
        let default_schema = Self::default_schema();

        if let Some(schema) = response.get("__schema") {
            for (op_type, key) in [
                ("query", "queryType"),
                ("mutation", "mutationType"),
                ("subscription", "subscriptionType"),
            ] {
                if let Some(fields) = schema.get(key).and_then(|v| v.get("fields")).and_then(|v| v.as_array()) {
                    for field in fields {
                        if let Some(name) = field.get("name").and_then(|v| v.as_str()) {
                            let description = field
                                .get("description")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string();
                            tools.push(Tool {
                                name: name.to_string(),
                                description,
                                inputs: default_schema.clone(),
                                outputs: default_schema.clone(),
                                tags: vec![op_type.to_string()],
                                average_response_size: None,
                                provider_name: Some(gql_prov.base.name.clone()),
                            });
                        }
                    }
                }
            }
        }

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
        let gql_prov = prov
            .as_any()
            .downcast_ref::<GraphqlProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected a GraphQL provider".into()))?;

        let call_name = tool_name.strip_prefix(&format!("{}.", gql_prov.base.name)).unwrap_or(tool_name);
        let operation_type = Self::infer_operation(&gql_prov.operation_type, call_name);
        let operation_name = gql_prov.operation_name.clone().unwrap_or_else(|| call_name.to_string());

        let (query, variables) = Self::build_operation(&operation_type, &operation_name, call_name, args);
        self.execute_query(gql_prov, &query, variables).await
    }

    async fn call_tool_stream(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Box<dyn StreamResult>, UtcpError> {
        let gql_prov = prov
            .as_any()
            .downcast_ref::<GraphqlProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected a GraphQL provider".into()))?;

        let call_name = tool_name.strip_prefix(&format!("{}.", gql_prov.base.name)).unwrap_or(tool_name);
        let operation_type = Self::infer_operation(&gql_prov.operation_type, call_name);

        if operation_type != "subscription" {
            return Err(UtcpError::InvalidProvider(format!(
                "call_tool_stream is only for GraphQL subscriptions; '{call_name}' is a {operation_type}"
            )));
        }

        let operation_name = gql_prov.operation_name.clone().unwrap_or_else(|| call_name.to_string());
        let (subscription_query, variables) = Self::build_operation(&operation_type, &operation_name, call_name, args);

        let mut ws_url = gql_prov.url.replace("http://", "ws://").replace("https://", "wss://");
        let mut extra_headers: Vec<(String, String)> = Vec::new();
        if let Some(auth) = &gql_prov.base.auth {
            let applied = apply_credentials(auth)?;
            extra_headers.extend(applied.headers);
            for (name, value) in applied.query {
                let separator = if ws_url.contains('?') { "&" } else { "?" };
                ws_url = format!("{ws_url}{separator}{name}={value}");
            }
        }

        let mut req = tokio_tungstenite::tungstenite::http::Request::builder()
            .uri(&ws_url)
            .header("Host", ws_url.split('/').nth(2).unwrap_or("localhost"))
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", tokio_tungstenite::tungstenite::handshake::client::generate_key())
            .header("Sec-WebSocket-Protocol", "graphql-transport-ws")
            .body(())
            .map_err(|e| UtcpError::InvalidProvider(format!("invalid subscription request: {e}")))?;

        for (name, value) in extra_headers {
            use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| UtcpError::InvalidProvider(format!("invalid header name: {name}")))?;
            let header_value =
                HeaderValue::from_str(&value).map_err(|_| UtcpError::InvalidProvider("invalid header value".into()))?;
            req.headers_mut().insert(header_name, header_value);
        }
        if let Some(headers) = &gql_prov.headers {
            use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
            for (k, v) in headers {
                let name = HeaderName::from_bytes(k.as_bytes())
                    .map_err(|_| UtcpError::InvalidProvider(format!("invalid header name: {k}")))?;
                let value = HeaderValue::from_str(v)
                    .map_err(|_| UtcpError::InvalidProvider(format!("invalid header value: {v}")))?;
                req.headers_mut().insert(name, value);
            }
        }

        let (mut ws_stream, _) = connect_async(req).await.map_err(|e| UtcpError::ConnectFailed(e.to_string()))?;

        ws_stream
            .send(Message::Text(json!({ "type": "connection_init" }).to_string()))
            .await
            .map_err(|e| UtcpError::ConnectFailed(e.to_string()))?;

        if let Some(msg) = ws_stream.next().await {
            let msg = msg.map_err(|e| UtcpError::ConnectFailed(e.to_string()))?;
            match msg {
                Message::Text(text) => {
                    let ack: Value = serde_json::from_str(&text).map_err(|e| UtcpError::DecodeFailed(e.to_string()))?;
                    if ack.get("type").and_then(|v| v.as_str()) != Some("connection_ack") {
                        return Err(UtcpError::ConnectFailed(format!("expected connection_ack, got: {text}")));
                    }
                }
                _ => return Err(UtcpError::ConnectFailed("expected text message for connection_ack".into())),
            }
        }

        let subscribe_msg = json!({
            "id": "1",
            "type": "subscribe",
            "payload": { "query": subscription_query, "variables": variables },
        });
        ws_stream
            .send(Message::Text(subscribe_msg.to_string()))
            .await
            .map_err(|e| UtcpError::ConnectFailed(e.to_string()))?;

        let (tx, rx) = mpsc::channel(256);
        let tool = call_name.to_string();
        let provider_name = gql_prov.base.name.clone();
        tokio::spawn(async move {
            let mut builder = ChunkBuilder::new(tool, provider_name, "graphql");
            while let Some(msg) = ws_stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let parsed = match serde_json::from_str::<Value>(&text) {
                            Ok(v) => v,
                            Err(e) => {
                                let _ = tx.send(Ok(builder.error(e.to_string(), None))).await;
                                return;
                            }
                        };

                        match parsed.get("type").and_then(|v| v.as_str()) {
                            Some("next") => {
                                if let Some(payload) = parsed.get("payload") {
                                    if let Some(data) = payload.get("data") {
                                        if tx.send(Ok(builder.data(data.clone(), now_millis()))).await.is_err() {
                                            return;
                                        }
                                    }
                                    if let Some(errors) = payload.get("errors") {
                                        let _ = tx.send(Ok(builder.error(errors.to_string(), None))).await;
                                        return;
                                    }
                                }
                            }
                            Some("error") => {
                                let message = parsed.get("payload").map(|p| p.to_string()).unwrap_or_else(|| "unknown error".to_string());
                                let _ = tx.send(Ok(builder.error(message, None))).await;
                                return;
                            }
                            Some("complete") => break,
                            _ => {}
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        let _ = tx.send(Ok(builder.error(err.to_string(), None))).await;
                        return;
                    }
                }
            }
            let _ = tx.send(Ok(builder.end())).await;
        });

        Ok(boxed_channel_stream(rx, None))
    }
}
