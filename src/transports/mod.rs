pub mod cli;
pub mod graphql;
pub mod grpc;
pub mod http;
pub mod mcp;
pub mod pool;
pub mod registry;
pub mod stream;
pub mod tcp;
pub mod udp;
pub mod webrtc;
pub mod websocket;

use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::tools::Tool;
use crate::transports::stream::StreamResult;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Core transport abstraction all communication protocols implement.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Static transport name, e.g. "http", "websocket".
    fn name(&self) -> &'static str;
    /// Whether `call_tool_stream` is meaningfully supported. CLI returns false.
    fn supports_streaming(&self) -> bool {
        true
    }
    /// Register a tool provider with the underlying transport, returning discovered
    /// tools. Idempotent per provider.
    async fn register_tool_provider(&self, prov: &dyn Provider) -> Result<Vec<Tool>, UtcpError>;
    /// Deregister a tool provider and release any associated resources. Never fails.
    async fn deregister_tool_provider(&self, prov: &dyn Provider) -> Result<(), UtcpError>;
    /// Invoke a tool over the transport and return the result payload.
    async fn call_tool(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Value, UtcpError>;
    /// Invoke a tool and stream incremental responses back to the caller.
    async fn call_tool_stream(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Box<dyn StreamResult>, UtcpError>;
}

// CommunicationProtocol is the name used by the registry and by third-party transport
// plugins; kept as an alias so both names refer to the same trait object.
pub use ClientTransport as CommunicationProtocol;

pub use registry::{
    communication_protocols_snapshot, register_communication_protocol,
    CommunicationProtocolRegistry,
};
