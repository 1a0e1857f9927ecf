use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::transports::ClientTransport;

/// Plugin-style registry for transports keyed by provider_type.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    map: HashMap<String, Arc<dyn ClientTransport>>,
}

/// Alias kept for call sites that think in terms of "communication protocols"
/// rather than transports; both names refer to the same registry.
pub type CommunicationProtocolRegistry = TransportRegistry;

/// Global registry seeded with the built-in transports. Custom transports can be
/// added at runtime via [`register_communication_protocol`] so that every
/// [`crate::UtcpClient`] created afterwards picks them up.
pub static GLOBAL_COMMUNICATION_PROTOCOLS: Lazy<RwLock<TransportRegistry>> =
    Lazy::new(|| RwLock::new(TransportRegistry::with_default_transports()));

/// Registers a transport in the global registry under `key`, replacing any
/// existing registration for the same key.
pub fn register_communication_protocol(key: &str, transport: Arc<dyn ClientTransport>) {
    GLOBAL_COMMUNICATION_PROTOCOLS
        .write()
        .expect("communication protocol registry lock poisoned")
        .register(key, transport);
}

/// Returns a snapshot (clone) of the global registry as it stands right now.
pub fn communication_protocols_snapshot() -> CommunicationProtocolRegistry {
    GLOBAL_COMMUNICATION_PROTOCOLS
        .read()
        .expect("communication protocol registry lock poisoned")
        .clone()
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn with_default_protocols() -> Self {
        Self::with_default_transports()
    }

    pub fn with_default_transports() -> Self {
        let mut reg = Self::new();
        reg.register(
            "http",
            Arc::new(crate::transports::http::HttpClientTransport::new()),
        );
        reg.register("cli", Arc::new(crate::transports::cli::CliTransport::new()));
        reg.register(
            "websocket",
            Arc::new(crate::transports::websocket::WebSocketTransport::new()),
        );
        reg.register(
            "grpc",
            Arc::new(crate::transports::grpc::GrpcTransport::new()),
        );
        reg.register(
            "graphql",
            Arc::new(crate::transports::graphql::GraphQLTransport::new()),
        );
        reg.register("tcp", Arc::new(crate::transports::tcp::TcpTransport::new()));
        reg.register("udp", Arc::new(crate::transports::udp::UdpTransport::new()));
        reg.register("mcp", Arc::new(crate::transports::mcp::McpTransport::new()));
        reg.register(
            "webrtc",
            Arc::new(crate::transports::webrtc::WebRtcTransport::new()),
        );
        reg
    }

    pub fn register(&mut self, key: &str, transport: Arc<dyn ClientTransport>) {
        self.map.insert(key.to_string(), transport);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn ClientTransport>> {
        self.map.get(key).cloned()
    }

    pub fn as_map(&self) -> HashMap<String, Arc<dyn ClientTransport>> {
        self.map.clone()
    }
}
