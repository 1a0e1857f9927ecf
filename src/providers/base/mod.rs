use serde::{Deserialize, Serialize};

use crate::auth::AuthConfig;

/// The nine provider kinds a client can register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Http,
    Cli,
    Websocket,
    Grpc,
    Graphql,
    Mcp,
    Tcp,
    Udp,
    Webrtc,
}

impl ProviderType {
    pub fn as_key(&self) -> &'static str {
        match self {
            ProviderType::Http => "http",
            ProviderType::Cli => "cli",
            ProviderType::Websocket => "websocket",
            ProviderType::Grpc => "grpc",
            ProviderType::Graphql => "graphql",
            ProviderType::Tcp => "tcp",
            ProviderType::Udp => "udp",
            ProviderType::Webrtc => "webrtc",
            ProviderType::Mcp => "mcp",
        }
    }
}


/// Common surface every provider kind exposes regardless of its transport-specific
/// fields.
pub trait Provider: Send + Sync + std::fmt::Debug + std::any::Any {
    fn type_(&self) -> ProviderType;
    fn name(&self) -> String;

    fn as_any(&self) -> &dyn std::any::Any;
}

/// Fields common to every provider kind. Transport-specific fields live in each
/// `providers::<kind>` module and are carried via `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseProvider {
    pub name: String,
    pub provider_type: ProviderType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
}

impl BaseProvider {
    pub fn new(name: String, provider_type: ProviderType) -> Self {
        Self {
            name,
            provider_type,
            auth: None,
        }
    }
}

impl Provider for BaseProvider {
    fn type_(&self) -> ProviderType {
        self.provider_type
    }
    fn name(&self) -> String {
        self.name.clone()
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
