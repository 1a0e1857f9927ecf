use serde::{Deserialize, Serialize};

use crate::auth::AuthConfig;
use crate::providers::base::{BaseProvider, Provider, ProviderType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrpcProvider {
    #[serde(flatten)]
    pub base: BaseProvider,
    pub host: String,
    pub port: u16,
    pub service_name: String,
    pub method_name: String,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proto_path: Option<String>,
}

impl Provider for GrpcProvider {
    fn type_(&self) -> ProviderType {
        ProviderType::Grpc
    }

    fn name(&self) -> String {
        self.base.name.clone()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl GrpcProvider {
    pub fn new(
        name: String,
        host: String,
        port: u16,
        service_name: String,
        method_name: String,
        auth: Option<AuthConfig>,
    ) -> Self {
        Self {
            base: BaseProvider {
                name,
                provider_type: ProviderType::Grpc,
                auth,
            },
            host,
            port,
            service_name,
            method_name,
            use_ssl: false,
            proto_path: None,
        }
    }
}
