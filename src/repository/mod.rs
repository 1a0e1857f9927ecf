pub mod in_memory;

use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::tools::Tool;
use async_trait::async_trait;
use std::sync::Arc;

/// Mapping `provider_name -> provider` plus `provider_name -> tools`. Writes are
/// serialized by the implementation; reads may be lock-free snapshots.
#[async_trait]
pub trait ToolRepository: Send + Sync {
    async fn save_provider_with_tools(
        &self,
        prov: Arc<dyn Provider>,
        tools: Vec<Tool>,
    ) -> Result<(), UtcpError>;
    async fn get_provider(&self, name: &str) -> Result<Option<Arc<dyn Provider>>, UtcpError>;
    /// Snapshot of every registered provider.
    async fn get_providers(&self) -> Result<Vec<Arc<dyn Provider>>, UtcpError>;
    /// Drop a provider and its tools. Idempotent: removing an unknown provider is
    /// not an error.
    async fn remove_provider(&self, name: &str) -> Result<(), UtcpError>;
    async fn get_tools(&self) -> Result<Vec<Tool>, UtcpError>;
    /// Returns an empty list for an unknown provider rather than erroring.
    async fn get_tools_by_provider(&self, provider_name: &str) -> Result<Vec<Tool>, UtcpError>;
}
