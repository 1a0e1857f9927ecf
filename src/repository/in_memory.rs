use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::repository::ToolRepository;
use crate::tools::Tool;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory repository. Provider registration and tool storage are serialized
/// behind independent locks; reads take a read-lock snapshot.
#[derive(Default)]
pub struct InMemoryToolRepository {
    tools: RwLock<HashMap<String, Vec<Tool>>>, // provider_name -> tools
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>, // provider_name -> Provider
}

impl InMemoryToolRepository {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            providers: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ToolRepository for InMemoryToolRepository {
    async fn save_provider_with_tools(
        &self,
        provider: Arc<dyn Provider>,
        tools: Vec<Tool>,
    ) -> Result<(), UtcpError> {
        let provider_name = provider.name();

        let mut providers_lock = self.providers.write().await;
        providers_lock.insert(provider_name.clone(), provider);

        let mut tools_lock = self.tools.write().await;
        tools_lock.insert(provider_name, tools);

        Ok(())
    }

    async fn get_provider(&self, name: &str) -> Result<Option<Arc<dyn Provider>>, UtcpError> {
        let providers = self.providers.read().await;
        Ok(providers.get(name).cloned())
    }

    async fn get_providers(&self) -> Result<Vec<Arc<dyn Provider>>, UtcpError> {
        let providers = self.providers.read().await;
        Ok(providers.values().cloned().collect())
    }

    async fn remove_provider(&self, name: &str) -> Result<(), UtcpError> {
        let mut providers = self.providers.write().await;
        providers.remove(name);
        let mut tools = self.tools.write().await;
        tools.remove(name);
        Ok(())
    }

    async fn get_tools(&self) -> Result<Vec<Tool>, UtcpError> {
        let tools_map = self.tools.read().await;
        let mut all_tools = Vec::new();
        for tools in tools_map.values() {
            all_tools.extend(tools.clone());
        }
        Ok(all_tools)
    }

    async fn get_tools_by_provider(&self, provider_name: &str) -> Result<Vec<Tool>, UtcpError> {
        let tools_map = self.tools.read().await;
        Ok(tools_map.get(provider_name).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::base::{BaseProvider, ProviderType};

    fn provider(name: &str) -> Arc<dyn Provider> {
        Arc::new(BaseProvider::new(name.to_string(), ProviderType::Http))
    }

    #[tokio::test]
    async fn remove_provider_is_idempotent() {
        let repo = InMemoryToolRepository::new();
        assert!(repo.remove_provider("ghost").await.is_ok());
        repo.save_provider_with_tools(provider("p"), Vec::new())
            .await
            .unwrap();
        assert!(repo.remove_provider("p").await.is_ok());
        assert!(repo.remove_provider("p").await.is_ok());
        assert!(repo.get_provider("p").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_providers_returns_every_registered_provider() {
        let repo = InMemoryToolRepository::new();
        repo.save_provider_with_tools(provider("a"), Vec::new()).await.unwrap();
        repo.save_provider_with_tools(provider("b"), Vec::new()).await.unwrap();
        let mut names: Vec<_> = repo.get_providers().await.unwrap().iter().map(|p| p.name()).collect();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn get_tools_by_provider_unknown_returns_empty() {
        let repo = InMemoryToolRepository::new();
        let tools = repo.get_tools_by_provider("missing").await.unwrap();
        assert!(tools.is_empty());
    }

    #[tokio::test]
    async fn save_then_remove_drops_both_provider_and_tools() {
        let repo = InMemoryToolRepository::new();
        repo.save_provider_with_tools(provider("p"), Vec::new())
            .await
            .unwrap();
        assert!(repo.get_provider("p").await.unwrap().is_some());
        repo.remove_provider("p").await.unwrap();
        assert!(repo.get_provider("p").await.unwrap().is_none());
        assert!(repo.get_tools_by_provider("p").await.unwrap().is_empty());
    }
}
