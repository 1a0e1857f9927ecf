pub mod auth;
pub mod config;
pub mod errors;
pub mod grpcpb;
pub mod loader;
pub mod providers;
pub mod repository;
pub mod search;
pub mod security;
pub mod telemetry;
pub mod tools;
pub mod transports;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::UtcpClientConfig;
use crate::errors::UtcpError;
use crate::providers::base::{Provider, ProviderType};
use crate::repository::ToolRepository;
use crate::search::{SearchOptions, SearchResultItem, SearchStats, SearchStrategy};
use crate::telemetry::{Event, EventSink, NoopEventSink};
use crate::tools::Tool;
use crate::transports::registry::{communication_protocols_snapshot, CommunicationProtocolRegistry};
use crate::transports::stream::StreamResult;
use crate::transports::CommunicationProtocol;

/// Public surface of the client orchestrator. A tool name is either the bare name
/// registered by an MCP provider or the fully-qualified `<provider>.<name>` form
/// every other transport uses.
#[async_trait]
pub trait UtcpClientInterface: Send + Sync {
    async fn register_tool_provider(&self, prov: Arc<dyn Provider>) -> Result<Vec<Tool>, UtcpError>;
    /// Idempotent: deregistering a provider that was never registered is not an error.
    async fn deregister_tool_provider(&self, provider_name: &str) -> Result<(), UtcpError>;
    async fn call_tool(
        &self,
        tool_name: &str,
        args: HashMap<String, serde_json::Value>,
    ) -> Result<serde_json::Value, UtcpError>;
    async fn call_tool_stream(
        &self,
        tool_name: &str,
        args: HashMap<String, serde_json::Value>,
    ) -> Result<Box<dyn StreamResult>, UtcpError>;

    async fn search_tools(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchResultItem>, UtcpError>;
    async fn search_providers(&self, query: &str, limit: usize) -> Result<Vec<String>, UtcpError>;
    async fn get_suggestions(&self, prefix: &str, limit: usize) -> Result<Vec<String>, UtcpError>;
    async fn find_similar_tools(&self, tool_name: &str, limit: usize) -> Result<Vec<Tool>, UtcpError>;
    async fn get_stats(&self) -> Result<SearchStats, UtcpError>;

    fn get_transports(&self) -> HashMap<String, Arc<dyn CommunicationProtocol>>;
}

pub struct UtcpClient {
    config: UtcpClientConfig,
    communication_protocols: CommunicationProtocolRegistry,
    tool_repository: Arc<dyn ToolRepository>,
    search_strategy: Arc<dyn SearchStrategy>,
    sink: Arc<dyn EventSink>,

    resolved_tools_cache: RwLock<HashMap<String, ResolvedTool>>,
}

#[derive(Clone)]
struct ResolvedTool {
    provider: Arc<dyn Provider>,
    protocol: Arc<dyn CommunicationProtocol>,
    call_name: String,
}

impl UtcpClient {
    /// Async factory kept for symmetry with other language SDKs' construction style.
    pub async fn create(
        config: UtcpClientConfig,
        repo: Arc<dyn ToolRepository>,
        strategy: Arc<dyn SearchStrategy>,
    ) -> Result<Self, UtcpError> {
        Self::new(config, repo, strategy).await
    }

    /// Builds a client and, if `config.providers_file_path` is set, registers every
    /// provider found there before returning.
    pub async fn new(
        config: UtcpClientConfig,
        repo: Arc<dyn ToolRepository>,
        strategy: Arc<dyn SearchStrategy>,
    ) -> Result<Self, UtcpError> {
        Self::with_sink(config, repo, strategy, Arc::new(NoopEventSink)).await
    }

    pub async fn with_sink(
        config: UtcpClientConfig,
        repo: Arc<dyn ToolRepository>,
        strategy: Arc<dyn SearchStrategy>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, UtcpError> {
        let communication_protocols = communication_protocols_snapshot();

        let client = Self {
            config,
            communication_protocols,
            tool_repository: repo,
            search_strategy: strategy,
            sink,
            resolved_tools_cache: RwLock::new(HashMap::new()),
        };

        if let Some(providers_path) = client.config.providers_file_path.clone() {
            let providers = crate::loader::load_providers_from_file(&providers_path, &client.config)
                .await
                .map_err(|e| UtcpError::wrap_step("load providers file", e))?;

            for provider in providers {
                if let Err(e) = client.register_tool_provider(provider.clone()).await {
                    tracing::warn!(provider = %provider.name(), error = %e, "failed to load provider");
                }
            }
        }

        Ok(client)
    }

    /// MCP is the only surviving provider kind whose tools are addressed by their
    /// bare name on the wire; every other transport gets the fully-qualified name.
    fn call_name_for_provider(tool_name: &str, provider_type: &ProviderType) -> String {
        match provider_type {
            ProviderType::Mcp => tool_name.splitn(2, '.').nth(1).unwrap_or(tool_name).to_string(),
            _ => tool_name.to_string(),
        }
    }

    async fn protocol_for(&self, provider_type: ProviderType) -> Result<Arc<dyn CommunicationProtocol>, UtcpError> {
        self.communication_protocols
            .get(provider_type.as_key())
            .ok_or_else(|| UtcpError::NoTransport(provider_type.as_key().to_string()))
    }

    async fn resolve_tool(&self, tool_name: &str) -> Result<ResolvedTool, UtcpError> {
        {
            let cache = self.resolved_tools_cache.read().await;
            if let Some(resolved) = cache.get(tool_name) {
                return Ok(resolved.clone());
            }
        }

        let (provider_name, _) = tool_name
            .split_once('.')
            .filter(|(p, _)| !p.is_empty())
            .ok_or_else(|| UtcpError::ToolNotFound(tool_name.to_string()))?;

        let prov = self
            .tool_repository
            .get_provider(provider_name)
            .await?
            .ok_or_else(|| UtcpError::ProviderNotFound(provider_name.to_string()))?;
        let provider_type = prov.type_();
        let protocol = self.protocol_for(provider_type).await?;
        let call_name = Self::call_name_for_provider(tool_name, &provider_type);

        let resolved = ResolvedTool {
            provider: prov,
            protocol,
            call_name,
        };
        self.resolved_tools_cache
            .write()
            .await
            .insert(tool_name.to_string(), resolved.clone());
        Ok(resolved)
    }
}

#[async_trait]
impl UtcpClientInterface for UtcpClient {
    async fn register_tool_provider(&self, prov: Arc<dyn Provider>) -> Result<Vec<Tool>, UtcpError> {
        let provider_name = prov.name();
        let provider_type = prov.type_();
        let protocol = self.protocol_for(provider_type).await?;

        let result = protocol.register_tool_provider(prov.as_ref()).await;
        self.sink.emit(Event::Provider {
            provider: provider_name.clone(),
            action: "register",
            ok: result.is_ok(),
        });
        let tools = result?;

        let normalized_tools: Vec<Tool> = tools
            .into_iter()
            .map(|mut tool| {
                if !tool.name.starts_with(&format!("{provider_name}.")) {
                    tool.name = format!("{provider_name}.{}", tool.name.trim_start_matches('.'));
                }
                tool.provider_name = Some(provider_name.clone());
                tool
            })
            .collect();

        self.tool_repository
            .save_provider_with_tools(prov.clone(), normalized_tools.clone())
            .await?;

        {
            let mut resolved = self.resolved_tools_cache.write().await;
            for tool in &normalized_tools {
                let call_name = Self::call_name_for_provider(&tool.name, &provider_type);
                resolved.insert(
                    tool.name.clone(),
                    ResolvedTool {
                        provider: prov.clone(),
                        protocol: protocol.clone(),
                        call_name,
                    },
                );
            }
        }

        Ok(normalized_tools)
    }

    async fn deregister_tool_provider(&self, provider_name: &str) -> Result<(), UtcpError> {
        let Some(prov) = self.tool_repository.get_provider(provider_name).await? else {
            return Ok(());
        };

        let protocol = self.protocol_for(prov.type_()).await?;
        let result = protocol.deregister_tool_provider(prov.as_ref()).await;
        self.sink.emit(Event::Provider {
            provider: provider_name.to_string(),
            action: "deregister",
            ok: result.is_ok(),
        });
        result?;

        self.tool_repository.remove_provider(provider_name).await?;

        let mut resolved = self.resolved_tools_cache.write().await;
        resolved.retain(|tool_name, _| !tool_name.starts_with(&format!("{provider_name}.")));

        Ok(())
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        args: HashMap<String, serde_json::Value>,
    ) -> Result<serde_json::Value, UtcpError> {
        let resolved = self.resolve_tool(tool_name).await?;
        let started = std::time::Instant::now();
        let result = resolved
            .protocol
            .call_tool(&resolved.call_name, args, resolved.provider.as_ref())
            .await;
        self.sink.emit(Event::ToolCall {
            tool: tool_name.to_string(),
            provider: resolved.provider.name(),
            transport: resolved.protocol.name(),
            duration: started.elapsed(),
            ok: result.is_ok(),
        });
        result
    }

    async fn call_tool_stream(
        &self,
        tool_name: &str,
        args: HashMap<String, serde_json::Value>,
    ) -> Result<Box<dyn StreamResult>, UtcpError> {
        let resolved = self.resolve_tool(tool_name).await?;
        resolved
            .protocol
            .call_tool_stream(&resolved.call_name, args, resolved.provider.as_ref())
            .await
    }

    async fn search_tools(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchResultItem>, UtcpError> {
        let started = std::time::Instant::now();
        let result = self.search_strategy.search(query, options).await;
        self.sink.emit(Event::Search {
            query: query.to_string(),
            algorithm: match options.algorithm {
                crate::search::SearchAlgorithm::Exact => "exact",
                crate::search::SearchAlgorithm::Fuzzy => "fuzzy",
                crate::search::SearchAlgorithm::Semantic => "semantic",
                crate::search::SearchAlgorithm::Combined => "combined",
            },
            matches: result.as_ref().map(|r| r.len()).unwrap_or(0),
            duration: started.elapsed(),
        });
        result
    }

    async fn search_providers(&self, query: &str, limit: usize) -> Result<Vec<String>, UtcpError> {
        self.search_strategy.search_providers(query, limit).await
    }

    async fn get_suggestions(&self, prefix: &str, limit: usize) -> Result<Vec<String>, UtcpError> {
        self.search_strategy.get_suggestions(prefix, limit).await
    }

    async fn find_similar_tools(&self, tool_name: &str, limit: usize) -> Result<Vec<Tool>, UtcpError> {
        self.search_strategy.find_similar_tools(tool_name, limit).await
    }

    async fn get_stats(&self) -> Result<SearchStats, UtcpError> {
        self.search_strategy.get_stats().await
    }

    fn get_transports(&self) -> HashMap<String, Arc<dyn CommunicationProtocol>> {
        self.communication_protocols.as_map()
    }
}
