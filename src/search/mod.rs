//! In-memory search over the tool repository: exact/fuzzy/keyword-semantic matching,
//! a blended ranking function, an optional secret scan, and prefix suggestions.
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::errors::UtcpError;
use crate::repository::ToolRepository;
use crate::security::scan_for_secrets;
use crate::tools::Tool;

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9]+").unwrap());

fn words(text: &str) -> Vec<String> {
    WORD_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

fn word_set(text: &str) -> HashSet<String> {
    words(text).into_iter().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchAlgorithm {
    Exact,
    Fuzzy,
    Semantic,
    Combined,
}

impl Default for SearchAlgorithm {
    fn default() -> Self {
        SearchAlgorithm::Combined
    }
}

#[derive(Debug, Clone, Default)]
pub struct Filters {
    pub providers: Option<Vec<String>>,
    pub transports: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub algorithm: SearchAlgorithm,
    pub threshold: f64,
    pub limit: usize,
    pub filters: Filters,
    pub include_descriptions: bool,
    pub security_scan: bool,
    pub filter_sensitive: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            algorithm: SearchAlgorithm::default(),
            threshold: 0.5,
            limit: 10,
            filters: Filters::default(),
            include_descriptions: true,
            security_scan: false,
            filter_sensitive: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchResultItem {
    pub tool: Tool,
    pub score: f64,
    pub security_warnings: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchStats {
    pub tool_count: usize,
    pub provider_count: usize,
    pub tools_per_provider: HashMap<String, usize>,
}

/// Pluggable search behavior, so a caller can swap in a different strategy without
/// changing the orchestrator. [`SearchEngine`] is the stock implementation.
#[async_trait]
pub trait SearchStrategy: Send + Sync {
    async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchResultItem>, UtcpError>;

    async fn search_tools(&self, query: &str, limit: usize) -> Result<Vec<Tool>, UtcpError> {
        let options = SearchOptions {
            limit,
            ..SearchOptions::default()
        };
        Ok(self
            .search(query, &options)
            .await?
            .into_iter()
            .map(|r| r.tool)
            .collect())
    }

    async fn search_providers(&self, query: &str, limit: usize) -> Result<Vec<String>, UtcpError>;
    async fn get_suggestions(&self, prefix: &str, limit: usize) -> Result<Vec<String>, UtcpError>;
    async fn find_similar_tools(&self, tool_name: &str, limit: usize) -> Result<Vec<Tool>, UtcpError>;
    async fn get_stats(&self) -> Result<SearchStats, UtcpError>;
}

/// Stock search strategy over an in-memory snapshot of the tool repository.
pub struct SearchEngine {
    repository: Arc<dyn ToolRepository>,
}

impl SearchEngine {
    pub fn new(repository: Arc<dyn ToolRepository>) -> Self {
        Self { repository }
    }

    fn exact_score(tool: &Tool, query: &str, include_descriptions: bool) -> f64 {
        if tool.name.eq_ignore_ascii_case(query) {
            return 1.0;
        }
        if include_descriptions
            && tool
                .description
                .to_lowercase()
                .contains(&query.to_lowercase())
        {
            return 0.8;
        }
        0.0
    }

    fn levenshtein_ratio(a: &str, b: &str) -> f64 {
        let a: Vec<char> = a.chars().collect();
        let b: Vec<char> = b.chars().collect();
        if a.is_empty() && b.is_empty() {
            return 1.0;
        }
        let mut prev: Vec<usize> = (0..=b.len()).collect();
        let mut cur = vec![0usize; b.len() + 1];
        for i in 1..=a.len() {
            cur[0] = i;
            for j in 1..=b.len() {
                let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
                cur[j] = (prev[j] + 1).min(cur[j - 1] + 1).min(prev[j - 1] + cost);
            }
            std::mem::swap(&mut prev, &mut cur);
        }
        let distance = prev[b.len()];
        let max_len = a.len().max(b.len()).max(1);
        1.0 - (distance as f64 / max_len as f64)
    }

    fn token_overlap_ratio(query_words: &HashSet<String>, tool_words: &HashSet<String>) -> f64 {
        if query_words.is_empty() || tool_words.is_empty() {
            return 0.0;
        }
        let overlap = query_words.intersection(tool_words).count();
        overlap as f64 / query_words.len() as f64
    }

    fn fuzzy_score(tool: &Tool, query: &str, include_descriptions: bool) -> f64 {
        let name_ratio = Self::levenshtein_ratio(&tool.name.to_lowercase(), &query.to_lowercase());
        let haystack = if include_descriptions {
            format!("{} {}", tool.name, tool.description)
        } else {
            tool.name.clone()
        };
        let token_ratio = Self::token_overlap_ratio(&word_set(query), &word_set(&haystack));
        0.5 * name_ratio + 0.5 * token_ratio
    }

    fn keyword_set(tool: &Tool, include_descriptions: bool) -> HashSet<String> {
        let mut set = word_set(&tool.name);
        if include_descriptions {
            set.extend(word_set(&tool.description));
        }
        for tag in &tool.tags {
            set.extend(word_set(tag));
        }
        set
    }

    fn semantic_score(tool: &Tool, query_words: &HashSet<String>, include_descriptions: bool) -> f64 {
        let tool_words = Self::keyword_set(tool, include_descriptions);
        if query_words.is_empty() || tool_words.is_empty() {
            return 0.0;
        }
        let intersection = query_words.intersection(&tool_words).count();
        let union = query_words.union(&tool_words).count();
        if union == 0 {
            return 0.0;
        }
        let jaccard = intersection as f64 / union as f64;

        // Contextual boost when the tool's declared parameter/response labels also
        // mention a query token.
        let mut boost = 0.0;
        if let Some(props) = &tool.inputs.properties {
            if props.keys().any(|k| query_words.contains(&k.to_lowercase())) {
                boost += 0.1;
            }
        }
        (jaccard + boost).min(1.0)
    }

    fn raw_score(tool: &Tool, query: &str, query_words: &HashSet<String>, algorithm: SearchAlgorithm, include_descriptions: bool) -> f64 {
        match algorithm {
            SearchAlgorithm::Exact => Self::exact_score(tool, query, include_descriptions),
            SearchAlgorithm::Fuzzy => Self::fuzzy_score(tool, query, include_descriptions),
            SearchAlgorithm::Semantic => Self::semantic_score(tool, query_words, include_descriptions),
            SearchAlgorithm::Combined => {
                let exact = Self::exact_score(tool, query, include_descriptions);
                let fuzzy = Self::fuzzy_score(tool, query, include_descriptions);
                let semantic = Self::semantic_score(tool, query_words, include_descriptions);
                exact.max(fuzzy).max(semantic)
            }
        }
    }

    fn tag_prior(tool: &Tool) -> f64 {
        (tool.tags.len() as f64 / 5.0).min(1.0)
    }

    fn description_prior(tool: &Tool) -> f64 {
        (tool.description.len() as f64 / 120.0).min(1.0)
    }

    /// Transport preference prior, constant per provider kind since no usage
    /// telemetry feeds this yet. Request/response transports rank above
    /// fire-and-forget or still-experimental ones.
    fn transport_prior(provider_type_key: Option<&str>) -> f64 {
        match provider_type_key {
            Some("http") | Some("mcp") => 1.0,
            Some("grpc") | Some("graphql") => 0.8,
            Some("websocket") | Some("tcp") | Some("udp") => 0.6,
            Some("cli") | Some("webrtc") => 0.4,
            _ => 0.5,
        }
    }

    fn rank(raw: f64, tool: &Tool, provider_type_key: Option<&str>) -> f64 {
        0.6 * raw
            + 0.2 * Self::tag_prior(tool)
            + 0.1 * Self::description_prior(tool)
            + 0.1 * Self::transport_prior(provider_type_key)
    }

    async fn provider_type_key(&self, tool: &Tool) -> Option<String> {
        let provider_name = tool.provider_name.as_ref()?;
        let provider = self.repository.get_provider(provider_name).await.ok()??;
        Some(provider.type_().as_key().to_string())
    }

    fn passes_filters(tool: &Tool, filters: &Filters) -> bool {
        if let Some(providers) = &filters.providers {
            if !tool
                .provider_name
                .as_ref()
                .is_some_and(|p| providers.iter().any(|allowed| allowed == p))
            {
                return false;
            }
        }
        if let Some(tags) = &filters.tags {
            if !tags.iter().any(|t| tool.tags.contains(t)) {
                return false;
            }
        }
        true
    }

    fn passes_transport_filter(&self, provider_type_key: Option<&str>, filters: &Filters) -> bool {
        match (&filters.transports, provider_type_key) {
            (Some(allowed), Some(key)) => allowed.iter().any(|t| t == key),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

#[async_trait]
impl SearchStrategy for SearchEngine {
    async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchResultItem>, UtcpError> {
        let tools = self.repository.get_tools().await?;
        let query_words = word_set(query);

        let mut scored = Vec::new();
        for tool in tools {
            if !Self::passes_filters(&tool, &options.filters) {
                continue;
            }
            let provider_type_key = self.provider_type_key(&tool).await;
            if !self.passes_transport_filter(provider_type_key.as_deref(), &options.filters) {
                continue;
            }

            let raw = Self::raw_score(&tool, query, &query_words, options.algorithm, options.include_descriptions);
            if raw < options.threshold {
                continue;
            }
            let score = Self::rank(raw, &tool, provider_type_key.as_deref());

            let security_warnings = if options.security_scan {
                let text = format!("{} {}", tool.name, tool.description);
                scan_for_secrets(&text)
            } else {
                Vec::new()
            };
            if options.filter_sensitive && !security_warnings.is_empty() {
                continue;
            }

            scored.push(SearchResultItem {
                tool,
                score,
                security_warnings,
            });
        }

        // Combined algorithm: dedupe by tool name keeping the best score.
        if matches!(options.algorithm, SearchAlgorithm::Combined) {
            let mut best: HashMap<String, SearchResultItem> = HashMap::new();
            for item in scored {
                best.entry(item.tool.qualified_name())
                    .and_modify(|existing| {
                        if item.score > existing.score {
                            *existing = item.clone();
                        }
                    })
                    .or_insert(item);
            }
            scored = best.into_values().collect();
        }

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.tool.name.cmp(&b.tool.name))
        });
        scored.truncate(options.limit);
        Ok(scored)
    }

    async fn search_providers(&self, query: &str, limit: usize) -> Result<Vec<String>, UtcpError> {
        let providers = self.repository.get_providers().await?;
        let query_lower = query.to_lowercase();

        let mut scored: Vec<(String, f64)> = providers
            .into_iter()
            .map(|p| {
                let name = p.name();
                let exact = if name.eq_ignore_ascii_case(query) { 1.0 } else { 0.0 };
                let fuzzy = Self::levenshtein_ratio(&name.to_lowercase(), &query_lower);
                (name, exact.max(fuzzy))
            })
            .filter(|(_, score)| *score >= 0.5)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(limit);
        Ok(scored.into_iter().map(|(name, _)| name).collect())
    }

    async fn get_suggestions(&self, prefix: &str, limit: usize) -> Result<Vec<String>, UtcpError> {
        let tools = self.repository.get_tools().await?;
        let prefix_lower = prefix.to_lowercase();

        let mut prefix_matches: Vec<String> = tools
            .iter()
            .map(|t| t.name.clone())
            .filter(|name| name.to_lowercase().starts_with(&prefix_lower))
            .collect();
        prefix_matches.sort();
        prefix_matches.dedup();

        if prefix_matches.len() >= limit {
            prefix_matches.truncate(limit);
            return Ok(prefix_matches);
        }

        // Cheap fuzzy expansion: tools within edit distance 1 of the prefix,
        // compensating for a single typo.
        let mut fuzzy_matches: Vec<String> = tools
            .iter()
            .map(|t| t.name.clone())
            .filter(|name| !prefix_matches.contains(name))
            .filter(|name| {
                let candidate_prefix: String = name.chars().take(prefix.chars().count()).collect();
                Self::levenshtein_ratio(&candidate_prefix.to_lowercase(), &prefix_lower) >= 0.7
            })
            .collect();
        fuzzy_matches.sort();
        fuzzy_matches.dedup();

        prefix_matches.extend(fuzzy_matches);
        prefix_matches.truncate(limit);
        Ok(prefix_matches)
    }

    async fn find_similar_tools(&self, tool_name: &str, limit: usize) -> Result<Vec<Tool>, UtcpError> {
        let tools = self.repository.get_tools().await?;
        let target = tools
            .iter()
            .find(|t| t.name == tool_name || t.qualified_name() == tool_name)
            .ok_or_else(|| UtcpError::ToolNotFound(tool_name.to_string()))?
            .clone();

        let target_words = Self::keyword_set(&target, true);
        let mut scored: Vec<(Tool, f64)> = tools
            .into_iter()
            .filter(|t| t.qualified_name() != target.qualified_name())
            .map(|t| {
                let words = Self::keyword_set(&t, true);
                let union = target_words.union(&words).count();
                let score = if union == 0 {
                    0.0
                } else {
                    target_words.intersection(&words).count() as f64 / union as f64
                };
                (t, score)
            })
            .filter(|(_, score)| *score > 0.0)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.name.cmp(&b.0.name)));
        scored.truncate(limit);
        Ok(scored.into_iter().map(|(t, _)| t).collect())
    }

    async fn get_stats(&self) -> Result<SearchStats, UtcpError> {
        let tools = self.repository.get_tools().await?;
        let providers = self.repository.get_providers().await?;

        let mut tools_per_provider: HashMap<String, usize> = HashMap::new();
        for tool in &tools {
            if let Some(name) = &tool.provider_name {
                *tools_per_provider.entry(name.clone()).or_insert(0) += 1;
            }
        }

        Ok(SearchStats {
            tool_count: tools.len(),
            provider_count: providers.len(),
            tools_per_provider,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::base::{BaseProvider, ProviderType};
    use crate::repository::in_memory::InMemoryToolRepository;
    use crate::tools::ToolInputOutputSchema;

    fn schema() -> ToolInputOutputSchema {
        ToolInputOutputSchema {
            type_: "object".into(),
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

    fn tool(name: &str, description: &str, tags: &[&str]) -> Tool {
        Tool {
            name: name.to_string(),
            description: description.to_string(),
            inputs: schema(),
            outputs: schema(),
            tags: tags.iter().map(|s| s.to_string()).collect(),
            average_response_size: None,
            provider_name: Some("weather".to_string()),
        }
    }

    async fn engine_with(tools: Vec<Tool>) -> SearchEngine {
        let repo = Arc::new(InMemoryToolRepository::new());
        repo.save_provider_with_tools(
            Arc::new(BaseProvider::new("weather".to_string(), ProviderType::Http)),
            tools,
        )
        .await
        .unwrap();
        SearchEngine::new(repo)
    }

    #[tokio::test]
    async fn exact_match_scores_highest() {
        let engine = engine_with(vec![
            tool("weather.get_forecast", "fetches a weather forecast", &["weather"]),
            tool("weather.get_alerts", "fetches active weather alerts", &["weather", "alerts"]),
        ])
        .await;

        let options = SearchOptions {
            algorithm: SearchAlgorithm::Exact,
            threshold: 0.0,
            ..SearchOptions::default()
        };
        let results = engine.search("weather.get_forecast", &options).await.unwrap();
        assert_eq!(results[0].tool.name, "weather.get_forecast");
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn fuzzy_tolerates_typos() {
        let engine = engine_with(vec![tool("weather.get_forecast", "weather forecast lookup", &[])]).await;
        let options = SearchOptions {
            algorithm: SearchAlgorithm::Fuzzy,
            threshold: 0.3,
            ..SearchOptions::default()
        };
        let results = engine.search("get_forcast", &options).await.unwrap();
        assert!(!results.is_empty());
    }

    #[tokio::test]
    async fn combined_dedupes_by_tool_name() {
        let engine = engine_with(vec![tool("weather.get_forecast", "weather forecast", &["weather"])]).await;
        let options = SearchOptions {
            algorithm: SearchAlgorithm::Combined,
            threshold: 0.0,
            ..SearchOptions::default()
        };
        let results = engine.search("forecast", &options).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn filter_sensitive_drops_flagged_results() {
        let engine = engine_with(vec![tool(
            "weather.debug_dump",
            "dumps config including api_key: \"sk-abcdefghijklmnopqrst\"",
            &[],
        )])
        .await;
        let options = SearchOptions {
            algorithm: SearchAlgorithm::Exact,
            threshold: 0.0,
            security_scan: true,
            filter_sensitive: true,
            ..SearchOptions::default()
        };
        let results = engine.search("weather.debug_dump", &options).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn get_suggestions_prefix_matches_then_fuzzy_expands() {
        let engine = engine_with(vec![
            tool("weather.get_forecast", "forecast", &[]),
            tool("weather.get_alerts", "alerts", &[]),
        ])
        .await;
        let suggestions = engine.get_suggestions("weather.get_", 10).await.unwrap();
        assert_eq!(suggestions.len(), 2);
    }

    #[tokio::test]
    async fn find_similar_tools_excludes_self() {
        let engine = engine_with(vec![
            tool("weather.get_forecast", "weather forecast lookup", &["weather"]),
            tool("weather.get_alerts", "weather alert lookup", &["weather"]),
            tool("billing.get_invoice", "fetch an invoice", &["billing"]),
        ])
        .await;
        let similar = engine.find_similar_tools("weather.get_forecast", 5).await.unwrap();
        assert!(similar.iter().all(|t| t.name != "weather.get_forecast"));
        assert_eq!(similar[0].name, "weather.get_alerts");
    }

    #[tokio::test]
    async fn get_stats_counts_tools_and_providers() {
        let engine = engine_with(vec![
            tool("weather.get_forecast", "forecast", &[]),
            tool("weather.get_alerts", "alerts", &[]),
        ])
        .await;
        let stats = engine.get_stats().await.unwrap();
        assert_eq!(stats.tool_count, 2);
        assert_eq!(stats.provider_count, 1);
        assert_eq!(stats.tools_per_provider.get("weather"), Some(&2));
    }
}
