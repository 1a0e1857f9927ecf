use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::errors::UtcpError;

#[async_trait]
pub trait UtcpVariablesConfig: Send + Sync {
    async fn load(&self) -> Result<HashMap<String, String>, UtcpError>;
    async fn get(&self, key: &str) -> Result<String, UtcpError>;
}

#[derive(Clone, Default)]
pub struct UtcpClientConfig {
    pub variables: HashMap<String, String>,
    pub providers_file_path: Option<PathBuf>,
    pub load_variables_from: Vec<Arc<dyn UtcpVariablesConfig>>,
}

impl UtcpClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_providers_file(mut self, path: PathBuf) -> Self {
        self.providers_file_path = Some(path);
        self
    }

    pub fn with_variable(mut self, key: String, value: String) -> Self {
        self.variables.insert(key, value);
        self
    }

    pub fn with_variables(mut self, vars: HashMap<String, String>) -> Self {
        self.variables.extend(vars);
        self
    }

    /// Resolution order: inline variables, then each configured loader in turn,
    /// then the process environment.
    pub async fn get_variable(&self, key: &str) -> Option<String> {
        if let Some(val) = self.variables.get(key) {
            return Some(val.clone());
        }

        for loader in &self.load_variables_from {
            if let Ok(val) = loader.get(key).await {
                return Some(val);
            }
        }

        std::env::var(key).ok()
    }
}

/// Loads `KEY=VALUE` pairs from a `.env`-style file, ignoring blank lines and `#`
/// comments and trimming surrounding quotes from values.
pub struct DotEnvLoader {
    file_path: PathBuf,
}

impl DotEnvLoader {
    pub fn new(file_path: PathBuf) -> Self {
        Self { file_path }
    }
}

#[async_trait]
impl UtcpVariablesConfig for DotEnvLoader {
    async fn load(&self) -> Result<HashMap<String, String>, UtcpError> {
        let contents = tokio::fs::read_to_string(&self.file_path)
            .await
            .map_err(|e| UtcpError::Config(format!("failed to read dotenv file: {e}")))?;
        let mut vars = HashMap::new();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                vars.insert(key.trim().to_string(), value.trim().trim_matches('"').to_string());
            }
        }

        Ok(vars)
    }

    async fn get(&self, key: &str) -> Result<String, UtcpError> {
        let vars = self.load().await?;
        vars.get(key)
            .cloned()
            .ok_or_else(|| UtcpError::Config(format!("variable {key} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn dotenv_loader_parses_and_skips_comments() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# comment\nAPI_KEY=\"secret\"\n\nHOST=localhost").unwrap();

        let loader = DotEnvLoader::new(file.path().to_path_buf());
        assert_eq!(loader.get("API_KEY").await.unwrap(), "secret");
        assert_eq!(loader.get("HOST").await.unwrap(), "localhost");
        assert!(loader.get("MISSING").await.is_err());
    }

    #[tokio::test]
    async fn get_variable_prefers_inline_over_loader_and_env() {
        let config = UtcpClientConfig::new().with_variable("KEY".to_string(), "inline".to_string());
        assert_eq!(config.get_variable("KEY").await, Some("inline".to_string()));
        assert_eq!(config.get_variable("DEFINITELY_UNSET_VAR").await, None);
    }
}
