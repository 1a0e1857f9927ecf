use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::providers::cli::CliProvider;
use crate::security::{validate_command, validate_command_args};
use crate::tools::Tool;
use crate::transports::{stream::StreamResult, ClientTransport};

/// Executes tools as subprocesses. Discovery runs the bare command; calls run
/// `<command> call <provider> <tool> [--flags]` with the tool arguments also piped
/// to stdin as JSON. Does not support streaming.
pub struct CliTransport;

impl Default for CliTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl CliTransport {
    pub fn new() -> Self {
        Self
    }

    fn split_command(command_name: &str) -> Result<(String, Vec<String>), UtcpError> {
        let parts: Vec<String> = command_name
            .split_whitespace()
            .map(|s| s.to_string())
            .collect();
        if parts.is_empty() {
            return Err(UtcpError::CommandInjection("empty command name".into()));
        }
        validate_command(&parts[0], &[])?;
        validate_command_args(&parts[1..])?;
        Ok((parts[0].clone(), parts[1..].to_vec()))
    }

    async fn execute_command(
        &self,
        cmd_path: &str,
        args: &[String],
        env_vars: &Option<HashMap<String, String>>,
        working_dir: &Option<String>,
        stdin_input: Option<&str>,
    ) -> Result<(String, String, i32), UtcpError> {
        validate_command_args(args)?;

        let mut cmd = Command::new(cmd_path);
        cmd.args(args);

        if let Some(env) = env_vars {
            for (k, v) in env {
                cmd.env(k, v);
            }
        }

        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(if stdin_input.is_some() {
            std::process::Stdio::piped()
        } else {
            std::process::Stdio::null()
        });
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| UtcpError::ConnectFailed(format!("failed to spawn {cmd_path}: {e}")))?;

        if let Some(input) = stdin_input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input.as_bytes())
                    .await
                    .map_err(|e| UtcpError::EncodeFailed(e.to_string()))?;
                drop(stdin);
            }
        }

        let output = tokio::time::timeout(Duration::from_secs(30), child.wait_with_output())
            .await
            .map_err(|_| UtcpError::Timeout(Duration::from_secs(30)))?
            .map_err(|e| UtcpError::Other(e.into()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(1);

        Ok((stdout, stderr, exit_code))
    }

    fn format_arguments(&self, args: &HashMap<String, Value>) -> Vec<String> {
        let mut result = Vec::new();
        let mut keys: Vec<_> = args.keys().collect();
        keys.sort();

        for key in keys {
            if let Some(value) = args.get(key) {
                match value {
                    Value::Bool(true) => result.push(format!("--{key}")),
                    Value::Bool(false) => {}
                    Value::Array(arr) => {
                        for item in arr {
                            result.push(format!("--{key}"));
                            result.push(item.to_string());
                        }
                    }
                    _ => {
                        result.push(format!("--{key}"));
                        result.push(value.to_string().trim_matches('"').to_string());
                    }
                }
            }
        }

        result
    }

    fn extract_tools_from_output(&self, output: &str, provider_name: &str) -> Vec<Tool> {
        let bind = |mut tool: Tool| {
            tool.provider_name = Some(provider_name.to_string());
            tool
        };

        if let Ok(manifest) = serde_json::from_str::<Value>(output) {
            if let Some(tools_array) = manifest.get("tools").and_then(|v| v.as_array()) {
                return tools_array
                    .iter()
                    .filter_map(|v| serde_json::from_value::<Tool>(v.clone()).ok())
                    .map(bind)
                    .collect();
            }
        }

        output
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with('{') && line.ends_with('}'))
            .filter_map(|line| serde_json::from_str::<Tool>(line).ok())
            .map(bind)
            .collect()
    }
}

#[async_trait]
impl ClientTransport for CliTransport {
    fn name(&self) -> &'static str {
        "cli"
    }

    fn supports_streaming(&self) -> bool {
        false
    }

    async fn register_tool_provider(&self, prov: &dyn Provider) -> Result<Vec<Tool>, UtcpError> {
        let cli_prov = prov
            .as_any()
            .downcast_ref::<CliProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected a CLI provider".into()))?;

        let (cmd_path, cmd_args) = Self::split_command(&cli_prov.command_name)?;

        let (stdout, stderr, exit_code) = self
            .execute_command(
                &cmd_path,
                &cmd_args,
                &cli_prov.env_vars,
                &cli_prov.working_dir,
                None,
            )
            .await?;

        let output = if exit_code == 0 { stdout } else { stderr };
        if output.trim().is_empty() {
            return Ok(vec![]);
        }

        Ok(self.extract_tools_from_output(&output, &cli_prov.base.name))
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
        let cli_prov = prov
            .as_any()
            .downcast_ref::<CliProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected a CLI provider".into()))?;

        let (cmd_path, _) = Self::split_command(&cli_prov.command_name)?;

        let mut cmd_args = vec![
            "call".to_string(),
            cli_prov.base.name.clone(),
            tool_name.to_string(),
        ];
        cmd_args.extend(self.format_arguments(&args));

        let input_json =
            serde_json::to_string(&args).map_err(|e| UtcpError::EncodeFailed(e.to_string()))?;

        let (stdout, stderr, exit_code) = self
            .execute_command(
                &cmd_path,
                &cmd_args,
                &cli_prov.env_vars,
                &cli_prov.working_dir,
                Some(&input_json),
            )
            .await?;

        let output = if exit_code == 0 { stdout } else { stderr };
        if output.trim().is_empty() {
            return Ok(Value::String(String::new()));
        }

        Ok(serde_json::from_str::<Value>(&output)
            .unwrap_or_else(|_| Value::String(output.trim().to_string())))
    }

    async fn call_tool_stream(
        &self,
        _tool_name: &str,
        _args: HashMap<String, Value>,
        _prov: &dyn Provider,
    ) -> Result<Box<dyn StreamResult>, UtcpError> {
        Err(UtcpError::NoTransport(
            "cli transport does not support streaming".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_command_rejects_shell_metacharacters() {
        assert!(CliTransport::split_command("echo `whoami`").is_err());
    }

    #[test]
    fn split_command_splits_on_whitespace() {
        let (cmd, args) = CliTransport::split_command("python3 server.py").unwrap();
        assert_eq!(cmd, "python3");
        assert_eq!(args, vec!["server.py".to_string()]);
    }

    #[test]
    fn extract_tools_from_manifest_binds_provider_name() {
        let transport = CliTransport::new();
        let output = serde_json::json!({
            "tools": [{
                "name": "echo",
                "description": "d",
                "inputs": {"type": "object"},
                "outputs": {"type": "object"},
                "tags": [],
            }]
        })
        .to_string();
        let tools = transport.extract_tools_from_output(&output, "cli-provider");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].provider_name.as_deref(), Some("cli-provider"));
    }
}
