// Provider loading from JSON files
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use crate::config::UtcpClientConfig;
use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::providers::cli::CliProvider;
use crate::providers::graphql::GraphqlProvider;
use crate::providers::grpc::GrpcProvider;
use crate::providers::http::HttpProvider;
use crate::providers::mcp::McpProvider;
use crate::providers::tcp::TcpProvider;
use crate::providers::udp::UdpProvider;
use crate::providers::webrtc::WebRtcProvider;
use crate::providers::websocket::WebSocketProvider;

/// Parses a providers JSON file: `{"providers": [<provider-record>, ...]}`, or a bare
/// array of provider records, or a single record with no wrapper.
pub async fn load_providers_from_file(
    path: impl AsRef<Path>,
    config: &UtcpClientConfig,
) -> Result<Vec<Arc<dyn Provider>>, UtcpError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| UtcpError::Config(format!("failed to read providers file: {e}")))?;
    let json: Value = serde_json::from_str(&contents)
        .map_err(|e| UtcpError::Config(format!("invalid providers JSON: {e}")))?;

    let provider_values = parse_providers_json(json)?;

    let mut providers = Vec::new();
    for (index, mut provider_value) in provider_values.into_iter().enumerate() {
        substitute_variables(&mut provider_value, config);
        providers.push(create_provider_from_value(provider_value, index)?);
    }

    Ok(providers)
}

/// Parses the raw JSON value into a list of provider JSON objects.
fn parse_providers_json(json: Value) -> Result<Vec<Value>, UtcpError> {
    match json {
        Value::Array(arr) => Ok(arr),
        Value::Object(obj) => {
            if let Some(providers_value) = obj.get("providers") {
                match providers_value {
                    Value::Array(arr) => Ok(arr.clone()),
                    Value::Object(_) => Ok(vec![providers_value.clone()]),
                    _ => Err(UtcpError::Config("'providers' field must be an array or object".into())),
                }
            } else {
                Ok(vec![Value::Object(obj)])
            }
        }
        _ => Err(UtcpError::Config("provider config JSON root must be an array or object".into())),
    }
}

/// Creates a Provider instance from a JSON value. Accepts both `"type"` and the
/// legacy `"provider_type"` key; defaults to `http` when neither is present.
fn create_provider_from_value(mut value: Value, index: usize) -> Result<Arc<dyn Provider>, UtcpError> {
    let provider_type = {
        let obj = value
            .as_object_mut()
            .ok_or_else(|| UtcpError::Config("provider record must be an object".into()))?;

        if obj.get("provider_type").is_none() && obj.get("type").is_none() {
            obj.insert("provider_type".to_string(), Value::String("http".to_string()));
            obj.insert("type".to_string(), Value::String("http".to_string()));
        }

        let ptype = obj
            .get("provider_type")
            .or_else(|| obj.get("type"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| UtcpError::Config("missing 'type' field on provider record".into()))?
            .to_string();

        obj.insert("type".to_string(), Value::String(ptype.clone()));
        obj.insert("provider_type".to_string(), Value::String(ptype.clone()));

        if !obj.contains_key("name") {
            obj.insert("name".to_string(), Value::String(format!("{ptype}_{index}")));
        }

        ptype
    };

    match provider_type.as_str() {
        "http" => {
            if let Some(obj) = value.as_object_mut() {
                obj.entry("http_method").or_insert(Value::String("GET".to_string()));
                obj.entry("url").or_insert(Value::String("http://localhost".to_string()));
            }
            let provider: HttpProvider = serde_json::from_value(value).map_err(|e| UtcpError::Config(e.to_string()))?;
            Ok(Arc::new(provider))
        }
        "cli" => {
            let provider: CliProvider = serde_json::from_value(value).map_err(|e| UtcpError::Config(e.to_string()))?;
            Ok(Arc::new(provider))
        }
        "websocket" => {
            let provider: WebSocketProvider = serde_json::from_value(value).map_err(|e| UtcpError::Config(e.to_string()))?;
            Ok(Arc::new(provider))
        }
        "grpc" => {
            let provider: GrpcProvider = serde_json::from_value(value).map_err(|e| UtcpError::Config(e.to_string()))?;
            Ok(Arc::new(provider))
        }
        "graphql" => {
            let provider: GraphqlProvider = serde_json::from_value(value).map_err(|e| UtcpError::Config(e.to_string()))?;
            Ok(Arc::new(provider))
        }
        "tcp" => {
            let provider: TcpProvider = serde_json::from_value(value).map_err(|e| UtcpError::Config(e.to_string()))?;
            Ok(Arc::new(provider))
        }
        "udp" => {
            let provider: UdpProvider = serde_json::from_value(value).map_err(|e| UtcpError::Config(e.to_string()))?;
            Ok(Arc::new(provider))
        }
        "mcp" => {
            let provider: McpProvider = serde_json::from_value(value).map_err(|e| UtcpError::Config(e.to_string()))?;
            Ok(Arc::new(provider))
        }
        "webrtc" => {
            let provider: WebRtcProvider = serde_json::from_value(value).map_err(|e| UtcpError::Config(e.to_string()))?;
            Ok(Arc::new(provider))
        }
        other => Err(UtcpError::Config(format!("unsupported provider type: {other}"))),
    }
}

/// Substitutes `${VAR}`/`$VAR` placeholders from config variables, then from the
/// process environment for anything still unresolved.
fn substitute_variables(value: &mut Value, config: &UtcpClientConfig) {
    match value {
        Value::String(s) => {
            let mut result = s.clone();
            for (key, val) in &config.variables {
                result = result.replace(&format!("${{{key}}}"), val);
                result = result.replace(&format!("${key}"), val);
            }
            if result.contains('$') {
                for key in config.variables.keys() {
                    if let Ok(env_val) = std::env::var(key) {
                        result = result.replace(&format!("${key}"), &env_val);
                        result = result.replace(&format!("${{{key}}}"), &env_val);
                    }
                }
            }
            *s = result;
        }
        Value::Object(obj) => {
            for v in obj.values_mut() {
                substitute_variables(v, config);
            }
        }
        Value::Array(arr) => {
            for item in arr.iter_mut() {
                substitute_variables(item, config);
            }
        }
        _ => {}
    }
}
