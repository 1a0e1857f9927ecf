use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInputOutputSchema {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<HashMap<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<HashMap<String, serde_json::Value>>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// One callable operation exposed by a provider. The fully-qualified identifier
/// `<provider_name>.<name>` is what callers pass to `call_tool`; a tool is owned by
/// exactly one provider at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub inputs: ToolInputOutputSchema,
    pub outputs: ToolInputOutputSchema,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_response_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_name: Option<String>,
}

impl Tool {
    /// Fully-qualified name, e.g. `weather.get_forecast`. Returns the bare name when
    /// the tool has not yet been bound to a provider.
    pub fn qualified_name(&self) -> String {
        match &self.provider_name {
            Some(provider) => format!("{provider}.{}", self.name),
            None => self.name.clone(),
        }
    }
}
