// WebRTC Transport - peer-to-peer data channels
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::auth::AuthConfig;
use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::providers::webrtc::WebRtcProvider;
use crate::tools::Tool;
use crate::transports::{stream::StreamResult, ClientTransport};

pub struct WebRtcTransport;

impl Default for WebRtcTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WebRtcTransport {
    pub fn new() -> Self {
        Self
    }

    fn apply_auth(&self, _auth: &AuthConfig) -> Result<(), UtcpError> {
        Err(UtcpError::Authentication("authentication is not yet supported by the WebRTC transport".into()))
    }

    fn check_auth(&self, prov: &WebRtcProvider) -> Result<(), UtcpError> {
        if let Some(auth) = prov.base.auth.as_ref() {
            self.apply_auth(auth)?;
        }
        Ok(())
    }

    /// Parses the provider's inline tool list. Every element must be a JSON object
    /// decodable as a `Tool`; anything else is a registration-time error.
    fn parse_inline_tools(prov: &WebRtcProvider) -> Result<Vec<Tool>, UtcpError> {
        prov.tools
            .iter()
            .map(|entry| {
                if !entry.is_object() {
                    return Err(UtcpError::InvalidProvider(format!(
                        "WebRTC provider '{}' has a non-object entry in its inline tool list",
                        prov.base.name
                    )));
                }
                let mut tool: Tool = serde_json::from_value(entry.clone())
                    .map_err(|e| UtcpError::InvalidProvider(format!("invalid inline tool for provider '{}': {e}", prov.base.name)))?;
                tool.provider_name = Some(prov.base.name.clone());
                Ok(tool)
            })
            .collect()
    }
}

#[async_trait]
impl ClientTransport for WebRtcTransport {
    fn name(&self) -> &'static str {
        "webrtc"
    }

    async fn register_tool_provider(&self, prov: &dyn Provider) -> Result<Vec<Tool>, UtcpError> {
        let webrtc_prov = prov
            .as_any()
            .downcast_ref::<WebRtcProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected a WebRTC provider".into()))?;

        self.check_auth(webrtc_prov)?;
        Self::parse_inline_tools(webrtc_prov)
    }

    async fn deregister_tool_provider(&self, _prov: &dyn Provider) -> Result<(), UtcpError> {
        Ok(())
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        _args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Value, UtcpError> {
        let webrtc_prov = prov
            .as_any()
            .downcast_ref::<WebRtcProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected a WebRTC provider".into()))?;

        self.check_auth(webrtc_prov)?;

        // Peer connection negotiation (signaling exchange, ICE gathering, data
        // channel open) is out of scope; providers only describe their tools here.
        Err(UtcpError::NoTransport(format!(
            "WebRTC transport requires a live data channel to call '{tool_name}', which is not established by this client"
        )))
    }

    async fn call_tool_stream(
        &self,
        _tool_name: &str,
        _args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Box<dyn StreamResult>, UtcpError> {
        let webrtc_prov = prov
            .as_any()
            .downcast_ref::<WebRtcProvider>()
            .ok_or_else(|| UtcpError::InvalidProvider("expected a WebRTC provider".into()))?;

        self.check_auth(webrtc_prov)?;
        Err(UtcpError::NoTransport("webrtc transport does not support streaming".into()))
    }
}
