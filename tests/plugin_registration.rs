use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use utcp_runtime::errors::UtcpError;
use utcp_runtime::providers::base::{Provider, ProviderType};
use utcp_runtime::transports::registry::GLOBAL_COMMUNICATION_PROTOCOLS;
use utcp_runtime::transports::stream::{boxed_vec_stream, StreamChunk};
use utcp_runtime::transports::{
    communication_protocols_snapshot, register_communication_protocol, CommunicationProtocol,
};

#[derive(Debug, Default)]
struct CountingProtocol {
    call_count: AtomicUsize,
    stream_count: AtomicUsize,
    captured_args: Mutex<Vec<HashMap<String, Value>>>,
}

#[async_trait]
impl CommunicationProtocol for CountingProtocol {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn register_tool_provider(
        &self,
        _prov: &dyn Provider,
    ) -> Result<Vec<utcp_runtime::tools::Tool>, UtcpError> {
        Ok(vec![])
    }

    async fn deregister_tool_provider(&self, _prov: &dyn Provider) -> Result<(), UtcpError> {
        Ok(())
    }

    async fn call_tool(
        &self,
        _tool_name: &str,
        args: HashMap<String, Value>,
        _prov: &dyn Provider,
    ) -> Result<Value, UtcpError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.captured_args.lock().unwrap().push(args.clone());
        Ok(json!({ "echo": args }))
    }

    async fn call_tool_stream(
        &self,
        _tool_name: &str,
        args: HashMap<String, Value>,
        _prov: &dyn Provider,
    ) -> Result<Box<dyn utcp_runtime::transports::stream::StreamResult>, UtcpError> {
        self.stream_count.fetch_add(1, Ordering::SeqCst);
        self.captured_args.lock().unwrap().push(args.clone());
        Ok(boxed_vec_stream(
            vec![json!({ "stream": args })],
            "demo.stream",
            "dummy",
            "counting",
        ))
    }
}

#[derive(Debug, Clone)]
struct DummyProvider {
    name: String,
}

impl DummyProvider {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl Provider for DummyProvider {
    fn type_(&self) -> ProviderType {
        ProviderType::Http
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[test]
fn registering_custom_plugins_makes_them_available() {
    let key = "myproto_test";
    let registry_before = communication_protocols_snapshot();

    register_communication_protocol(key, Arc::new(CountingProtocol::default()));
    let snapshot = communication_protocols_snapshot();
    assert!(
        snapshot.get(key).is_some(),
        "custom communication protocol should be registered"
    );

    if let Ok(mut reg) = GLOBAL_COMMUNICATION_PROTOCOLS.write() {
        *reg = registry_before;
    }
}

#[tokio::test]
async fn custom_protocol_call_tool_and_stream_are_invoked() {
    let key = "myproto_calls";
    let registry_before = communication_protocols_snapshot();
    let protocol = Arc::new(CountingProtocol::default());
    register_communication_protocol(key, protocol.clone());

    let snapshot = communication_protocols_snapshot();
    let proto = snapshot
        .get(key)
        .expect("custom protocol should be visible in snapshot");

    let provider = DummyProvider::new("dummy");
    let mut args = HashMap::new();
    args.insert("foo".into(), json!(1));

    let call_response = proto
        .call_tool("demo.tool", args.clone(), &provider)
        .await
        .unwrap();
    assert_eq!(call_response, json!({ "echo": args.clone() }));
    assert_eq!(protocol.call_count.load(Ordering::SeqCst), 1);

    let mut stream = proto
        .call_tool_stream("demo.stream", args.clone(), &provider)
        .await
        .unwrap();
    let first = stream.next().await.unwrap().unwrap();
    match first {
        StreamChunk::Data { data, .. } => assert_eq!(data, json!({ "stream": args.clone() })),
        other => panic!("expected a data chunk, got {other:?}"),
    }
    let second = stream.next().await.unwrap().unwrap();
    assert!(matches!(second, StreamChunk::End { .. }));
    assert!(stream.next().await.unwrap().is_none());
    assert_eq!(protocol.stream_count.load(Ordering::SeqCst), 1);

    let captured = protocol.captured_args.lock().unwrap();
    assert_eq!(
        captured.len(),
        2,
        "call_tool and call_tool_stream should capture args"
    );

    if let Ok(mut reg) = GLOBAL_COMMUNICATION_PROTOCOLS.write() {
        *reg = registry_before;
    }
}
