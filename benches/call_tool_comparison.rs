use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc};
use tokio::runtime::Runtime;
use utcp_runtime::{
    config::UtcpClientConfig,
    errors::UtcpError,
    providers::base::{BaseProvider, Provider, ProviderType},
    repository::in_memory::InMemoryToolRepository,
    search::SearchEngine,
    tools::{Tool, ToolInputOutputSchema},
    transports::{
        registry::register_communication_protocol,
        stream::{boxed_vec_stream, StreamResult},
        CommunicationProtocol,
    },
    UtcpClient, UtcpClientInterface,
};

// A transport that answers locally, so these benchmarks measure orchestrator
// overhead (tool resolution, caching, telemetry) rather than network latency.
#[derive(Debug)]
struct BenchmarkProtocol;

fn schema() -> ToolInputOutputSchema {
    ToolInputOutputSchema {
        type_: "object".to_string(),
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

#[async_trait]
impl CommunicationProtocol for BenchmarkProtocol {
    fn name(&self) -> &'static str {
        "benchmark"
    }

    async fn register_tool_provider(&self, _prov: &dyn Provider) -> Result<Vec<Tool>, UtcpError> {
        Ok(vec![
            Tool {
                name: "echo".to_string(),
                description: "Echo tool".to_string(),
                inputs: schema(),
                outputs: schema(),
                tags: vec![],
                average_response_size: None,
                provider_name: None,
            },
            Tool {
                name: "stream".to_string(),
                description: "Streaming tool".to_string(),
                inputs: schema(),
                outputs: schema(),
                tags: vec![],
                average_response_size: None,
                provider_name: None,
            },
        ])
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
        Ok(json!(args))
    }

    async fn call_tool_stream(
        &self,
        tool_name: &str,
        _args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Box<dyn StreamResult>, UtcpError> {
        let items: Vec<Value> = (0..10).map(|i| json!({"chunk": i})).collect();
        Ok(boxed_vec_stream(items, tool_name, prov.name(), "benchmark"))
    }
}

async fn create_bench_client() -> Arc<UtcpClient> {
    register_communication_protocol("http", Arc::new(BenchmarkProtocol));

    let config = UtcpClientConfig::new();
    let repo = Arc::new(InMemoryToolRepository::new());
    let search = Arc::new(SearchEngine::new(repo.clone()));
    let client = UtcpClient::create(config, repo, search).await.unwrap();

    let provider: Arc<dyn Provider> = Arc::new(BaseProvider::new("bench".to_string(), ProviderType::Http));
    client.register_tool_provider(provider).await.unwrap();

    Arc::new(client)
}

fn bench_call_tool(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let client = rt.block_on(create_bench_client());

    c.bench_function("call_tool_native", |b| {
        b.to_async(&rt).iter(|| async {
            let mut args = HashMap::new();
            args.insert("msg".to_string(), json!("hello"));
            client
                .call_tool(black_box("bench.echo"), black_box(args))
                .await
                .unwrap()
        });
    });
}

fn bench_call_tool_stream(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let client = rt.block_on(create_bench_client());

    c.bench_function("call_tool_stream_native", |b| {
        b.to_async(&rt).iter(|| async {
            let args = HashMap::new();
            let mut stream = client
                .call_tool_stream(black_box("bench.stream"), black_box(args))
                .await
                .unwrap();

            let mut count = 0;
            while let Ok(Some(_)) = stream.next().await {
                count += 1;
            }
            black_box(count)
        });
    });
}

fn bench_call_many_tools(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let client = rt.block_on(create_bench_client());
    let tool_count = 50;

    c.bench_function("call_many_tools_native", |b| {
        b.to_async(&rt).iter(|| async {
            for i in 0..tool_count {
                let mut args = HashMap::new();
                args.insert("msg".to_string(), json!(format!("hello {}", i)));
                client
                    .call_tool(black_box("bench.echo"), black_box(args))
                    .await
                    .unwrap();
            }
        });
    });
}

criterion_group!(
    benches,
    bench_call_tool,
    bench_call_tool_stream,
    bench_call_many_tools,
);
criterion_main!(benches);
