use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::fs;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::runtime::Runtime;
use utcp_runtime::{
    config::UtcpClientConfig, repository::in_memory::InMemoryToolRepository,
    search::SearchEngine, UtcpClient,
};

/// Builds a client from a providers-file JSON. Registration failures against
/// unreachable hosts are swallowed by the orchestrator (logged, not fatal), so
/// this measures provider construction plus the registration attempt itself.
async fn create_client_from_config(config_json: serde_json::Value) -> Arc<UtcpClient> {
    let temp_file = NamedTempFile::new().unwrap();
    fs::write(temp_file.path(), serde_json::to_vec(&config_json).unwrap()).unwrap();

    let config = UtcpClientConfig::new().with_providers_file(temp_file.path().to_path_buf());
    let repo = Arc::new(InMemoryToolRepository::new());
    let search = Arc::new(SearchEngine::new(repo.clone()));

    Arc::new(UtcpClient::new(config, repo, search).await.unwrap())
}

/// Compare provider registration overhead across transport kinds.
fn bench_provider_comparison(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("provider_initialization");

    group.bench_function("http", |b| {
        b.to_async(&rt).iter(|| async {
            let config_json = json!({
                "providers": [{
                    "type": "http",
                    "name": "http_test",
                    "url": "http://localhost:9999/tools",
                    "http_method": "GET"
                }]
            });
            black_box(create_client_from_config(black_box(config_json)).await)
        });
    });

    group.bench_function("cli", |b| {
        b.to_async(&rt).iter(|| async {
            let config_json = json!({
                "providers": [{
                    "type": "cli",
                    "name": "cli_test",
                    "command_name": "echo"
                }]
            });
            black_box(create_client_from_config(black_box(config_json)).await)
        });
    });

    group.bench_function("websocket", |b| {
        b.to_async(&rt).iter(|| async {
            let config_json = json!({
                "providers": [{
                    "type": "websocket",
                    "name": "ws_test",
                    "url": "ws://localhost:9999"
                }]
            });
            black_box(create_client_from_config(black_box(config_json)).await)
        });
    });

    group.bench_function("mcp", |b| {
        b.to_async(&rt).iter(|| async {
            let config_json = json!({
                "providers": [{
                    "type": "mcp",
                    "name": "mcp_test",
                    "url": "http://localhost:9999/mcp"
                }]
            });
            black_box(create_client_from_config(black_box(config_json)).await)
        });
    });

    group.bench_function("grpc", |b| {
        b.to_async(&rt).iter(|| async {
            let config_json = json!({
                "providers": [{
                    "type": "grpc",
                    "name": "grpc_test",
                    "host": "localhost",
                    "port": 9999,
                    "service_name": "bench.Service",
                    "method_name": "Call"
                }]
            });
            black_box(create_client_from_config(black_box(config_json)).await)
        });
    });

    group.finish();
}

/// Benchmark loading multiple providers at once.
fn bench_multi_provider_loading(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("load_5_providers", |b| {
        b.to_async(&rt).iter(|| async {
            let config_json = json!({
                "providers": [
                    { "type": "http", "name": "http_provider", "url": "http://localhost:8001/tools" },
                    { "type": "cli", "name": "cli_provider", "command_name": "echo" },
                    { "type": "websocket", "name": "ws_provider", "url": "ws://localhost:8002" },
                    { "type": "mcp", "name": "mcp_provider", "url": "http://localhost:8003/mcp" },
                    { "type": "grpc", "name": "grpc_provider", "host": "localhost", "port": 8004, "service_name": "bench.Service", "method_name": "Call" }
                ]
            });
            black_box(create_client_from_config(black_box(config_json)).await)
        });
    });
}

criterion_group!(benches, bench_provider_comparison, bench_multi_provider_loading);
criterion_main!(benches);
