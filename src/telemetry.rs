//! Event sink for the client orchestrator and transports.
//!
//! Health-check, metrics, and tracing sidecars all reduce to one interface: a named
//! event taxonomy with timing and labels. Emission is fire-and-forget and must never
//! fail or block the caller.
use std::time::Duration;

/// One phase of orchestrator/transport activity worth observing externally.
#[derive(Debug, Clone)]
pub enum Event {
    ToolCall {
        tool: String,
        provider: String,
        transport: &'static str,
        duration: Duration,
        ok: bool,
    },
    Search {
        query: String,
        algorithm: &'static str,
        matches: usize,
        duration: Duration,
    },
    Provider {
        provider: String,
        action: &'static str, // "register" | "deregister"
        ok: bool,
    },
    Connection {
        pool_key: String,
        action: &'static str, // "open" | "reuse" | "evict" | "reconnect" | "close"
    },
    HealthCheck {
        provider: String,
        ok: bool,
    },
}

/// Pluggable telemetry consumer. Implementations must not panic or block; the
/// orchestrator and transports call `emit` without awaiting any result.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Default sink: drops every event. Library consumers who don't care about
/// observability pay nothing for it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: Event) {}
}

/// Sink that forwards events to `tracing`, one structured span-free event per call,
/// tagged the way the rest of the ecosystem tags request/response events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: Event) {
        match event {
            Event::ToolCall {
                tool,
                provider,
                transport,
                duration,
                ok,
            } => {
                tracing::info!(
                    target: "utcp::tool_call",
                    tool = %tool,
                    provider = %provider,
                    transport,
                    duration_ms = duration.as_millis() as u64,
                    ok,
                    "tool_call"
                );
            }
            Event::Search {
                query,
                algorithm,
                matches,
                duration,
            } => {
                tracing::info!(
                    target: "utcp::search",
                    query = %query,
                    algorithm,
                    matches,
                    duration_ms = duration.as_millis() as u64,
                    "search"
                );
            }
            Event::Provider {
                provider,
                action,
                ok,
            } => {
                tracing::info!(
                    target: "utcp::provider",
                    provider = %provider,
                    action,
                    ok,
                    "provider"
                );
            }
            Event::Connection { pool_key, action } => {
                tracing::debug!(
                    target: "utcp::connection",
                    pool_key = %pool_key,
                    action,
                    "connection"
                );
            }
            Event::HealthCheck { provider, ok } => {
                tracing::info!(
                    target: "utcp::health_check",
                    provider = %provider,
                    ok,
                    "health_check"
                );
            }
        }
    }
}
