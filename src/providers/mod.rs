pub mod base;
pub mod cli;
pub mod graphql;
pub mod grpc;
pub mod http;
pub mod mcp;
pub mod tcp;
pub mod udp;
pub mod webrtc;
pub mod websocket;
