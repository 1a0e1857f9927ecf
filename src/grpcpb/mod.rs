//! Generated client/server types for the UTCP gRPC service, compiled by `build.rs`
//! from `utcp.proto` into `generated/utcp.rs`.
#![allow(clippy::all)]

include!("generated/utcp.rs");
