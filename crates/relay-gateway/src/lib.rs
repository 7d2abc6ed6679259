//! Client-facing surfaces of the relay gateway.
//!
//! Serves the HTTP API (service registration, request forwarding, server-push
//! streams, status) and the optional line-delimited JSON-RPC stdio entry mode
//! on top of the process bridge runtime.

pub mod gateway_server;

pub use gateway_server::{
    run_gateway_server, start_gateway_server, GatewayAuthMode, GatewayServerConfig,
    GatewayServerHandle, MAX_REQUEST_BODY_BYTES,
};
