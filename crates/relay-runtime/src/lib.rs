//! Process bridge runtime for the relay gateway.
//!
//! Owns the stdio backend processes (spawn, readiness, reuse, idle eviction,
//! teardown), the JSON-RPC request bridge that multiplexes gateway calls onto
//! them, and the fan-out pool that pushes events to streaming clients.

pub mod auto_login;
pub mod fanout_pool;
pub mod jsonrpc_frames;
pub mod managed_process;
pub mod process_pool;
pub mod request_bridge;
mod runtime_helpers;
pub mod service_key;

pub use auto_login::*;
pub use fanout_pool::*;
pub use jsonrpc_frames::*;
pub use managed_process::*;
pub use process_pool::*;
pub use request_bridge::*;
pub use runtime_helpers::{current_unix_timestamp_ms, duration_ms};
pub use service_key::*;
