use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use relay_registry::{RegistryError, ServiceDescriptor, ServiceRegistry};
use relay_runtime::{
    current_unix_timestamp_ms, duration_ms, spawn_auto_login, start_idle_sweeper, AutoLoginConfig,
    AutoLoginOutcome, BootstrapGate, BridgeError, FanOutConfig, FanOutEvent, IdleSweeperHandle,
    NotificationHook, ProcessPool, ProcessPoolConfig, ProcessPoolError, RequestBridge,
    ServiceKeyResolver, StreamFanOutPool, StreamFrame, DEFAULT_REQUEST_TIMEOUT,
    MCP_PROTOCOL_VERSION,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

mod auth_runtime;
mod bridge_handlers;
mod server_bootstrap;
mod service_handlers;
mod status_runtime;
mod stdio_server;
mod stream_handlers;
mod types;

use auth_runtime::authorize_gateway_request;
use bridge_handlers::{handle_initialize, handle_mcp_request};
pub use server_bootstrap::{run_gateway_server, start_gateway_server, GatewayServerHandle};
use service_handlers::{handle_list_services, handle_register_service, handle_remove_service};
use status_runtime::{handle_gateway_status, start_connection_observer, GatewayCounters};
use stream_handlers::handle_stream_connect;
use types::GatewayApiError;

const SERVICES_ENDPOINT: &str = "/services";
const SERVICE_DETAIL_ENDPOINT: &str = "/services/{id}";
const STREAM_ENDPOINT: &str = "/sse/{client_id}";
const MCP_ENDPOINT: &str = "/mcp/{service_id}";
const INITIALIZE_ENDPOINT: &str = "/initialize";
const GATEWAY_STATUS_ENDPOINT: &str = "/gateway/status";

/// Largest accepted request body.
pub const MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;

/// How inbound HTTP requests are authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatewayAuthMode {
    /// Shared secret in the `Authorization` header.
    #[default]
    Token,
    /// No authentication; meant for loopback development only.
    LocalhostDev,
}

impl GatewayAuthMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::LocalhostDev => "localhost-dev",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayServerConfig {
    pub bind: String,
    pub services_file: PathBuf,
    pub auth_mode: GatewayAuthMode,
    pub auth_token: Option<String>,
    pub pool: ProcessPoolConfig,
    pub request_timeout: Duration,
    pub fanout: FanOutConfig,
    pub resolver: ServiceKeyResolver,
    pub auto_login: AutoLoginConfig,
    pub stdio_enabled: bool,
}

impl GatewayServerConfig {
    pub fn new(bind: impl Into<String>, services_file: impl Into<PathBuf>) -> Self {
        Self {
            bind: bind.into(),
            services_file: services_file.into(),
            auth_mode: GatewayAuthMode::Token,
            auth_token: None,
            pool: ProcessPoolConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            fanout: FanOutConfig::default(),
            resolver: ServiceKeyResolver::default(),
            auto_login: AutoLoginConfig::new(relay_runtime::DEFAULT_AUTO_LOGIN_SERVICE),
            stdio_enabled: false,
        }
    }

    /// Rejects settings the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.auth_mode == GatewayAuthMode::Token
            && self
                .auth_token
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .is_empty()
        {
            anyhow::bail!("token auth mode requires a non-empty auth token");
        }
        if self.request_timeout.is_zero() {
            anyhow::bail!("request timeout must be greater than zero");
        }
        if self.fanout.heartbeat_interval.is_zero() {
            anyhow::bail!("heartbeat interval must be greater than zero");
        }
        let pool = &self.pool;
        for (name, value) in [
            ("startup timeout", pool.startup_timeout),
            ("slow-start grace", pool.slow_start_grace),
            ("idle timeout", pool.idle_timeout),
            ("idle sweep interval", pool.idle_sweep_interval),
        ] {
            if value.is_zero() {
                anyhow::bail!("{name} must be greater than zero");
            }
        }
        Ok(())
    }
}

struct GatewayState {
    config: GatewayServerConfig,
    registry: Arc<ServiceRegistry>,
    bridge: RequestBridge,
    fanout: StreamFanOutPool,
    gate: BootstrapGate,
    counters: Arc<Mutex<GatewayCounters>>,
    started_unix_ms: u64,
}

impl GatewayState {
    fn new(config: GatewayServerConfig, registry: ServiceRegistry) -> Self {
        let fanout = StreamFanOutPool::new(config.fanout.clone());
        let counters = Arc::new(Mutex::new(GatewayCounters::default()));
        let bridge = RequestBridge::new(
            ProcessPool::new(config.pool.clone()),
            config.resolver.clone(),
            config.request_timeout,
        )
        .with_notification_hook(notification_broadcast_hook(
            fanout.clone(),
            Arc::clone(&counters),
        ));
        let gate = if config.auto_login.credentials().is_some() {
            BootstrapGate::closed_for(config.auto_login.service_id.clone())
        } else {
            BootstrapGate::open()
        };
        Self {
            config,
            registry: Arc::new(registry),
            bridge,
            fanout,
            gate,
            counters,
            started_unix_ms: current_unix_timestamp_ms(),
        }
    }

    fn pool(&self) -> &ProcessPool {
        self.bridge.pool()
    }
}

fn notification_broadcast_hook(
    fanout: StreamFanOutPool,
    counters: Arc<Mutex<GatewayCounters>>,
) -> NotificationHook {
    Arc::new(move |service_key: &str, frame: &Value| {
        let report = fanout.broadcast(&json!({
            "type": "notification",
            "service": service_key,
            "message": frame,
        }));
        status_runtime::record_notification(&counters, report.delivered);
        debug!(
            service = %service_key,
            delivered = report.delivered,
            removed = report.removed,
            "backend notification broadcast"
        );
    })
}

fn parse_gateway_json_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, GatewayApiError> {
    serde_json::from_slice::<T>(body).map_err(|error| {
        GatewayApiError::bad_request("invalid_request", format!("invalid JSON body: {error}"))
    })
}
