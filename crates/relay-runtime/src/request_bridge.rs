//! Translates gateway requests into backend JSON-RPC calls.

use std::sync::Arc;
use std::time::Duration;

use relay_registry::{validate_command, CommandValidationError, ServiceDescriptor};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::managed_process::ChannelError;
use crate::process_pool::{ProcessPool, ProcessPoolError, ProcessSpec};
use crate::runtime_helpers::duration_ms;
use crate::service_key::ServiceKeyResolver;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Methods the backends speak natively; anything else is treated as a tool name.
pub const RECOGNIZED_BACKEND_METHODS: [&str; 8] = [
    "initialize",
    "tools/list",
    "tools/call",
    "notifications/list",
    "resources/list",
    "resources/read",
    "resources/subscribe",
    "resources/unsubscribe",
];

/// Receives `(service_key, frame)` for every backend notification observed.
pub type NotificationHook = Arc<dyn Fn(&str, &Value) + Send + Sync>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid command: {0}")]
    InvalidCommand(#[from] CommandValidationError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    ServiceUnavailable(#[from] ProcessPoolError),
    #[error("service '{key}' did not respond within {timeout_ms}ms")]
    Timeout { key: String, timeout_ms: u64 },
    #[error("service '{key}' produced invalid output: {detail}")]
    BackendProtocol { key: String, detail: String },
    #[error("service '{key}' stdio failure: {detail}")]
    BackendIo { key: String, detail: String },
}

pub fn is_recognized_method(method: &str) -> bool {
    RECOGNIZED_BACKEND_METHODS.contains(&method)
}

/// Rewrites `payload` into the backend's JSON-RPC dialect.
///
/// Native method calls pass through untouched apart from a default `id` of 1.
/// Any other method becomes a `tools/call` of the tool with that name.
pub fn normalize_request(payload: Value) -> Result<Value, BridgeError> {
    let Value::Object(mut object) = payload else {
        return Err(BridgeError::InvalidRequest(
            "request payload must be a JSON object".to_string(),
        ));
    };
    let method = match object.get("method") {
        None => None,
        Some(Value::String(method)) => Some(method.clone()),
        Some(_) => {
            return Err(BridgeError::InvalidRequest(
                "request method must be a string".to_string(),
            ))
        }
    };

    match method {
        Some(method) if !is_recognized_method(method.as_str()) => {
            let id = match object.remove("id") {
                None | Some(Value::Null) => json!(1),
                Some(id) => id,
            };
            let arguments = match object.remove("params") {
                None | Some(Value::Null) => Value::Object(Map::new()),
                Some(params) => params,
            };
            Ok(json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": "tools/call",
                "params": {
                    "name": method,
                    "arguments": arguments,
                },
            }))
        }
        _ => {
            if !object.contains_key("id") {
                object.insert("id".to_string(), json!(1));
            }
            Ok(Value::Object(object))
        }
    }
}

/// Sends normalized requests to pooled backend processes and correlates replies.
#[derive(Clone)]
pub struct RequestBridge {
    pool: ProcessPool,
    resolver: Arc<ServiceKeyResolver>,
    request_timeout: Duration,
    notification_hook: Option<NotificationHook>,
}

impl std::fmt::Debug for RequestBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBridge")
            .field("pool", &self.pool)
            .field("resolver", &self.resolver)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl RequestBridge {
    pub fn new(pool: ProcessPool, resolver: ServiceKeyResolver, request_timeout: Duration) -> Self {
        Self {
            pool,
            resolver: Arc::new(resolver),
            request_timeout,
            notification_hook: None,
        }
    }

    pub fn with_notification_hook(mut self, hook: NotificationHook) -> Self {
        self.notification_hook = Some(hook);
        self
    }

    pub fn pool(&self) -> &ProcessPool {
        &self.pool
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn service_key(&self, descriptor: &ServiceDescriptor) -> String {
        self.resolver.resolve(&descriptor.command)
    }

    /// Delivers `payload` to the backend behind `descriptor` and returns its response.
    ///
    /// Calls for one process are serialized. A timeout fails only this call;
    /// the process stays pooled for the next one.
    pub async fn send(
        &self,
        descriptor: &ServiceDescriptor,
        payload: Value,
    ) -> Result<Value, BridgeError> {
        validate_command(&descriptor.command)?;
        let request = normalize_request(payload)?;
        let key = self.service_key(descriptor);
        let spec = ProcessSpec::from_descriptor(key.clone(), descriptor);
        let lease = self.pool.acquire(&spec).await?;
        let deadline = Instant::now() + self.request_timeout;

        let method = request.get("method").and_then(Value::as_str);
        let expected_id = request.get("id").cloned().unwrap_or(Value::Null);
        let is_initialize = method == Some("initialize");
        if is_initialize {
            if let Some(result) = lease.cached_initialize_result() {
                debug!(service = %key, "answering initialize from cached backend result");
                return Ok(json!({"jsonrpc": "2.0", "id": expected_id, "result": result}));
            }
        }

        let timeout = || BridgeError::Timeout {
            key: key.clone(),
            timeout_ms: duration_ms(self.request_timeout),
        };
        let Ok(mut channel) = tokio::time::timeout_at(deadline, lease.channel().lock()).await
        else {
            return Err(timeout());
        };
        let hook = self.notification_hook.clone();
        let hook_key = key.clone();
        let on_notification = move |frame: &Value| match hook.as_ref() {
            Some(hook) => hook(hook_key.as_str(), frame),
            None => debug!(service = %hook_key, frame = %frame, "backend notification dropped"),
        };

        let outcome = channel
            .exchange(&request, &expected_id, deadline, &on_notification)
            .await;
        drop(channel);
        match outcome {
            Ok(response) => {
                if is_initialize {
                    if let Some(result) = response.get("result") {
                        lease.cache_initialize_result(result.clone());
                    }
                }
                Ok(response)
            }
            Err(ChannelError::Timeout) => {
                warn!(
                    service = %key,
                    timeout_ms = duration_ms(self.request_timeout),
                    "backend request timed out; process kept alive"
                );
                Err(timeout())
            }
            Err(ChannelError::Closed { partial: true }) => Err(BridgeError::BackendProtocol {
                key,
                detail: "stdout closed in the middle of a JSON value".to_string(),
            }),
            Err(ChannelError::Closed { partial: false }) => {
                let detail = match lease.exit_status() {
                    Some(exit) => format!("backend exited ({})", exit.detail),
                    None => "backend closed stdout".to_string(),
                };
                Err(BridgeError::BackendIo { key, detail })
            }
            Err(ChannelError::Protocol(detail)) => Err(BridgeError::BackendProtocol { key, detail }),
            Err(ChannelError::Io(detail)) => {
                warn!(service = %key, error = %detail, "backend stdin failed; terminating process");
                lease.terminate();
                Err(BridgeError::BackendIo { key, detail })
            }
        }
    }
}
