//! Startup sign-in for one designated backend service.
//!
//! When credentials are configured, the gateway pre-warms the designated
//! service and calls its sign-in tool once before letting traffic for that
//! service through. Every failure is logged and swallowed.

use std::sync::Arc;
use std::time::Duration;

use relay_registry::ServiceDescriptor;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::request_bridge::RequestBridge;
use crate::runtime_helpers::duration_ms;

pub const DEFAULT_AUTO_LOGIN_SERVICE: &str = "affine";
pub const DEFAULT_AUTO_LOGIN_TOOL: &str = "sign_in";
pub const DEFAULT_AUTO_LOGIN_SETTLE_DELAY: Duration = Duration::from_secs(2);
const AUTO_LOGIN_REQUEST_ID: &str = "relay-auto-login";

#[derive(Clone, PartialEq, Eq)]
pub struct AutoLoginConfig {
    pub service_id: String,
    pub email: Option<String>,
    pub password: Option<String>,
    pub tool_name: String,
    pub settle_delay: Duration,
}

impl std::fmt::Debug for AutoLoginConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoLoginConfig")
            .field("service_id", &self.service_id)
            .field("email", &self.email)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("tool_name", &self.tool_name)
            .field("settle_delay", &self.settle_delay)
            .finish()
    }
}

impl AutoLoginConfig {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            email: None,
            password: None,
            tool_name: DEFAULT_AUTO_LOGIN_TOOL.to_string(),
            settle_delay: DEFAULT_AUTO_LOGIN_SETTLE_DELAY,
        }
    }

    pub fn with_credentials(mut self, email: impl Into<String>, password: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_tool_name(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = tool_name.into();
        self
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    /// Both credentials, when both are present and non-blank.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        let email = self.email.as_deref().map(str::trim).filter(|value| !value.is_empty())?;
        let password = self.password.as_deref().filter(|value| !value.trim().is_empty())?;
        Some((email, password))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AutoLoginOutcome {
    Skipped(String),
    SignedIn,
    /// The tool answered but did not confirm the sign-in.
    Unconfirmed(Value),
    Failed(String),
}

impl AutoLoginOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skipped(_) => "skipped",
            Self::SignedIn => "signed_in",
            Self::Unconfirmed(_) => "unconfirmed",
            Self::Failed(_) => "failed",
        }
    }
}

/// True when any text content item of a `tools/call` result reports `signedIn: true`.
pub fn response_confirms_sign_in(response: &Value) -> bool {
    let Some(content) = response
        .get("result")
        .and_then(|result| result.get("content"))
        .and_then(Value::as_array)
    else {
        return false;
    };
    content
        .iter()
        .filter_map(|item| item.get("text").and_then(Value::as_str))
        .any(|text| {
            match serde_json::from_str::<Value>(text) {
                Ok(parsed) => parsed.get("signedIn") == Some(&Value::Bool(true)),
                Err(_) => text.contains("\"signedIn\":true"),
            }
        })
}

/// Calls the sign-in tool of the designated service once.
pub async fn run_auto_login(
    bridge: &RequestBridge,
    descriptor: Option<&ServiceDescriptor>,
    config: &AutoLoginConfig,
) -> AutoLoginOutcome {
    let Some((email, password)) = config.credentials() else {
        return AutoLoginOutcome::Skipped("credentials not configured".to_string());
    };
    let Some(descriptor) = descriptor else {
        return AutoLoginOutcome::Skipped(format!(
            "service '{}' is not registered",
            config.service_id
        ));
    };

    info!(service = %descriptor.id, tool = %config.tool_name, "auto-login starting");
    let request = json!({
        "jsonrpc": "2.0",
        "id": AUTO_LOGIN_REQUEST_ID,
        "method": "tools/call",
        "params": {
            "name": config.tool_name,
            "arguments": {"email": email, "password": password},
        },
    });
    let response = match bridge.send(descriptor, request).await {
        Ok(response) => response,
        Err(error) => return AutoLoginOutcome::Failed(error.to_string()),
    };
    if let Some(error) = response.get("error") {
        return AutoLoginOutcome::Failed(format!("sign-in rejected: {error}"));
    }
    if response_confirms_sign_in(&response) {
        AutoLoginOutcome::SignedIn
    } else {
        AutoLoginOutcome::Unconfirmed(response)
    }
}

/// Holds back traffic for one service until its startup sign-in has finished.
#[derive(Clone, Debug)]
pub struct BootstrapGate {
    service_id: Option<String>,
    state: Arc<watch::Sender<bool>>,
}

impl BootstrapGate {
    /// A gate that never blocks.
    pub fn open() -> Self {
        let (state, _) = watch::channel(true);
        Self {
            service_id: None,
            state: Arc::new(state),
        }
    }

    pub fn closed_for(service_id: impl Into<String>) -> Self {
        let (state, _) = watch::channel(false);
        Self {
            service_id: Some(service_id.into()),
            state: Arc::new(state),
        }
    }

    pub fn guards(&self, service_id: &str) -> bool {
        self.service_id.as_deref() == Some(service_id)
    }

    pub fn is_open(&self) -> bool {
        *self.state.borrow()
    }

    pub fn release(&self) {
        self.state.send_replace(true);
    }

    /// Waits up to `limit` for the gate when it guards `service_id`.
    ///
    /// Returns false when the wait timed out; callers proceed either way.
    pub async fn wait(&self, service_id: &str, limit: Duration) -> bool {
        if !self.guards(service_id) || self.is_open() {
            return true;
        }
        let mut state = self.state.subscribe();
        let opened = tokio::time::timeout(limit, state.wait_for(|open| *open))
            .await
            .is_ok();
        if !opened {
            warn!(service = %service_id, limit_ms = duration_ms(limit), "bootstrap gate wait timed out");
        }
        opened
    }
}

struct GateRelease(BootstrapGate);

impl Drop for GateRelease {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Runs the auto-login in the background and opens `gate` when it finishes.
///
/// The gate opens whatever the outcome, including when the task is cancelled.
pub fn spawn_auto_login(
    bridge: RequestBridge,
    descriptor: Option<ServiceDescriptor>,
    config: AutoLoginConfig,
    gate: BootstrapGate,
) -> JoinHandle<AutoLoginOutcome> {
    tokio::spawn(async move {
        let _release = GateRelease(gate);
        let outcome = run_auto_login(&bridge, descriptor.as_ref(), &config).await;
        match &outcome {
            AutoLoginOutcome::SignedIn => {
                info!(service = %config.service_id, settle_ms = duration_ms(config.settle_delay), "auto-login succeeded");
                tokio::time::sleep(config.settle_delay).await;
            }
            AutoLoginOutcome::Skipped(reason) => {
                info!(service = %config.service_id, reason = %reason, "auto-login skipped");
            }
            AutoLoginOutcome::Unconfirmed(response) => {
                warn!(service = %config.service_id, response = %response, "auto-login response did not confirm sign-in");
            }
            AutoLoginOutcome::Failed(error) => {
                warn!(service = %config.service_id, error = %error, "auto-login failed; continuing without it");
            }
        }
        outcome
    })
}
