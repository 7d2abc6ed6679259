//! Error envelope shared by every gateway handler.

use super::*;

/// Rendered as `{"error": code, "message": message}` with `status`.
#[derive(Debug)]
pub(super) struct GatewayApiError {
    pub(super) status: StatusCode,
    pub(super) code: &'static str,
    pub(super) message: String,
}

impl GatewayApiError {
    pub(super) fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub(super) fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub(super) fn missing_authorization() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "missing_authorization",
            "Authorization header is required",
        )
    }

    pub(super) fn invalid_token() -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            "invalid_token",
            "Provided token does not match expected value",
        )
    }

    pub(super) fn service_not_found(service_id: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "service_not_found",
            format!("Service not found: {service_id}"),
        )
    }

    pub(super) fn internal(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }
}

impl From<BridgeError> for GatewayApiError {
    fn from(error: BridgeError) -> Self {
        let message = error.to_string();
        match error {
            BridgeError::InvalidCommand(_)
            | BridgeError::ServiceUnavailable(ProcessPoolError::InvalidCommand { .. }) => {
                Self::bad_request("invalid_command", message)
            }
            BridgeError::InvalidRequest(_) => Self::bad_request("invalid_request", message),
            BridgeError::ServiceUnavailable(_) => Self::internal("service_unavailable", message),
            BridgeError::Timeout { .. } => Self::internal("request_timeout", message),
            BridgeError::BackendProtocol { .. } => {
                Self::internal("backend_protocol_error", message)
            }
            BridgeError::BackendIo { .. } => Self::internal("backend_io_error", message),
        }
    }
}

impl From<RegistryError> for GatewayApiError {
    fn from(error: RegistryError) -> Self {
        let message = error.to_string();
        match error {
            RegistryError::Invalid(_) => Self::bad_request("invalid_command", message),
            RegistryError::Persist { .. } => Self::internal("registry_persist_failed", message),
        }
    }
}

impl IntoResponse for GatewayApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "error": self.code,
                "message": self.message,
            })),
        )
            .into_response()
    }
}
