//! Shared-secret authentication for gateway HTTP requests.
use super::*;

/// Token carried by the `Authorization` header, with or without a `Bearer ` prefix.
///
/// `None` when the header is absent; a header that is not valid UTF-8 yields
/// an empty token so it can never match.
fn presented_token_from_headers(headers: &HeaderMap) -> Option<String> {
    let header = headers.get(header::AUTHORIZATION)?;
    let Ok(raw) = header.to_str() else {
        return Some(String::new());
    };
    let token = raw.strip_prefix("Bearer ").unwrap_or(raw);
    Some(token.trim().to_string())
}

pub(super) fn authorize_gateway_request(
    state: &GatewayState,
    headers: &HeaderMap,
) -> Result<&'static str, GatewayApiError> {
    match state.config.auth_mode {
        GatewayAuthMode::LocalhostDev => Ok(GatewayAuthMode::LocalhostDev.as_str()),
        GatewayAuthMode::Token => {
            let expected = state
                .config
                .auth_token
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| {
                    GatewayApiError::internal(
                        "internal_error",
                        "gateway token auth mode is misconfigured",
                    )
                })?;
            let Some(observed) = presented_token_from_headers(headers) else {
                debug!("request rejected: missing authorization header");
                return Err(GatewayApiError::missing_authorization());
            };
            if observed != expected {
                debug!("request rejected: token mismatch");
                return Err(GatewayApiError::invalid_token());
            }
            Ok(GatewayAuthMode::Token.as_str())
        }
    }
}
