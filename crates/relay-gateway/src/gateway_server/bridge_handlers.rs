//! Request forwarding endpoints.
use super::*;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct InitializeRequest {
    service_id: String,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    params: Option<Value>,
}

pub(super) async fn handle_mcp_request(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(service_id): Path<String>,
    body: Bytes,
) -> Response {
    if let Err(error) = authorize_gateway_request(&state, &headers) {
        return error.into_response();
    }
    let payload = match parse_gateway_json_body::<Value>(&body) {
        Ok(payload) => payload,
        Err(error) => return error.into_response(),
    };
    match forward_to_service(&state, &service_id, payload).await {
        Ok(response) => Json(response).into_response(),
        Err(error) => error.into_response(),
    }
}

pub(super) async fn handle_initialize(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(error) = authorize_gateway_request(&state, &headers) {
        return error.into_response();
    }
    let request = match parse_gateway_json_body::<InitializeRequest>(&body) {
        Ok(request) => request,
        Err(error) => return error.into_response(),
    };
    let payload = build_initialize_payload(request.id, request.params);
    match forward_to_service(&state, &request.service_id, payload).await {
        Ok(response) => Json(response).into_response(),
        Err(error) => error.into_response(),
    }
}

pub(super) fn build_initialize_payload(id: Option<Value>, params: Option<Value>) -> Value {
    let params = params.filter(|params| !params.is_null()).unwrap_or_else(|| {
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "relay-gateway",
                "version": env!("CARGO_PKG_VERSION"),
            },
        })
    });
    json!({
        "jsonrpc": "2.0",
        "id": id.filter(|id| !id.is_null()).unwrap_or_else(|| json!(1)),
        "method": "initialize",
        "params": params,
    })
}

/// Looks up `service_id`, waits for its bootstrap, and sends `payload` through the bridge.
///
/// Every outcome after the registry lookup is counted against the service.
pub(super) async fn forward_to_service(
    state: &GatewayState,
    service_id: &str,
    payload: Value,
) -> Result<Value, GatewayApiError> {
    let Some(descriptor) = state.registry.get(service_id) else {
        return Err(GatewayApiError::service_not_found(service_id));
    };
    state
        .gate
        .wait(service_id, state.bridge.request_timeout())
        .await;

    let started = tokio::time::Instant::now();
    let result = state
        .bridge
        .send(&descriptor, payload)
        .await
        .map_err(GatewayApiError::from);
    let elapsed = started.elapsed();
    status_runtime::record_service_request(
        &state.counters,
        service_id,
        elapsed,
        result.as_ref().err().map(|error| error.code),
    );
    match &result {
        Ok(_) => debug!(
            service = %service_id,
            duration_ms = duration_ms(elapsed),
            "service request completed"
        ),
        Err(error) => warn!(
            service = %service_id,
            code = error.code,
            error = %error.message,
            "service request failed"
        ),
    }
    result
}
