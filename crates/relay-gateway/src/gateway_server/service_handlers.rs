//! Service registration endpoints.
use super::*;

pub(super) async fn handle_register_service(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(error) = authorize_gateway_request(&state, &headers) {
        return error.into_response();
    }
    let descriptor = match parse_service_descriptor(&body) {
        Ok(descriptor) => descriptor,
        Err(error) => return error.into_response(),
    };
    let service_id = descriptor.id.clone();
    let previous = state.registry.get(&service_id);
    let command = descriptor.command.clone();
    if let Err(error) = state.registry.register(descriptor) {
        warn!(service = %service_id, error = %error, "service registration failed");
        return GatewayApiError::from(error).into_response();
    }
    if let Some(previous) = previous.filter(|previous| previous.command != command) {
        retire_unshared_process(&state, &previous);
    }
    info!(service = %service_id, command = ?command, "service registered");
    Json(json!({"message": format!("Service {service_id} registered successfully")}))
        .into_response()
}

pub(super) async fn handle_list_services(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(error) = authorize_gateway_request(&state, &headers) {
        return error.into_response();
    }
    Json(json!({"services": state.registry.ids()})).into_response()
}

pub(super) async fn handle_remove_service(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(service_id): Path<String>,
) -> Response {
    if let Err(error) = authorize_gateway_request(&state, &headers) {
        return error.into_response();
    }
    let Some(descriptor) = state.registry.get(&service_id) else {
        return GatewayApiError::service_not_found(&service_id).into_response();
    };
    match state.registry.remove(&service_id) {
        Ok(true) => {}
        Ok(false) => return GatewayApiError::service_not_found(&service_id).into_response(),
        Err(error) => {
            warn!(service = %service_id, error = %error, "service removal failed");
            return GatewayApiError::from(error).into_response();
        }
    }
    retire_unshared_process(&state, &descriptor);
    info!(service = %service_id, "service removed");
    Json(json!({"message": format!("Service {service_id} removed successfully")})).into_response()
}

/// The `id` and `command` fields are required; everything else is optional.
fn parse_service_descriptor(body: &Bytes) -> Result<ServiceDescriptor, GatewayApiError> {
    let payload = parse_gateway_json_body::<Value>(body)?;
    let has_id = payload
        .get("id")
        .and_then(Value::as_str)
        .is_some_and(|id| !id.trim().is_empty());
    let has_command = payload
        .get("command")
        .and_then(Value::as_array)
        .is_some_and(|command| !command.is_empty());
    if !has_id || !has_command {
        return Err(GatewayApiError::bad_request(
            "invalid_request",
            "Missing service ID or command",
        ));
    }
    serde_json::from_value::<ServiceDescriptor>(payload).map_err(|error| {
        GatewayApiError::bad_request("invalid_request", format!("invalid service descriptor: {error}"))
    })
}

/// Stops the idle process behind `descriptor` unless a remaining service still uses its key.
fn retire_unshared_process(state: &GatewayState, descriptor: &ServiceDescriptor) {
    let key = state.bridge.service_key(descriptor);
    let still_used = state
        .registry
        .descriptors()
        .iter()
        .any(|remaining| state.bridge.service_key(remaining) == key);
    if still_used {
        debug!(service = %descriptor.id, key = %key, "process key still in use; not retiring");
        return;
    }
    if state.pool().retire(&key) {
        info!(service = %descriptor.id, key = %key, "retired process of removed service");
    }
}
