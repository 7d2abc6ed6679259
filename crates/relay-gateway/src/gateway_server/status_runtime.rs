//! Request/connection counters and the status endpoint.
use relay_runtime::ManagedProcessSnapshot;

use super::*;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub(super) struct ServiceRequestCounters {
    pub(super) requests_total: u64,
    pub(super) failures_total: u64,
    pub(super) duration_ms_total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) last_error_code: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub(super) struct GatewayCounters {
    pub(super) services: BTreeMap<String, ServiceRequestCounters>,
    pub(super) open_connections: usize,
    pub(super) connections_opened_total: u64,
    pub(super) connections_closed_total: u64,
    pub(super) notifications_total: u64,
    pub(super) notification_deliveries_total: u64,
}

#[derive(Debug, Serialize)]
struct GatewayStatusReport {
    started_unix_ms: u64,
    uptime_ms: u64,
    auth_mode: &'static str,
    services: GatewayServicesStatus,
    processes: Vec<ManagedProcessSnapshot>,
    spawn_count: u64,
    streams: GatewayStreamStatus,
    bootstrap: GatewayBootstrapStatus,
    requests: BTreeMap<String, ServiceRequestCounters>,
}

#[derive(Debug, Serialize)]
struct GatewayServicesStatus {
    registered: usize,
    ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct GatewayStreamStatus {
    open_connections: usize,
    connections_opened_total: u64,
    connections_closed_total: u64,
    notifications_total: u64,
    notification_deliveries_total: u64,
    heartbeat_interval_ms: u64,
}

#[derive(Debug, Serialize)]
struct GatewayBootstrapStatus {
    service_id: String,
    gate_open: bool,
}

pub(super) fn record_service_request(
    counters: &Mutex<GatewayCounters>,
    service_id: &str,
    elapsed: Duration,
    error_code: Option<&'static str>,
) {
    if let Ok(mut counters) = counters.lock() {
        let entry = counters.services.entry(service_id.to_string()).or_default();
        entry.requests_total = entry.requests_total.saturating_add(1);
        entry.duration_ms_total = entry
            .duration_ms_total
            .saturating_add(duration_ms(elapsed));
        if let Some(code) = error_code {
            entry.failures_total = entry.failures_total.saturating_add(1);
            entry.last_error_code = Some(code.to_string());
        }
    }
}

pub(super) fn record_notification(counters: &Mutex<GatewayCounters>, delivered: usize) {
    if let Ok(mut counters) = counters.lock() {
        counters.notifications_total = counters.notifications_total.saturating_add(1);
        counters.notification_deliveries_total = counters
            .notification_deliveries_total
            .saturating_add(u64::try_from(delivered).unwrap_or(u64::MAX));
    }
}

pub(super) fn apply_fanout_event(counters: &Mutex<GatewayCounters>, event: &FanOutEvent) {
    let Ok(mut counters) = counters.lock() else {
        return;
    };
    match event {
        FanOutEvent::ConnectionAdded {
            open_connections, ..
        } => {
            counters.open_connections = *open_connections;
            counters.connections_opened_total = counters.connections_opened_total.saturating_add(1);
        }
        FanOutEvent::ConnectionRemoved {
            open_connections, ..
        } => {
            counters.open_connections = *open_connections;
            counters.connections_closed_total = counters.connections_closed_total.saturating_add(1);
        }
    }
}

/// Keeps the connection gauge in step with the fan-out pool until aborted.
pub(super) fn start_connection_observer(
    fanout: StreamFanOutPool,
    counters: Arc<Mutex<GatewayCounters>>,
) -> JoinHandle<()> {
    let mut events = fanout.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => apply_fanout_event(&counters, &event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "connection observer lagged; resynchronising gauge");
                    if let Ok(mut counters) = counters.lock() {
                        counters.open_connections = fanout.connection_count();
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn collect_gateway_status_report(state: &GatewayState) -> GatewayStatusReport {
    let counters = state
        .counters
        .lock()
        .map(|counters| counters.clone())
        .unwrap_or_default();
    let now_unix_ms = current_unix_timestamp_ms();
    let ids = state.registry.ids();
    GatewayStatusReport {
        started_unix_ms: state.started_unix_ms,
        uptime_ms: now_unix_ms.saturating_sub(state.started_unix_ms),
        auth_mode: state.config.auth_mode.as_str(),
        services: GatewayServicesStatus {
            registered: ids.len(),
            ids,
        },
        processes: state.pool().snapshots(),
        spawn_count: state.pool().spawn_count(),
        streams: GatewayStreamStatus {
            open_connections: counters.open_connections,
            connections_opened_total: counters.connections_opened_total,
            connections_closed_total: counters.connections_closed_total,
            notifications_total: counters.notifications_total,
            notification_deliveries_total: counters.notification_deliveries_total,
            heartbeat_interval_ms: duration_ms(state.fanout.config().heartbeat_interval),
        },
        bootstrap: GatewayBootstrapStatus {
            service_id: state.config.auto_login.service_id.clone(),
            gate_open: state.gate.is_open(),
        },
        requests: counters.services,
    }
}

pub(super) async fn handle_gateway_status(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(error) = authorize_gateway_request(&state, &headers) {
        return error.into_response();
    }
    Json(collect_gateway_status_report(&state)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_runtime::RemovalReason;

    #[test]
    fn unit_record_service_request_accumulates_failures_and_duration() {
        let counters = Mutex::new(GatewayCounters::default());
        record_service_request(&counters, "echo", Duration::from_millis(12), None);
        record_service_request(
            &counters,
            "echo",
            Duration::from_millis(30),
            Some("request_timeout"),
        );
        let counters = counters.lock().expect("counters");
        let echo = counters.services.get("echo").expect("echo counters");
        assert_eq!(echo.requests_total, 2);
        assert_eq!(echo.failures_total, 1);
        assert_eq!(echo.duration_ms_total, 42);
        assert_eq!(echo.last_error_code.as_deref(), Some("request_timeout"));
    }

    #[test]
    fn regression_request_and_notification_counters_saturate() {
        let counters = Mutex::new(GatewayCounters::default());
        record_service_request(&counters, "echo", Duration::MAX, None);
        record_service_request(&counters, "echo", Duration::from_millis(5), None);
        record_notification(&counters, usize::MAX);
        record_notification(&counters, 3);
        let counters = counters.lock().expect("counters");
        let echo = counters.services.get("echo").expect("echo counters");
        assert_eq!(echo.duration_ms_total, u64::MAX);
        assert_eq!(counters.notifications_total, 2);
        assert_eq!(counters.notification_deliveries_total, u64::MAX);
    }

    #[test]
    fn unit_apply_fanout_event_tracks_gauge_and_totals() {
        let counters = Mutex::new(GatewayCounters::default());
        apply_fanout_event(
            &counters,
            &FanOutEvent::ConnectionAdded {
                client_id: "a".to_string(),
                open_connections: 1,
            },
        );
        apply_fanout_event(
            &counters,
            &FanOutEvent::ConnectionAdded {
                client_id: "b".to_string(),
                open_connections: 2,
            },
        );
        apply_fanout_event(
            &counters,
            &FanOutEvent::ConnectionRemoved {
                client_id: "a".to_string(),
                open_connections: 1,
                reason: RemovalReason::SinkClosed,
            },
        );
        let counters = counters.lock().expect("counters");
        assert_eq!(counters.open_connections, 1);
        assert_eq!(counters.connections_opened_total, 2);
        assert_eq!(counters.connections_closed_total, 1);
    }
}
