//! Gateway server bootstrap, background tasks and router wiring.

use super::*;

/// A running gateway: HTTP listener plus its background tasks.
pub struct GatewayServerHandle {
    local_addr: SocketAddr,
    state: Arc<GatewayState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    serve_task: Option<JoinHandle<std::io::Result<()>>>,
    background: GatewayBackgroundTasks,
}

struct GatewayBackgroundTasks {
    idle_sweeper: IdleSweeperHandle,
    connection_observer: Option<JoinHandle<()>>,
    auto_login: Option<JoinHandle<AutoLoginOutcome>>,
}

impl GatewayBackgroundTasks {
    async fn shutdown(&mut self) {
        self.idle_sweeper.shutdown().await;
        if let Some(task) = self.auto_login.take() {
            task.abort();
        }
        if let Some(task) = self.connection_observer.take() {
            task.abort();
        }
    }
}

impl GatewayServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of stream clients currently connected.
    pub fn open_connections(&self) -> usize {
        self.state.fanout.connection_count()
    }

    /// Number of live backend processes.
    pub fn live_processes(&self) -> usize {
        self.state.pool().len()
    }

    /// Resolves when the startup bootstrap gate has opened.
    pub async fn wait_for_bootstrap(&self, limit: Duration) -> bool {
        self.state
            .gate
            .wait(&self.state.config.auto_login.service_id, limit)
            .await
    }

    /// Starts stdio entry mode on the process's own stdin/stdout.
    pub fn spawn_stdio_mode(&self) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            if let Err(error) = stdio_server::run_gateway_stdio(state).await {
                warn!(error = %error, "stdio entry mode stopped");
            }
        })
    }

    /// Stops the sweeper, closes every stream, drains the listener, and terminates all backends.
    pub async fn shutdown(mut self) -> Result<()> {
        self.background.shutdown().await;
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        self.state.fanout.shutdown();
        let serve_result = match self.serve_task.take() {
            Some(task) => task.await.context("gateway server task failed")?,
            None => Ok(()),
        };
        self.state.pool().shutdown();
        info!(addr = %self.local_addr, "relay gateway stopped");
        serve_result.context("relay gateway server exited unexpectedly")
    }
}

/// Loads the registry, binds the listener, and starts serving in the background.
pub async fn start_gateway_server(config: GatewayServerConfig) -> Result<GatewayServerHandle> {
    config.validate()?;
    let bind_addr = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid gateway bind address '{}'", config.bind))?;
    let registry = ServiceRegistry::load(&config.services_file)?;
    info!(
        path = %config.services_file.display(),
        services = registry.len(),
        "service registry loaded"
    );

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind relay gateway on {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound relay gateway address")?;

    let state = Arc::new(GatewayState::new(config, registry));
    let background = start_gateway_background_tasks(&state)?;
    let app = build_gateway_router(Arc::clone(&state));
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let serve_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
    });
    info!(
        addr = %local_addr,
        auth_mode = state.config.auth_mode.as_str(),
        "relay gateway listening"
    );

    Ok(GatewayServerHandle {
        local_addr,
        state,
        shutdown_tx: Some(shutdown_tx),
        serve_task: Some(serve_task),
        background,
    })
}

/// Runs the gateway until Ctrl-C, with stdio entry mode when configured.
pub async fn run_gateway_server(config: GatewayServerConfig) -> Result<()> {
    let stdio_enabled = config.stdio_enabled;
    let handle = start_gateway_server(config).await?;
    let stdio_task = stdio_enabled.then(|| handle.spawn_stdio_mode());

    let signal = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
    if let Some(task) = stdio_task {
        task.abort();
    }
    let shutdown_result = handle.shutdown().await;
    signal.context("failed to listen for shutdown signal")?;
    shutdown_result
}

fn start_gateway_background_tasks(state: &Arc<GatewayState>) -> Result<GatewayBackgroundTasks> {
    let idle_sweeper = start_idle_sweeper(state.pool().clone())?;
    let connection_observer =
        start_connection_observer(state.fanout.clone(), Arc::clone(&state.counters));
    let auto_login = if state.gate.is_open() {
        debug!(
            service = %state.config.auto_login.service_id,
            "auto-login credentials not configured"
        );
        None
    } else {
        let service_id = state.config.auto_login.service_id.as_str();
        Some(spawn_auto_login(
            state.bridge.clone(),
            state.registry.get(service_id),
            state.config.auto_login.clone(),
            state.gate.clone(),
        ))
    };
    Ok(GatewayBackgroundTasks {
        idle_sweeper,
        connection_observer: Some(connection_observer),
        auto_login,
    })
}

pub(super) fn build_gateway_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route(
            SERVICES_ENDPOINT,
            get(handle_list_services).post(handle_register_service),
        )
        .route(SERVICE_DETAIL_ENDPOINT, delete(handle_remove_service))
        .route(STREAM_ENDPOINT, get(handle_stream_connect))
        .route(MCP_ENDPOINT, post(handle_mcp_request))
        .route(INITIALIZE_ENDPOINT, post(handle_initialize))
        .route(GATEWAY_STATUS_ENDPOINT, get(handle_gateway_status))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .with_state(state)
}
