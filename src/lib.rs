pub mod bus;
pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod metrics;
pub mod protocol;
pub mod rate_limit;
pub mod store;
pub mod ws;

use crate::bus::{MemoryBus, MessageBus, NatsBus};
use crate::cache::{MemoryTaskCache, RedisTaskCache, TaskCache};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::gateway::{GatewayHandler, Subjects};
use crate::hub::Hub;
use crate::metrics::MetricsService;
use crate::rate_limit::{build_limiter, CounterStore, LocalCounterStore};
use crate::store::RedisStore;
use crate::ws::{create_router, AppState};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info};

/// External collaborators the gateway runs against
pub struct Backends {
    pub counters: Arc<dyn CounterStore>,
    pub cache: Arc<dyn TaskCache>,
    pub bus: Arc<dyn MessageBus>,
}

impl Backends {
    /// Everything in-process: no shared store, no message broker
    pub fn in_process(config: &GatewayConfig) -> Self {
        Self {
            counters: Arc::new(LocalCounterStore::new()),
            cache: Arc::new(MemoryTaskCache::new(&config.cache)),
            bus: Arc::new(MemoryBus::default()),
        }
    }
}

/// Connect the configured store and bus, falling back to in-process ones
pub async fn connect_backends(config: &GatewayConfig) -> Result<Backends> {
    let (counters, cache): (Arc<dyn CounterStore>, Arc<dyn TaskCache>) = match &config.redis {
        Some(redis) => {
            let store = RedisStore::connect(redis).await?;
            (
                Arc::new(store.clone()),
                Arc::new(RedisTaskCache::new(store, config.cache.clone())),
            )
        }
        None => {
            info!("No shared store configured, counters and results stay in-process");
            (
                Arc::new(LocalCounterStore::new()),
                Arc::new(MemoryTaskCache::new(&config.cache)),
            )
        }
    };

    let bus: Arc<dyn MessageBus> = match &config.nats {
        Some(nats) => Arc::new(NatsBus::connect(nats).await?),
        None => {
            info!("No message bus configured, using in-process bus");
            Arc::new(MemoryBus::default())
        }
    };

    Ok(Backends {
        counters,
        cache,
        bus,
    })
}

/// Compose limiter, hub, cache and bus into the gateway handler
pub fn build_handler(config: &GatewayConfig, backends: Backends) -> Arc<GatewayHandler> {
    let limiter = build_limiter(&config.rate_limit, backends.counters);
    let (request, result) = config.subjects();

    Arc::new(
        GatewayHandler::new(
            Arc::new(Hub::new()),
            limiter,
            backends.cache,
            backends.bus,
            Subjects { request, result },
        )
        .with_translation_reuse(config.cache.translation_reuse),
    )
}

/// Serve on `listener` until `shutdown` resolves, relaying bus results meanwhile
pub async fn serve<F>(
    listener: TcpListener,
    config: &GatewayConfig,
    handler: Arc<GatewayHandler>,
    metrics: Option<MetricsService>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (stop_relay, relay_stopped) = oneshot::channel::<()>();
    let relay = handler
        .start_result_relay(async {
            let _ = relay_stopped.await;
        })
        .await?;

    let state = AppState {
        handler,
        connection: config.connection.clone(),
    };
    let app = create_router(
        state,
        &config.server.path,
        metrics
            .as_ref()
            .map(|service| (config.metrics.path.as_str(), service.clone())),
    );

    info!("Gateway ready to accept connections");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| GatewayError::Internal(format!("Server error: {}", e)))?;

    let _ = stop_relay.send(());
    if let Err(e) = relay.await {
        error!(error = %e, "Result relay task failed");
    }
    Ok(())
}

/// Initialize the gateway server and run it until SIGINT or SIGTERM
pub async fn init_gateway(config: GatewayConfig) -> Result<()> {
    config.validate()?;

    info!("Starting translate gateway");

    let metrics = if config.metrics.enabled {
        Some(MetricsService::new()?)
    } else {
        None
    };

    let backends = connect_backends(&config).await?;
    let handler = build_handler(&config, backends);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(
        "Server listening on {}{}",
        addr, config.server.path
    );

    serve(listener, &config, handler, metrics, shutdown_signal()).await?;

    info!("Gateway stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}

/// Initialize tracing/logging
pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "translate_gateway=debug,tower_http=debug".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}
