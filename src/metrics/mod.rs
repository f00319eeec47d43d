use crate::error::{GatewayError, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use tracing::{debug, info};

/// Metrics service for collecting and exposing Prometheus metrics
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl MetricsService {
    /// Install the Prometheus recorder for this process
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            GatewayError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

        Self::register_metrics();

        info!("Metrics service initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    /// Register all metrics with descriptions
    fn register_metrics() {
        // Connection metrics
        describe_counter!(
            "gateway_connections_total",
            "Total number of accepted client connections"
        );
        describe_counter!(
            "gateway_connections_rejected_total",
            "Total number of connections refused before upgrade"
        );
        describe_gauge!(
            "gateway_active_clients",
            "Number of registered client connections"
        );

        // Delivery metrics
        describe_counter!(
            "gateway_messages_dropped_total",
            "Total number of outbound messages dropped on a full queue"
        );
        describe_counter!(
            "gateway_cache_replays_total",
            "Total number of requests answered from the result cache"
        );

        // Bus metrics
        describe_counter!(
            "gateway_requests_published_total",
            "Total number of requests published to the bus"
        );
        describe_counter!(
            "gateway_publish_errors_total",
            "Total number of failed bus publishes"
        );
        describe_counter!(
            "gateway_invalid_messages_total",
            "Total number of malformed inbound or result payloads"
        );

        // Rate limiting metrics
        describe_counter!(
            "gateway_rate_limit_exceeded_total",
            "Total number of admissions rejected by rate limiting"
        );

        debug!("All metrics registered with descriptions");
    }

    /// Get the Prometheus metrics handle
    pub fn handle(&self) -> Arc<PrometheusHandle> {
        self.handle.clone()
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Metrics endpoint handler
pub async fn metrics_handler(State(service): State<MetricsService>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        service.render(),
    )
}

/// Record an accepted connection
pub fn record_connection() {
    counter!("gateway_connections_total").increment(1);
}

/// Record a connection refused by admission control
pub fn record_connection_rejected() {
    counter!("gateway_connections_rejected_total").increment(1);
}

/// Record the current size of the connection registry
pub fn set_active_clients(count: usize) {
    gauge!("gateway_active_clients").set(count as f64);
}

/// Record an outbound message dropped because the client queue was full
pub fn record_message_dropped() {
    counter!("gateway_messages_dropped_total").increment(1);
}

/// Record a request served from cache without a bus round trip
pub fn record_cache_replay(source: &str) {
    let labels = [("source", source.to_string())];
    counter!("gateway_cache_replays_total", &labels).increment(1);
}

/// Record a request published to the bus
pub fn record_published() {
    counter!("gateway_requests_published_total").increment(1);
}

/// Record a failed bus publish
pub fn record_publish_error() {
    counter!("gateway_publish_errors_total").increment(1);
}

/// Record a payload that failed to parse
pub fn record_invalid_message(direction: &str) {
    let labels = [("direction", direction.to_string())];
    counter!("gateway_invalid_messages_total", &labels).increment(1);
}

/// Record rate limit exceeded; `scope` is `global` or `key`
pub fn record_rate_limit_exceeded(scope: &str) {
    let labels = [("scope", scope.to_string())];
    counter!("gateway_rate_limit_exceeded_total", &labels).increment(1);
}
