//! Gateway handler
//!
//! Bridges client connections to the message bus:
//!
//! - a new connection is admitted by the rate limiter, keyed by peer address
//! - the first parsed message registers the connection in the [`Hub`]
//! - a request whose id already has a finished record is answered from cache
//! - everything else gets a request id, a pending record, and one publish
//! - results from the bus are recorded and delivered through the hub

use crate::bus::MessageBus;
use crate::cache::{content_hash, RequestRecord, TaskCache};
use crate::hub::{ConnectionId, Delivery, Hub};
use crate::metrics;
use crate::protocol::{self, TranslateRequest, TranslateResponse};
use crate::rate_limit::RateLimiter;
use bytes::Bytes;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-connection state owned by the accepting task.
///
/// Until the first message arrives the connection has no client id and
/// holds its own outbound sender; registration hands that sender to the hub.
pub struct ConnectionState {
    conn_id: ConnectionId,
    peer: String,
    client_id: Option<String>,
    outbound: Option<mpsc::Sender<Bytes>>,
}

impl ConnectionState {
    pub fn new(conn_id: ConnectionId, peer: impl Into<String>, outbound: mpsc::Sender<Bytes>) -> Self {
        Self {
            conn_id,
            peer: peer.into(),
            client_id: None,
            outbound: Some(outbound),
        }
    }

    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Identity assigned on the first message
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn is_registered(&self) -> bool {
        self.client_id.is_some()
    }
}

/// Bus subjects used by the gateway
#[derive(Debug, Clone)]
pub struct Subjects {
    pub request: String,
    pub result: String,
}

/// What became of one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Published to the request subject
    Published { request_id: String },
    /// Answered from the request record cache
    Replayed { request_id: String },
    /// Answered from the translation cache
    Reused { request_id: String },
    /// Publish failed; the record is marked failed
    PublishFailed { request_id: String },
    /// Could not be parsed and was discarded
    Invalid,
}

/// Top-level composition of limiter, cache, bus and hub
pub struct GatewayHandler {
    hub: Arc<Hub>,
    limiter: Arc<dyn RateLimiter>,
    cache: Arc<dyn TaskCache>,
    bus: Arc<dyn MessageBus>,
    subjects: Subjects,
    translation_reuse: bool,
}

impl GatewayHandler {
    pub fn new(
        hub: Arc<Hub>,
        limiter: Arc<dyn RateLimiter>,
        cache: Arc<dyn TaskCache>,
        bus: Arc<dyn MessageBus>,
        subjects: Subjects,
    ) -> Self {
        Self {
            hub,
            limiter,
            cache,
            bus,
            subjects,
            translation_reuse: true,
        }
    }

    /// Enable or disable answering from the translation cache
    pub fn with_translation_reuse(mut self, enabled: bool) -> Self {
        self.translation_reuse = enabled;
        self
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn cache(&self) -> &Arc<dyn TaskCache> {
        &self.cache
    }

    /// Admission check for a new connection, keyed by peer address
    pub async fn admit(&self, peer: &str) -> bool {
        let allowed = self.limiter.allow(peer).await;
        if allowed {
            metrics::record_connection();
        } else {
            warn!(peer, "Connection rejected by rate limiter");
            metrics::record_connection_rejected();
        }
        allowed
    }

    /// Handle one inbound frame from `conn`
    pub async fn handle_inbound(&self, conn: &mut ConnectionState, payload: &[u8]) -> InboundOutcome {
        let mut request: TranslateRequest = match protocol::decode(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(conn_id = conn.conn_id, error = %e, "Invalid inbound message, dropped");
                metrics::record_invalid_message("inbound");
                return InboundOutcome::Invalid;
            }
        };

        request.client_id = self.ensure_registered(conn, &request.client_id);

        if !request.request_id.is_empty() {
            if let Some(record) = self.finished_record(&request.request_id).await {
                let mut response = TranslateResponse::from_record(&record);
                response.client_id = request.client_id.clone();
                info!(
                    client_id = %request.client_id,
                    request_id = %request.request_id,
                    "Replaying cached result"
                );
                self.deliver(&response);
                metrics::record_cache_replay("task");
                return InboundOutcome::Replayed {
                    request_id: request.request_id,
                };
            }
        } else {
            request.request_id = Uuid::new_v4().to_string();
        }

        if self.translation_reuse {
            if let Some(outcome) = self.reuse_translation(&request).await {
                return outcome;
            }
        }

        self.publish(request).await
    }

    /// Register the connection on its first message and return its client id
    fn ensure_registered(&self, conn: &mut ConnectionState, requested: &str) -> String {
        if let Some(id) = &conn.client_id {
            return id.clone();
        }

        let id = if requested.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            requested.to_string()
        };

        if let Some(outbound) = conn.outbound.take() {
            self.hub.add_client(id.clone(), conn.conn_id, outbound);
        }
        debug!(conn_id = conn.conn_id, peer = %conn.peer, client_id = %id, "Connection identified");
        conn.client_id = Some(id.clone());
        id
    }

    async fn finished_record(&self, request_id: &str) -> Option<RequestRecord> {
        match self.cache.get_task(request_id).await {
            Ok(Some(record)) if record.is_done() => Some(record),
            Ok(_) => None,
            Err(e) => {
                // an unreadable cache behaves like a miss
                warn!(request_id, error = %e, "Task cache lookup failed");
                None
            }
        }
    }

    async fn reuse_translation(&self, request: &TranslateRequest) -> Option<InboundOutcome> {
        if request.source_text.is_empty() {
            return None;
        }
        let hash = content_hash(&request.lang_from, &request.lang_to, &request.source_text);
        let text = match self.cache.cached_translation(&hash).await {
            Ok(Some(text)) => text,
            Ok(None) => return None,
            Err(e) => {
                warn!(request_id = %request.request_id, error = %e, "Translation cache lookup failed");
                return None;
            }
        };

        debug!(request_id = %request.request_id, "Answering from translation cache");
        let record = RequestRecord::pending(
            &request.request_id,
            &request.client_id,
            &request.source_text,
            &request.lang_from,
            &request.lang_to,
        )
        .complete(text.clone());
        self.record_finished(&record).await;
        self.deliver(&TranslateResponse::for_request(request, text));
        metrics::record_cache_replay("translation");

        Some(InboundOutcome::Reused {
            request_id: request.request_id.clone(),
        })
    }

    async fn publish(&self, request: TranslateRequest) -> InboundOutcome {
        let record = RequestRecord::pending(
            &request.request_id,
            &request.client_id,
            &request.source_text,
            &request.lang_from,
            &request.lang_to,
        );
        if let Err(e) = self.cache.advance_task(&record).await {
            warn!(request_id = %record.request_id, error = %e, "Failed to save pending record");
        }

        let published = match serde_json::to_vec(&request) {
            Ok(payload) => self
                .bus
                .publish(&self.subjects.request, Bytes::from(payload))
                .await,
            Err(e) => Err(e.into()),
        };

        match published {
            Ok(()) => {
                debug!(
                    client_id = %request.client_id,
                    request_id = %request.request_id,
                    subject = %self.subjects.request,
                    "Request published"
                );
                metrics::record_published();
                InboundOutcome::Published {
                    request_id: request.request_id,
                }
            }
            Err(e) => {
                error!(request_id = %request.request_id, error = %e, "Failed to publish request");
                metrics::record_publish_error();
                if let Err(e) = self.cache.advance_task(&record.fail()).await {
                    warn!(request_id = %request.request_id, error = %e, "Failed to mark record failed");
                }
                InboundOutcome::PublishFailed {
                    request_id: request.request_id,
                }
            }
        }
    }

    /// Handle one result envelope from the bus
    pub async fn handle_result(&self, payload: &[u8]) -> Option<Delivery> {
        let mut response: TranslateResponse = match protocol::decode(payload) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Invalid result message, dropped");
                metrics::record_invalid_message("result");
                return None;
            }
        };

        if !response.request_id.is_empty() {
            let record = match self.cache.get_task(&response.request_id).await {
                Ok(Some(existing)) => existing,
                Ok(None) => RequestRecord::pending(
                    &response.request_id,
                    &response.client_id,
                    "",
                    &response.lang_from,
                    &response.lang_to,
                ),
                Err(e) => {
                    warn!(request_id = %response.request_id, error = %e, "Task cache lookup failed");
                    RequestRecord::pending(
                        &response.request_id,
                        &response.client_id,
                        "",
                        &response.lang_from,
                        &response.lang_to,
                    )
                }
            };

            // workers may answer without echoing the routing fields
            if response.client_id.is_empty() {
                response.client_id = record.client_id.clone();
            }
            if response.lang_from.is_empty() {
                response.lang_from = record.lang_from.clone();
            }
            if response.lang_to.is_empty() {
                response.lang_to = record.lang_to.clone();
            }

            self.record_finished(&record.complete(response.result.clone()))
                .await;
        }

        Some(self.deliver(&response))
    }

    /// Persist a finished record, the client's history and the translation
    async fn record_finished(&self, record: &RequestRecord) {
        match self.cache.advance_task(record).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(request_id = %record.request_id, "Record already final, not rewritten");
                return;
            }
            Err(e) => {
                warn!(request_id = %record.request_id, error = %e, "Failed to save finished record");
                return;
            }
        }

        if !record.client_id.is_empty() {
            if let Err(e) = self
                .cache
                .add_user_task(&record.client_id, &record.request_id)
                .await
            {
                warn!(client_id = %record.client_id, error = %e, "Failed to append user task");
            }
        }

        if !record.source_text.is_empty() {
            let hash = content_hash(&record.lang_from, &record.lang_to, &record.source_text);
            if let Err(e) = self.cache.save_translation(&hash, &record.result_text).await {
                warn!(request_id = %record.request_id, error = %e, "Failed to cache translation");
            }
        }
    }

    fn deliver(&self, response: &TranslateResponse) -> Delivery {
        match self.hub.send_response(response) {
            Ok(delivery) => delivery,
            Err(e) => {
                error!(request_id = %response.request_id, error = %e, "Failed to encode response");
                Delivery::Dropped
            }
        }
    }

    /// Subscribe to the result subject and relay results until `shutdown`
    /// resolves. The subscription is active when this returns.
    pub async fn start_result_relay<F>(
        self: &Arc<Self>,
        shutdown: F,
    ) -> crate::error::Result<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut results = self.bus.subscribe(&self.subjects.result).await?;
        info!(subject = %self.subjects.result, "Result relay started");

        let handler = self.clone();
        Ok(tokio::spawn(async move {
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    _ = &mut shutdown => {
                        info!("Result relay stopping");
                        break;
                    }
                    message = results.next() => match message {
                        Some(payload) => {
                            handler.handle_result(&payload).await;
                        }
                        None => {
                            warn!("Result subscription ended");
                            break;
                        }
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::cache::{CacheConfig, MemoryTaskCache, TaskStatus};
    use crate::error::{GatewayError, Result};
    use crate::rate_limit::MemoryRateLimiter;
    use async_trait::async_trait;
    use std::time::Duration;

    struct FailingBus;

    #[async_trait]
    impl MessageBus for FailingBus {
        async fn publish(&self, _subject: &str, _payload: Bytes) -> Result<()> {
            Err(GatewayError::Bus("not connected".to_string()))
        }
        async fn subscribe(&self, _subject: &str) -> Result<crate::bus::BusStream> {
            Err(GatewayError::Bus("not connected".to_string()))
        }
    }

    fn subjects() -> Subjects {
        Subjects {
            request: "translate.request".to_string(),
            result: "translate.result".to_string(),
        }
    }

    fn handler_with_bus(bus: Arc<dyn MessageBus>) -> GatewayHandler {
        GatewayHandler::new(
            Arc::new(Hub::new()),
            Arc::new(MemoryRateLimiter::new(2, Duration::from_secs(60))),
            Arc::new(MemoryTaskCache::new(&CacheConfig::default())),
            bus,
            subjects(),
        )
    }

    fn connection(handler: &GatewayHandler) -> (ConnectionState, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(8);
        let conn = ConnectionState::new(handler.hub().next_connection_id(), "127.0.0.1", tx);
        (conn, rx)
    }

    fn request(request_id: &str, client_id: &str, text: &str) -> Vec<u8> {
        serde_json::to_vec(&TranslateRequest {
            request_id: request_id.to_string(),
            client_id: client_id.to_string(),
            source_text: text.to_string(),
            lang_from: "en".to_string(),
            lang_to: "zh".to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_admit_uses_limiter() {
        let handler = handler_with_bus(Arc::new(MemoryBus::default()));
        assert!(handler.admit("10.0.0.1").await);
        assert!(handler.admit("10.0.0.1").await);
        assert!(!handler.admit("10.0.0.1").await);
        assert!(handler.admit("10.0.0.2").await);
    }

    #[tokio::test]
    async fn test_first_message_registers_connection() {
        let handler = handler_with_bus(Arc::new(MemoryBus::default()));
        let (mut conn, _rx) = connection(&handler);
        assert!(!conn.is_registered());

        handler.handle_inbound(&mut conn, &request("r1", "", "hi")).await;

        let client_id = conn.client_id().unwrap().to_string();
        assert!(Uuid::parse_str(&client_id).is_ok());
        assert!(handler.hub().contains(&client_id));

        // later messages keep the identity, whatever they claim
        handler
            .handle_inbound(&mut conn, &request("r2", "someone-else", "yo"))
            .await;
        assert_eq!(conn.client_id(), Some(client_id.as_str()));
        assert_eq!(handler.hub().client_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_payload_is_dropped() {
        let handler = handler_with_bus(Arc::new(MemoryBus::default()));
        let (mut conn, _rx) = connection(&handler);

        assert_eq!(
            handler.handle_inbound(&mut conn, b"{not json").await,
            InboundOutcome::Invalid
        );
        assert!(!conn.is_registered());
    }

    #[tokio::test]
    async fn test_publish_assigns_request_id_and_saves_pending() {
        let bus = Arc::new(MemoryBus::default());
        let mut requests = bus.subscribe("translate.request").await.unwrap();
        let handler = handler_with_bus(bus);
        let (mut conn, _rx) = connection(&handler);

        let outcome = handler
            .handle_inbound(&mut conn, &request("", "c1", "hello"))
            .await;
        let request_id = match outcome {
            InboundOutcome::Published { request_id } => request_id,
            other => panic!("expected publish, got {:?}", other),
        };
        assert!(!request_id.is_empty());

        let published: TranslateRequest =
            serde_json::from_slice(&requests.next().await.unwrap()).unwrap();
        assert_eq!(published.request_id, request_id);
        assert_eq!(published.client_id, "c1");

        let record = handler.cache().get_task(&request_id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.source_text, "hello");
    }

    #[tokio::test]
    async fn test_result_without_client_id_routes_to_assigned_client() {
        let handler = handler_with_bus(Arc::new(MemoryBus::default()));
        let (mut conn, mut rx) = connection(&handler);

        handler.handle_inbound(&mut conn, &request("r1", "", "hello")).await;
        let assigned = conn.client_id().unwrap().to_string();

        let delivery = handler
            .handle_result(br#"{"request_id":"r1","result":"\u4f60\u597d"}"#)
            .await;
        assert_eq!(delivery, Some(Delivery::Queued));

        let delivered: TranslateResponse = serde_json::from_slice(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(delivered.client_id, assigned);
        assert_eq!(delivered.request_id, "r1");
        assert_eq!(delivered.result, "你好");
        assert_eq!((delivered.lang_from.as_str(), delivered.lang_to.as_str()), ("en", "zh"));

        let record = handler.cache().get_task("r1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Done);
        assert_eq!(record.client_id, assigned);
    }

    #[tokio::test]
    async fn test_publish_failure_marks_record_failed() {
        let handler = handler_with_bus(Arc::new(FailingBus));
        let (mut conn, _rx) = connection(&handler);

        let outcome = handler
            .handle_inbound(&mut conn, &request("r1", "c1", "hello"))
            .await;
        assert_eq!(
            outcome,
            InboundOutcome::PublishFailed {
                request_id: "r1".to_string()
            }
        );
        // the connection stays registered and usable
        assert!(handler.hub().contains("c1"));

        let record = handler.cache().get_task("r1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_result_is_recorded_and_delivered() {
        let handler = handler_with_bus(Arc::new(MemoryBus::default()));
        let (mut conn, mut rx) = connection(&handler);
        handler
            .handle_inbound(&mut conn, &request("r1", "c1", "hello"))
            .await;

        let result = br#"{"client_id":"c1","request_id":"r1","lang_from":"en","lang_to":"zh","result":"hi-zh"}"#;
        assert_eq!(handler.handle_result(result).await, Some(Delivery::Queued));

        let delivered: TranslateResponse = serde_json::from_slice(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(delivered.result, "hi-zh");

        let record = handler.cache().get_task("r1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Done);
        assert_eq!(record.source_text, "hello");
        assert_eq!(handler.cache().user_tasks("c1", 10).await.unwrap(), vec!["r1"]);
    }

    #[tokio::test]
    async fn test_duplicate_request_replayed_without_publish() {
        let bus = Arc::new(MemoryBus::default());
        let mut requests = bus.subscribe("translate.request").await.unwrap();
        let handler = handler_with_bus(bus);
        let (mut conn, mut rx) = connection(&handler);

        handler
            .handle_inbound(&mut conn, &request("r1", "c1", "hello"))
            .await;
        handler
            .handle_result(br#"{"client_id":"c1","request_id":"r1","result":"first"}"#)
            .await;
        rx.recv().await.unwrap();

        let outcome = handler
            .handle_inbound(&mut conn, &request("r1", "c1", "hello"))
            .await;
        assert_eq!(
            outcome,
            InboundOutcome::Replayed {
                request_id: "r1".to_string()
            }
        );
        let replay: TranslateResponse = serde_json::from_slice(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(replay.result, "first");

        // only the first request reached the bus
        requests.next().await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), requests.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_same_content_reused_from_translation_cache() {
        let bus = Arc::new(MemoryBus::default());
        let mut requests = bus.subscribe("translate.request").await.unwrap();
        let handler = handler_with_bus(bus);
        let (mut conn, mut rx) = connection(&handler);

        handler
            .handle_inbound(&mut conn, &request("r1", "c1", "hello"))
            .await;
        handler
            .handle_result(br#"{"client_id":"c1","request_id":"r1","lang_from":"en","lang_to":"zh","result":"nihao"}"#)
            .await;
        rx.recv().await.unwrap();
        requests.next().await.unwrap();

        let outcome = handler
            .handle_inbound(&mut conn, &request("r2", "c1", "hello"))
            .await;
        assert_eq!(
            outcome,
            InboundOutcome::Reused {
                request_id: "r2".to_string()
            }
        );
        let reused: TranslateResponse = serde_json::from_slice(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reused.request_id, "r2");
        assert_eq!(reused.result, "nihao");
        assert!(handler.cache().get_task("r2").await.unwrap().unwrap().is_done());
    }

    #[tokio::test]
    async fn test_reuse_disabled_publishes_again() {
        let bus = Arc::new(MemoryBus::default());
        let handler = handler_with_bus(bus).with_translation_reuse(false);
        handler
            .cache()
            .save_translation(&content_hash("en", "zh", "hello"), "nihao")
            .await
            .unwrap();
        let (mut conn, _rx) = connection(&handler);

        let outcome = handler
            .handle_inbound(&mut conn, &request("r9", "c1", "hello"))
            .await;
        assert!(matches!(outcome, InboundOutcome::Published { .. }));
    }

    #[tokio::test]
    async fn test_result_for_unknown_client_is_recorded() {
        let handler = handler_with_bus(Arc::new(MemoryBus::default()));
        let delivery = handler
            .handle_result(br#"{"client_id":"gone","request_id":"r5","result":"x"}"#)
            .await;
        assert_eq!(delivery, Some(Delivery::Unknown));
        assert!(handler.cache().get_task("r5").await.unwrap().unwrap().is_done());
    }

    #[tokio::test]
    async fn test_invalid_result_is_dropped() {
        let handler = handler_with_bus(Arc::new(MemoryBus::default()));
        assert_eq!(handler.handle_result(b"[1,2,3]").await, None);
    }

    #[tokio::test]
    async fn test_result_relay_stops_on_shutdown() {
        let bus = Arc::new(MemoryBus::default());
        let handler = Arc::new(handler_with_bus(bus.clone()));
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let relay = handler
            .start_result_relay(async {
                let _ = stop_rx.await;
            })
            .await
            .unwrap();

        bus.publish(
            "translate.result",
            Bytes::from_static(br#"{"client_id":"c1","request_id":"r7","result":"x"}"#),
        )
        .await
        .unwrap();

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), relay)
            .await
            .unwrap()
            .unwrap();
    }
}
