//! Message bus bridge
//!
//! The gateway publishes requests on one subject and consumes results from
//! another. [`NatsBus`] talks to a NATS server; [`MemoryBus`] keeps both
//! subjects inside the process for single-node runs and tests.

use crate::config::NatsConfig;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Stream of raw payloads delivered on one subject
pub type BusStream = BoxStream<'static, Bytes>;

/// Publish/subscribe primitive the gateway is written against
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Fire-and-forget publish
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Receive every message published on `subject` from now on
    async fn subscribe(&self, subject: &str) -> Result<BusStream>;
}

/// NATS core client
#[derive(Clone)]
pub struct NatsBus {
    client: async_nats::Client,
    queue_group: String,
}

impl NatsBus {
    /// Connect to the configured server
    pub async fn connect(config: &NatsConfig) -> Result<Self> {
        info!(url = %config.url, name = %config.name, "Connecting to NATS");
        let client = async_nats::ConnectOptions::new()
            .name(config.name.clone())
            .connect(config.url.as_str())
            .await
            .map_err(|e| GatewayError::Bus(format!("failed to connect to {}: {}", config.url, e)))?;

        info!("NATS connection established");
        Ok(Self {
            client,
            queue_group: config.queue_group.clone(),
        })
    }

    /// Join the worker queue group on `subject`; each message goes to one member
    pub async fn subscribe_queue(&self, subject: &str) -> Result<BusStream> {
        info!(subject, queue_group = %self.queue_group, "Joining queue group");
        let subscriber = self
            .client
            .queue_subscribe(subject.to_string(), self.queue_group.clone())
            .await
            .map_err(|e| GatewayError::Bus(e.to_string()))?;
        Ok(subscriber.map(|message| message.payload).boxed())
    }

    /// Flush buffered publishes
    pub async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| GatewayError::Bus(e.to_string()))
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| GatewayError::Bus(e.to_string()))
    }

    async fn subscribe(&self, subject: &str) -> Result<BusStream> {
        info!(subject, "Subscribing to subject");
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| GatewayError::Bus(e.to_string()))?;
        Ok(subscriber.map(|message| message.payload).boxed())
    }
}

const DEFAULT_MEMORY_BUS_CAPACITY: usize = 1024;

/// In-process bus with broadcast semantics per subject.
///
/// Like NATS core, a publish with no subscriber is dropped.
pub struct MemoryBus {
    subjects: DashMap<String, broadcast::Sender<Bytes>>,
    capacity: usize,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_BUS_CAPACITY)
    }
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subjects: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, subject: &str) -> broadcast::Sender<Bytes> {
        self.subjects
            .entry(subject.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        if self.sender(subject).send(payload).is_err() {
            debug!(subject, "No subscribers, message dropped");
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<BusStream> {
        let receiver = self.sender(subject).subscribe();
        let subject = subject.to_string();

        Ok(stream::unfold(
            (receiver, subject),
            |(mut receiver, subject)| async move {
                loop {
                    match receiver.recv().await {
                        Ok(payload) => return Some((payload, (receiver, subject))),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(subject = %subject, skipped, "Subscriber lagged, messages lost");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            },
        )
        .boxed())
    }
}
