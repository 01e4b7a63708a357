//! The durable pub/sub provider, reduced to what the bridge needs.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::Result;

pub type TransportStream = BoxStream<'static, Vec<u8>>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Messages published to `topic` after this call returns.
    async fn subscribe(&self, topic: &str) -> Result<TransportStream>;
}

const CHANNEL_CAPACITY: usize = 1024;

/// Process-local transport: one broadcast channel per topic.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    topics: Arc<DashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map_or(0, |sender| sender.receiver_count())
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        match self.sender(topic).send(payload) {
            Ok(receivers) => debug!(topic, receivers, "Published"),
            Err(_) => debug!(topic, "Published with no subscribers"),
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<TransportStream> {
        let rx = self.sender(topic).subscribe();
        let topic = topic.to_string();
        let stream = futures::stream::unfold((rx, topic), |(mut rx, topic)| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => return Some((message, (rx, topic))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "Subscriber lagged, messages lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}
