//! Relays the session's bus to and from the transport channel pair.
//!
//! Inbound: every message on `.../invoke` is an [`Envelope`]. Its type selects a decoder from
//! a table built from [`Topic`] types, and the decoded payload is published on the bus.
//! Redelivered invocations (the transport is at-least-once) are dropped by `requestID`.
//!
//! Outbound: acknowledgements and results are forwarded from the bus into a single queue and
//! published in order to `.../events`, so an ack always leaves before its result.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use faas_common::topics::{FunctionAck, FunctionError, FunctionInvoked, FunctionSuccess};
use faas_common::{Envelope, EventBus, Subscription, Topic};
use futures::StreamExt;
use lru::LruCache;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::transport::{Transport, TransportStream};
use crate::{ChannelScope, GatewayError, Result};

pub const DEFAULT_DEDUPE_WINDOW: usize = 4096;

type Decoder = fn(&EventBus, &Envelope) -> faas_common::Result<usize>;

fn decoder<T: Topic>() -> (&'static str, Decoder) {
    (T::NAME, |bus, envelope| bus.republish::<T>(envelope))
}

/// Topics accepted from the remote side.
fn inbound_decoders() -> HashMap<&'static str, Decoder> {
    HashMap::from([decoder::<FunctionInvoked>()])
}

pub struct Bridge {
    bus: EventBus,
    transport: Arc<dyn Transport>,
    scope: ChannelScope,
    dedupe_window: NonZeroUsize,
}

impl Bridge {
    pub fn new(bus: EventBus, transport: Arc<dyn Transport>, scope: ChannelScope) -> Self {
        Self {
            bus,
            transport,
            scope,
            dedupe_window: NonZeroUsize::new(DEFAULT_DEDUPE_WINDOW).unwrap_or(NonZeroUsize::MIN),
        }
    }

    pub fn with_dedupe_window(mut self, window: usize) -> Self {
        self.dedupe_window = NonZeroUsize::new(window).unwrap_or(NonZeroUsize::MIN);
        self
    }

    pub fn scope(&self) -> &ChannelScope {
        &self.scope
    }

    /// Subscribes to the invoke topic and starts both relay directions.
    #[instrument(skip(self), fields(invoke = %self.scope.invoke_topic(), events = %self.scope.events_topic()))]
    pub async fn start(self) -> Result<BridgeHandle> {
        let inbound_stream = self.transport.subscribe(&self.scope.invoke_topic()).await?;

        let (sink, queue) = mpsc::unbounded_channel();
        let subscriptions = vec![
            self.bus.forward::<FunctionAck>(sink.clone()),
            self.bus.forward::<FunctionSuccess>(sink.clone()),
            self.bus.forward::<FunctionError>(sink),
        ];

        let outbound = tokio::spawn(relay_outbound(
            self.transport.clone(),
            self.scope.events_topic(),
            queue,
        ));
        let inbound = tokio::spawn(relay_inbound(
            self.bus,
            self.scope.invoke_topic(),
            inbound_stream,
            LruCache::new(self.dedupe_window),
        ));

        info!("Bridge started");
        Ok(BridgeHandle {
            inbound,
            outbound,
            _subscriptions: subscriptions,
        })
    }
}

pub struct BridgeHandle {
    inbound: JoinHandle<Result<()>>,
    outbound: JoinHandle<()>,
    _subscriptions: Vec<Subscription>,
}

impl BridgeHandle {
    /// Resolves when the inbound relay stops: with an error on a malformed envelope, with
    /// `Closed` when the transport ends the subscription.
    pub async fn wait(&mut self) -> Result<()> {
        match (&mut self.inbound).await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(GatewayError::Transport(format!("inbound relay panicked: {e}"))),
        }
    }

    pub fn shutdown(self) {
        self.inbound.abort();
        self.outbound.abort();
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.inbound.abort();
        self.outbound.abort();
    }
}

async fn relay_inbound(
    bus: EventBus,
    topic: String,
    mut stream: TransportStream,
    mut seen: LruCache<String, ()>,
) -> Result<()> {
    let decoders = inbound_decoders();
    while let Some(message) = stream.next().await {
        let envelope: Envelope =
            serde_json::from_slice(&message).map_err(|e| GatewayError::Malformed {
                topic: topic.clone(),
                reason: e.to_string(),
            })?;

        let Some(decode) = decoders.get(envelope.kind.as_str()) else {
            warn!(kind = %envelope.kind, "Ignoring envelope of unknown type");
            continue;
        };

        if envelope.is::<FunctionInvoked>() {
            let request_id = envelope
                .properties
                .get("requestID")
                .and_then(|id| id.as_str())
                .ok_or_else(|| GatewayError::Malformed {
                    topic: topic.clone(),
                    reason: "invocation without requestID".to_string(),
                })?;
            if seen.put(request_id.to_string(), ()).is_some() {
                debug!(request_id, "Dropping redelivered invocation");
                continue;
            }
        }

        decode(&bus, &envelope).map_err(|e| GatewayError::Malformed {
            topic: topic.clone(),
            reason: e.to_string(),
        })?;
    }
    Err(GatewayError::Closed(topic))
}

async fn relay_outbound(
    transport: Arc<dyn Transport>,
    topic: String,
    mut queue: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(envelope) = queue.recv().await {
        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                error!(kind = %envelope.kind, error = %e, "Failed to encode outbound envelope");
                continue;
            }
        };
        if let Err(e) = transport.publish(&topic, payload).await {
            error!(kind = %envelope.kind, error = %e, "Failed to publish to transport");
        }
    }
    debug!(topic = %topic, "Outbound relay stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;
    use faas_common::{Acknowledgement, Invocation, InvocationResult};
    use std::sync::Mutex;
    use std::time::Duration;

    async fn started(bus: &EventBus, transport: &InMemoryTransport) -> BridgeHandle {
        Bridge::new(bus.clone(), Arc::new(transport.clone()), ChannelScope::new("shop", "dev"))
            .start()
            .await
            .unwrap()
    }

    fn invoked(request_id: &str) -> Vec<u8> {
        let inv = Invocation::new(request_id, "f1", "w1", Duration::from_secs(5));
        serde_json::to_vec(&Envelope::encode::<FunctionInvoked>(&inv).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_inbound_invocations_are_deduplicated() {
        let bus = EventBus::new();
        let transport = InMemoryTransport::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let seen = seen.clone();
            bus.subscribe::<FunctionInvoked, _>(move |inv| {
                seen.lock().unwrap().push(inv.request_id.clone())
            })
        };
        let _bridge = started(&bus, &transport).await;

        let topic = ChannelScope::new("shop", "dev").invoke_topic();
        for id in ["r1", "r1", "r2"] {
            transport.publish(&topic, invoked(id)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["r1".to_string(), "r2".to_string()]);
    }

    #[tokio::test]
    async fn test_outbound_keeps_ack_before_result() {
        let bus = EventBus::new();
        let transport = InMemoryTransport::new();
        let mut events = transport
            .subscribe(&ChannelScope::new("shop", "dev").events_topic())
            .await
            .unwrap();
        let _bridge = started(&bus, &transport).await;

        let inv = Invocation::new("r1", "f1", "w1", Duration::from_secs(5));
        bus.publish::<FunctionAck>(Acknowledgement::from(&inv));
        if let InvocationResult::Success(success) =
            InvocationResult::success(&inv, serde_json::json!({"ok": true}))
        {
            bus.publish::<FunctionSuccess>(success);
        }

        let first: Envelope = serde_json::from_slice(&events.next().await.unwrap()).unwrap();
        let second: Envelope = serde_json::from_slice(&events.next().await.unwrap()).unwrap();
        assert!(first.is::<FunctionAck>());
        assert!(second.is::<FunctionSuccess>());
        assert_eq!(second.decode::<FunctionSuccess>().unwrap().request_id, "r1");
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_fatal() {
        let bus = EventBus::new();
        let transport = InMemoryTransport::new();
        let mut bridge = started(&bus, &transport).await;

        let topic = ChannelScope::new("shop", "dev").invoke_topic();
        transport.publish(&topic, b"{not json".to_vec()).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), bridge.wait())
            .await
            .unwrap();
        assert!(matches!(result, Err(GatewayError::Malformed { .. })));
    }

    #[tokio::test]
    async fn test_unknown_envelope_type_is_skipped() {
        let bus = EventBus::new();
        let transport = InMemoryTransport::new();
        let count = Arc::new(Mutex::new(0));
        let _sub = {
            let count = count.clone();
            bus.subscribe::<FunctionInvoked, _>(move |_| *count.lock().unwrap() += 1)
        };
        let _bridge = started(&bus, &transport).await;

        let topic = ChannelScope::new("shop", "dev").invoke_topic();
        let unknown = serde_json::json!({"type": "function.ping", "properties": {}});
        transport
            .publish(&topic, serde_json::to_vec(&unknown).unwrap())
            .await
            .unwrap();
        transport.publish(&topic, invoked("r9")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
