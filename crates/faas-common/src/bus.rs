//! In-process typed publish/subscribe.
//!
//! Topics are types: a [`Topic`] fixes its wire name and payload shape at compile time, so a
//! publisher and its subscribers cannot drift apart. Delivery is synchronous, in subscription
//! order, with each subscriber isolated from a panic in another. Nothing is retained: a
//! subscriber registered after a publish never sees it.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::{FaasError, Result};

pub trait Topic: Send + Sync + 'static {
    const NAME: &'static str;
    type Payload: Clone + Send + Sync + Serialize + DeserializeOwned + 'static;
}

/// A bus message in transport form: `{"type": "<topic>", "properties": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub properties: serde_json::Value,
}

impl Envelope {
    pub fn encode<T: Topic>(payload: &T::Payload) -> Result<Self> {
        Ok(Self {
            kind: T::NAME.to_string(),
            properties: serde_json::to_value(payload)?,
        })
    }

    pub fn decode<T: Topic>(&self) -> Result<T::Payload> {
        if self.kind != T::NAME {
            return Err(FaasError::Internal(format!(
                "envelope of type {} decoded as {}",
                self.kind,
                T::NAME
            )));
        }
        Ok(serde_json::from_value(self.properties.clone())?)
    }

    pub fn is<T: Topic>(&self) -> bool {
        self.kind == T::NAME
    }
}

type Handler = Arc<dyn Fn(&(dyn Any + Send + Sync)) + Send + Sync>;

struct Subscriber {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
struct Inner {
    topics: Mutex<HashMap<&'static str, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl Inner {
    fn topics(&self) -> MutexGuard<'_, HashMap<&'static str, Vec<Subscriber>>> {
        // Handlers never run under this lock, so a poisoned guard still holds a consistent map.
        self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One bus per dev session; clones share the same subscriber table.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<T, F>(&self, handler: F) -> Subscription
    where
        T: Topic,
        F: Fn(&T::Payload) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: Handler = Arc::new(move |payload: &(dyn Any + Send + Sync)| {
            if let Some(payload) = payload.downcast_ref::<T::Payload>() {
                handler(payload);
            }
        });
        self.inner
            .topics()
            .entry(T::NAME)
            .or_default()
            .push(Subscriber { id, handler });
        debug!(topic = T::NAME, subscriber = id, "subscribed");

        Subscription {
            bus: Arc::downgrade(&self.inner),
            topic: T::NAME,
            id,
            active: true,
        }
    }

    /// Delivers `payload` to every current subscriber of `T`; returns how many handled it cleanly.
    pub fn publish<T: Topic>(&self, payload: T::Payload) -> usize {
        let handlers: Vec<(u64, Handler)> = self
            .inner
            .topics()
            .get(T::NAME)
            .map(|subs| subs.iter().map(|s| (s.id, s.handler.clone())).collect())
            .unwrap_or_default();

        let erased: &(dyn Any + Send + Sync) = &payload;
        let mut delivered = 0;
        for (id, handler) in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(erased))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    error!(
                        topic = T::NAME,
                        subscriber = id,
                        reason = %panic_message(panic.as_ref()),
                        "Subscriber panicked, continuing delivery"
                    );
                }
            }
        }
        debug!(topic = T::NAME, delivered, "published");
        delivered
    }

    /// Decodes an inbound envelope as `T` and publishes it.
    pub fn republish<T: Topic>(&self, envelope: &Envelope) -> Result<usize> {
        let payload = envelope.decode::<T>()?;
        Ok(self.publish::<T>(payload))
    }

    /// Relays every `T` published from now on into `sink` as an [`Envelope`].
    ///
    /// Several topics forwarded into the same sink keep their relative publish order.
    pub fn forward<T: Topic>(&self, sink: mpsc::UnboundedSender<Envelope>) -> Subscription {
        self.subscribe::<T, _>(move |payload| match Envelope::encode::<T>(payload) {
            Ok(envelope) => {
                if sink.send(envelope).is_err() {
                    debug!(topic = T::NAME, "Forward sink closed, dropping message");
                }
            }
            Err(e) => error!(topic = T::NAME, error = %e, "Failed to encode forwarded payload"),
        })
    }

    pub fn subscriber_count<T: Topic>(&self) -> usize {
        self.inner.topics().get(T::NAME).map_or(0, Vec::len)
    }
}

/// Removes its handler from the bus when dropped or on [`Subscription::unsubscribe`].
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    bus: Weak<Inner>,
    topic: &'static str,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Keeps the handler registered for the lifetime of the bus.
    pub fn detach(mut self) {
        self.active = false;
    }

    pub fn topic(&self) -> &'static str {
        self.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            if let Some(subs) = bus.topics().get_mut(self.topic) {
                subs.retain(|s| s.id != self.id);
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topics::{FileChange, FileChanged, FunctionAck, FunctionInvoked};
    use crate::{Acknowledgement, Invocation};
    use std::path::PathBuf;
    use std::time::Duration;

    fn change(file: &str) -> FileChange {
        FileChange {
            file: PathBuf::from(file),
        }
    }

    #[test]
    fn test_delivery_in_subscription_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let seen = seen.clone();
            bus.subscribe::<FileChanged, _>(move |c| seen.lock().unwrap().push(("first", c.file.clone())))
        };
        let second = {
            let seen = seen.clone();
            bus.subscribe::<FileChanged, _>(move |c| seen.lock().unwrap().push(("second", c.file.clone())))
        };

        assert_eq!(bus.publish::<FileChanged>(change("a.ts")), 2);
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen[0].0, "first");
        assert_eq!(seen[1].0, "second");
        drop((first, second));
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));

        let _bad = bus.subscribe::<FileChanged, _>(|_| panic!("subscriber bug"));
        let _good = {
            let hits = hits.clone();
            bus.subscribe::<FileChanged, _>(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert_eq!(bus.publish::<FileChanged>(change("a.ts")), 1);
        assert_eq!(bus.publish::<FileChanged>(change("b.ts")), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_no_replay_for_late_subscribers() {
        let bus = EventBus::new();
        bus.publish::<FileChanged>(change("early.ts"));

        let hits = Arc::new(AtomicU64::new(0));
        let _sub = {
            let hits = hits.clone();
            bus.subscribe::<FileChanged, _>(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_and_detach() {
        let bus = EventBus::new();
        let sub = bus.subscribe::<FileChanged, _>(|_| {});
        assert_eq!(bus.subscriber_count::<FileChanged>(), 1);
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count::<FileChanged>(), 0);

        bus.subscribe::<FileChanged, _>(|_| {}).detach();
        assert_eq!(bus.subscriber_count::<FileChanged>(), 1);
    }

    #[test]
    fn test_topics_are_independent() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        let _sub = {
            let hits = hits.clone();
            bus.subscribe::<FunctionAck, _>(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        bus.publish::<FileChanged>(change("a.ts"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_forward_preserves_cross_topic_order() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _ack = bus.forward::<FunctionAck>(tx.clone());
        let _changed = bus.forward::<FileChanged>(tx);

        bus.publish::<FunctionAck>(Acknowledgement {
            worker_id: "w1".into(),
            function_id: "f1".into(),
            request_id: None,
        });
        bus.publish::<FileChanged>(change("x.py"));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.is::<FunctionAck>());
        assert_eq!(first.properties["workerID"], "w1");
        assert_eq!(second.decode::<FileChanged>().unwrap(), change("x.py"));
    }

    #[test]
    fn test_republish_checks_topic() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        let _sub = {
            let hits = hits.clone();
            bus.subscribe::<FunctionInvoked, _>(move |inv| {
                assert_eq!(inv.request_id, "r1");
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        let inv = Invocation::new("r1", "f1", "w1", Duration::from_secs(1));
        let envelope = Envelope::encode::<FunctionInvoked>(&inv).unwrap();
        assert_eq!(bus.republish::<FunctionInvoked>(&envelope).unwrap(), 1);
        assert!(bus.republish::<FileChanged>(&envelope).is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
