//! Turns each relayed invocation into exactly one result on the bus.
//!
//! The ack is published before anything else so the caller can tell "received, cold starting"
//! from silence. The worker's result is then raced against the invocation deadline. Losing the
//! race publishes `LocalTimeout` and drops the wait, not the work: the worker runs on and its
//! late result is discarded.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use faas_common::topics::{FunctionAck, FunctionError, FunctionInvoked, FunctionSuccess};
use faas_common::{
    Acknowledgement, ErrorKind, EventBus, Invocation, InvocationResult, Subscription,
};
use faas_executor::WorkerPool;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::{Result, ServerError};

struct Inner {
    bus: EventBus,
    pool: WorkerPool,
    handle: Handle,
    in_flight: AtomicUsize,
    invoked: Mutex<Option<Subscription>>,
}

#[derive(Clone)]
pub struct DevServer {
    inner: Arc<Inner>,
}

impl DevServer {
    /// Subscribes to `function.invoked`. Must be called from within a tokio runtime.
    pub fn start(bus: EventBus, pool: WorkerPool) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| ServerError::SchedulingFailed(format!("no tokio runtime: {e}")))?;
        let inner = Arc::new(Inner {
            bus,
            pool,
            handle,
            in_flight: AtomicUsize::new(0),
            invoked: Mutex::new(None),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let subscription = inner.bus.subscribe::<FunctionInvoked, _>(move |invocation| {
            if let Some(inner) = weak.upgrade() {
                DevServer { inner }.on_invoked(invocation.clone());
            }
        });
        *inner
            .invoked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(subscription);

        info!("Dev server listening for invocations");
        Ok(Self { inner })
    }

    /// Invocations whose result has not been published yet.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Stops accepting invocations; results already being awaited are still published.
    pub fn stop(&self) {
        self.inner
            .invoked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }

    fn on_invoked(&self, invocation: Invocation) {
        let inner = &self.inner;
        debug!(
            request_id = %invocation.request_id,
            function_id = %invocation.function_id,
            worker_id = %invocation.worker_id,
            "Invocation received"
        );
        inner
            .bus
            .publish::<FunctionAck>(Acknowledgement::from(&invocation));

        // Dispatched here, not in the task below, so one worker's queue keeps arrival order.
        let _guard = inner.handle.enter();
        let pending = inner.pool.dispatch(invocation.clone());
        inner.in_flight.fetch_add(1, Ordering::SeqCst);

        let server = self.clone();
        inner.handle.spawn(async move {
            let result = match tokio::time::timeout(invocation.remaining(), pending).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        request_id = %invocation.request_id,
                        worker_id = %invocation.worker_id,
                        "Deadline passed, reporting timeout and leaving the worker running"
                    );
                    InvocationResult::failure(
                        &invocation,
                        ErrorKind::LocalTimeout,
                        "invocation exceeded its deadline locally",
                    )
                }
            };
            server.publish(result);
            server.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    fn publish(&self, result: InvocationResult) {
        debug!(result = %result, "Publishing result");
        match result {
            InvocationResult::Success(success) => {
                self.inner.bus.publish::<FunctionSuccess>(success);
            }
            InvocationResult::Failure(failure) => {
                self.inner.bus.publish::<FunctionError>(failure);
            }
        }
    }
}
