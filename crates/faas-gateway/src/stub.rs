//! The remote side of the channel: publishes invocations and waits for their results, the way
//! the deployed stub does.

use std::sync::Arc;
use std::time::Duration;

use faas_common::topics::{FunctionAck, FunctionError, FunctionInvoked, FunctionSuccess};
use faas_common::{Envelope, Invocation, InvocationResult};
use futures::StreamExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::transport::Transport;
use crate::{ChannelScope, GatewayError, Result};

/// Extra wait beyond the invocation deadline, leaving room for the `LocalTimeout` result.
const DEADLINE_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct StubClient {
    transport: Arc<dyn Transport>,
    scope: ChannelScope,
}

impl StubClient {
    pub fn new(transport: Arc<dyn Transport>, scope: ChannelScope) -> Self {
        Self { transport, scope }
    }

    /// Invokes `function_id` on `worker_id` with a fresh request id.
    pub async fn call(
        &self,
        function_id: &str,
        worker_id: &str,
        event: serde_json::Value,
        timeout: Duration,
    ) -> Result<InvocationResult> {
        let invocation = Invocation::new(
            Uuid::new_v4().to_string(),
            function_id,
            worker_id,
            timeout,
        )
        .with_event(event);
        self.invoke(&invocation).await
    }

    /// Publishes `invocation` and waits for the result bearing its `requestID`.
    #[instrument(skip(self, invocation), fields(request_id = %invocation.request_id, function_id = %invocation.function_id))]
    pub async fn invoke(&self, invocation: &Invocation) -> Result<InvocationResult> {
        // Subscribe first so a fast result cannot slip past.
        let mut events = self.transport.subscribe(&self.scope.events_topic()).await?;
        let envelope = Envelope::encode::<FunctionInvoked>(invocation)?;
        self.transport
            .publish(&self.scope.invoke_topic(), serde_json::to_vec(&envelope)?)
            .await?;
        debug!("Invocation published");

        let request_id = invocation.request_id.as_str();
        let wait = async {
            while let Some(message) = events.next().await {
                let envelope: Envelope = match serde_json::from_slice(&message) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(error = %e, "Skipping unreadable event");
                        continue;
                    }
                };
                if envelope.is::<FunctionAck>() {
                    let ack = envelope.decode::<FunctionAck>()?;
                    if ack.request_id.as_deref() == Some(request_id) {
                        info!(worker_id = %ack.worker_id, "Acknowledged");
                    }
                } else if envelope.is::<FunctionSuccess>() {
                    let success = envelope.decode::<FunctionSuccess>()?;
                    if success.request_id == request_id {
                        return Ok(InvocationResult::Success(success));
                    }
                } else if envelope.is::<FunctionError>() {
                    let failure = envelope.decode::<FunctionError>()?;
                    if failure.request_id == request_id {
                        return Ok(InvocationResult::Failure(failure));
                    }
                }
            }
            Err(GatewayError::Closed(self.scope.events_topic()))
        };

        tokio::time::timeout(invocation.remaining() + DEADLINE_GRACE, wait)
            .await
            .map_err(|_| GatewayError::Timeout {
                request_id: request_id.to_string(),
            })?
    }
}
