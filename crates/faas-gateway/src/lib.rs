//! Relay between the in-process event bus and the remote pub/sub channel the deployed stub
//! talks to.

use faas_common::FaasError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod bridge;
pub mod stub;
pub mod transport;

pub use bridge::{Bridge, BridgeHandle};
pub use stub::StubClient;
pub use transport::{InMemoryTransport, Transport, TransportStream};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Malformed envelope on {topic}: {reason}")]
    Malformed { topic: String, reason: String },
    #[error("Timed out waiting for result of request {request_id}")]
    Timeout { request_id: String },
    #[error("Transport channel {0} closed")]
    Closed(String),
    #[error("Serialization Error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Common Error: {0}")]
    Common(#[from] FaasError),
}

impl From<GatewayError> for FaasError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Common(e) => e,
            GatewayError::Serialization(e) => FaasError::Serialization(e),
            other => FaasError::Gateway(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

pub const DEFAULT_PREFIX: &str = "faas-dev";

/// Names the channel pair of one `{application, stage}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelScope {
    pub prefix: String,
    pub app: String,
    pub stage: String,
}

impl ChannelScope {
    pub fn new(app: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            app: app.into(),
            stage: stage.into(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Remote to local: invocations.
    pub fn invoke_topic(&self) -> String {
        format!("{}/{}/{}/invoke", self.prefix, self.app, self.stage)
    }

    /// Local to remote: acknowledgements and results.
    pub fn events_topic(&self) -> String {
        format!("{}/{}/{}/events", self.prefix, self.app, self.stage)
    }
}
