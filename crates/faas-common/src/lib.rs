// Re-export dependencies used in public interfaces of common types

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use uuid;

pub mod bus;
pub mod semaphore;
pub mod topics;

pub use bus::{Envelope, EventBus, Subscription, Topic};
pub use semaphore::{Permit, Semaphore};

#[derive(Error, Debug)]
pub enum FaasError {
    #[error("Executor Error: {0}")]
    Executor(String),

    #[error("Orchestration Error: {0}")]
    Orchestration(String),

    #[error("Gateway Error: {0}")]
    Gateway(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Function Definition Invalid: {0}")]
    DefinitionInvalid(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

// Define the primary Result type for FaaS operations
pub type Result<T> = std::result::Result<T, FaasError>;

/// Options handed to the runtime bundler for one function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildOptions {
    /// Source root of the function, relative to the project root.
    pub src_path: Option<PathBuf>,
    /// Replaces the runtime's default build command.
    pub command: Option<Vec<String>>,
    /// Extra globs added to the function's watch set.
    pub watch: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// A function as declared by the resource graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDefinition {
    #[serde(rename = "functionID")]
    pub function_id: String,
    pub handler_ref: String,
    pub runtime: String,
    #[serde(default)]
    pub build_options: BuildOptions,
    pub root: PathBuf,
}

impl FunctionDefinition {
    pub fn new(
        function_id: impl Into<String>,
        handler_ref: impl Into<String>,
        runtime: impl Into<String>,
        root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            function_id: function_id.into(),
            handler_ref: handler_ref.into(),
            runtime: runtime.into(),
            build_options: BuildOptions::default(),
            root: root.into(),
        }
    }

    /// Directory the handler reference is resolved against.
    pub fn src_root(&self) -> PathBuf {
        match &self.build_options.src_path {
            Some(src) if src.is_absolute() => src.clone(),
            Some(src) => self.root.join(src),
            None => self.root.clone(),
        }
    }
}

/// One remote call, as relayed by the deployed stub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    #[serde(rename = "requestID")]
    pub request_id: String,
    #[serde(rename = "functionID")]
    pub function_id: String,
    #[serde(rename = "workerID")]
    pub worker_id: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub event: serde_json::Value,
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub deadline: DateTime<Utc>,
}

impl Invocation {
    pub fn new(
        request_id: impl Into<String>,
        function_id: impl Into<String>,
        worker_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        Self {
            request_id: request_id.into(),
            function_id: function_id.into(),
            worker_id: worker_id.into(),
            env: BTreeMap::new(),
            event: serde_json::Value::Null,
            context: serde_json::Value::Null,
            deadline: Utc::now()
                .checked_add_signed(timeout)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn with_event(mut self, event: serde_json::Value) -> Self {
        self.event = event;
        self
    }

    /// Time left until the deadline; zero once it has passed.
    pub fn remaining(&self) -> Duration {
        (self.deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// "Invocation received, timer may start."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    #[serde(rename = "workerID")]
    pub worker_id: String,
    #[serde(rename = "functionID")]
    pub function_id: String,
    #[serde(rename = "requestID", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl From<&Invocation> for Acknowledgement {
    fn from(invocation: &Invocation) -> Self {
        Self {
            worker_id: invocation.worker_id.clone(),
            function_id: invocation.function_id.clone(),
            request_id: Some(invocation.request_id.clone()),
        }
    }
}

/// Failure kinds produced by the dev bridge itself, as opposed to errors thrown by handler code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BuildFailure,
    BuildUnavailable,
    WorkerCrashed,
    LocalTimeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BuildFailure => "BuildFailure",
            ErrorKind::BuildUnavailable => "BuildUnavailable",
            ErrorKind::WorkerCrashed => "WorkerCrashed",
            ErrorKind::LocalTimeout => "LocalTimeout",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationSuccess {
    #[serde(rename = "requestID")]
    pub request_id: String,
    #[serde(rename = "workerID")]
    pub worker_id: String,
    #[serde(rename = "functionID")]
    pub function_id: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationFailure {
    #[serde(rename = "requestID")]
    pub request_id: String,
    #[serde(rename = "workerID")]
    pub worker_id: String,
    #[serde(rename = "functionID")]
    pub function_id: String,
    pub error_type: String,
    pub error_message: String,
    #[serde(default)]
    pub trace: Vec<String>,
}

impl InvocationFailure {
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.error_type == kind.as_str()
    }
}

/// Exactly one of these is produced per [`Invocation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum InvocationResult {
    Success(InvocationSuccess),
    Failure(InvocationFailure),
}

impl InvocationResult {
    pub fn success(invocation: &Invocation, body: serde_json::Value) -> Self {
        InvocationResult::Success(InvocationSuccess {
            request_id: invocation.request_id.clone(),
            worker_id: invocation.worker_id.clone(),
            function_id: invocation.function_id.clone(),
            body,
        })
    }

    /// A failure raised by handler code; the error type is whatever the runtime reported.
    pub fn handler_error(
        invocation: &Invocation,
        error_type: impl Into<String>,
        error_message: impl Into<String>,
        trace: Vec<String>,
    ) -> Self {
        InvocationResult::Failure(InvocationFailure {
            request_id: invocation.request_id.clone(),
            worker_id: invocation.worker_id.clone(),
            function_id: invocation.function_id.clone(),
            error_type: error_type.into(),
            error_message: error_message.into(),
            trace,
        })
    }

    pub fn failure(invocation: &Invocation, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::handler_error(invocation, kind.as_str(), message, Vec::new())
    }

    pub fn request_id(&self) -> &str {
        match self {
            InvocationResult::Success(s) => &s.request_id,
            InvocationResult::Failure(f) => &f.request_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, InvocationResult::Success(_))
    }

    /// The failure kind if this result is one of the bridge's own failures.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        let InvocationResult::Failure(failure) = self else {
            return None;
        };
        [
            ErrorKind::BuildFailure,
            ErrorKind::BuildUnavailable,
            ErrorKind::WorkerCrashed,
            ErrorKind::LocalTimeout,
        ]
        .into_iter()
        .find(|kind| failure.is(*kind))
    }
}

impl Display for InvocationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvocationResult::Success(s) => write!(
                f,
                "InvocationResult(request_id: {}, worker_id: {}, success)",
                s.request_id, s.worker_id
            ),
            InvocationResult::Failure(e) => write!(
                f,
                "InvocationResult(request_id: {}, worker_id: {}, error: {}: {})",
                e.request_id, e.worker_id, e.error_type, e.error_message
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serialization() {
        let mut def = FunctionDefinition::new("api", "src/api.handler", "nodejs18.x", "/work/app");
        def.build_options.src_path = Some(PathBuf::from("packages/functions"));
        let json = serde_json::to_string(&def).unwrap();
        assert!(json.contains("\"functionID\":\"api\""));
        assert!(json.contains("\"handlerRef\":\"src/api.handler\""));
        assert!(json.contains("\"buildOptions\""));

        let back: FunctionDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, def);
        assert_eq!(back.src_root(), PathBuf::from("/work/app/packages/functions"));
    }

    #[test]
    fn test_invocation_wire_shape() {
        let raw = json!({
            "requestID": "r1",
            "functionID": "f1",
            "workerID": "w1",
            "event": {"path": "/"},
            "deadline": 1_700_000_000_000i64
        });
        let inv: Invocation = serde_json::from_value(raw).unwrap();
        assert_eq!(inv.request_id, "r1");
        assert_eq!(inv.deadline.timestamp_millis(), 1_700_000_000_000);
        assert!(inv.env.is_empty());
        assert_eq!(inv.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_result_helpers() {
        let inv = Invocation::new("r1", "f1", "w1", Duration::from_secs(5));
        assert!(inv.remaining() > Duration::from_secs(4));

        let timeout = InvocationResult::failure(&inv, ErrorKind::LocalTimeout, "too slow");
        assert_eq!(timeout.error_kind(), Some(ErrorKind::LocalTimeout));
        assert_eq!(timeout.request_id(), "r1");

        let thrown = InvocationResult::handler_error(&inv, "TypeError", "boom", vec![]);
        assert_eq!(thrown.error_kind(), None);

        let ok = InvocationResult::success(&inv, json!({"statusCode": 200}));
        let wire = serde_json::to_value(&ok).unwrap();
        assert_eq!(wire["status"], "success");
        assert_eq!(wire["requestID"], "r1");
    }
}
