//! The seam between the pool and whatever actually runs handler code.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use faas_common::Invocation;
use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Starting,
    Idle,
    Busy,
    Stopped,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Starting => "starting",
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// One reply line from a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerReply {
    Success {
        #[serde(default)]
        body: serde_json::Value,
    },
    Error {
        #[serde(rename = "errorType")]
        error_type: String,
        #[serde(rename = "errorMessage", default)]
        error_message: String,
        #[serde(default)]
        trace: Vec<String>,
    },
}

/// Everything needed to start one worker against a built artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub worker_id: String,
    pub function_id: String,
    pub artifact_path: PathBuf,
    /// Fully substituted command line.
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// A live worker. Runs at most one invocation at a time; the pool guarantees it is never
/// called concurrently.
#[async_trait]
pub trait WorkerProcess: Send {
    /// Delivers one invocation and waits for its reply. An error means the worker is gone.
    async fn invoke(&mut self, invocation: &Invocation) -> Result<WorkerReply>;

    /// Resolves with the exit code once the process has exited on its own.
    async fn exited(&mut self) -> Option<i32>;

    async fn shutdown(&mut self);
}

#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, request: &SpawnRequest) -> Result<Box<dyn WorkerProcess>>;
}
