use faas_common::FaasError;
use thiserror::Error;

pub use faas_common as common;

pub mod pool;
pub mod process;
pub mod worker;

pub mod test_utils;

pub use pool::{PendingResult, WorkerInfo, WorkerPool};
pub use process::ProcessSpawner;
pub use worker::{SpawnRequest, WorkerProcess, WorkerReply, WorkerSpawner, WorkerState};

// --- Custom Error Type ---
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("No successful build for function {function_id}")]
    BuildUnavailable { function_id: String },
    #[error("Worker {worker_id} failed to start: {reason}")]
    SpawnFailed { worker_id: String, reason: String },
    #[error("Worker {worker_id} exited (code {code:?})")]
    WorkerExited {
        worker_id: String,
        code: Option<i32>,
    },
    #[error("Worker protocol violation: {0}")]
    Protocol(String),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization Error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Internal executor error: {0}")]
    Internal(String),
}

// Implement conversion from ExecutorError to the common FaasError
impl From<ExecutorError> for FaasError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Io(e) => FaasError::Io(e),
            ExecutorError::Serialization(e) => FaasError::Serialization(e),
            other => FaasError::Executor(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
