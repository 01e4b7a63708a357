use faas_common::FaasError;
use thiserror::Error;

pub use faas_common as common;

pub mod builder;
pub mod orchestrator;
pub mod runtime;
pub mod store;
pub mod watcher;

pub use builder::{BuildOutput, Builder, CommandBuilder};
pub use orchestrator::BuildOrchestrator;
pub use runtime::{BuildInstruction, RuntimeRegistry, RuntimeResolver};
pub use store::FunctionStore;
pub use watcher::{FileWatcher, PathWatcher, WatchConfig};

// --- Custom Error Type ---
#[derive(Error, Debug)]
pub enum Error {
    #[error("Common Error: {source}")]
    Common {
        #[from]
        source: FaasError,
    },
    #[error("Function not found in registry: {0}")]
    FunctionNotFound(String),
    #[error("Unsupported runtime `{runtime}` for function {function_id}")]
    UnsupportedRuntime { function_id: String, runtime: String },
    #[error("Handler `{handler}` for function {function_id} could not be resolved: {reason}")]
    HandlerUnresolved {
        function_id: String,
        handler: String,
        reason: String,
    },
    #[error("Build failed for {function_id}: {}", errors.join("; "))]
    BuildFailed {
        function_id: String,
        errors: Vec<String>,
    },
    #[error("Scheduling Failed: {0}")]
    SchedulingFailed(String),
    #[error("Watcher Error: {0}")]
    Watch(#[from] notify::Error),
    #[error("Invalid watch pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for FaasError {
    fn from(err: Error) -> Self {
        match err {
            Error::Common { source } => source,
            Error::UnsupportedRuntime { .. } | Error::HandlerUnresolved { .. } => {
                FaasError::DefinitionInvalid(err.to_string())
            }
            Error::FunctionNotFound(id) => FaasError::NotFound(id),
            Error::Io(e) => FaasError::Io(e),
            other => FaasError::Orchestration(other.to_string()),
        }
    }
}

impl Error {
    /// Human-readable lines for a `build.failed` event.
    pub fn into_build_errors(self) -> Vec<String> {
        match self {
            Error::BuildFailed { errors, .. } => errors,
            other => vec![other.to_string()],
        }
    }
}
