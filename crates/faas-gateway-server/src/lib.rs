//! The dev session's coordinator: answers relayed invocations from the worker pool within
//! their deadline, and exposes a loopback HTTP surface for poking at a running session.

use faas_common::FaasError;
use faas_gateway::GatewayError;
use thiserror::Error;

pub mod config;
pub mod routes;
pub mod server;
pub mod session;

pub use config::DevConfig;
pub use routes::{router, AppState};
pub use server::DevServer;
pub use session::{DevDeps, DevSession};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Orchestrator Error: {0}")]
    Orchestrator(#[from] faas_orchestrator::Error),
    #[error("Gateway Error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("Common Error: {0}")]
    Common(#[from] FaasError),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Scheduling Failed: {0}")]
    SchedulingFailed(String),
}

impl From<ServerError> for FaasError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Orchestrator(e) => e.into(),
            ServerError::Gateway(e) => e.into(),
            ServerError::Common(e) => e,
            ServerError::Io(e) => FaasError::Io(e),
            other => FaasError::Internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
