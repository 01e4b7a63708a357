use std::future::IntoFuture;

use color_eyre::eyre;
use faas_gateway_server::{DevConfig, DevDeps, DevSession};
use faas_orchestrator::FunctionStore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,faas_dev=debug")),
        )
        .init();

    let config = DevConfig::from_env()?;
    info!(root = %config.root.display(), app = %config.app, stage = %config.stage, "Starting faas-dev");

    // The synthesis engine writes the declared functions here before handing over.
    let definitions = FunctionStore::new().current(&config.root).await?;
    if definitions.is_empty() {
        warn!(
            store = %FunctionStore::path(&config.root).display(),
            "No functions declared; watching an empty set"
        );
    }

    let addr = config.addr();
    let mut session = DevSession::start(config, definitions, DevDeps::default()).await?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Loopback API listening on http://{}", addr);
    let http = axum::serve(listener, session.router()).into_future();

    let outcome = tokio::select! {
        result = session.run() => result.map_err(eyre::Report::from),
        result = http => result.map_err(eyre::Report::from),
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
            Ok(())
        }
    };

    session.shutdown().await;
    outcome
}
