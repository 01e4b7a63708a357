//! One dev session: a single bus shared by every component, wired in dependency order.

use std::sync::Arc;

use faas_common::{EventBus, FunctionDefinition};
use faas_executor::{ProcessSpawner, WorkerPool, WorkerSpawner};
use faas_gateway::{Bridge, BridgeHandle, InMemoryTransport, StubClient, Transport};
use faas_orchestrator::{BuildOrchestrator, Builder, CommandBuilder, FileWatcher, PathWatcher};
use tracing::{error, info, instrument};

use crate::routes::{self, AppState};
use crate::server::DevServer;
use crate::{DevConfig, Result};

/// The seams a session is assembled from. The defaults run real build tools and processes
/// against the filesystem, over an in-process transport.
pub struct DevDeps {
    pub builder: Arc<dyn Builder>,
    pub spawner: Arc<dyn WorkerSpawner>,
    pub transport: Arc<dyn Transport>,
    /// `None` watches the project root with a [`FileWatcher`].
    pub watcher: Option<Arc<dyn PathWatcher>>,
}

impl Default for DevDeps {
    fn default() -> Self {
        Self {
            builder: Arc::new(CommandBuilder::new()),
            spawner: Arc::new(ProcessSpawner::new()),
            transport: Arc::new(InMemoryTransport::new()),
            watcher: None,
        }
    }
}

pub struct DevSession {
    config: DevConfig,
    bus: EventBus,
    orchestrator: BuildOrchestrator,
    pool: WorkerPool,
    server: DevServer,
    transport: Arc<dyn Transport>,
    bridge: BridgeHandle,
}

impl DevSession {
    /// Builds every function, then opens the transport. Invocations only start flowing once
    /// the initial builds have settled.
    #[instrument(skip_all, fields(app = %config.app, stage = %config.stage, functions = definitions.len()))]
    pub async fn start(
        config: DevConfig,
        definitions: Vec<FunctionDefinition>,
        deps: DevDeps,
    ) -> Result<Self> {
        let bus = EventBus::new();

        let watcher: Arc<dyn PathWatcher> = match deps.watcher {
            Some(watcher) => watcher,
            None => Arc::new(FileWatcher::new(bus.clone(), &config.root, config.watch)?),
        };
        let orchestrator = BuildOrchestrator::new(
            bus.clone(),
            deps.builder,
            watcher,
            config.build_semaphore(),
            &config.root,
        )?;
        let pool = WorkerPool::new(bus.clone(), deps.spawner);
        let server = DevServer::start(bus.clone(), pool.clone())?;

        orchestrator.start(definitions).await?;

        let bridge = Bridge::new(bus.clone(), deps.transport.clone(), config.scope())
            .start()
            .await?;

        info!(
            invoke = %config.scope().invoke_topic(),
            events = %config.scope().events_topic(),
            "Dev session ready"
        );
        Ok(Self {
            config,
            bus,
            orchestrator,
            pool,
            server,
            transport: deps.transport,
            bridge,
        })
    }

    pub fn config(&self) -> &DevConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn orchestrator(&self) -> &BuildOrchestrator {
        &self.orchestrator
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn server(&self) -> &DevServer {
        &self.server
    }

    /// A client speaking to this session the way the deployed stub does.
    pub fn client(&self) -> StubClient {
        StubClient::new(self.transport.clone(), self.config.scope())
    }

    pub fn router(&self) -> axum::Router {
        routes::router(AppState {
            pool: self.pool.clone(),
            orchestrator: self.orchestrator.clone(),
            client: self.client(),
            default_timeout: self.config.default_timeout,
        })
    }

    /// Resolves when the bridge stops. A malformed envelope is returned as an error; the
    /// session is in an unknown state afterwards and should be restarted.
    pub async fn run(&mut self) -> Result<()> {
        match self.bridge.wait().await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "Bridge failed, session must restart");
                Err(e.into())
            }
        }
    }

    pub async fn shutdown(self) {
        info!("Shutting down dev session");
        self.server.stop();
        self.bridge.shutdown();
        self.pool.shutdown().await;
    }
}
