//! Local worker lifecycle, mirroring a remote platform's container reuse.
//!
//! Each `workerID` maps to one actor task that owns the worker process and drains an
//! unbounded FIFO of invocations, so a worker never runs two invocations at once and runs its
//! queue in arrival order. Distinct workers run fully in parallel.
//!
//! State per worker: `starting -> idle -> busy -> idle`, or `-> stopped` on spawn failure,
//! crash, or invalidation. A stopped worker leaves the map and is never reused; the next
//! invocation naming its `workerID` starts a fresh one against the current artifact.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use faas_common::topics::{BuildSucceeded, BuildSuccess, WorkerExit, WorkerExited};
use faas_common::{ErrorKind, EventBus, Invocation, InvocationResult, Subscription};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::worker::{SpawnRequest, WorkerProcess, WorkerReply, WorkerSpawner, WorkerState};
use crate::{ExecutorError, Result};

const INVALIDATED: &str = "invalidated by rebuild";

struct Job {
    invocation: Invocation,
    reply: oneshot::Sender<InvocationResult>,
}

struct WorkerSlot {
    function_id: String,
    generation: u64,
    artifact_path: PathBuf,
    jobs: mpsc::UnboundedSender<Job>,
    state: watch::Receiver<WorkerState>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl WorkerSlot {
    fn is_live(&self) -> bool {
        !self.jobs.is_closed() && *self.state.borrow() != WorkerState::Stopped
    }
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    #[serde(rename = "workerID")]
    pub worker_id: String,
    #[serde(rename = "functionID")]
    pub function_id: String,
    pub state: WorkerState,
    pub artifact_path: PathBuf,
}

struct PoolInner {
    bus: EventBus,
    spawner: Arc<dyn WorkerSpawner>,
    workers: Mutex<HashMap<String, WorkerSlot>>,
    artifacts: Mutex<HashMap<String, BuildSuccess>>,
    builds: Mutex<Option<Subscription>>,
    generation: AtomicU64,
}

impl PoolInner {
    fn workers(&self) -> MutexGuard<'_, HashMap<String, WorkerSlot>> {
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn artifacts(&self) -> MutexGuard<'_, HashMap<String, BuildSuccess>> {
        self.artifacts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drops the slot for `worker_id` unless it has already been replaced by a newer worker.
    fn retire(&self, worker_id: &str, generation: u64) {
        let mut workers = self.workers();
        if workers
            .get(worker_id)
            .is_some_and(|slot| slot.generation == generation)
        {
            workers.remove(worker_id);
        }
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Subscribes to `build.succeeded`: each success records the new artifact and invalidates
    /// the function's workers.
    pub fn new(bus: EventBus, spawner: Arc<dyn WorkerSpawner>) -> Self {
        let inner = Arc::new(PoolInner {
            bus,
            spawner,
            workers: Mutex::new(HashMap::new()),
            artifacts: Mutex::new(HashMap::new()),
            builds: Mutex::new(None),
            generation: AtomicU64::new(0),
        });

        let weak: Weak<PoolInner> = Arc::downgrade(&inner);
        let subscription = inner.bus.subscribe::<BuildSucceeded, _>(move |build| {
            if let Some(inner) = weak.upgrade() {
                WorkerPool { inner }.on_build_succeeded(build.clone());
            }
        });
        *inner
            .builds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(subscription);

        Self { inner }
    }

    fn on_build_succeeded(&self, build: BuildSuccess) {
        let function_id = build.function_id.clone();
        self.set_artifact(build);
        let stopped = self.invalidate(&function_id);
        if stopped > 0 {
            info!(function_id = %function_id, stopped, "New build, workers invalidated");
        }
    }

    /// Records the artifact new workers of `build.function_id` start from.
    pub fn set_artifact(&self, build: BuildSuccess) {
        self.inner
            .artifacts()
            .insert(build.function_id.clone(), build);
    }

    pub fn artifact(&self, function_id: &str) -> Option<PathBuf> {
        self.inner
            .artifacts()
            .get(function_id)
            .map(|build| build.artifact_path.clone())
    }

    /// Returns the state of the live worker for `worker_id`, spawning one against the
    /// function's current artifact if there is none.
    pub fn obtain_or_spawn(&self, worker_id: &str, function_id: &str) -> Result<WorkerState> {
        let mut workers = self.inner.workers();
        let slot = self.slot(&mut workers, worker_id, function_id, Default::default())?;
        let state = *slot.state.borrow();
        Ok(state)
    }

    fn slot<'a>(
        &self,
        workers: &'a mut HashMap<String, WorkerSlot>,
        worker_id: &str,
        function_id: &str,
        env: std::collections::BTreeMap<String, String>,
    ) -> Result<&'a WorkerSlot> {
        let reusable = workers
            .get(worker_id)
            .is_some_and(|slot| slot.is_live() && slot.function_id == function_id);
        if !reusable {
            if let Some(mut stale) = workers.remove(worker_id) {
                if stale.function_id != function_id {
                    warn!(worker_id = %worker_id, old = %stale.function_id, new = %function_id, "Worker id reused for another function");
                }
                if let Some(stop) = stale.stop.take() {
                    let _ = stop.send(());
                }
            }

            let build = self
                .inner
                .artifacts()
                .get(function_id)
                .cloned()
                .ok_or_else(|| ExecutorError::BuildUnavailable {
                    function_id: function_id.to_string(),
                })?;
            let request = SpawnRequest {
                worker_id: worker_id.to_string(),
                function_id: function_id.to_string(),
                artifact_path: build.artifact_path,
                command: build.command,
                env,
            };
            let slot = self.start_worker(request);
            workers.insert(worker_id.to_string(), slot);
        }
        workers
            .get(worker_id)
            .ok_or_else(|| ExecutorError::Internal(format!("worker {worker_id} vanished")))
    }

    fn start_worker(&self, request: SpawnRequest) -> WorkerSlot {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(WorkerState::Starting);
        let (stop_tx, stop_rx) = oneshot::channel();

        debug!(worker_id = %request.worker_id, function_id = %request.function_id, generation, "Starting worker");
        let actor = WorkerActor {
            pool: Arc::downgrade(&self.inner),
            bus: self.inner.bus.clone(),
            spawner: self.inner.spawner.clone(),
            generation,
            state: state_tx,
        };
        let function_id = request.function_id.clone();
        let artifact_path = request.artifact_path.clone();
        let task = tokio::spawn(actor.run(request, jobs_rx, stop_rx));

        WorkerSlot {
            function_id,
            generation,
            artifact_path,
            jobs: jobs_tx,
            state: state_rx,
            stop: Some(stop_tx),
            task,
        }
    }

    /// Tears down every worker bound to `function_id`. Idempotent.
    #[instrument(skip(self))]
    pub fn invalidate(&self, function_id: &str) -> usize {
        let mut workers = self.inner.workers();
        let stale: Vec<String> = workers
            .iter()
            .filter(|(_, slot)| slot.function_id == function_id)
            .map(|(id, _)| id.clone())
            .collect();
        for worker_id in &stale {
            if let Some(mut slot) = workers.remove(worker_id) {
                if let Some(stop) = slot.stop.take() {
                    let _ = stop.send(());
                }
            }
        }
        stale.len()
    }

    /// Queues `invocation` on its worker. The returned future always resolves to exactly one
    /// result, including for spawn failures and crashes.
    pub fn dispatch(&self, invocation: Invocation) -> PendingResult {
        let (reply, rx) = oneshot::channel();
        let fallback = Fallback::from(&invocation);

        let mut workers = self.inner.workers();
        let slot = self.slot(
            &mut workers,
            &invocation.worker_id,
            &invocation.function_id,
            invocation.env.clone(),
        );
        match slot {
            Ok(slot) => {
                if let Err(mpsc::error::SendError(job)) = slot.jobs.send(Job { invocation, reply }) {
                    let result = InvocationResult::failure(
                        &job.invocation,
                        ErrorKind::WorkerCrashed,
                        "worker stopped before accepting the invocation",
                    );
                    let _ = job.reply.send(result);
                }
            }
            Err(e) => {
                let kind = match e {
                    ExecutorError::BuildUnavailable { .. } => ErrorKind::BuildUnavailable,
                    _ => ErrorKind::WorkerCrashed,
                };
                warn!(function_id = %invocation.function_id, error = %e, "Dispatch failed");
                let _ = reply.send(InvocationResult::failure(&invocation, kind, e.to_string()));
            }
        }

        PendingResult { rx, fallback }
    }

    pub fn worker_state(&self, worker_id: &str) -> Option<WorkerState> {
        self.inner
            .workers()
            .get(worker_id)
            .map(|slot| *slot.state.borrow())
    }

    pub fn live_workers(&self, function_id: &str) -> usize {
        self.inner
            .workers()
            .values()
            .filter(|slot| slot.function_id == function_id && slot.is_live())
            .count()
    }

    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        let workers = self.inner.workers();
        let mut infos: Vec<WorkerInfo> = workers
            .iter()
            .map(|(worker_id, slot)| WorkerInfo {
                worker_id: worker_id.clone(),
                function_id: slot.function_id.clone(),
                state: *slot.state.borrow(),
                artifact_path: slot.artifact_path.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        infos
    }

    /// Stops every worker and waits for their processes to be torn down.
    pub async fn shutdown(&self) {
        self.inner
            .builds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let slots: Vec<WorkerSlot> = self.inner.workers().drain().map(|(_, slot)| slot).collect();
        info!(workers = slots.len(), "Shutting down worker pool");
        let mut tasks = Vec::with_capacity(slots.len());
        for mut slot in slots {
            if let Some(stop) = slot.stop.take() {
                let _ = stop.send(());
            }
            tasks.push(slot.task);
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// Identity of an invocation, kept so a lost reply can still be answered.
struct Fallback {
    request_id: String,
    worker_id: String,
    function_id: String,
}

impl From<&Invocation> for Fallback {
    fn from(invocation: &Invocation) -> Self {
        Self {
            request_id: invocation.request_id.clone(),
            worker_id: invocation.worker_id.clone(),
            function_id: invocation.function_id.clone(),
        }
    }
}

/// The eventual result of a dispatched invocation. Dropping it abandons the wait, not the work.
pub struct PendingResult {
    rx: oneshot::Receiver<InvocationResult>,
    fallback: Fallback,
}

impl Future for PendingResult {
    type Output = InvocationResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => {
                let failure = faas_common::InvocationFailure {
                    request_id: self.fallback.request_id.clone(),
                    worker_id: self.fallback.worker_id.clone(),
                    function_id: self.fallback.function_id.clone(),
                    error_type: ErrorKind::WorkerCrashed.to_string(),
                    error_message: "worker dropped the invocation".to_string(),
                    trace: Vec::new(),
                };
                Poll::Ready(InvocationResult::Failure(failure))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

enum Exit {
    Invalidated,
    Crashed(Option<i32>),
    Closed,
}

struct WorkerActor {
    pool: Weak<PoolInner>,
    bus: EventBus,
    spawner: Arc<dyn WorkerSpawner>,
    generation: u64,
    state: watch::Sender<WorkerState>,
}

impl WorkerActor {
    async fn run(
        self,
        request: SpawnRequest,
        mut jobs: mpsc::UnboundedReceiver<Job>,
        mut stop: oneshot::Receiver<()>,
    ) {
        let worker_id = request.worker_id.clone();
        let function_id = request.function_id.clone();

        let spawned = tokio::select! {
            biased;
            _ = &mut stop => None,
            spawned = self.spawner.spawn(&request) => Some(spawned),
        };
        let mut process: Box<dyn WorkerProcess> = match spawned {
            Some(Ok(process)) => process,
            Some(Err(e)) => {
                warn!(worker_id = %worker_id, function_id = %function_id, error = %e, "Worker failed to start");
                self.finish(&mut jobs, ErrorKind::BuildUnavailable, &e.to_string(), &worker_id);
                return;
            }
            None => {
                self.finish(&mut jobs, ErrorKind::WorkerCrashed, INVALIDATED, &worker_id);
                return;
            }
        };
        self.state.send_replace(WorkerState::Idle);
        info!(worker_id = %worker_id, function_id = %function_id, "Worker ready");

        let exit = loop {
            let job = tokio::select! {
                biased;
                _ = &mut stop => break Exit::Invalidated,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break Exit::Closed,
                },
                code = process.exited() => break Exit::Crashed(code),
            };

            self.state.send_replace(WorkerState::Busy);
            debug!(worker_id = %worker_id, request_id = %job.invocation.request_id, "Invocation started");
            let outcome = tokio::select! {
                biased;
                _ = &mut stop => None,
                outcome = process.invoke(&job.invocation) => Some(outcome),
            };
            match outcome {
                Some(Ok(reply)) => {
                    self.state.send_replace(WorkerState::Idle);
                    let _ = job.reply.send(to_result(&job.invocation, reply));
                }
                Some(Err(e)) => {
                    let code = match &e {
                        ExecutorError::WorkerExited { code, .. } => *code,
                        _ => None,
                    };
                    warn!(worker_id = %worker_id, error = %e, "Worker crashed mid-invocation");
                    let _ = job.reply.send(InvocationResult::failure(
                        &job.invocation,
                        ErrorKind::WorkerCrashed,
                        e.to_string(),
                    ));
                    break Exit::Crashed(code);
                }
                None => {
                    let _ = job.reply.send(InvocationResult::failure(
                        &job.invocation,
                        ErrorKind::WorkerCrashed,
                        INVALIDATED,
                    ));
                    break Exit::Invalidated;
                }
            }
        };

        match exit {
            Exit::Invalidated | Exit::Closed => {
                process.shutdown().await;
                self.finish(&mut jobs, ErrorKind::WorkerCrashed, INVALIDATED, &worker_id);
                debug!(worker_id = %worker_id, "Worker stopped");
            }
            Exit::Crashed(code) => {
                warn!(worker_id = %worker_id, function_id = %function_id, ?code, "Worker exited");
                self.finish(&mut jobs, ErrorKind::WorkerCrashed, "worker exited", &worker_id);
                self.bus.publish::<WorkerExited>(WorkerExit {
                    worker_id,
                    function_id,
                    code,
                });
            }
        }
    }

    /// Terminal transition: answers everything still queued and leaves the pool.
    fn finish(&self, jobs: &mut mpsc::UnboundedReceiver<Job>, kind: ErrorKind, message: &str, worker_id: &str) {
        self.state.send_replace(WorkerState::Stopped);
        if let Some(pool) = self.pool.upgrade() {
            pool.retire(worker_id, self.generation);
        }
        jobs.close();
        while let Ok(job) = jobs.try_recv() {
            let _ = job
                .reply
                .send(InvocationResult::failure(&job.invocation, kind, message));
        }
    }
}

fn to_result(invocation: &Invocation, reply: WorkerReply) -> InvocationResult {
    match reply {
        WorkerReply::Success { body } => InvocationResult::success(invocation, body),
        WorkerReply::Error {
            error_type,
            error_message,
            trace,
        } => InvocationResult::handler_error(invocation, error_type, error_message, trace),
    }
}
