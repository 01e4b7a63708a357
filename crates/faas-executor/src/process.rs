//! Workers as OS processes speaking JSON lines over stdio.
//!
//! The pool writes one [`Invocation`] per stdin line. Each stdout line that parses as a
//! [`WorkerReply`] answers the oldest outstanding request; every other line, and all of stderr,
//! is handler output and is re-emitted through `tracing`.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use faas_common::Invocation;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::worker::{SpawnRequest, WorkerProcess, WorkerReply, WorkerSpawner};
use crate::{ExecutorError, Result};

/// Set in every worker's environment.
pub const WORKER_ID_ENV: &str = "FAAS_DEV_WORKER_ID";
pub const FUNCTION_ID_ENV: &str = "FAAS_DEV_FUNCTION_ID";

const REAP_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default)]
pub struct ProcessSpawner;

impl ProcessSpawner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    #[instrument(skip(self, request), fields(worker_id = %request.worker_id, function_id = %request.function_id))]
    async fn spawn(&self, request: &SpawnRequest) -> Result<Box<dyn WorkerProcess>> {
        let (program, args) = request
            .command
            .split_first()
            .ok_or_else(|| ExecutorError::SpawnFailed {
                worker_id: request.worker_id.clone(),
                reason: "empty run command".to_string(),
            })?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&request.artifact_path)
            .envs(&request.env)
            .env(WORKER_ID_ENV, &request.worker_id)
            .env(FUNCTION_ID_ENV, &request.function_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::SpawnFailed {
                worker_id: request.worker_id.clone(),
                reason: format!("`{program}`: {e}"),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            ExecutorError::Internal("worker stdin was not captured".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ExecutorError::Internal("worker stdout was not captured".to_string())
        })?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(relay_output(stderr, request.worker_id.clone()));
        }

        let (tx, replies) = mpsc::unbounded_channel();
        tokio::spawn(read_replies(stdout, request.worker_id.clone(), tx));

        info!(pid = ?child.id(), "Worker process started");
        Ok(Box::new(ProcessWorker {
            worker_id: request.worker_id.clone(),
            child,
            stdin: Some(stdin),
            replies,
        }))
    }
}

pub struct ProcessWorker {
    worker_id: String,
    child: Child,
    stdin: Option<ChildStdin>,
    replies: mpsc::UnboundedReceiver<WorkerReply>,
}

impl ProcessWorker {
    /// Stdout closed; reap the process, killing it if it lingers.
    async fn exit_error(&mut self) -> ExecutorError {
        let code = match tokio::time::timeout(REAP_GRACE, self.child.wait()).await {
            Ok(status) => status.ok().and_then(|status| status.code()),
            Err(_) => {
                warn!(worker_id = %self.worker_id, "Worker closed stdout but kept running, killing");
                let _ = self.child.kill().await;
                None
            }
        };
        ExecutorError::WorkerExited {
            worker_id: self.worker_id.clone(),
            code,
        }
    }
}

#[async_trait]
impl WorkerProcess for ProcessWorker {
    async fn invoke(&mut self, invocation: &Invocation) -> Result<WorkerReply> {
        let mut line = serde_json::to_vec(invocation)?;
        line.push(b'\n');

        let Some(stdin) = self.stdin.as_mut() else {
            return Err(self.exit_error().await);
        };
        if let Err(e) = stdin.write_all(&line).await {
            debug!(worker_id = %self.worker_id, error = %e, "Worker stdin closed");
            return Err(self.exit_error().await);
        }
        stdin.flush().await?;

        match self.replies.recv().await {
            Some(reply) => Ok(reply),
            None => Err(self.exit_error().await),
        }
    }

    async fn exited(&mut self) -> Option<i32> {
        self.child.wait().await.ok().and_then(|status| status.code())
    }

    async fn shutdown(&mut self) {
        // Closing stdin lets the bridge shims exit cleanly; kill covers everything else.
        self.stdin.take();
        if let Err(e) = self.child.kill().await {
            debug!(worker_id = %self.worker_id, error = %e, "Worker already gone");
        }
    }
}

async fn read_replies<R: AsyncRead + Unpin>(
    stdout: R,
    worker_id: String,
    tx: mpsc::UnboundedSender<WorkerReply>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match serde_json::from_str::<WorkerReply>(&line) {
                Ok(reply) => {
                    if tx.send(reply).is_err() {
                        return;
                    }
                }
                Err(_) => info!(target: "faas_dev::worker", worker_id = %worker_id, "{}", line),
            },
            Ok(None) => return,
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "Failed to read worker stdout");
                return;
            }
        }
    }
}

async fn relay_output<R: AsyncRead + Unpin>(output: R, worker_id: String) {
    let mut lines = BufReader::new(output).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "faas_dev::worker", worker_id = %worker_id, "{}", line);
    }
}
