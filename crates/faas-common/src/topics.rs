//! Every message that crosses a component boundary, with its payload shape.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::bus::Topic;
use crate::{Acknowledgement, Invocation, InvocationFailure, InvocationSuccess};

/// Remote call relayed in from the deployed stub.
pub struct FunctionInvoked;

impl Topic for FunctionInvoked {
    const NAME: &'static str = "function.invoked";
    type Payload = Invocation;
}

pub struct FunctionAck;

impl Topic for FunctionAck {
    const NAME: &'static str = "function.ack";
    type Payload = Acknowledgement;
}

pub struct FunctionSuccess;

impl Topic for FunctionSuccess {
    const NAME: &'static str = "function.success";
    type Payload = InvocationSuccess;
}

pub struct FunctionError;

impl Topic for FunctionError {
    const NAME: &'static str = "function.error";
    type Payload = InvocationFailure;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub file: PathBuf,
}

pub struct FileChanged;

impl Topic for FileChanged {
    const NAME: &'static str = "file.changed";
    type Payload = FileChange;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSuccess {
    #[serde(rename = "functionID")]
    pub function_id: String,
    pub artifact_path: PathBuf,
    /// Command line that starts one worker process against this artifact.
    pub command: Vec<String>,
}

pub struct BuildSucceeded;

impl Topic for BuildSucceeded {
    const NAME: &'static str = "build.succeeded";
    type Payload = BuildSuccess;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildFailure {
    #[serde(rename = "functionID")]
    pub function_id: String,
    pub errors: Vec<String>,
}

pub struct BuildFailed;

impl Topic for BuildFailed {
    const NAME: &'static str = "build.failed";
    type Payload = BuildFailure;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerExit {
    #[serde(rename = "workerID")]
    pub worker_id: String,
    #[serde(rename = "functionID")]
    pub function_id: String,
    pub code: Option<i32>,
}

/// A worker process went away on its own (not through invalidation).
pub struct WorkerExited;

impl Topic for WorkerExited {
    const NAME: &'static str = "worker.exited";
    type Payload = WorkerExit;
}
