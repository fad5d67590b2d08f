//! Events - バス上を流れるイベント
//!
//! コンポーネント間の通知はすべてこの tagged union を経由します。
//! 直接呼び出しは「自分が所有しているオブジェクト」に対してだけ。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use super::ids::{FunctionId, RequestId, WorkerId};
use super::invocation::{Invocation, InvocationError};

/// Discriminant of [`Event`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    FileChanged,
    FunctionInvoked,
    FunctionBuilt,
    FunctionBuildFailed,
    FunctionSuccess,
    FunctionError,
    WorkerStarted,
    WorkerStopped,
    WorkerExited,
    WorkerFailed,
    WorkerStdout,
}

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        EventKind::FileChanged,
        EventKind::FunctionInvoked,
        EventKind::FunctionBuilt,
        EventKind::FunctionBuildFailed,
        EventKind::FunctionSuccess,
        EventKind::FunctionError,
        EventKind::WorkerStarted,
        EventKind::WorkerStopped,
        EventKind::WorkerExited,
        EventKind::WorkerFailed,
        EventKind::WorkerStdout,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::FileChanged => "file.changed",
            EventKind::FunctionInvoked => "function.invoked",
            EventKind::FunctionBuilt => "function.build.success",
            EventKind::FunctionBuildFailed => "function.build.failed",
            EventKind::FunctionSuccess => "function.success",
            EventKind::FunctionError => "function.error",
            EventKind::WorkerStarted => "worker.started",
            EventKind::WorkerStopped => "worker.stopped",
            EventKind::WorkerExited => "worker.exited",
            EventKind::WorkerFailed => "worker.failed",
            EventKind::WorkerStdout => "worker.stdout",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "properties")]
pub enum Event {
    #[serde(rename = "file.changed")]
    FileChanged { file: PathBuf },

    #[serde(rename = "function.invoked")]
    FunctionInvoked(Invocation),

    #[serde(rename = "function.build.success")]
    FunctionBuilt {
        #[serde(rename = "functionID")]
        function_id: FunctionId,
    },

    #[serde(rename = "function.build.failed")]
    FunctionBuildFailed {
        #[serde(rename = "functionID")]
        function_id: FunctionId,
        errors: Vec<String>,
    },

    #[serde(rename = "function.success")]
    FunctionSuccess {
        #[serde(rename = "workerID")]
        worker_id: WorkerId,
        #[serde(rename = "functionID")]
        function_id: FunctionId,
        #[serde(rename = "requestID")]
        request_id: RequestId,
        body: serde_json::Value,
    },

    #[serde(rename = "function.error")]
    FunctionError {
        #[serde(rename = "workerID")]
        worker_id: WorkerId,
        #[serde(rename = "functionID")]
        function_id: FunctionId,
        #[serde(rename = "requestID")]
        request_id: RequestId,
        #[serde(flatten)]
        error: InvocationError,
    },

    #[serde(rename = "worker.started")]
    WorkerStarted {
        #[serde(rename = "workerID")]
        worker_id: WorkerId,
        #[serde(rename = "functionID")]
        function_id: FunctionId,
    },

    #[serde(rename = "worker.stopped")]
    WorkerStopped {
        #[serde(rename = "workerID")]
        worker_id: WorkerId,
        #[serde(rename = "functionID")]
        function_id: FunctionId,
    },

    #[serde(rename = "worker.exited")]
    WorkerExited {
        #[serde(rename = "workerID")]
        worker_id: WorkerId,
        #[serde(rename = "functionID")]
        function_id: FunctionId,
        code: Option<i32>,
    },

    /// The worker could not be started (missing toolchain, build failure, ...).
    #[serde(rename = "worker.failed")]
    WorkerFailed {
        #[serde(rename = "workerID")]
        worker_id: WorkerId,
        #[serde(rename = "functionID")]
        function_id: FunctionId,
        error: String,
    },

    #[serde(rename = "worker.stdout")]
    WorkerStdout {
        #[serde(rename = "workerID")]
        worker_id: WorkerId,
        #[serde(rename = "functionID")]
        function_id: FunctionId,
        #[serde(rename = "requestID")]
        request_id: Option<RequestId>,
        message: String,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::FileChanged { .. } => EventKind::FileChanged,
            Event::FunctionInvoked(_) => EventKind::FunctionInvoked,
            Event::FunctionBuilt { .. } => EventKind::FunctionBuilt,
            Event::FunctionBuildFailed { .. } => EventKind::FunctionBuildFailed,
            Event::FunctionSuccess { .. } => EventKind::FunctionSuccess,
            Event::FunctionError { .. } => EventKind::FunctionError,
            Event::WorkerStarted { .. } => EventKind::WorkerStarted,
            Event::WorkerStopped { .. } => EventKind::WorkerStopped,
            Event::WorkerExited { .. } => EventKind::WorkerExited,
            Event::WorkerFailed { .. } => EventKind::WorkerFailed,
            Event::WorkerStdout { .. } => EventKind::WorkerStdout,
        }
    }

    /// Request id carried by the event, if any.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Event::FunctionInvoked(invocation) => Some(&invocation.request_id),
            Event::FunctionSuccess { request_id, .. } | Event::FunctionError { request_id, .. } => {
                Some(request_id)
            }
            Event::WorkerStdout { request_id, .. } => request_id.as_ref(),
            _ => None,
        }
    }
}
