//! WorkerSignals - handler から WorkerManager への通知経路
//!
//! 子プロセスの stdout/stderr と終了は、どのリクエストの処理中かを知らない
//! 非同期の出来事なので、handler はここに投げるだけにして、
//! 帰属（requestID の付与）は WorkerManager が行います。

use tokio::sync::mpsc;

use crate::domain::{FunctionId, WorkerId};

/// Out-of-band report from a running worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerSignal {
    Stdout {
        worker_id: WorkerId,
        function_id: FunctionId,
        instance: u64,
        line: String,
    },
    Exited {
        worker_id: WorkerId,
        function_id: FunctionId,
        instance: u64,
        code: Option<i32>,
    },
}

/// Sender half handed to a handler for one worker instance.
///
/// `instance` distinguishes a restarted worker from the one it replaced, so that a
/// late exit report from the old process cannot remove the new record.
#[derive(Debug, Clone)]
pub struct WorkerSignals {
    worker_id: WorkerId,
    function_id: FunctionId,
    instance: u64,
    tx: mpsc::UnboundedSender<WorkerSignal>,
}

impl WorkerSignals {
    pub fn new(
        worker_id: WorkerId,
        function_id: FunctionId,
        instance: u64,
        tx: mpsc::UnboundedSender<WorkerSignal>,
    ) -> Self {
        Self {
            worker_id,
            function_id,
            instance,
            tx,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn stdout(&self, line: impl Into<String>) {
        // manager gone means the session is shutting down
        let _ = self.tx.send(WorkerSignal::Stdout {
            worker_id: self.worker_id.clone(),
            function_id: self.function_id.clone(),
            instance: self.instance,
            line: line.into(),
        });
    }

    pub fn exited(&self, code: Option<i32>) {
        let _ = self.tx.send(WorkerSignal::Exited {
            worker_id: self.worker_id.clone(),
            function_id: self.function_id.clone(),
            instance: self.instance,
            code,
        });
    }
}
