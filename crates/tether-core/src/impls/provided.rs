//! Custom runtime: the handler is an executable that speaks the runtime API
//! itself. Copied to `<artifact>/bootstrap` and run as is.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use super::fs::ProjectRoots;
use super::process::{ProcessTable, worker_command};
use crate::domain::{FunctionId, TetherError, WorkerId};
use crate::ports::{BuildInput, BuildResult, RuntimeFamily, RuntimeHandler, StartWorkerInput};

const BOOTSTRAP: &str = "bootstrap";

pub struct ProvidedHandler {
    processes: ProcessTable,
    roots: ProjectRoots,
}

impl ProvidedHandler {
    pub fn new(grace: Duration) -> Self {
        Self {
            processes: ProcessTable::new(grace),
            roots: ProjectRoots::default(),
        }
    }
}

#[async_trait]
impl RuntimeHandler for ProvidedHandler {
    fn family(&self) -> RuntimeFamily {
        RuntimeFamily::Provided
    }

    async fn build(&self, input: BuildInput) -> BuildResult {
        let executable = input.function.handler_file();
        if let Some(parent) = executable.parent() {
            self.roots.record(input.function_id(), parent);
        }
        // fs::copy はパーミッションも引き継ぐ
        match tokio::fs::copy(&executable, input.out_dir.join(BOOTSTRAP)).await {
            Ok(_) => BuildResult::success(BOOTSTRAP),
            Err(e) => BuildResult::failed(format!("failed to copy {}: {e}", executable.display())),
        }
    }

    async fn start_worker(&self, input: StartWorkerInput) -> Result<(), TetherError> {
        let dir = input.artifact_dir().to_path_buf();
        let env = input.process_env();
        let no_args: [&str; 0] = [];
        self.processes.spawn(
            &input.worker_id,
            worker_command(dir.join(&input.artifact.entry_handler), no_args, &dir, &env),
            input.signals,
        )
    }

    async fn stop_worker(&self, worker_id: &WorkerId) -> Result<(), TetherError> {
        self.processes.stop(worker_id).await;
        Ok(())
    }

    fn should_rebuild(&self, changed_file: &Path, function_id: &FunctionId) -> bool {
        self.roots.contains(function_id, changed_file)
    }
}
