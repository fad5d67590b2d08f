//! Go handler: `go build` into `<artifact>/bootstrap`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::fs::{ProjectRoots, find_above};
use super::process::{ProcessTable, command, run_build, worker_command};
use crate::domain::{Architecture, BuildMode, FunctionDescriptor, FunctionId, TetherError, WorkerId};
use crate::ports::{BuildInput, BuildResult, RuntimeFamily, RuntimeHandler, StartWorkerInput};

#[cfg(windows)]
const BINARY: &str = "bootstrap.exe";
#[cfg(not(windows))]
const BINARY: &str = "bootstrap";

pub struct GoHandler {
    processes: ProcessTable,
    roots: ProjectRoots,
}

impl GoHandler {
    pub fn new(grace: Duration) -> Self {
        Self {
            processes: ProcessTable::new(grace),
            roots: ProjectRoots::default(),
        }
    }
}

/// Module root (directory of `go.mod`) and the package path relative to it.
fn locate(function: &FunctionDescriptor) -> Result<(PathBuf, String), String> {
    let handler = function.handler_file();
    let start = handler.parent().unwrap_or(&function.source_root);
    let project =
        find_above(start, "go.mod").ok_or_else(|| "could not find a go.mod file".to_string())?;
    let package = handler
        .strip_prefix(&project)
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default();
    Ok((project, format!("./{package}")))
}

fn go_build_args(out_dir: &Path, package: &str, mode: BuildMode) -> Vec<String> {
    let binary = match mode {
        BuildMode::Start => BINARY,
        BuildMode::Deploy => "bootstrap",
    };
    vec![
        "build".into(),
        "-ldflags".into(),
        "-s -w".into(),
        "-o".into(),
        out_dir.join(binary).to_string_lossy().into_owned(),
        package.to_string(),
    ]
}

#[async_trait]
impl RuntimeHandler for GoHandler {
    fn family(&self) -> RuntimeFamily {
        RuntimeFamily::Go
    }

    async fn build(&self, input: BuildInput) -> BuildResult {
        let (project, package) = match locate(&input.function) {
            Ok(found) => found,
            Err(diagnostic) => return BuildResult::failed(diagnostic),
        };
        self.roots.record(input.function_id(), &project);

        let mut go = command("go", go_build_args(&input.out_dir, &package, input.mode), &project);
        if input.mode == BuildMode::Deploy {
            let arch = match input.function.build_props.architecture {
                Architecture::Arm64 => "arm64",
                Architecture::X86_64 => "amd64",
            };
            go.env("CGO_ENABLED", "0").env("GOOS", "linux").env("GOARCH", arch);
        }
        match run_build(go).await {
            Ok(_) => BuildResult::success("bootstrap"),
            Err(diagnostic) => BuildResult::failed(diagnostic),
        }
    }

    async fn start_worker(&self, input: StartWorkerInput) -> Result<(), TetherError> {
        let dir = input.artifact_dir().to_path_buf();
        let env = input.process_env();
        let no_args: [&str; 0] = [];
        self.processes.spawn(
            &input.worker_id,
            worker_command(dir.join(BINARY), no_args, &dir, &env),
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
