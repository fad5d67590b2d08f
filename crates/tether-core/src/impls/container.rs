//! Container handler: `docker build` the function directory, `docker run` the
//! image on the host network so the runtime client can reach the local API.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::fs::ProjectRoots;
use super::process::{ProcessTable, command, run_build, worker_command};
use crate::domain::{Architecture, BuildMode, FunctionDescriptor, FunctionId, TetherError, WorkerId};
use crate::ports::{BuildInput, BuildResult, RuntimeFamily, RuntimeHandler, StartWorkerInput};

pub struct ContainerHandler {
    processes: ProcessTable,
    roots: ProjectRoots,
    /// worker -> `docker run --name`
    containers: Mutex<HashMap<WorkerId, String>>,
}

impl ContainerHandler {
    pub fn new(grace: Duration) -> Self {
        Self {
            processes: ProcessTable::new(grace),
            roots: ProjectRoots::default(),
            containers: Mutex::new(HashMap::new()),
        }
    }
}

/// Docker names allow `[a-zA-Z0-9_.-]`; tags must also be lowercase.
fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

fn image_tag(function_id: &FunctionId, mode: BuildMode) -> String {
    let prefix = match mode {
        BuildMode::Start => "tether-dev",
        BuildMode::Deploy => "tether-build",
    };
    format!("{prefix}:{}", sanitize(function_id.as_str()))
}

fn docker_build_args(function: &FunctionDescriptor, mode: BuildMode) -> Vec<String> {
    let props = &function.build_props.container;
    let mut args = vec![
        "build".to_string(),
        "-t".into(),
        image_tag(&function.function_id, mode),
    ];
    if let Some(file) = &props.file {
        args.push("-f".into());
        args.push(file.to_string_lossy().into_owned());
    }
    for (key, value) in &props.build_args {
        args.push("--build-arg".into());
        args.push(format!("{key}={value}"));
    }
    if mode == BuildMode::Deploy {
        let platform = match function.build_props.architecture {
            Architecture::Arm64 => "linux/arm64",
            Architecture::X86_64 => "linux/amd64",
        };
        args.push("--platform".into());
        args.push(platform.into());
    }
    args.push(".".into());
    args
}

fn docker_run_args(
    name: &str,
    image: &str,
    env: &HashMap<String, String>,
    function: &FunctionDescriptor,
) -> Vec<String> {
    let props = &function.build_props.container;
    let mut args = vec![
        "run".to_string(),
        "--rm".into(),
        "--network=host".into(),
        format!("--name={name}"),
    ];
    let mut vars: Vec<_> = env.iter().collect();
    vars.sort();
    for (key, value) in vars {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }
    if let Some(entrypoint) = &props.entrypoint {
        args.push("--entrypoint".into());
        args.push(entrypoint.clone());
    }
    args.push(image.to_string());
    args.extend(props.cmd.iter().cloned());
    args
}

#[async_trait]
impl RuntimeHandler for ContainerHandler {
    fn family(&self) -> RuntimeFamily {
        RuntimeFamily::Container
    }

    async fn build(&self, input: BuildInput) -> BuildResult {
        let root: PathBuf = input.function.handler_file();
        if !root.is_dir() {
            return BuildResult::failed(format!(
                "container handler {} is not a directory",
                root.display()
            ));
        }
        self.roots.record(input.function_id(), &root);

        let docker = command("docker", docker_build_args(&input.function, input.mode), &root);
        match run_build(docker).await {
            Ok(_) => BuildResult::success(image_tag(input.function_id(), input.mode)),
            Err(diagnostic) => BuildResult::failed(diagnostic),
        }
    }

    async fn start_worker(&self, input: StartWorkerInput) -> Result<(), TetherError> {
        let name = sanitize(&format!(
            "tether-{}-{}",
            input.worker_id,
            chrono::Utc::now().timestamp_millis()
        ));
        let args = docker_run_args(
            &name,
            &input.artifact.entry_handler,
            &input.process_env(),
            &input.function,
        );
        let dir = input.artifact_dir().to_path_buf();
        self.processes.spawn(
            &input.worker_id,
            worker_command("docker", args, &dir, &HashMap::new()),
            input.signals,
        )?;
        self.containers.lock().insert(input.worker_id, name);
        Ok(())
    }

    async fn stop_worker(&self, worker_id: &WorkerId) -> Result<(), TetherError> {
        let name = self.containers.lock().remove(worker_id);
        if let Some(name) = name {
            let cwd = std::env::temp_dir();
            if let Err(diagnostic) = run_build(command("docker", ["kill", name.as_str()], &cwd)).await {
                tracing::debug!(worker_id = %worker_id, %diagnostic, "docker kill failed");
            }
        }
        self.processes.stop(worker_id).await;
        Ok(())
    }

    fn should_rebuild(&self, changed_file: &Path, function_id: &FunctionId) -> bool {
        self.roots.contains(function_id, changed_file)
    }
}
