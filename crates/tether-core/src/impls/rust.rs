//! Rust handler: `cargo build` for local runs, `cargo lambda build` for deploys.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::fs::{ProjectRoots, find_above, matches_source};
use super::process::{ProcessTable, command, run_build, worker_command};
use crate::domain::{Architecture, BuildMode, FunctionDescriptor, FunctionId, TetherError, WorkerId};
use crate::ports::{BuildInput, BuildResult, RuntimeFamily, RuntimeHandler, StartWorkerInput};

#[cfg(windows)]
const EXE_SUFFIX: &str = ".exe";
#[cfg(not(windows))]
const EXE_SUFFIX: &str = "";

pub struct RustHandler {
    processes: ProcessTable,
    roots: ProjectRoots,
}

impl RustHandler {
    pub fn new(grace: Duration) -> Self {
        Self {
            processes: ProcessTable::new(grace),
            roots: ProjectRoots::default(),
        }
    }
}

/// Cargo project root and binary name (the handler's file stem).
fn locate(function: &FunctionDescriptor) -> Result<(PathBuf, String), String> {
    let handler = function.handler_file();
    let name = handler
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| format!("invalid rust handler \"{}\"", function.handler_path))?
        .to_string();
    let start = handler.parent().unwrap_or(&function.source_root);
    let project = find_above(start, "Cargo.toml")
        .ok_or_else(|| "could not find a Cargo.toml file".to_string())?;
    Ok((project, name))
}

/// (cargo args, built binary, file name inside the artifact)
fn cargo_plan(
    project: &Path,
    name: &str,
    mode: BuildMode,
    architecture: Architecture,
) -> (Vec<String>, PathBuf, &'static str) {
    match mode {
        BuildMode::Start => (
            vec!["build".into(), "--bin".into(), name.to_string()],
            project
                .join("target/debug")
                .join(format!("{name}{EXE_SUFFIX}")),
            "handler",
        ),
        BuildMode::Deploy => {
            let mut args = vec!["lambda".to_string(), "build".into(), "--release".into()];
            let triple = match architecture {
                Architecture::Arm64 => {
                    args.push("--arm64".into());
                    "aarch64"
                }
                Architecture::X86_64 => "x86_64",
            };
            // Amazon Linux 2 の glibc 2.26 に合わせる
            args.push("--target".into());
            args.push(format!("{triple}-unknown-linux-gnu.2.26"));
            args.push("--bin".into());
            args.push(name.to_string());
            (
                args,
                project.join("target/lambda").join(name).join("bootstrap"),
                "bootstrap",
            )
        }
    }
}

#[async_trait]
impl RuntimeHandler for RustHandler {
    fn family(&self) -> RuntimeFamily {
        RuntimeFamily::Rust
    }

    async fn build(&self, input: BuildInput) -> BuildResult {
        let (project, name) = match locate(&input.function) {
            Ok(found) => found,
            Err(diagnostic) => return BuildResult::failed(diagnostic),
        };
        self.roots.record(input.function_id(), &project);

        let (args, built, file) = cargo_plan(
            &project,
            &name,
            input.mode,
            input.function.build_props.architecture,
        );
        if let Err(diagnostic) = run_build(command("cargo", args, &project)).await {
            return BuildResult::failed(diagnostic);
        }
        match tokio::fs::copy(&built, input.out_dir.join(file)).await {
            Ok(_) => BuildResult::success(file),
            Err(e) => BuildResult::failed(format!("failed to copy {}: {e}", built.display())),
        }
    }

    async fn start_worker(&self, input: StartWorkerInput) -> Result<(), TetherError> {
        let dir = input.artifact_dir().to_path_buf();
        let mut env = input.process_env();
        env.insert("RUST_BACKTRACE".into(), "1".into());
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
        matches_source(changed_file, &["rs"], &["Cargo.toml", "Cargo.lock"])
            && self.roots.contains(function_id, changed_file)
    }
}
