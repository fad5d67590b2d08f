//! Python handler.
//!
//! start: ビルドなし。ソースをその場で実行する（成果物 = handler そのもの）
//! deploy: ソースツリーを成果物にコピーし、requirements.txt と installCommands を実行

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::fs::{ProjectRoots, copy_recursive, find_above};
use super::process::{ProcessTable, command, run_build, worker_command};
use crate::domain::{BuildMode, FunctionDescriptor, FunctionId, TetherError, WorkerId};
use crate::ports::{BuildInput, BuildResult, RuntimeFamily, RuntimeHandler, StartWorkerInput};

const RUNTIME_SHIM: &str = include_str!("../../support/python-runtime.py");
const SHIM_FILE: &str = "__tether_runtime.py";
const SOURCE_MARKERS: [&str; 3] = ["requirements.txt", "Pipfile", "poetry.lock"];

#[cfg(windows)]
const PYTHON: &str = "python.exe";
#[cfg(not(windows))]
const PYTHON: &str = "python3";

pub struct PythonHandler {
    processes: ProcessTable,
    roots: ProjectRoots,
}

impl PythonHandler {
    pub fn new(grace: Duration) -> Self {
        Self {
            processes: ProcessTable::new(grace),
            roots: ProjectRoots::default(),
        }
    }
}

/// Nearest directory above the handler holding one of the source markers.
fn find_src(handler_file: &Path) -> Option<PathBuf> {
    let dir = handler_file.parent()?;
    SOURCE_MARKERS
        .iter()
        .find_map(|marker| find_above(dir, marker))
}

/// `<src>/api/orders.handler` -> (`api.orders`, `handler`)
fn module_and_function(src: &Path, handler_file: &Path) -> Option<(String, String)> {
    let relative = handler_file.strip_prefix(src).ok()?;
    let function = relative.extension()?.to_str()?.to_string();
    let stem = relative.file_stem()?.to_str()?;
    let mut parts: Vec<String> = relative
        .parent()
        .map(|parent| {
            parent
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    parts.push(stem.to_string());
    Some((parts.join("."), function))
}

async fn deploy(function: &FunctionDescriptor, src: &Path, out_dir: &Path) -> Result<(), String> {
    let (from, to) = (src.to_path_buf(), out_dir.to_path_buf());
    tokio::task::spawn_blocking(move || copy_recursive(&from, &to))
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| format!("failed to copy sources: {e}"))?;

    if out_dir.join("requirements.txt").is_file() {
        let args = ["-m", "pip", "install", "-r", "requirements.txt", "-t", "."];
        run_build(command(PYTHON, args, out_dir)).await?;
    }
    for install in &function.build_props.python.install_commands {
        let (shell, flag) = if cfg!(windows) { ("cmd", "/C") } else { ("sh", "-c") };
        run_build(command(shell, [flag, install.as_str()], out_dir)).await?;
    }
    Ok(())
}

#[async_trait]
impl RuntimeHandler for PythonHandler {
    fn family(&self) -> RuntimeFamily {
        RuntimeFamily::Python
    }

    async fn build(&self, input: BuildInput) -> BuildResult {
        let function = &input.function;
        let handler_file = function.handler_file();
        let Some(src) = find_src(&handler_file) else {
            return BuildResult::failed(format!(
                "could not find src for {}",
                function.handler_path
            ));
        };
        self.roots.record(input.function_id(), &src);

        match input.mode {
            BuildMode::Start => BuildResult::success(handler_file.to_string_lossy()),
            BuildMode::Deploy => match deploy(function, &src, &input.out_dir).await {
                Ok(()) => {
                    let relative = handler_file
                        .strip_prefix(&src)
                        .map(|p| p.to_string_lossy().replace('\\', "/"))
                        .unwrap_or_else(|_| function.handler_path.clone());
                    BuildResult::success(relative)
                }
                Err(diagnostic) => BuildResult::failed(diagnostic),
            },
        }
    }

    async fn start_worker(&self, input: StartWorkerInput) -> Result<(), TetherError> {
        let spawn_error = |message: String| TetherError::WorkerSpawn {
            worker_id: input.worker_id.clone(),
            message,
        };
        // start 成果物は絶対パスの handler、deploy 成果物は成果物ディレクトリ相対
        let entry = Path::new(&input.artifact.entry_handler);
        let (src, handler_file) = if entry.is_absolute() {
            let src = find_src(entry)
                .ok_or_else(|| spawn_error(format!("could not find src for {}", entry.display())))?;
            (src, entry.to_path_buf())
        } else {
            let dir = input.artifact_dir().to_path_buf();
            (dir.clone(), dir.join(entry))
        };
        let (module, function) = module_and_function(&src, &handler_file).ok_or_else(|| {
            spawn_error(format!("invalid python handler {}", handler_file.display()))
        })?;

        let shim = input.artifact_dir().join(SHIM_FILE);
        tokio::fs::write(&shim, RUNTIME_SHIM).await?;
        let args = [
            "-u".to_string(),
            shim.to_string_lossy().into_owned(),
            module,
            src.to_string_lossy().into_owned(),
            function,
        ];
        let env = input.process_env();
        self.processes.spawn(
            &input.worker_id,
            worker_command(PYTHON, args, &src, &env),
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
