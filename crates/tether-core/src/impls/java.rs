//! Java handler: gradle build, distribution zip unpacked into the artifact, run
//! through the Lambda runtime interface client.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use walkdir::WalkDir;

use super::fs::{ProjectRoots, find_below, matches_source};
use super::process::{ProcessTable, command, run_build, worker_command};
use crate::domain::{FunctionDescriptor, FunctionId, TetherError, WorkerId};
use crate::ports::{BuildInput, BuildResult, RuntimeFamily, RuntimeHandler, StartWorkerInput};

const RIC_MAIN: &str = "com.amazonaws.services.lambda.runtime.api.client.AWSLambda";

#[cfg(windows)]
const CLASSPATH_SEPARATOR: &str = ";";
#[cfg(not(windows))]
const CLASSPATH_SEPARATOR: &str = ":";

pub struct JavaHandler {
    processes: ProcessTable,
    roots: ProjectRoots,
    /// gradle はプロジェクトディレクトリごとに 1 つずつしか走らせない
    gradle_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl JavaHandler {
    pub fn new(grace: Duration) -> Self {
        Self {
            processes: ProcessTable::new(grace),
            roots: ProjectRoots::default(),
            gradle_locks: Mutex::new(HashMap::new()),
        }
    }

    fn gradle_lock(&self, project: &Path) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.gradle_locks
                .lock()
                .entry(project.to_path_buf())
                .or_default(),
        )
    }

    async fn build_inner(&self, input: &BuildInput) -> Result<(), String> {
        let function = &input.function;
        let project = find_below(&function.source_root, "build.gradle")
            .ok_or_else(|| "could not find a build.gradle file".to_string())?;
        self.roots.record(input.function_id(), &project);

        let (program, args) = gradle_invocation(&project, function);
        {
            let lock = self.gradle_lock(&project);
            let _guard = lock.lock().await;
            run_build(command(program, args, &project)).await?;
        }

        let output_dir = project.join("build").join(
            function
                .build_props
                .java
                .build_output_dir
                .as_deref()
                .unwrap_or("distributions"),
        );
        let zip = find_zip(&output_dir)
            .ok_or_else(|| format!("no .zip distribution in {}", output_dir.display()))?;
        let zip = zip.to_string_lossy().into_owned();
        let out = input.out_dir.to_string_lossy().into_owned();
        run_build(command("unzip", ["-q", "-o", zip.as_str(), "-d", out.as_str()], &project))
            .await
            .map(|_| ())
    }
}

/// Gradle wrapper when the project ships one, `gradle` otherwise.
fn gradle_invocation(project: &Path, function: &FunctionDescriptor) -> (PathBuf, Vec<String>) {
    let wrapper = project.join(if cfg!(windows) { "gradlew.bat" } else { "gradlew" });
    let program = if wrapper.is_file() {
        wrapper
    } else {
        PathBuf::from("gradle")
    };
    let task = function
        .build_props
        .java
        .build_task
        .clone()
        .unwrap_or_else(|| "build".to_string());
    (
        program,
        vec![task, "-Dorg.gradle.logging.level=lifecycle".to_string()],
    )
}

fn find_zip(dir: &Path) -> Option<PathBuf> {
    let mut zips: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "zip"))
        .collect();
    zips.sort();
    zips.into_iter().next()
}

/// Runtime client entries followed by every jar of the unpacked distribution.
fn classpath(runtime_classpath: &[PathBuf], artifact: &Path) -> String {
    let mut jars: Vec<PathBuf> = WalkDir::new(artifact)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "jar"))
        .collect();
    jars.sort();
    runtime_classpath
        .iter()
        .cloned()
        .chain(std::iter::once(artifact.to_path_buf()))
        .chain(jars)
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(CLASSPATH_SEPARATOR)
}

#[async_trait]
impl RuntimeHandler for JavaHandler {
    fn family(&self) -> RuntimeFamily {
        RuntimeFamily::Java
    }

    async fn build(&self, input: BuildInput) -> BuildResult {
        match self.build_inner(&input).await {
            Ok(()) => BuildResult::success(input.function.handler_path.clone()),
            Err(diagnostic) => BuildResult::failed(diagnostic),
        }
    }

    async fn start_worker(&self, input: StartWorkerInput) -> Result<(), TetherError> {
        let dir = input.artifact_dir().to_path_buf();
        let classpath = classpath(&input.function.build_props.java.runtime_classpath, &dir);
        let args = [
            "-cp".to_string(),
            classpath,
            RIC_MAIN.to_string(),
            input.artifact.entry_handler.clone(),
        ];
        let env = input.process_env();
        self.processes.spawn(
            &input.worker_id,
            worker_command("java", args, &dir, &env),
            input.signals,
        )
    }

    async fn stop_worker(&self, worker_id: &WorkerId) -> Result<(), TetherError> {
        self.processes.stop(worker_id).await;
        Ok(())
    }

    fn should_rebuild(&self, changed_file: &Path, function_id: &FunctionId) -> bool {
        matches_source(changed_file, &["java", "gradle"], &[])
            && self.roots.contains(function_id, changed_file)
    }
}
