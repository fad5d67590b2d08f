//! RuntimeHandler port - one implementation per language/runtime family.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use super::signals::WorkerSignals;
use crate::domain::{BuildArtifact, BuildMode, FunctionDescriptor, FunctionId, TetherError, WorkerId};

/// Language family a runtime string belongs to.
///
/// Selected once per function and memoized; never re-evaluated per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeFamily {
    Node,
    Go,
    Python,
    Rust,
    Java,
    Dotnet,
    Container,
    Provided,
}

impl RuntimeFamily {
    /// `nodejs18.x` -> Node, `python3.11` -> Python, `provided.al2` -> Provided, ...
    pub fn detect(runtime: &str) -> Option<Self> {
        const PREFIXES: [(&str, RuntimeFamily); 8] = [
            ("nodejs", RuntimeFamily::Node),
            ("go", RuntimeFamily::Go),
            ("python", RuntimeFamily::Python),
            ("rust", RuntimeFamily::Rust),
            ("java", RuntimeFamily::Java),
            ("dotnet", RuntimeFamily::Dotnet),
            ("container", RuntimeFamily::Container),
            ("provided", RuntimeFamily::Provided),
        ];
        PREFIXES
            .iter()
            .find(|(prefix, _)| runtime.starts_with(prefix))
            .map(|(_, family)| *family)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeFamily::Node => "node",
            RuntimeFamily::Go => "go",
            RuntimeFamily::Python => "python",
            RuntimeFamily::Rust => "rust",
            RuntimeFamily::Java => "java",
            RuntimeFamily::Dotnet => "dotnet",
            RuntimeFamily::Container => "container",
            RuntimeFamily::Provided => "provided",
        }
    }
}

impl fmt::Display for RuntimeFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct BuildInput {
    pub function: FunctionDescriptor,
    pub mode: BuildMode,
    /// Freshly created, empty directory the handler writes into.
    pub out_dir: PathBuf,
}

impl BuildInput {
    pub fn function_id(&self) -> &FunctionId {
        &self.function.function_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildResult {
    Success {
        /// Entry handler relative to the output directory.
        handler: String,
    },
    Failed {
        diagnostics: Vec<String>,
    },
}

impl BuildResult {
    pub fn success(handler: impl Into<String>) -> Self {
        BuildResult::Success {
            handler: handler.into(),
        }
    }

    pub fn failed(diagnostic: impl Into<String>) -> Self {
        BuildResult::Failed {
            diagnostics: vec![diagnostic.into()],
        }
    }
}

pub struct StartWorkerInput {
    pub worker_id: WorkerId,
    pub function: FunctionDescriptor,
    pub artifact: BuildArtifact,
    /// Declared function environment plus invocation environment.
    pub environment: HashMap<String, String>,
    /// `host:port/{workerID}`, the value of `AWS_LAMBDA_RUNTIME_API`.
    pub runtime_api: String,
    pub signals: WorkerSignals,
}

impl StartWorkerInput {
    /// Process environment every worker gets.
    pub fn process_env(&self) -> HashMap<String, String> {
        let mut env = self.environment.clone();
        env.insert("IS_LOCAL".into(), "true".into());
        env.insert("AWS_LAMBDA_RUNTIME_API".into(), self.runtime_api.clone());
        env.insert(
            "AWS_LAMBDA_FUNCTION_NAME".into(),
            self.function.function_id.to_string(),
        );
        env.entry("AWS_LAMBDA_FUNCTION_MEMORY_SIZE".into())
            .or_insert_with(|| self.function.build_props.memory_size.unwrap_or(1024).to_string());
        env
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact.output_dir
    }
}

/// Per-language build/start/stop implementation.
#[async_trait]
pub trait RuntimeHandler: Send + Sync {
    fn family(&self) -> RuntimeFamily;

    fn can_handle(&self, runtime: &str) -> bool {
        RuntimeFamily::detect(runtime) == Some(self.family())
    }

    /// Compile/bundle into `input.out_dir`. Toolchain failures are reported as
    /// `BuildResult::Failed`, never as a panic or a hung future.
    async fn build(&self, input: BuildInput) -> BuildResult;

    /// Spawn the process that runs the artifact. Stdout and exit are reported
    /// through `input.signals`.
    async fn start_worker(&self, input: StartWorkerInput) -> Result<(), TetherError>;

    /// Terminate the worker. A no-op for unknown or already exited workers.
    async fn stop_worker(&self, worker_id: &WorkerId) -> Result<(), TetherError>;

    /// Does `changed_file` invalidate the last build of `function_id`?
    /// Must err on the side of `true`.
    fn should_rebuild(&self, changed_file: &Path, function_id: &FunctionId) -> bool;
}
