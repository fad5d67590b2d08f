//! Errors - エラー型

use thiserror::Error;

use super::ids::{FunctionId, WorkerId};
use crate::context::ContextError;

#[derive(Debug, Error)]
pub enum TetherError {
    #[error("unknown function: {0}")]
    UnknownFunction(FunctionId),

    #[error("no runtime handler found for runtime={runtime} (function={function_id})")]
    UnsupportedRuntime {
        function_id: FunctionId,
        runtime: String,
    },

    #[error("build failed for function={function_id}: {}", diagnostics.join("; "))]
    BuildFailed {
        function_id: FunctionId,
        diagnostics: Vec<String>,
    },

    #[error("no artifact available for function={function_id}")]
    NoArtifact {
        function_id: FunctionId,
        diagnostics: Vec<String>,
    },

    #[error("failed to start worker={worker_id}: {message}")]
    WorkerSpawn { worker_id: WorkerId, message: String },

    #[error("invocation timed out after {0:?}")]
    InvocationTimeout(std::time::Duration),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("runtime server error: {0}")]
    Server(String),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl TetherError {
    /// Diagnostics attached to build related errors.
    pub fn diagnostics(&self) -> &[String] {
        match self {
            TetherError::BuildFailed { diagnostics, .. }
            | TetherError::NoArtifact { diagnostics, .. } => diagnostics,
            _ => &[],
        }
    }
}
