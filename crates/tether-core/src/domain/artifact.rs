//! Build artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use super::ids::FunctionId;

/// What the build is for.
///
/// - `Start`: local development (fast, debug symbols, sourcemaps, incremental caches)
/// - `Deploy`: the artifact that actually ships
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    #[default]
    Start,
    Deploy,
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildMode::Start => f.write_str("start"),
            BuildMode::Deploy => f.write_str("deploy"),
        }
    }
}

/// The compiled/bundled output for a function, ready to execute.
///
/// Replaced (never mutated) on rebuild. A worker may keep running from an older
/// artifact until it is stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifact {
    pub function_id: FunctionId,
    pub output_dir: PathBuf,
    /// Entry point as the runtime understands it (`bootstrap`, `src/api.handler`, ...).
    pub entry_handler: String,
    pub built_at: DateTime<Utc>,
}
