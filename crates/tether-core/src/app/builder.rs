//! Function Builder - 関数ごとの成果物（BuildArtifact）の所有者
//!
//! - `artifact`: キャッシュがあれば返す。なければその場でビルドする
//! - `build`: 常にビルドし直す。成功したら `function.build.success` を publish
//! - `watch`: `file.changed` を購読し、`should_rebuild` が true の関数を再ビルド
//!
//! 同じ functionID のビルドは関数ごとの async Mutex で直列化し、
//! 異なる関数のビルドは並行に進みます。

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use super::registry::{BoundFunction, HandlerRegistry};
use crate::bus::Bus;
use crate::domain::{BuildArtifact, BuildMode, Event, EventKind, FunctionId, TetherError};
use crate::impls::fs::{copy_recursive, link};
use crate::ports::{BuildInput, BuildResult};

pub struct FunctionBuilder {
    registry: Arc<HandlerRegistry>,
    bus: Arc<Bus>,
    artifacts_dir: PathBuf,
    mode: BuildMode,
    artifacts: RwLock<HashMap<FunctionId, BuildArtifact>>,
    locks: Mutex<HashMap<FunctionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl FunctionBuilder {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        bus: Arc<Bus>,
        artifacts_dir: impl Into<PathBuf>,
        mode: BuildMode,
    ) -> Arc<Self> {
        // handler はプロジェクトディレクトリを cwd にしてツールを走らせるので絶対パスにしておく
        let artifacts_dir: PathBuf = artifacts_dir.into();
        let artifacts_dir = std::path::absolute(&artifacts_dir).unwrap_or(artifacts_dir);
        Arc::new(Self {
            registry,
            bus,
            artifacts_dir,
            mode,
            artifacts: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn mode(&self) -> BuildMode {
        self.mode
    }

    /// Last successful build, if any. Never builds.
    pub fn cached(&self, function_id: &FunctionId) -> Option<BuildArtifact> {
        self.artifacts.read().get(function_id).cloned()
    }

    /// Cached artifact, or build it now.
    ///
    /// When this first build fails the error is `NoArtifact` carrying the build
    /// diagnostics.
    pub async fn artifact(&self, function_id: &FunctionId) -> Result<BuildArtifact, TetherError> {
        if let Some(artifact) = self.cached(function_id) {
            return Ok(artifact);
        }

        let lock = self.lock_for(function_id);
        let _guard = lock.lock().await;
        // 待っている間に別のビルドが終わっていればそれを使う
        if let Some(artifact) = self.cached(function_id) {
            return Ok(artifact);
        }

        match self.build_locked(function_id).await {
            Ok(artifact) => Ok(artifact),
            Err(TetherError::BuildFailed {
                function_id,
                diagnostics,
            }) => Err(TetherError::NoArtifact {
                function_id,
                diagnostics,
            }),
            Err(e) => Err(e),
        }
    }

    /// Build unconditionally. A rebuild requested while one is in flight waits
    /// for it and then builds again.
    ///
    /// On failure the previous artifact (if any) stays cached and servable.
    pub async fn build(&self, function_id: &FunctionId) -> Result<BuildArtifact, TetherError> {
        let lock = self.lock_for(function_id);
        let _guard = lock.lock().await;
        self.build_locked(function_id).await
    }

    /// Rebuild on `file.changed` until `shutdown` is cancelled.
    pub fn watch(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut events = self.bus.channel(&[EventKind::FileChanged]);
        let builder = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                let file = match event {
                    Some(Event::FileChanged { file }) => file,
                    Some(_) => continue,
                    None => break,
                };
                for function_id in builder.affected_by(&file) {
                    let builder = Arc::clone(&builder);
                    tokio::spawn(async move {
                        if let Err(e) = builder.build(&function_id).await {
                            tracing::warn!(function_id = %function_id, error = %e, "rebuild failed");
                        }
                    });
                }
            }
            tracing::debug!("builder watch loop stopped");
        })
    }

    /// Functions whose handler says `file` invalidates their last build.
    pub fn affected_by(&self, file: &Path) -> Vec<FunctionId> {
        let catalog = match self.registry.catalog() {
            Ok(catalog) => catalog,
            Err(e) => {
                tracing::debug!(error = %e, "file change ignored");
                return Vec::new();
            }
        };
        catalog
            .iter()
            .filter_map(|function| {
                let bound = match self.registry.bind(&function.function_id) {
                    Ok(bound) => bound,
                    Err(e) => {
                        tracing::debug!(function_id = %function.function_id, error = %e, "skipping function");
                        return None;
                    }
                };
                bound
                    .handler
                    .should_rebuild(file, &function.function_id)
                    .then(|| function.function_id.clone())
            })
            .collect()
    }

    fn lock_for(&self, function_id: &FunctionId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.locks
                .lock()
                .entry(function_id.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Caller holds the function's build lock.
    async fn build_locked(&self, function_id: &FunctionId) -> Result<BuildArtifact, TetherError> {
        let bound = self.registry.bind(function_id)?;
        let function_dir = self.artifacts_dir.join(function_id.as_str());
        let out_dir = function_dir.join(Ulid::new().to_string().to_lowercase());
        tokio::fs::create_dir_all(&out_dir).await?;

        tracing::info!(function_id = %function_id, mode = %self.mode, "building");
        let started = std::time::Instant::now();
        let result = bound
            .handler
            .build(BuildInput {
                function: bound.function.clone(),
                mode: self.mode,
                out_dir: out_dir.clone(),
            })
            .await;

        let result = match result {
            BuildResult::Success { handler } => match self.copy_files(&bound, &out_dir).await {
                Ok(()) => BuildResult::Success { handler },
                Err(diagnostic) => BuildResult::failed(diagnostic),
            },
            failed => failed,
        };

        match result {
            BuildResult::Success { handler } => {
                let artifact = BuildArtifact {
                    function_id: function_id.clone(),
                    output_dir: out_dir.clone(),
                    entry_handler: handler,
                    built_at: Utc::now(),
                };
                let previous = self
                    .artifacts
                    .write()
                    .insert(function_id.clone(), artifact.clone());
                let keep = [Some(out_dir), previous.map(|a| a.output_dir)];
                prune(&function_dir, &keep).await;

                tracing::info!(
                    function_id = %function_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "built"
                );
                self.bus.publish(Event::FunctionBuilt {
                    function_id: function_id.clone(),
                });
                Ok(artifact)
            }
            BuildResult::Failed { diagnostics } => {
                if let Err(e) = tokio::fs::remove_dir_all(&out_dir).await {
                    tracing::debug!(dir = %out_dir.display(), error = %e, "failed to remove build dir");
                }
                tracing::warn!(
                    function_id = %function_id,
                    errors = diagnostics.len(),
                    "build failed"
                );
                self.bus.publish(Event::FunctionBuildFailed {
                    function_id: function_id.clone(),
                    errors: diagnostics.clone(),
                });
                Err(TetherError::BuildFailed {
                    function_id: function_id.clone(),
                    diagnostics,
                })
            }
        }
    }

    /// `buildProps.copyFiles`: symlinked for start builds, copied for deploy builds.
    async fn copy_files(&self, bound: &BoundFunction, out_dir: &Path) -> Result<(), String> {
        let copy_files = bound.function.build_props.copy_files.clone();
        if copy_files.is_empty() {
            return Ok(());
        }
        let source_root = bound.function.source_root.clone();
        let out_dir = out_dir.to_path_buf();
        let mode = self.mode;

        let task = tokio::task::spawn_blocking(move || {
            for entry in &copy_files {
                let to = entry.to.clone().unwrap_or_else(|| entry.from.clone());
                if to.is_absolute() {
                    return Err(format!(
                        "copyFiles destination must be relative: {}",
                        to.display()
                    ));
                }
                let from = source_root.join(&entry.from);
                if !from.exists() {
                    return Err(format!("copyFiles source not found: {}", from.display()));
                }
                let target = out_dir.join(&to);
                let copied = match mode {
                    BuildMode::Start => link(&from, &target),
                    BuildMode::Deploy => copy_recursive(&from, &target),
                };
                copied.map_err(|e| format!("copyFiles {}: {e}", from.display()))?;
            }
            Ok(())
        });
        task.await.map_err(|e| format!("copyFiles task failed: {e}"))?
    }
}

/// Remove every build dir under `function_dir` except `keep`.
async fn prune(function_dir: &Path, keep: &[Option<PathBuf>]) {
    let Ok(mut entries) = tokio::fs::read_dir(function_dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if keep.iter().flatten().any(|k| *k == path) {
            continue;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&path).await {
            tracing::debug!(dir = %path.display(), error = %e, "failed to prune build dir");
        }
    }
}
