//! Test doubles for the app layer.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::domain::{FunctionId, TetherError, WorkerId};
use crate::ports::{
    BuildInput, BuildResult, RuntimeFamily, RuntimeHandler, StartWorkerInput, WorkerSignals,
};

/// `RuntimeHandler` that records every call and lets the test script outcomes.
///
/// - build: writes `index.js` into the output dir and succeeds, unless a result was
///   scripted with `script_build`
/// - start_worker: keeps the `WorkerSignals` so the test can play stdout / exit
/// - stop_worker: reports an exit through the kept signals, like a killed process
pub struct RecordingHandler {
    family: RuntimeFamily,
    can_handle_calls: AtomicUsize,
    builds: AtomicUsize,
    scripted: Mutex<VecDeque<BuildResult>>,
    build_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fail_start: AtomicBool,
    rebuild_under: Mutex<Vec<(Option<FunctionId>, PathBuf)>>,
    signals: Mutex<HashMap<WorkerId, WorkerSignals>>,
    /// Signals of stopped or crashed processes, last one per worker.
    retired: Mutex<HashMap<WorkerId, WorkerSignals>>,
    starts: Mutex<Vec<StartRecord>>,
    log: Mutex<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct StartRecord {
    pub worker_id: WorkerId,
    pub function_id: FunctionId,
    pub artifact_dir: PathBuf,
    pub env: HashMap<String, String>,
}

impl RecordingHandler {
    pub fn new(family: RuntimeFamily) -> Arc<Self> {
        Arc::new(Self {
            family,
            can_handle_calls: AtomicUsize::new(0),
            builds: AtomicUsize::new(0),
            scripted: Mutex::new(VecDeque::new()),
            build_delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            fail_start: AtomicBool::new(false),
            rebuild_under: Mutex::new(Vec::new()),
            signals: Mutex::new(HashMap::new()),
            retired: Mutex::new(HashMap::new()),
            starts: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn script_build(&self, result: BuildResult) {
        self.scripted.lock().push_back(result);
    }

    pub fn set_build_delay(&self, delay: Duration) {
        *self.build_delay.lock() = delay;
    }

    pub fn fail_starts(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// `should_rebuild` answers true for files under `dir`.
    pub fn rebuild_under(&self, dir: impl Into<PathBuf>) {
        self.rebuild_under.lock().push((None, dir.into()));
    }

    /// Like `rebuild_under`, for one function only.
    pub fn rebuild_only(&self, function_id: &FunctionId, dir: impl Into<PathBuf>) {
        self.rebuild_under
            .lock()
            .push((Some(function_id.clone()), dir.into()));
    }

    pub fn can_handle_calls(&self) -> usize {
        self.can_handle_calls.load(Ordering::SeqCst)
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_builds(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> Vec<StartRecord> {
        self.starts.lock().clone()
    }

    /// Ordered `build:<fid>`, `start:<wid>`, `stop:<wid>` entries.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn is_running(&self, worker_id: &WorkerId) -> bool {
        self.signals.lock().contains_key(worker_id)
    }

    pub fn emit_stdout(&self, worker_id: &WorkerId, line: &str) {
        if let Some(signals) = self.signals.lock().get(worker_id) {
            signals.stdout(line);
        }
    }

    /// A late line from the last stopped or crashed process of `worker_id`.
    pub fn emit_retired_stdout(&self, worker_id: &WorkerId, line: &str) {
        if let Some(signals) = self.retired.lock().get(worker_id) {
            signals.stdout(line);
        }
    }

    /// Simulate the worker process exiting by itself.
    pub fn crash(&self, worker_id: &WorkerId, code: i32) {
        let signals = self.signals.lock().remove(worker_id);
        if let Some(signals) = signals {
            signals.exited(Some(code));
            self.retired.lock().insert(worker_id.clone(), signals);
        }
    }
}

#[async_trait]
impl RuntimeHandler for RecordingHandler {
    fn family(&self) -> RuntimeFamily {
        self.family
    }

    fn can_handle(&self, runtime: &str) -> bool {
        self.can_handle_calls.fetch_add(1, Ordering::SeqCst);
        RuntimeFamily::detect(runtime) == Some(self.family)
    }

    async fn build(&self, input: BuildInput) -> BuildResult {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(format!("build:{}", input.function_id()));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.build_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(result) = self.scripted.lock().pop_front() {
            return result;
        }
        match tokio::fs::write(input.out_dir.join("index.js"), "export const handler = 1;").await {
            Ok(()) => BuildResult::success("index.handler"),
            Err(e) => BuildResult::failed(e.to_string()),
        }
    }

    async fn start_worker(&self, input: StartWorkerInput) -> Result<(), TetherError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(TetherError::WorkerSpawn {
                worker_id: input.worker_id,
                message: "toolchain not installed".into(),
            });
        }
        self.log.lock().push(format!("start:{}", input.worker_id));
        self.starts.lock().push(StartRecord {
            worker_id: input.worker_id.clone(),
            function_id: input.function.function_id.clone(),
            artifact_dir: input.artifact.output_dir.clone(),
            env: input.process_env(),
        });
        self.signals.lock().insert(input.worker_id, input.signals);
        Ok(())
    }

    async fn stop_worker(&self, worker_id: &WorkerId) -> Result<(), TetherError> {
        self.log.lock().push(format!("stop:{worker_id}"));
        let signals = self.signals.lock().remove(worker_id);
        if let Some(signals) = signals {
            signals.exited(None);
            self.retired.lock().insert(worker_id.clone(), signals);
        }
        Ok(())
    }

    fn should_rebuild(&self, changed_file: &Path, function_id: &FunctionId) -> bool {
        self.rebuild_under
            .lock()
            .iter()
            .any(|(scope, dir)| {
                scope.as_ref().is_none_or(|id| id == function_id) && changed_file.starts_with(dir)
            })
    }
}
