//! Runtime Worker Manager
//!
//! workerID ごとに高々 1 つのプロセスを管理します。
//!
//! - `function.invoked`: 未知の workerID なら handler を解決し、Builder から成果物を
//!   取得して `start_worker`。既知なら何もしない（起動済みのプロセスが自分で次を取りに来る）
//! - `function.build.success`: 古い成果物で動いている worker を止めて `worker.stopped`
//!   （今の成果物で起動済みのものはそのまま）
//! - handler からの stdout は、現行プロセスのものだけ最新 requestID を付けて `worker.stdout` に
//! - プロセス終了はレコードを消して `worker.exited`（自動再起動はしない）
//!
//! 同じ workerID の start/stop は worker ごとの async Mutex で直列化します。

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedMutexGuard, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::builder::FunctionBuilder;
use super::registry::HandlerRegistry;
use crate::bus::Bus;
use crate::domain::{Event, EventKind, FunctionId, Invocation, RequestId, TetherError, WorkerId};
use crate::ports::{RuntimeHandler, StartWorkerInput, WorkerSignal, WorkerSignals};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Binding, building or spawning.
    Starting,
    Running,
}

/// Snapshot of one worker record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub worker_id: WorkerId,
    pub function_id: FunctionId,
    pub state: WorkerState,
}

struct WorkerRecord {
    function_id: FunctionId,
    state: WorkerState,
    instance: u64,
    handler: Option<Arc<dyn RuntimeHandler>>,
    /// Output dir of the artifact the process runs. Set once running.
    artifact_dir: Option<PathBuf>,
    /// The function was rebuilt while this worker was starting.
    stale: bool,
}

#[derive(Default)]
struct ManagerState {
    workers: HashMap<WorkerId, WorkerRecord>,
    /// Last request id dispatched to each worker, for stdout attribution.
    requests: HashMap<WorkerId, RequestId>,
}

pub struct WorkerManager {
    registry: Arc<HandlerRegistry>,
    builder: Arc<FunctionBuilder>,
    bus: Arc<Bus>,
    /// `host:port` of the runtime server.
    runtime_api: String,
    grace: Duration,
    state: Mutex<ManagerState>,
    locks: Mutex<HashMap<WorkerId, Arc<tokio::sync::Mutex<()>>>>,
    next_instance: AtomicU64,
    signals_tx: mpsc::UnboundedSender<WorkerSignal>,
    signals_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerSignal>>>,
}

impl WorkerManager {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        builder: Arc<FunctionBuilder>,
        bus: Arc<Bus>,
        runtime_api: impl Into<String>,
        grace: Duration,
    ) -> Arc<Self> {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            registry,
            builder,
            bus,
            runtime_api: runtime_api.into(),
            grace,
            state: Mutex::new(ManagerState::default()),
            locks: Mutex::new(HashMap::new()),
            next_instance: AtomicU64::new(1),
            signals_tx,
            signals_rx: Mutex::new(Some(signals_rx)),
        })
    }

    /// Start consuming bus events and worker signals until `shutdown`.
    ///
    /// Subscribes immediately, so events published after this call returns are
    /// never missed.
    pub fn run(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut events = self
            .bus
            .channel(&[EventKind::FunctionInvoked, EventKind::FunctionBuilt]);
        let signals = self.signals_rx.lock().take();
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            let Some(mut signals) = signals else {
                tracing::error!("worker manager is already running");
                return;
            };
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(Event::FunctionInvoked(invocation)) => manager.on_invoked(invocation),
                        Some(Event::FunctionBuilt { function_id }) => manager.on_built(&function_id).await,
                        Some(_) => {}
                        None => break,
                    },
                    Some(signal) = signals.recv() => manager.on_signal(signal),
                }
            }
            tracing::debug!("worker manager loop stopped");
        })
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        let state = self.state.lock();
        let mut workers: Vec<WorkerInfo> = state
            .workers
            .iter()
            .map(|(worker_id, record)| WorkerInfo {
                worker_id: worker_id.clone(),
                function_id: record.function_id.clone(),
                state: record.state,
            })
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }

    pub fn get(&self, worker_id: &WorkerId) -> Option<WorkerInfo> {
        self.state.lock().workers.get(worker_id).map(|record| WorkerInfo {
            worker_id: worker_id.clone(),
            function_id: record.function_id.clone(),
            state: record.state,
        })
    }

    pub fn last_request(&self, worker_id: &WorkerId) -> Option<RequestId> {
        self.state.lock().requests.get(worker_id).cloned()
    }

    /// Stop one worker. No-op for unknown workers.
    pub async fn stop(&self, worker_id: &WorkerId) {
        let guard = self.lock_for(worker_id).lock_owned().await;
        let record = {
            let mut state = self.state.lock();
            state.requests.remove(worker_id);
            state.workers.remove(worker_id)
        };
        if let Some(record) = record {
            self.stop_locked(worker_id.clone(), record, guard).await;
        }
    }

    /// Stop every worker (session shutdown).
    pub async fn stop_all(&self) {
        let ids: Vec<WorkerId> = self.state.lock().workers.keys().cloned().collect();
        for id in ids {
            self.stop(&id).await;
        }
    }

    fn on_invoked(self: &Arc<Self>, invocation: Invocation) {
        let worker_id = invocation.worker_id.clone();
        let instance = {
            let mut state = self.state.lock();
            state
                .requests
                .insert(worker_id.clone(), invocation.request_id.clone());
            if state.workers.contains_key(&worker_id) {
                return;
            }
            let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
            state.workers.insert(
                worker_id.clone(),
                WorkerRecord {
                    function_id: invocation.function_id.clone(),
                    state: WorkerState::Starting,
                    instance,
                    handler: None,
                    artifact_dir: None,
                    stale: false,
                },
            );
            instance
        };

        let manager = Arc::clone(self);
        let lock = self.lock_for(&worker_id);
        tokio::spawn(async move {
            // 先行する stop があればそれが終わるまで待つ
            let _guard = lock.lock_owned().await;
            if let Err(e) = manager.start(&invocation, instance).await {
                let removed = {
                    let mut state = manager.state.lock();
                    let current = state.workers.get(&worker_id).map(|r| r.instance);
                    if current == Some(instance) {
                        state.workers.remove(&worker_id);
                        state.requests.remove(&worker_id);
                        true
                    } else {
                        false
                    }
                };
                tracing::warn!(
                    worker_id = %worker_id,
                    function_id = %invocation.function_id,
                    error = %e,
                    "worker failed to start"
                );
                if removed {
                    manager.bus.publish(Event::WorkerFailed {
                        worker_id,
                        function_id: invocation.function_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        });
    }

    /// Caller holds the worker lock.
    async fn start(&self, invocation: &Invocation, instance: u64) -> Result<(), TetherError> {
        let worker_id = &invocation.worker_id;
        let bound = self.registry.bind(&invocation.function_id)?;

        loop {
            let artifact = self.builder.artifact(&invocation.function_id).await?;
            if !self.is_current(worker_id, instance) {
                return Ok(());
            }

            let artifact_dir = artifact.output_dir.clone();
            let mut environment = bound.function.build_props.environment.clone();
            environment.extend(invocation.env.clone());
            bound
                .handler
                .start_worker(StartWorkerInput {
                    worker_id: worker_id.clone(),
                    function: bound.function.clone(),
                    artifact,
                    environment,
                    runtime_api: format!("{}/{}", self.runtime_api, worker_id),
                    signals: WorkerSignals::new(
                        worker_id.clone(),
                        invocation.function_id.clone(),
                        instance,
                        self.signals_tx.clone(),
                    ),
                })
                .await?;

            enum Next {
                Started,
                Restart,
                Abandon,
            }
            // 起動中に届いた build.success が、今起動した成果物そのものの通知なら入れ替え不要
            let outdated = self
                .builder
                .cached(&invocation.function_id)
                .is_some_and(|current| current.output_dir != artifact_dir);
            let next = {
                let mut state = self.state.lock();
                match state.workers.get_mut(worker_id) {
                    Some(record) if record.instance == instance && record.stale && outdated => {
                        record.stale = false;
                        Next::Restart
                    }
                    Some(record) if record.instance == instance => {
                        record.stale = false;
                        record.state = WorkerState::Running;
                        record.handler = Some(Arc::clone(&bound.handler));
                        record.artifact_dir = Some(artifact_dir);
                        Next::Started
                    }
                    _ => Next::Abandon,
                }
            };

            match next {
                Next::Started => {
                    tracing::info!(worker_id = %worker_id, function_id = %invocation.function_id, "worker started");
                    self.bus.publish(Event::WorkerStarted {
                        worker_id: worker_id.clone(),
                        function_id: invocation.function_id.clone(),
                    });
                    return Ok(());
                }
                Next::Restart => {
                    // 起動中にリビルドされた: 古い成果物のプロセスを黙って入れ替える
                    tracing::debug!(worker_id = %worker_id, "function rebuilt while starting; restarting");
                    self.stop_handler(&bound.handler, worker_id).await;
                }
                Next::Abandon => {
                    self.stop_handler(&bound.handler, worker_id).await;
                    return Ok(());
                }
            }
        }
    }

    async fn on_built(&self, function_id: &FunctionId) {
        let current = self.builder.cached(function_id).map(|a| a.output_dir);
        let stale: Vec<(WorkerId, WorkerRecord)> = {
            let mut state = self.state.lock();
            let mut stale = Vec::new();
            let ids: Vec<WorkerId> = state
                .workers
                .iter()
                .filter(|(_, r)| &r.function_id == function_id)
                .map(|(id, _)| id.clone())
                .collect();
            for id in ids {
                let Some(record) = state.workers.get_mut(&id) else {
                    continue;
                };
                let keep = match record.state {
                    WorkerState::Starting => {
                        record.stale = true;
                        true
                    }
                    // 今の成果物で動いている
                    WorkerState::Running => current.is_some() && record.artifact_dir == current,
                };
                if keep {
                    continue;
                }
                state.requests.remove(&id);
                if let Some(record) = state.workers.remove(&id) {
                    stale.push((id, record));
                }
            }
            stale
        };

        for (worker_id, record) in stale {
            // guard をここで取ってから spawn する: 後続の start は stop の完了を待つ
            let guard = self.lock_for(&worker_id).lock_owned().await;
            let handler = record.handler.clone();
            let bus = Arc::clone(&self.bus);
            let grace = self.grace;
            tokio::spawn(async move {
                let _guard = guard;
                if let Some(handler) = handler {
                    stop_with_grace(&handler, &worker_id, grace).await;
                }
                tracing::info!(worker_id = %worker_id, function_id = %record.function_id, "worker stopped (rebuilt)");
                bus.publish(Event::WorkerStopped {
                    worker_id,
                    function_id: record.function_id,
                });
            });
        }
    }

    fn on_signal(&self, signal: WorkerSignal) {
        match signal {
            WorkerSignal::Stdout {
                worker_id,
                function_id,
                instance,
                line,
            } => {
                // 止めた古いプロセスの残りの出力には requestID を付けない
                let request_id = {
                    let state = self.state.lock();
                    match state.workers.get(&worker_id) {
                        Some(record) if record.instance == instance => state.requests.get(&worker_id).cloned(),
                        _ => None,
                    }
                };
                self.bus.publish(Event::WorkerStdout {
                    worker_id,
                    function_id,
                    request_id,
                    message: line,
                });
            }
            WorkerSignal::Exited {
                worker_id,
                function_id,
                instance,
                code,
            } => {
                let removed = {
                    let mut state = self.state.lock();
                    let current = state.workers.get(&worker_id).map(|r| r.instance);
                    if current == Some(instance) {
                        state.workers.remove(&worker_id);
                        state.requests.remove(&worker_id);
                        true
                    } else {
                        false
                    }
                };
                // stop 済みのプロセスの終了報告は無視する
                if removed {
                    tracing::info!(worker_id = %worker_id, function_id = %function_id, code = ?code, "worker exited");
                    self.bus.publish(Event::WorkerExited {
                        worker_id,
                        function_id,
                        code,
                    });
                }
            }
        }
    }

    async fn stop_locked(&self, worker_id: WorkerId, record: WorkerRecord, _guard: OwnedMutexGuard<()>) {
        if let Some(handler) = &record.handler {
            stop_with_grace(handler, &worker_id, self.grace).await;
        }
        tracing::info!(worker_id = %worker_id, function_id = %record.function_id, "worker stopped");
        self.bus.publish(Event::WorkerStopped {
            worker_id,
            function_id: record.function_id,
        });
    }

    async fn stop_handler(&self, handler: &Arc<dyn RuntimeHandler>, worker_id: &WorkerId) {
        stop_with_grace(handler, worker_id, self.grace).await;
    }

    fn is_current(&self, worker_id: &WorkerId, instance: u64) -> bool {
        self.state
            .lock()
            .workers
            .get(worker_id)
            .is_some_and(|r| r.instance == instance)
    }

    fn lock_for(&self, worker_id: &WorkerId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.locks
                .lock()
                .entry(worker_id.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

/// `stop_worker`, bounded. A worker that does not go away in time is logged and
/// treated as gone.
async fn stop_with_grace(handler: &Arc<dyn RuntimeHandler>, worker_id: &WorkerId, grace: Duration) {
    // handler 側の猶予に少し上乗せして、二重のタイムアウトが先に切れないようにする
    let bound = grace + Duration::from_millis(500);
    match tokio::time::timeout(bound, handler.stop_worker(worker_id)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(worker_id = %worker_id, error = %e, "stop_worker failed; dropping worker record");
        }
        Err(_) => {
            tracing::warn!(worker_id = %worker_id, "worker did not stop in time; dropping worker record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::registry::CATALOG;
    use crate::app::testing::RecordingHandler;
    use crate::bus::EventReceiver;
    use crate::context::Context;
    use crate::domain::{BuildMode, FunctionCatalog, FunctionDescriptor};
    use crate::ports::{BuildResult, RuntimeFamily};

    struct Fixture {
        dir: tempfile::TempDir,
        bus: Arc<Bus>,
        node: Arc<RecordingHandler>,
        builder: Arc<FunctionBuilder>,
        manager: Arc<WorkerManager>,
        shutdown: CancellationToken,
        events: EventReceiver,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new();
        let mut f1 = FunctionDescriptor::new("f1", "nodejs18.x", "src/a.handler", dir.path());
        f1.build_props
            .environment
            .insert("TABLE".into(), "users".into());
        let f2 = FunctionDescriptor::new("f2", "nodejs18.x", "src/b.handler", dir.path());
        ctx.provide(&CATALOG, FunctionCatalog::new([f1, f2]));

        let mut registry = HandlerRegistry::new(ctx);
        let node = RecordingHandler::new(RuntimeFamily::Node);
        registry.register(node.clone());
        let registry = Arc::new(registry);

        let bus = Bus::new();
        let builder = FunctionBuilder::new(
            registry.clone(),
            bus.clone(),
            dir.path().join("artifacts"),
            BuildMode::Start,
        );
        let manager = WorkerManager::new(
            registry,
            builder.clone(),
            bus.clone(),
            "127.0.0.1:12557",
            Duration::from_millis(200),
        );
        let shutdown = CancellationToken::new();
        manager.run(shutdown.clone());
        let events = bus.channel(&[
            EventKind::WorkerStarted,
            EventKind::WorkerStopped,
            EventKind::WorkerExited,
            EventKind::WorkerFailed,
            EventKind::WorkerStdout,
        ]);
        Fixture {
            dir,
            bus,
            node,
            builder,
            manager,
            shutdown,
            events,
        }
    }

    fn invoke(bus: &Bus, function: &str, worker: &str, request: &str) {
        bus.publish(Event::FunctionInvoked(Invocation::new(
            function,
            worker,
            request,
            serde_json::json!({}),
        )));
    }

    async fn next(events: &mut EventReceiver) -> Event {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("bus closed")
    }

    async fn quiet(events: &mut EventReceiver) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(events.try_recv(), None);
    }

    fn started(worker: &str, function: &str) -> Event {
        Event::WorkerStarted {
            worker_id: WorkerId::new(worker),
            function_id: FunctionId::new(function),
        }
    }

    #[tokio::test]
    async fn first_invocation_builds_and_starts_a_worker() {
        let mut fx = fixture();
        invoke(&fx.bus, "f1", "w1", "r1");

        assert_eq!(next(&mut fx.events).await, started("w1", "f1"));
        let starts = fx.node.starts();
        assert_eq!(starts.len(), 1);
        let env = &starts[0].env;
        assert_eq!(env["IS_LOCAL"], "true");
        assert_eq!(env["AWS_LAMBDA_RUNTIME_API"], "127.0.0.1:12557/w1");
        assert_eq!(env["TABLE"], "users");
        assert_eq!(env["AWS_LAMBDA_FUNCTION_MEMORY_SIZE"], "1024");
        assert_eq!(
            fx.manager.get(&WorkerId::new("w1")).unwrap().state,
            WorkerState::Running
        );
        fx.shutdown.cancel();
    }

    #[tokio::test]
    async fn first_build_notification_does_not_stop_the_new_worker() {
        let mut fx = fixture();
        invoke(&fx.bus, "f1", "w1", "r1");

        assert_eq!(next(&mut fx.events).await, started("w1", "f1"));
        // function.build.success of the first build reaches the manager after the start
        quiet(&mut fx.events).await;
        assert_eq!(fx.node.log(), vec!["build:f1", "start:w1"]);
        assert!(fx.node.is_running(&WorkerId::new("w1")));
        assert_eq!(fx.manager.workers().len(), 1);
        fx.shutdown.cancel();
    }

    #[tokio::test]
    async fn slow_first_build_still_starts_exactly_once() {
        let mut fx = fixture();
        fx.node.set_build_delay(Duration::from_millis(80));
        invoke(&fx.bus, "f1", "w1", "r1");

        assert_eq!(next(&mut fx.events).await, started("w1", "f1"));
        quiet(&mut fx.events).await;
        assert_eq!(fx.node.starts().len(), 1);
        assert_eq!(fx.node.builds(), 1);
        fx.shutdown.cancel();
    }

    #[tokio::test]
    async fn edit_outside_the_function_tree_keeps_its_worker() {
        let mut fx = fixture();
        let other = fx.dir.path().join("src/b");
        fx.node.rebuild_only(&FunctionId::new("f2"), &other);
        let watcher = fx.builder.watch(fx.shutdown.clone());

        invoke(&fx.bus, "f1", "w1", "r1");
        assert_eq!(next(&mut fx.events).await, started("w1", "f1"));

        let mut built = fx.bus.channel(&[EventKind::FunctionBuilt]);
        fx.bus.publish(Event::FileChanged {
            file: other.join("index.ts"),
        });
        let rebuilt = tokio::time::timeout(Duration::from_secs(2), built.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            rebuilt,
            Event::FunctionBuilt {
                function_id: FunctionId::new("f2"),
            }
        );

        quiet(&mut fx.events).await;
        assert!(fx.node.is_running(&WorkerId::new("w1")));
        assert!(!fx.node.log().contains(&"stop:w1".to_string()));
        fx.shutdown.cancel();
        watcher.await.unwrap();
    }

    #[tokio::test]
    async fn edit_inside_the_function_tree_stops_its_worker() {
        let mut fx = fixture();
        let src = fx.dir.path().join("src/a");
        fx.node.rebuild_only(&FunctionId::new("f1"), &src);
        let watcher = fx.builder.watch(fx.shutdown.clone());

        invoke(&fx.bus, "f1", "w1", "r1");
        assert_eq!(next(&mut fx.events).await, started("w1", "f1"));

        fx.bus.publish(Event::FileChanged {
            file: src.join("index.ts"),
        });
        assert_eq!(
            next(&mut fx.events).await,
            Event::WorkerStopped {
                worker_id: WorkerId::new("w1"),
                function_id: FunctionId::new("f1"),
            }
        );
        quiet(&mut fx.events).await;
        fx.shutdown.cancel();
        watcher.await.unwrap();
    }

    #[tokio::test]
    async fn same_worker_twice_starts_one_process() {
        let mut fx = fixture();
        fx.node.set_build_delay(Duration::from_millis(50));
        invoke(&fx.bus, "f1", "w1", "r1");
        invoke(&fx.bus, "f1", "w1", "r2");

        assert_eq!(next(&mut fx.events).await, started("w1", "f1"));
        quiet(&mut fx.events).await;
        assert_eq!(fx.node.starts().len(), 1);
        assert_eq!(fx.manager.last_request(&WorkerId::new("w1")), Some(RequestId::new("r2")));
        fx.shutdown.cancel();
    }

    #[tokio::test]
    async fn rebuild_stops_workers_of_that_function_only() {
        let mut fx = fixture();
        invoke(&fx.bus, "f1", "w1", "r1");
        invoke(&fx.bus, "f2", "w2", "r2");
        let mut seen = vec![next(&mut fx.events).await, next(&mut fx.events).await];
        seen.sort_by_key(|e| format!("{e:?}"));
        assert_eq!(seen, vec![started("w1", "f1"), started("w2", "f2")]);

        fx.builder.build(&FunctionId::new("f1")).await.unwrap();
        assert_eq!(
            next(&mut fx.events).await,
            Event::WorkerStopped {
                worker_id: WorkerId::new("w1"),
                function_id: FunctionId::new("f1"),
            }
        );
        // the killed process reports its exit, which must not surface as worker.exited
        quiet(&mut fx.events).await;
        assert!(fx.manager.get(&WorkerId::new("w1")).is_none());
        assert!(fx.manager.get(&WorkerId::new("w2")).is_some());
        fx.shutdown.cancel();
    }

    #[tokio::test]
    async fn stop_precedes_the_next_start_after_rebuild() {
        let mut fx = fixture();
        invoke(&fx.bus, "f1", "w1", "r1");
        next(&mut fx.events).await;

        fx.builder.build(&FunctionId::new("f1")).await.unwrap();
        invoke(&fx.bus, "f1", "w1", "r2");
        assert!(matches!(next(&mut fx.events).await, Event::WorkerStopped { .. }));
        assert_eq!(next(&mut fx.events).await, started("w1", "f1"));

        let log: Vec<String> = fx
            .node
            .log()
            .into_iter()
            .filter(|l| !l.starts_with("build:"))
            .collect();
        assert_eq!(log, vec!["start:w1", "stop:w1", "start:w1"]);

        // the restarted worker runs the new artifact
        let starts = fx.node.starts();
        assert_ne!(starts[0].artifact_dir, starts[1].artifact_dir);
        fx.shutdown.cancel();
    }

    #[tokio::test]
    async fn stdout_is_attributed_to_the_latest_request() {
        let mut fx = fixture();
        invoke(&fx.bus, "f1", "w1", "r1");
        next(&mut fx.events).await;
        invoke(&fx.bus, "f1", "w1", "r2");
        tokio::time::sleep(Duration::from_millis(20)).await;

        fx.node.emit_stdout(&WorkerId::new("w1"), "hello");
        assert_eq!(
            next(&mut fx.events).await,
            Event::WorkerStdout {
                worker_id: WorkerId::new("w1"),
                function_id: FunctionId::new("f1"),
                request_id: Some(RequestId::new("r2")),
                message: "hello".into(),
            }
        );
        fx.shutdown.cancel();
    }

    #[tokio::test]
    async fn late_stdout_of_a_stopped_process_is_not_attributed() {
        let mut fx = fixture();
        let w1 = WorkerId::new("w1");
        invoke(&fx.bus, "f1", "w1", "r1");
        next(&mut fx.events).await;

        fx.builder.build(&FunctionId::new("f1")).await.unwrap();
        assert!(matches!(next(&mut fx.events).await, Event::WorkerStopped { .. }));
        invoke(&fx.bus, "f1", "w1", "r2");
        assert_eq!(next(&mut fx.events).await, started("w1", "f1"));

        fx.node.emit_retired_stdout(&w1, "bye from the old process");
        assert_eq!(
            next(&mut fx.events).await,
            Event::WorkerStdout {
                worker_id: w1.clone(),
                function_id: FunctionId::new("f1"),
                request_id: None,
                message: "bye from the old process".into(),
            }
        );

        fx.node.emit_stdout(&w1, "hello");
        let Event::WorkerStdout { request_id, .. } = next(&mut fx.events).await else {
            panic!("expected worker.stdout");
        };
        assert_eq!(request_id, Some(RequestId::new("r2")));
        fx.shutdown.cancel();
    }

    #[tokio::test]
    async fn crash_removes_the_worker_and_next_invocation_starts_a_new_one() {
        let mut fx = fixture();
        invoke(&fx.bus, "f1", "w1", "r1");
        next(&mut fx.events).await;

        fx.node.crash(&WorkerId::new("w1"), 1);
        assert_eq!(
            next(&mut fx.events).await,
            Event::WorkerExited {
                worker_id: WorkerId::new("w1"),
                function_id: FunctionId::new("f1"),
                code: Some(1),
            }
        );
        assert!(fx.manager.workers().is_empty());
        assert_eq!(fx.manager.last_request(&WorkerId::new("w1")), None);

        invoke(&fx.bus, "f1", "w1", "r2");
        assert_eq!(next(&mut fx.events).await, started("w1", "f1"));
        // cached artifact is reused
        assert_eq!(fx.node.builds(), 1);
        fx.shutdown.cancel();
    }

    #[tokio::test]
    async fn spawn_failure_creates_no_record() {
        let mut fx = fixture();
        fx.node.fail_starts(true);
        invoke(&fx.bus, "f1", "w1", "r1");

        let Event::WorkerFailed { worker_id, error, .. } = next(&mut fx.events).await else {
            panic!("expected worker.failed");
        };
        assert_eq!(worker_id, WorkerId::new("w1"));
        assert!(error.contains("toolchain not installed"));
        assert!(fx.manager.workers().is_empty());
        fx.shutdown.cancel();
    }

    #[tokio::test]
    async fn build_failure_without_artifact_fails_the_worker() {
        let mut fx = fixture();
        fx.node.script_build(BuildResult::failed("SyntaxError"));
        invoke(&fx.bus, "f1", "w1", "r1");

        let Event::WorkerFailed { error, .. } = next(&mut fx.events).await else {
            panic!("expected worker.failed");
        };
        assert!(error.contains("no artifact"), "{error}");
        assert!(fx.node.starts().is_empty());
        fx.shutdown.cancel();
    }

    #[tokio::test]
    async fn stop_all_stops_running_workers() {
        let mut fx = fixture();
        invoke(&fx.bus, "f1", "w1", "r1");
        next(&mut fx.events).await;

        fx.manager.stop_all().await;
        assert!(matches!(next(&mut fx.events).await, Event::WorkerStopped { .. }));
        assert!(!fx.node.is_running(&WorkerId::new("w1")));
        fx.shutdown.cancel();
    }
}
