//! Session - 全コンポーネントの配線と invocation relay
//!
//! 起動順:
//! 1. Context に関数カタログを provide
//! 2. Bus / HandlerRegistry / FunctionBuilder
//! 3. Runtime Server を bind（port 0 ならここで実ポートが決まる）
//! 4. WorkerManager（runtime API のアドレスは bind 後に確定）
//! 5. manager の run ループ、builder の watch、server の serve を起動

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::builder::FunctionBuilder;
use super::config::Config;
use super::registry::{CATALOG, HandlerRegistry};
use super::server::RuntimeServer;
use super::workers::WorkerManager;
use crate::bus::{Bus, EventReceiver};
use crate::context::Context;
use crate::domain::{
    BuildMode, Event, EventKind, FunctionCatalog, FunctionId, Invocation, InvocationOutcome,
    RequestId, TetherError, WorkerId,
};
use crate::ports::RuntimeHandler;

pub struct Session {
    ctx: Arc<Context>,
    bus: Arc<Bus>,
    registry: Arc<HandlerRegistry>,
    builder: Arc<FunctionBuilder>,
    workers: Arc<WorkerManager>,
    server: RuntimeServer,
    addr: SocketAddr,
    invocation_timeout: Duration,
    shutdown: CancellationToken,
    server_task: JoinHandle<Result<(), TetherError>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    pub async fn start(
        config: &Config,
        catalog: FunctionCatalog,
        handlers: Vec<Arc<dyn RuntimeHandler>>,
        mode: BuildMode,
    ) -> Result<Self, TetherError> {
        config.validate()?;

        let ctx = Context::new();
        ctx.provide(&CATALOG, catalog);
        let bus = Bus::new();

        let mut registry = HandlerRegistry::new(Arc::clone(&ctx));
        for handler in handlers {
            registry.register(handler);
        }
        let registry = Arc::new(registry);
        let builder = FunctionBuilder::new(
            Arc::clone(&registry),
            Arc::clone(&bus),
            config.artifacts_dir.clone(),
            mode,
        );

        let shutdown = CancellationToken::new();
        let listener = RuntimeServer::bind(config.addr()?).await?;
        let addr = listener.local_addr()?;
        let server = RuntimeServer::new(
            Arc::clone(&bus),
            config.server_options(),
            shutdown.clone(),
        );

        let workers = WorkerManager::new(
            Arc::clone(&registry),
            Arc::clone(&builder),
            Arc::clone(&bus),
            addr.to_string(),
            config.stop_grace(),
        );

        let tasks = vec![workers.run(shutdown.clone()), builder.watch(shutdown.clone())];
        let server_task = server.serve(listener);
        tracing::info!(%addr, functions = registry.catalog()?.len(), "session started");

        Ok(Self {
            ctx,
            bus,
            registry,
            builder,
            workers,
            server,
            addr,
            invocation_timeout: config.invocation_timeout(),
            shutdown,
            server_task,
            tasks,
        })
    }

    /// Address the runtime server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn builder(&self) -> &Arc<FunctionBuilder> {
        &self.builder
    }

    pub fn workers(&self) -> &Arc<WorkerManager> {
        &self.workers
    }

    pub fn server(&self) -> &RuntimeServer {
        &self.server
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Subscribe to bus events, e.g. to print them.
    pub fn events(&self, kinds: &[EventKind]) -> EventReceiver {
        self.bus.channel(kinds)
    }

    /// Replace the function catalog (a new synth cycle). Handler bindings are
    /// re-resolved on next use.
    pub fn set_catalog(&self, catalog: FunctionCatalog) {
        tracing::info!(functions = catalog.len(), "function catalog replaced");
        self.ctx.provide(&CATALOG, catalog);
    }

    /// Feed a file change into the session.
    pub fn file_changed(&self, file: impl Into<PathBuf>) {
        self.bus.publish(Event::FileChanged { file: file.into() });
    }

    /// Invoke `function_id` on `worker_id` and wait for the outcome.
    pub async fn invoke(
        &self,
        function_id: impl Into<FunctionId>,
        worker_id: impl Into<WorkerId>,
        payload: serde_json::Value,
        env: HashMap<String, String>,
    ) -> Result<InvocationOutcome, TetherError> {
        let invocation =
            Invocation::new(function_id, worker_id, RequestId::generate(), payload).with_env(env);
        self.dispatch(invocation).await
    }

    /// Publish `function.invoked` and relay the matching `function.success` /
    /// `function.error`, bounded by the configured invocation timeout. A timed out
    /// invocation is taken off its lane.
    pub async fn dispatch(&self, invocation: Invocation) -> Result<InvocationOutcome, TetherError> {
        // publish より先に購読しておく
        let mut outcomes = self
            .bus
            .channel(&[EventKind::FunctionSuccess, EventKind::FunctionError]);
        let request_id = invocation.request_id.clone();
        let worker_id = invocation.worker_id.clone();
        tracing::info!(
            function_id = %invocation.function_id,
            worker_id = %invocation.worker_id,
            request_id = %request_id,
            "invoking function"
        );
        self.bus.publish(Event::FunctionInvoked(invocation));

        let wait = async {
            while let Some(event) = outcomes.recv().await {
                match event {
                    Event::FunctionSuccess { request_id: id, body, .. } if id == request_id => {
                        return Ok(InvocationOutcome::Success(body));
                    }
                    Event::FunctionError { request_id: id, error, .. } if id == request_id => {
                        return Ok(InvocationOutcome::Error(error));
                    }
                    _ => {}
                }
            }
            Err(TetherError::Server("event bus closed".into()))
        };
        match tokio::time::timeout(self.invocation_timeout, wait).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.server.cancel(&worker_id, &request_id);
                tracing::warn!(
                    worker_id = %worker_id,
                    request_id = %request_id,
                    timeout_ms = self.invocation_timeout.as_millis() as u64,
                    "invocation timed out"
                );
                Err(TetherError::InvocationTimeout(self.invocation_timeout))
            }
        }
    }

    /// Stop every worker, the loops and the runtime server.
    pub async fn shutdown(mut self) -> Result<(), TetherError> {
        tracing::info!("session shutting down");
        // ループを先に止める: 停止後の再アナウンスで worker が起動し直さないように
        self.shutdown.cancel();
        self.workers.stop_all().await;
        self.server.detach();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "session task ended abnormally");
            }
        }
        match (&mut self.server_task).await {
            Ok(result) => result,
            Err(e) => Err(TetherError::Server(e.to_string())),
        }
    }
}
