//! tether - local Lambda runtime emulation
//!
//! - `tether dev`: セッションを起動し、Ctrl-C までバスのイベントを表示
//! - `tether invoke`: 1 回だけ invoke して結果を表示（function.error なら非 0 で終了）
//! - `tether build`: 成果物をビルドしてディレクトリか diagnostics を表示

use anyhow::{Context as _, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use tether_core::app::{CATALOG, Config, FunctionBuilder, HandlerRegistry, Session};
use tether_core::bus::Bus;
use tether_core::context::Context;
use tether_core::domain::{
    BuildMode, Event, EventKind, FunctionCatalog, FunctionId, InvocationOutcome,
};
use tether_core::impls::default_handlers;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Run and build Lambda functions locally", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the runtime server and serve worker invocations until Ctrl-C
    ///
    /// Files are not watched here; embedders feed changes through `Session::file_changed`.
    Dev {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Invoke one function through the local runtime API and print the result
    Invoke {
        #[command(flatten)]
        common: CommonArgs,

        /// Function ID to invoke
        #[arg(long)]
        function: String,

        /// JSON file with the invocation event (default: `{}`)
        #[arg(long)]
        event: Option<PathBuf>,
    },
    /// Build artifacts without starting workers
    Build {
        #[command(flatten)]
        common: CommonArgs,

        /// Only build this function
        #[arg(long)]
        function: Option<String>,

        #[arg(long, value_enum, default_value = "start")]
        mode: ModeArg,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// JSON array of function descriptors
    #[arg(long, default_value = "functions.json")]
    functions: PathBuf,

    /// Config file (default: ./tether.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    artifacts_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    /// Local development build
    Start,
    /// The artifact that ships
    Deploy,
}

impl From<ModeArg> for BuildMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Start => BuildMode::Start,
            ModeArg::Deploy => BuildMode::Deploy,
        }
    }
}

impl CommonArgs {
    /// Config file (or defaults) with the flag overrides applied.
    fn config(&self) -> Result<Config> {
        let cwd = std::env::current_dir().context("failed to read the current directory")?;
        let mut config = Config::discover(self.config.as_deref(), &cwd)?;
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(dir) = &self.artifacts_dir {
            config.artifacts_dir = dir.clone();
        }
        config.validate()?;
        Ok(config)
    }

    fn catalog(&self) -> Result<FunctionCatalog> {
        load_catalog(&self.functions)
    }
}

fn load_catalog(path: &Path) -> Result<FunctionCatalog> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let catalog = FunctionCatalog::from_json(&json)
        .with_context(|| format!("invalid function descriptors in {}", path.display()))?;
    Ok(catalog)
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    // stdout は結果表示に使うのでログは stderr へ
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    tracing::debug!(
        host = %config.host,
        port = config.port,
        artifacts_dir = %config.artifacts_dir.display(),
        "configuration loaded"
    );
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        Command::Dev { common } => {
            let config = common.config()?;
            init_tracing(&config);
            dev(&config, common.catalog()?).await
        }
        Command::Invoke {
            common,
            function,
            event,
        } => {
            let config = common.config()?;
            init_tracing(&config);
            let payload = match event {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    serde_json::from_str(&raw)
                        .with_context(|| format!("{} is not valid JSON", path.display()))?
                }
                None => serde_json::json!({}),
            };
            invoke(&config, common.catalog()?, function, payload).await
        }
        Command::Build {
            common,
            function,
            mode,
        } => {
            let config = common.config()?;
            init_tracing(&config);
            build(&config, common.catalog()?, function, mode.into()).await
        }
    }
}

async fn dev(config: &Config, catalog: FunctionCatalog) -> Result<ExitCode> {
    let session = Session::start(
        config,
        catalog,
        default_handlers(config.stop_grace()),
        BuildMode::Start,
    )
    .await?;
    println!("runtime api listening on http://{}", session.addr());

    let mut events = session.events(&EventKind::ALL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => println!("{}", describe(&event)),
                None => break,
            },
        }
    }
    drop(events);
    session.shutdown().await?;
    Ok(ExitCode::SUCCESS)
}

async fn invoke(
    config: &Config,
    catalog: FunctionCatalog,
    function: String,
    payload: serde_json::Value,
) -> Result<ExitCode> {
    let function_id = FunctionId::new(function);
    catalog.get(&function_id)?;

    let session = Session::start(
        config,
        catalog,
        default_handlers(config.stop_grace()),
        BuildMode::Start,
    )
    .await?;
    // 関数の出力は結果と一緒に見たい
    let mut stdout = session.events(&[EventKind::WorkerStdout]);
    let printer = tokio::spawn(async move {
        while let Some(event) = stdout.recv().await {
            eprintln!("{}", describe(&event));
        }
    });

    // worker は 1 関数につき 1 つ
    let worker_id = function_id.as_str().to_string();
    let outcome = session
        .invoke(function_id, worker_id, payload, HashMap::new())
        .await;
    session.shutdown().await?;
    printer.abort();

    match outcome? {
        InvocationOutcome::Success(body) => {
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(ExitCode::SUCCESS)
        }
        InvocationOutcome::Error(error) => {
            println!("{}", serde_json::to_string_pretty(&error)?);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn build(
    config: &Config,
    catalog: FunctionCatalog,
    only: Option<String>,
    mode: BuildMode,
) -> Result<ExitCode> {
    let targets: Vec<FunctionId> = match only {
        Some(id) => {
            let id = FunctionId::new(id);
            catalog.get(&id)?;
            vec![id]
        }
        None => catalog.iter().map(|f| f.function_id.clone()).collect(),
    };
    if targets.is_empty() {
        bail!("no functions to build");
    }

    let ctx = Context::new();
    ctx.provide(&CATALOG, catalog);
    let mut registry = HandlerRegistry::new(Arc::clone(&ctx));
    for handler in default_handlers(config.stop_grace()) {
        registry.register(handler);
    }
    let builder = FunctionBuilder::new(
        Arc::new(registry),
        Bus::new(),
        config.artifacts_dir.clone(),
        mode,
    );

    let mut failed = 0;
    for function_id in &targets {
        match builder.build(function_id).await {
            Ok(artifact) => println!(
                "{function_id}: {} ({})",
                artifact.output_dir.display(),
                artifact.entry_handler
            ),
            Err(e) => {
                failed += 1;
                println!("{function_id}: {e}");
                for line in e.diagnostics() {
                    println!("  {line}");
                }
            }
        }
    }
    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// One line per bus event.
fn describe(event: &Event) -> String {
    match event {
        Event::WorkerStdout {
            function_id,
            request_id,
            message,
            ..
        } => match request_id {
            Some(request_id) => format!("[{function_id} {request_id}] {message}"),
            None => format!("[{function_id}] {message}"),
        },
        Event::FileChanged { file } => format!("file changed: {}", file.display()),
        Event::FunctionInvoked(invocation) => format!(
            "invoked {} on {} ({})",
            invocation.function_id, invocation.worker_id, invocation.request_id
        ),
        Event::FunctionBuilt { function_id } => format!("built {function_id}"),
        Event::FunctionBuildFailed {
            function_id,
            errors,
        } => format!("build failed for {function_id}: {}", errors.join("; ")),
        Event::FunctionSuccess {
            function_id,
            request_id,
            ..
        } => format!("{function_id} succeeded ({request_id})"),
        Event::FunctionError {
            function_id,
            request_id,
            error,
            ..
        } => format!(
            "{function_id} failed ({request_id}): {}: {}",
            error.error_type, error.error_message
        ),
        Event::WorkerStarted {
            worker_id,
            function_id,
        } => format!("worker {worker_id} started for {function_id}"),
        Event::WorkerStopped {
            worker_id,
            function_id,
        } => format!("worker {worker_id} stopped for {function_id}"),
        Event::WorkerExited {
            worker_id, code, ..
        } => match code {
            Some(code) => format!("worker {worker_id} exited with code {code}"),
            None => format!("worker {worker_id} exited"),
        },
        Event::WorkerFailed {
            worker_id, error, ..
        } => format!("worker {worker_id} failed to start: {error}"),
    }
}
