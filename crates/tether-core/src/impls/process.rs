//! Child process plumbing shared by the runtime handlers.
//!
//! - `run_build`: ツールチェーンのコマンドを 1 回実行し、失敗を diagnostics 文字列にする
//! - `ProcessTable`: worker プロセスの起動・監視・停止（workerID 単位）

use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;

use crate::domain::{TetherError, WorkerId};
use crate::ports::WorkerSignals;

/// How long to keep draining stdout/stderr after the process itself exited.
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

/// Run a build command to completion.
///
/// Returns stdout on success. A missing binary or a non-zero exit becomes a single
/// diagnostic line that includes stderr.
pub async fn run_build(mut command: Command) -> Result<String, String> {
    let program = command
        .as_std()
        .get_program()
        .to_string_lossy()
        .into_owned();
    tracing::debug!(program = %program, "running build command");

    let output = command
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| format!("failed to run {program}: {e}"))?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let detail = if stderr.trim().is_empty() { stdout } else { stderr };
    Err(format!(
        "{program} exited with {}: {}",
        output.status,
        detail.trim()
    ))
}

/// `Command` with `args`, rooted at `cwd`.
pub fn command<I, S>(program: impl AsRef<OsStr>, args: I, cwd: &std::path::Path) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command.args(args).current_dir(cwd);
    command
}

/// Worker `Command`: inherits the parent environment, then applies `env`.
pub fn worker_command<I, S>(
    program: impl AsRef<OsStr>,
    args: I,
    cwd: &std::path::Path,
    env: &HashMap<String, String>,
) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = command(program, args, cwd);
    command.envs(env);
    command
}

struct Supervised {
    token: u64,
    stop_tx: oneshot::Sender<()>,
    exited_rx: oneshot::Receiver<()>,
}

/// Live worker processes of one handler, keyed by worker id.
///
/// Each process gets a supervisor task that forwards its output lines, waits for
/// exit (or a stop request) and reports the exit through `WorkerSignals`.
#[derive(Clone)]
pub struct ProcessTable {
    children: Arc<Mutex<HashMap<WorkerId, Supervised>>>,
    next_token: Arc<AtomicU64>,
    grace: Duration,
}

impl ProcessTable {
    pub fn new(grace: Duration) -> Self {
        Self {
            children: Arc::new(Mutex::new(HashMap::new())),
            next_token: Arc::new(AtomicU64::new(0)),
            grace,
        }
    }

    /// Spawn `command` for `worker_id`.
    ///
    /// The command's stdout and stderr are captured; callers only set the program,
    /// args, cwd and env.
    pub fn spawn(
        &self,
        worker_id: &WorkerId,
        mut command: Command,
        signals: WorkerSignals,
    ) -> Result<(), TetherError> {
        let program = command
            .as_std()
            .get_program()
            .to_string_lossy()
            .into_owned();
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TetherError::WorkerSpawn {
                worker_id: worker_id.clone(),
                message: format!("{program}: {e}"),
            })?;

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, signals.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, signals.clone())));
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let (exited_tx, exited_rx) = oneshot::channel::<()>();

        // 同じ workerID の古いエントリは drop され、その supervisor が kill する
        self.children.lock().insert(
            worker_id.clone(),
            Supervised {
                token,
                stop_tx,
                exited_rx,
            },
        );

        let children = Arc::clone(&self.children);
        let worker_id = worker_id.clone();
        tracing::debug!(worker_id = %worker_id, pid = ?child.id(), "worker process spawned");

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                // stop requested (or the entry was dropped)
                _ = &mut stop_rx => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(worker_id = %worker_id, error = %e, "kill failed; process likely gone");
                    }
                    child.wait().await
                }
            };

            for reader in readers {
                let _ = tokio::time::timeout(OUTPUT_DRAIN, reader).await;
            }

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(worker_id = %worker_id, error = %e, "failed to wait on worker process");
                    None
                }
            };
            tracing::debug!(worker_id = %worker_id, code = ?code, "worker process exited");

            {
                let mut children = children.lock();
                if children.get(&worker_id).is_some_and(|s| s.token == token) {
                    children.remove(&worker_id);
                }
            }
            let _ = exited_tx.send(());
            signals.exited(code);
        });

        Ok(())
    }

    /// Terminate the worker and wait (bounded by the grace period) for it to exit.
    ///
    /// Unknown or already exited workers are a no-op. A process that outlives the
    /// grace period is logged and forgotten.
    pub async fn stop(&self, worker_id: &WorkerId) {
        let Some(supervised) = self.children.lock().remove(worker_id) else {
            return;
        };
        let _ = supervised.stop_tx.send(());
        if tokio::time::timeout(self.grace, supervised.exited_rx)
            .await
            .is_err()
        {
            tracing::warn!(
                worker_id = %worker_id,
                grace_ms = self.grace.as_millis() as u64,
                "worker did not exit within the grace period"
            );
        }
    }

    pub async fn stop_all(&self) {
        let ids: Vec<WorkerId> = self.children.lock().keys().cloned().collect();
        for id in ids {
            self.stop(&id).await;
        }
    }

    pub fn contains(&self, worker_id: &WorkerId) -> bool {
        self.children.lock().contains_key(worker_id)
    }

    pub fn len(&self) -> usize {
        self.children.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.lock().is_empty()
    }
}

async fn forward_lines<R>(reader: R, signals: WorkerSignals)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => signals.stdout(line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(worker_id = %signals.worker_id(), error = %e, "worker output closed");
                break;
            }
        }
    }
}
