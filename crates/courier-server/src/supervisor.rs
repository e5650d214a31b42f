//! Worker supervisor.
//!
//! Spawns one worker process per slot, restarts any worker that exits on the
//! same port after a short backoff, and stops every worker on Ctrl-C.

use crate::config::Config;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Listen port of worker `index`.
#[must_use]
pub fn worker_port(base: u16, index: usize) -> Option<u16> {
    base.checked_add(u16::try_from(index).ok()?)
}

/// One worker slot: its index and the port it keeps across restarts.
#[derive(Debug, Clone, Copy)]
struct WorkerSlot {
    index: usize,
    port: u16,
}

/// A running worker.
#[async_trait]
trait Worker: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for the worker to exit.
    async fn wait(&mut self) -> std::io::Result<ExitStatus>;

    async fn kill(&mut self) -> std::io::Result<()>;
}

#[async_trait]
impl Worker for Child {
    fn pid(&self) -> Option<u32> {
        self.id()
    }

    async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        Child::wait(self).await
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        Child::kill(self).await
    }
}

/// Starts the worker for a slot.
trait Launcher: Send + Sync + 'static {
    type Worker: Worker;

    fn launch(&self, slot: WorkerSlot) -> std::io::Result<Self::Worker>;
}

/// Launches workers as child processes of this executable.
#[derive(Debug)]
struct ProcessLauncher {
    exe: PathBuf,
    config_path: Option<PathBuf>,
}

impl Launcher for ProcessLauncher {
    type Worker = Child;

    fn launch(&self, slot: WorkerSlot) -> std::io::Result<Child> {
        let mut command = Command::new(&self.exe);
        if let Some(path) = &self.config_path {
            command.arg("--config").arg(path);
        }
        command
            .arg("worker")
            .arg("--index")
            .arg(slot.index.to_string())
            .arg("--port")
            .arg(slot.port.to_string())
            .kill_on_drop(true)
            .spawn()
    }
}

/// Run the supervisor until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the executable path cannot be determined or the
/// worker ports do not fit.
pub async fn run(config: &Config, config_path: Option<&Path>) -> Result<()> {
    let count = config.worker_count();
    let exe = std::env::current_exe().context("Failed to locate the courier executable")?;
    let backoff = Duration::from_millis(config.workers.restart_backoff_ms);

    if count > 1 && !config.is_shared() {
        warn!(
            workers = count,
            "Presence and bus are process-local; workers will not see each other's connections"
        );
    }

    let mut slots = Vec::with_capacity(count);
    for index in 0..count {
        let Some(port) = worker_port(config.port, index) else {
            bail!("Worker {index} port exceeds 65535 (base port {})", config.port);
        };
        slots.push(WorkerSlot { index, port });
    }
    let launcher = Arc::new(ProcessLauncher {
        exe,
        config_path: config_path.map(Path::to_path_buf),
    });

    info!(workers = count, base_port = config.port, "Supervisor starting workers");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    for slot in slots {
        tasks.spawn(supervise(
            launcher.clone(),
            slot,
            backoff,
            shutdown_rx.clone(),
        ));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down workers");
    let _ = shutdown_tx.send(true);

    while tasks.join_next().await.is_some() {}
    info!("All workers stopped");
    Ok(())
}

/// Keep one worker slot occupied until shutdown.
async fn supervise<L: Launcher>(
    launcher: Arc<L>,
    slot: WorkerSlot,
    backoff: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let mut worker = match launcher.launch(slot) {
            Ok(worker) => worker,
            Err(e) => {
                error!(worker = slot.index, error = %e, "Failed to spawn worker");
                if wait_or_shutdown(backoff, &mut shutdown).await {
                    return;
                }
                continue;
            }
        };
        info!(worker = slot.index, port = slot.port, pid = worker.pid(), "Worker started");

        tokio::select! {
            status = worker.wait() => {
                log_exit(&slot, status);
            }
            _ = shutdown.changed() => {
                if let Err(e) = worker.kill().await {
                    warn!(worker = slot.index, error = %e, "Failed to stop worker");
                }
                return;
            }
        }

        if wait_or_shutdown(backoff, &mut shutdown).await {
            return;
        }
        info!(worker = slot.index, port = slot.port, "Restarting worker");
    }
}

fn log_exit(slot: &WorkerSlot, status: std::io::Result<ExitStatus>) {
    match status {
        Ok(status) => warn!(worker = slot.index, port = slot.port, %status, "Worker exited"),
        Err(e) => error!(worker = slot.index, error = %e, "Failed to wait for worker"),
    }
}

/// Sleep for `delay`. Returns `true` if shutdown was requested meanwhile.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        () = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}
