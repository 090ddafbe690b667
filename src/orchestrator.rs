//! Spawns the worker processes and waits for all of them.
//!
//! Each worker is this same binary re-executed with
//! `worker --worker-id i --total-workers n`. Workers share nothing at runtime;
//! the partition formula is the only coordination.

use crate::error::Result;
use futures::future::join_all;
use std::path::PathBuf;
use std::process::ExitStatus;
use tokio::process::{Child, Command};
use tracing::{error, info, instrument, warn};

/// Exit of one worker process.
#[derive(Debug)]
pub struct WorkerExit {
    pub worker_id: usize,
    pub status: std::io::Result<ExitStatus>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        matches!(&self.status, Ok(s) if s.success())
    }
}

/// How to launch one worker.
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    program: PathBuf,
    leading_args: Vec<String>,
    proxy: Option<String>,
}

impl WorkerLauncher {
    /// Launch workers through the currently running executable.
    pub fn current_exe(config_path: Option<&str>, proxy: Option<&str>) -> Result<Self> {
        let mut leading_args = Vec::new();
        if let Some(path) = config_path {
            leading_args.push("--config".to_string());
            leading_args.push(path.to_string());
        }
        Ok(Self {
            program: std::env::current_exe()?,
            leading_args,
            proxy: proxy.map(str::to_string),
        })
    }

    #[cfg(test)]
    pub fn new(program: &std::path::Path, leading_args: Vec<String>) -> Self {
        Self {
            program: program.to_path_buf(),
            leading_args,
            proxy: None,
        }
    }

    /// Full argument list for worker `worker_id` of `total_workers`.
    pub fn args(&self, worker_id: usize, total_workers: usize) -> Vec<String> {
        let mut args = self.leading_args.clone();
        args.extend([
            "worker".to_string(),
            "--worker-id".to_string(),
            worker_id.to_string(),
            "--total-workers".to_string(),
            total_workers.to_string(),
        ]);
        args
    }

    fn spawn(&self, worker_id: usize, total_workers: usize) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args(worker_id, total_workers));
        // Passed by environment so credentials stay out of the process list.
        if let Some(proxy) = &self.proxy {
            cmd.env("ANNO_PROXY", proxy);
        }
        cmd.spawn()
    }

    /// Start `total_workers` processes, ids `1..=total_workers`, and wait for
    /// every one of them. A failing worker never affects the others.
    #[instrument(level = "info", skip(self))]
    pub async fn run_all(&self, total_workers: usize) -> Vec<WorkerExit> {
        let mut children: Vec<(usize, Child)> = Vec::with_capacity(total_workers);
        let mut exits = Vec::new();

        for worker_id in 1..=total_workers {
            match self.spawn(worker_id, total_workers) {
                Ok(child) => {
                    info!(worker_id, pid = child.id(), "Spawned worker");
                    children.push((worker_id, child));
                }
                Err(e) => {
                    error!(worker_id, error = %e, "Failed to spawn worker");
                    exits.push(WorkerExit {
                        worker_id,
                        status: Err(e),
                    });
                }
            }
        }

        let waited = join_all(children.iter_mut().map(|(worker_id, child)| {
            let worker_id = *worker_id;
            async move {
                WorkerExit {
                    worker_id,
                    status: child.wait().await,
                }
            }
        }))
        .await;

        for exit in &waited {
            match &exit.status {
                Ok(status) if status.success() => info!(worker_id = exit.worker_id, "Worker exited"),
                Ok(status) => warn!(worker_id = exit.worker_id, %status, "Worker exited with failure"),
                Err(e) => error!(worker_id = exit.worker_id, error = %e, "Could not wait for worker"),
            }
        }
        exits.extend(waited);
        exits.sort_by_key(|e| e.worker_id);
        exits
    }
}
