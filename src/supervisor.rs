//! Cluster supervisor: spawns worker processes, forwards their output,
//! restarts them when they exit, and tears everything down on SIGINT/SIGTERM
//!
//! Workers are respawns of the current executable; the handshake environment
//! variables tell each child its role, id and port. The supervisor owns the
//! roster and hands the reverse proxy a shared reference to it.

use crate::config::ScalingConfig;
use crate::handshake::{ENV_PROCESS_ID, ENV_SCALING_MODE, ENV_WORKER_PORT, WORKER_MODE};
use crate::proxy::ReverseProxy;
use crate::worker::{Roster, WorkerHandle};
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Fixed back-off between a worker exit and its respawn
const RESTART_BACKOFF: Duration = Duration::from_secs(2);

/// Supervises a fixed-size pool of worker processes
///
/// Designed to be used behind an `Arc` for shared ownership across the
/// per-worker monitor tasks; the constructor returns `Arc<Self>` to enforce
/// this pattern.
pub struct ClusterSupervisor {
    config: ScalingConfig,
    argv: Vec<String>,
    roster: Arc<Roster>,
    shutdown_tx: watch::Sender<bool>,
}

impl ClusterSupervisor {
    pub fn new(config: ScalingConfig, argv: Vec<String>) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            argv,
            roster: Arc::new(Roster::new()),
            shutdown_tx,
        }))
    }

    /// Start the cluster; does not return until shutdown
    pub async fn start(config: ScalingConfig, argv: Vec<String>) -> anyhow::Result<()> {
        Self::new(config, argv)?.run().await
    }

    /// Shared reference to the live worker roster
    pub fn roster(&self) -> Arc<Roster> {
        Arc::clone(&self.roster)
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        info!(
            processes = self.config.processes,
            base_port = self.config.base_port,
            proxy = self.config.enable_proxy,
            "Starting cluster"
        );

        // Issue all spawns concurrently; readiness is declared only once
        // every spawn call has returned
        let mut spawns = JoinSet::new();
        for id in 0..self.config.processes {
            let supervisor = Arc::clone(&self);
            spawns.spawn(async move {
                let port = supervisor.config.worker_port(id);
                let child = supervisor.spawn_child(id, port)?;
                Ok::<_, anyhow::Error>((id, port, child))
            });
        }

        // Drain every spawn result before acting on a failure, so siblings
        // that did start are not leaked behind an early return
        let mut spawned = Vec::with_capacity(self.config.processes);
        let mut spawn_error: Option<anyhow::Error> = None;
        while let Some(result) = spawns.join_next().await {
            match result.map_err(anyhow::Error::from).and_then(|r| r) {
                Ok((id, port, child)) => spawned.push((id, port, child)),
                Err(e) => {
                    error!(error = %e, "Failed to spawn worker");
                    if spawn_error.is_none() {
                        spawn_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = spawn_error {
            for (id, port, mut child) in spawned {
                warn!(id, port, "Terminating sibling worker after spawn failure");
                terminate_child(&mut child);
            }
            return Err(e);
        }

        for (id, port, child) in spawned {
            let handle = Arc::new(WorkerHandle::new(id, port));
            handle.set_pid(child.id());
            self.roster.insert(Arc::clone(&handle));
            self.watch_worker(handle, child);
        }
        info!(workers = self.roster.len(), "Cluster ready");

        if self.config.enable_proxy {
            let addr: SocketAddr = ([0, 0, 0, 0], self.config.proxy_port).into();
            let proxy = ReverseProxy::new(
                addr,
                self.roster(),
                self.config.strategy,
                self.shutdown_tx.subscribe(),
            );
            tokio::spawn(async move {
                if let Err(e) = proxy.run().await {
                    error!(error = %e, "Reverse proxy error");
                }
            });
        } else {
            for worker in self.roster.snapshot() {
                info!(
                    id = worker.id(),
                    url = format!("http://127.0.0.1:{}", worker.port()),
                    "Worker listening"
                );
            }
        }

        self.wait_for_signal().await;
        self.shutdown().await;
        Ok(())
    }

    /// Spawn one worker child with the handshake environment and forward its
    /// output
    fn spawn_child(&self, id: usize, port: u16) -> anyhow::Result<Child> {
        let exe = std::env::current_exe()?;
        let mut cmd = Command::new(&exe);
        cmd.args(&self.argv)
            .env(ENV_PROCESS_ID, id.to_string())
            .env(ENV_WORKER_PORT, port.to_string())
            .env(ENV_SCALING_MODE, WORKER_MODE)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        let pid = child.id().unwrap_or(0);
        info!(id, port, pid, "Worker process spawned");

        // Forward child output byte-for-byte to the supervisor's streams
        if let Some(mut stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut stdout, &mut tokio::io::stdout()).await;
            });
        }
        if let Some(mut stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut stderr, &mut tokio::io::stderr()).await;
            });
        }

        Ok(child)
    }

    fn watch_worker(self: &Arc<Self>, handle: Arc<WorkerHandle>, child: Child) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor.monitor(handle, child).await;
        });
    }

    /// Observe one worker until shutdown, respawning it after each exit
    async fn monitor(self: Arc<Self>, mut handle: Arc<WorkerHandle>, mut child: Child) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = shutdown_rx.changed() => None,
            };

            let status = match exited {
                Some(status) => status,
                None => {
                    if *shutdown_rx.borrow() {
                        terminate_child(&mut child);
                        return;
                    }
                    continue;
                }
            };

            let code = status.ok().and_then(|s| s.code());
            warn!(
                id = handle.id(),
                port = handle.port(),
                code,
                "Worker exited"
            );
            handle.clear_process();
            self.roster.remove(handle.id());

            tokio::time::sleep(RESTART_BACKOFF).await;
            if *shutdown_rx.borrow() {
                return;
            }

            match self.spawn_child(handle.id(), handle.port()) {
                Ok(new_child) => {
                    child = new_child;
                    let new_handle = Arc::new(WorkerHandle::new(handle.id(), handle.port()));
                    new_handle.set_pid(child.id());
                    self.roster.insert(Arc::clone(&new_handle));
                    handle = new_handle;
                    info!(id = handle.id(), port = handle.port(), "Worker restarted");
                }
                Err(e) => {
                    error!(
                        id = handle.id(),
                        port = handle.port(),
                        error = %e,
                        "Failed to respawn worker"
                    );
                    std::process::exit(1);
                }
            }
        }
    }

    async fn wait_for_signal(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to listen for Ctrl+C");
            info!("Received Ctrl+C, shutting down...");
        }
    }

    /// Terminate all children without waiting for drain and exit with code 0
    pub async fn shutdown(&self) {
        info!("Shutting down cluster");
        let _ = self.shutdown_tx.send(true);

        #[cfg(unix)]
        for worker in self.roster.snapshot() {
            if let Some(pid) = worker.pid() {
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
        }

        // Let the per-worker monitors observe the shutdown broadcast; they
        // deliver the kill on platforms without pid signalling
        tokio::time::sleep(Duration::from_millis(200)).await;

        info!("Shutdown complete");
        std::process::exit(0);
    }
}

#[cfg(unix)]
fn terminate_child(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    } else {
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn terminate_child(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Strategy;

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = ScalingConfig {
            processes: 0,
            base_port: 3000,
            enable_proxy: false,
            proxy_port: 8080,
            strategy: Strategy::RoundRobin,
        };
        assert!(ClusterSupervisor::new(config, vec![]).is_err());
    }

    #[test]
    fn test_new_starts_with_empty_roster() {
        let config = ScalingConfig {
            processes: 2,
            base_port: 3000,
            enable_proxy: true,
            proxy_port: 8080,
            strategy: Strategy::RoundRobin,
        };
        let supervisor = ClusterSupervisor::new(config, vec!["serve".to_string()]).unwrap();
        assert!(supervisor.roster().is_empty());
    }
}
