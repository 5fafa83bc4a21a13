//! Wiring: one bus, one registry, one watcher, and the tasks that connect
//! them. Built once at startup and handed around as `Arc`s.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use loopwatch_core::{Config, ProjectDirectory};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::ChangeBus;
use crate::heartbeat::run_heartbeat;
use crate::registry::ConnectionRegistry;
use crate::router::run_router;
use crate::watcher::DirectoryWatcher;
use crate::ws_server::WsServer;

pub struct Daemon {
    config: Config,
    bus: ChangeBus,
    registry: Arc<ConnectionRegistry>,
    watcher: Arc<DirectoryWatcher>,
}

/// Handles for a started daemon. Dropping it does not stop anything; cancel
/// the token passed to [`Daemon::start`] and then [`RunningDaemon::wait`].
pub struct RunningDaemon {
    pub local_addr: SocketAddr,
    server: JoinHandle<std::io::Result<()>>,
    router: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        let bus = ChangeBus::new();
        let watcher = Arc::new(DirectoryWatcher::new(bus.clone(), config.debounce));
        Self {
            config,
            bus,
            registry: Arc::new(ConnectionRegistry::new()),
            watcher,
        }
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn watcher(&self) -> &Arc<DirectoryWatcher> {
        &self.watcher
    }

    /// Start router, heartbeat and WebSocket server, then watch every project
    /// the directory knows about. A project that fails to watch is logged and
    /// skipped.
    pub async fn start(
        &self,
        projects: &dyn ProjectDirectory,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunningDaemon> {
        let addr: SocketAddr = self
            .config
            .server
            .bind
            .parse()
            .with_context(|| format!("invalid bind address {:?}", self.config.server.bind))?;

        // Subscribe before watching so `ready` notifications are not missed.
        let router = tokio::spawn(run_router(
            self.bus.subscribe(),
            Arc::clone(&self.registry),
            cancel.clone(),
        ));
        let heartbeat = tokio::spawn(run_heartbeat(
            Arc::clone(&self.registry),
            self.config.heartbeat.interval(),
            self.config.heartbeat.timeout(),
            cancel.clone(),
        ));

        let server = WsServer::new(addr, Arc::clone(&self.registry), cancel)
            .with_max_connections(self.config.server.max_connections);
        let (listener, local_addr) = server
            .bind()
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let server = tokio::spawn(async move { server.serve(listener).await });

        let ids = projects.project_ids();
        let watched = ids
            .iter()
            .filter(|id| self.watcher.watch_project(projects, id))
            .count();
        tracing::info!(watched, configured = ids.len(), "project watches started");

        Ok(RunningDaemon {
            local_addr,
            server,
            router,
            heartbeat,
        })
    }

    /// Stop every watch. Pending debounce timers are cancelled, nothing more
    /// is published.
    pub fn shutdown_watches(&self) -> usize {
        let n = self.watcher.unwatch_all();
        tracing::info!(unwatched = n, "project watches stopped");
        n
    }
}

impl RunningDaemon {
    /// Wait for the spawned tasks to finish after cancellation.
    pub async fn wait(self) -> anyhow::Result<()> {
        self.server.await.context("ws server task panicked")??;
        self.router.await.context("router task panicked")?;
        self.heartbeat.await.context("heartbeat task panicked")?;
        Ok(())
    }
}

/// Run until Ctrl-C or SIGTERM, then shut down gracefully.
pub async fn run_daemon(config: Config, projects: &dyn ProjectDirectory) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let daemon = Daemon::new(config);
    let running = daemon.start(projects, cancel.clone()).await?;
    tracing::info!(addr = %running.local_addr, "loopwatch daemon ready");

    wait_for_shutdown_signal().await?;

    cancel.cancel();
    daemon.shutdown_watches();
    running.wait().await
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to register SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("failed to listen for ctrl-c")?;
                tracing::info!("received ctrl-c, shutting down");
            }
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
        tracing::info!("received ctrl-c, shutting down");
    }

    Ok(())
}
