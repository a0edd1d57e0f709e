use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::backend::{BackendSupervisor, PgAdminChannel, Provisioner};
use crate::config::RouterConfig;
use crate::router::Router;

/// Snapshot of router state, exposed to external collaborators (the CLI's
/// own reporting, a future dashboard, health checks).
#[derive(Debug, Clone)]
pub struct Stats {
    pub active_sessions: usize,
    pub databases: Vec<String>,
    pub backend_port: u16,
    pub backend_alive: bool,
}

/// Thin orchestrator: builds the Router, starts the Backend Supervisor,
/// starts the Router, and hands back a handle with `stop()`/`stats()`.
/// Contains no business logic of its own.
pub struct GatewayHandle {
    router: Arc<Router>,
    supervisor: Arc<BackendSupervisor>,
    provisioner: Arc<Provisioner>,
    shutdown_tx: watch::Sender<bool>,
    serve_task: Mutex<Option<JoinHandle<()>>>,
    stopped: Mutex<bool>,
}

pub async fn start(config: RouterConfig) -> anyhow::Result<GatewayHandle> {
    let supervisor = Arc::new(
        BackendSupervisor::new(&config.data_dir, config.listen_addr.port().wrapping_add(1000), config.pg_bin_dir.clone())
            .context("preparing backend supervisor")?,
    );
    supervisor.start().await.context("starting embedded backend")?;

    let admin = Arc::new(
        PgAdminChannel::connect(supervisor.socket_dir(), supervisor.tcp_port())
            .await
            .context("connecting admin channel")?,
    );
    let provisioner = Arc::new(Provisioner::bootstrap(admin).await);

    let router = Arc::new(
        Router::bind(config.listen_addr, config.max_connections, provisioner.clone(), supervisor.clone())
            .await
            .context("binding router listen socket")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serve_router = router.clone();
    let serve_task = tokio::spawn(async move {
        serve_router.serve(shutdown_rx).await;
    });

    Ok(GatewayHandle {
        router,
        supervisor,
        provisioner,
        shutdown_tx,
        serve_task: Mutex::new(Some(serve_task)),
        stopped: Mutex::new(false),
    })
}

impl GatewayHandle {
    /// Stops accepting new connections and shuts the backend down.
    /// Idempotent: a second call is a no-op, never an error.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let mut stopped = self.stopped.lock().await;
        if *stopped {
            return Ok(());
        }
        *stopped = true;

        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.serve_task.lock().await.take() {
            let _ = task.await;
        }

        self.supervisor.stop().await.context("stopping backend supervisor")?;
        info!("gateway stopped");
        Ok(())
    }

    pub async fn stats(&self) -> Stats {
        Stats {
            active_sessions: self.router.active_sessions(),
            databases: self.provisioner.provisioned_databases().await,
            backend_port: self.supervisor.tcp_port(),
            backend_alive: self.supervisor.is_alive(),
        }
    }
}
