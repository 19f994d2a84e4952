use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum_server::Handle;
use blob_store::BlobStorage;
use tokio::{self, signal, sync::watch};
use tracing::{error, info};

use crate::{
    artifact_store::ArtifactStore,
    chunk_store::ChunkStore,
    config::ServerConfig,
    merge_lock::MergeLocks,
    metrics::{api_io_stats, init_provider},
    reassembly::ReassemblyEngine,
    routes::{create_routes, RouteState},
    sweeper::Sweeper,
};

#[derive(Clone)]
pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub chunk_store: ChunkStore,
    pub artifact_store: ArtifactStore,
    pub merge_locks: MergeLocks,
    pub engine: Arc<ReassemblyEngine>,
    pub metrics: Arc<api_io_stats::Metrics>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let blob_storage = Arc::new(
            BlobStorage::new(config.blob_storage.clone())
                .context("error initializing BlobStorage")?,
        );

        let chunk_store = ChunkStore::new(blob_storage.clone());
        chunk_store
            .init()
            .await
            .context("error provisioning chunk namespace")?;
        let artifact_store = ArtifactStore::new(blob_storage);
        artifact_store
            .init()
            .await
            .context("error provisioning merged namespace")?;

        let metrics = Arc::new(api_io_stats::Metrics::new());
        let merge_locks = MergeLocks::new();
        let engine = Arc::new(ReassemblyEngine::new(
            chunk_store.clone(),
            artifact_store.clone(),
            merge_locks.clone(),
            &config.merge,
            metrics.clone(),
        ));
        info!(
            key_scheme = ?config.key_scheme,
            strict = config.merge.strict,
            storage = %config.blob_storage.path,
            "chunk storage ready"
        );

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            chunk_store,
            artifact_store,
            merge_locks,
            engine,
            metrics,
        })
    }

    pub fn route_state(&self) -> RouteState {
        RouteState {
            engine: self.engine.clone(),
            chunk_store: self.chunk_store.clone(),
            artifact_store: self.artifact_store.clone(),
            key_scheme: self.config.key_scheme,
            metrics: self.metrics.clone(),
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        init_provider(
            self.config.telemetry.enable_metrics,
            self.config.telemetry.endpoint.as_ref(),
            Duration::from_secs(self.config.telemetry.metrics_interval_secs),
            &self.config.instance_id(),
            env!("CARGO_PKG_VERSION"),
        )?;

        if self.config.sweeper.enabled {
            let mut sweeper = Sweeper::new(
                self.chunk_store.clone(),
                self.merge_locks.clone(),
                self.config.sweeper.clone(),
                self.metrics.clone(),
                self.shutdown_rx.clone(),
            );
            tokio::spawn(async move {
                if let Err(err) = sweeper.start().await {
                    error!("chunk sweeper exited: {:?}", err);
                }
            });
        }

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        let routes = create_routes(self.route_state(), self.config.max_chunk_size_bytes);
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    handle.graceful_shutdown(Some(Duration::from_secs(30)));
    if shutdown_tx.send(()).is_err() {
        info!("no background tasks to notify of shutdown");
    }
}
