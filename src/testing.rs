use anyhow::Result;
use blob_store::BlobStorageConfig;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{config::ServerConfig, routes::RouteState, service::Service};

pub struct TestService {
    pub service: Service,
    pub temp_dir: tempfile::TempDir,
}

impl TestService {
    pub async fn new() -> Result<Self> {
        Self::with_config(|_| {}).await
    }

    /// Builds a service over a fresh temp dir after `configure` has adjusted
    /// the defaults.
    pub async fn with_config(configure: impl FnOnce(&mut ServerConfig)) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let temp_dir = tempfile::tempdir()?;

        let mut cfg = ServerConfig {
            blob_storage: BlobStorageConfig {
                path: format!(
                    "file://{}",
                    temp_dir.path().join("blob_store").to_str().unwrap()
                ),
            },
            ..Default::default()
        };
        configure(&mut cfg);
        let srv = Service::new(cfg).await?;

        Ok(Self {
            service: srv,
            temp_dir,
        })
    }

    pub fn route_state(&self) -> RouteState {
        self.service.route_state()
    }
}
