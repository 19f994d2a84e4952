use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use blob_store::BlobStorageConfig;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::key_scheme::KeyScheme;

const LOCAL_ENV: &str = "local";
const ENV_PREFIX: &str = "CHUNKYARD_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub blob_storage: BlobStorageConfig,
    // Fixed for the lifetime of the process; ingestion and merge must agree.
    #[serde(default)]
    pub key_scheme: KeyScheme,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default = "default_max_chunk_size_bytes")]
    pub max_chunk_size_bytes: usize,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_env() -> String {
    LOCAL_ENV.to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_chunk_size_bytes() -> usize {
    64 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: default_env(),
            listen_addr: default_listen_addr(),
            blob_storage: Default::default(),
            key_scheme: Default::default(),
            merge: Default::default(),
            max_chunk_size_bytes: default_max_chunk_size_bytes(),
            sweeper: Default::default(),
            telemetry: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    // true: a merge with any missing index fails and touches nothing.
    // false: missing indices are skipped with a warning.
    #[serde(default = "default_strict")]
    pub strict: bool,
    #[serde(default = "default_max_total_chunks")]
    pub max_total_chunks: u64,
}

fn default_strict() -> bool {
    true
}

fn default_max_total_chunks() -> u64 {
    100_000
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            strict: default_strict(),
            max_total_chunks: default_max_total_chunks(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
    // Chunks untouched for longer than this are treated as orphaned.
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    60 * 60
}

fn default_max_age_secs() -> u64 {
    24 * 60 * 60
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_sweep_interval_secs(),
            max_age_secs: default_max_age_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enable_metrics: bool,
    #[serde(default)]
    pub enable_tracing: bool,
    // OpenTelemetry collector grpc endpoint for both traces and metrics.
    // Defaults to OTEL_EXPORTER_OTLP_ENDPOINT or localhost:4317 when unset.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
    #[serde(default)]
    pub instance_id: Option<String>,
}

fn default_metrics_interval_secs() -> u64 {
    10
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            enable_tracing: false,
            endpoint: None,
            metrics_interval_secs: default_metrics_interval_secs(),
            instance_id: None,
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::load(Some(&config_str))
    }

    /// Defaults, then the YAML document if any, then `CHUNKYARD_*` env vars.
    pub fn load(yaml: Option<&str>) -> Result<ServerConfig> {
        let mut figment = Figment::from(Serialized::defaults(ServerConfig::default()));
        if let Some(yaml) = yaml {
            figment = figment.merge(Yaml::string(yaml));
        }
        let config: ServerConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address: {}",
                self.listen_addr
            ));
        }
        if self.max_chunk_size_bytes == 0 {
            return Err(anyhow::anyhow!("max_chunk_size_bytes must be positive"));
        }
        if self.merge.max_total_chunks == 0 {
            return Err(anyhow::anyhow!("merge.max_total_chunks must be positive"));
        }
        if self.sweeper.enabled && self.sweeper.interval_secs == 0 {
            return Err(anyhow::anyhow!("sweeper.interval_secs must be positive"));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn instance_id(&self) -> String {
        self.telemetry
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, std::process::id()))
    }
}
