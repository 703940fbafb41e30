//! Ingest orchestration: configuration, the fetch-then-persist pipeline, and
//! the collaborators shared by every deployment shape.

use std::sync::Arc;

use anyhow::{Context, Result};
use wxraw_sink::{connect_store, IngestWriter, TableStore};
use wxraw_source::{WeatherApiClient, WeatherSource};

pub mod config;
pub mod forward;
pub mod pipeline;
pub mod scheduler;

pub use config::{AppConfig, ForwardConfig, IngestDefaults, ServerConfig};
pub use forward::{ForwardingWriter, IdentityTokenSource, MetadataIdentityToken};
pub use pipeline::{resolve_request, Delivery, IngestPipeline, PayloadSink, RunParams, RunReport};
pub use scheduler::build_scheduler;

pub const CRATE_NAME: &str = "wxraw-ingest";

/// Process-wide collaborators, built once at startup.
pub struct Services {
    pub config: AppConfig,
    pub source: Arc<dyn WeatherSource>,
    pub writer: Arc<IngestWriter>,
    /// Fetch and persist in-process.
    pub direct: Arc<IngestPipeline>,
    /// Fetch and forward to the writer service, when one is configured.
    pub forward: Option<Arc<IngestPipeline>>,
}

impl Services {
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        let store = connect_store(&config.sink)
            .await
            .with_context(|| format!("connecting {} sink", config.sink.backend.as_str()))?;
        Self::with_store(config, store)
    }

    pub fn with_store(config: AppConfig, store: Arc<dyn TableStore>) -> Result<Self> {
        let client = WeatherApiClient::new(config.source.clone())?;
        Self::with_parts(config, Arc::new(client), store)
    }

    pub fn with_parts(
        config: AppConfig,
        source: Arc<dyn WeatherSource>,
        store: Arc<dyn TableStore>,
    ) -> Result<Self> {
        let writer = Arc::new(IngestWriter::new(store, config.sink.target.clone()));
        let direct = Arc::new(IngestPipeline::new(
            Arc::clone(&source),
            writer.clone(),
            config.defaults.clone(),
        ));
        let forward = ForwardingWriter::from_config(&config.forward)?.map(|forwarder| {
            Arc::new(IngestPipeline::new(
                Arc::clone(&source),
                Arc::new(forwarder),
                config.defaults.clone(),
            ))
        });
        Ok(Self {
            config,
            source,
            writer,
            direct,
            forward,
        })
    }
}
