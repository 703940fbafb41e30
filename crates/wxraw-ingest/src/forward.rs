//! Hand-off of fetched payloads to a remote writer service.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use tracing::{debug, warn};
use wxraw_core::{format_timestamp, IngestError, Provenance, WeatherPayload};

use crate::config::ForwardConfig;
use crate::pipeline::{Delivery, PayloadSink};

pub const SOURCE_URL_HEADER: &str = "X-Source-Url";
pub const FETCHED_AT_HEADER: &str = "X-Fetched-At";

/// Mints bearer tokens that identify this service to the writer.
#[async_trait]
pub trait IdentityTokenSource: Send + Sync {
    async fn id_token(&self, audience: &str) -> Result<String, IngestError>;
}

/// Identity tokens from the instance metadata server.
#[derive(Debug, Clone)]
pub struct MetadataIdentityToken {
    client: Client,
    metadata_url: String,
}

impl MetadataIdentityToken {
    pub fn new(client: Client, metadata_url: impl Into<String>) -> Self {
        Self {
            client,
            metadata_url: metadata_url.into(),
        }
    }
}

#[async_trait]
impl IdentityTokenSource for MetadataIdentityToken {
    async fn id_token(&self, audience: &str) -> Result<String, IngestError> {
        let url = format!(
            "{}/instance/service-accounts/default/identity",
            self.metadata_url.trim_end_matches('/')
        );
        let response = self
            .client
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .query(&[("audience", audience), ("format", "full")])
            .send()
            .await
            .map_err(|err| {
                IngestError::ConfigurationMissing(format!("identity token unavailable: {err}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::ConfigurationMissing(format!(
                "identity token unavailable: metadata server returned {status}"
            )));
        }
        let token = response.text().await.map_err(|err| {
            IngestError::ConfigurationMissing(format!("identity token unavailable: {err}"))
        })?;
        Ok(token.trim().to_string())
    }
}

/// Posts the payload to the writer instead of persisting it locally.
pub struct ForwardingWriter {
    client: Client,
    writer_url: String,
    audience: String,
    tokens: Option<Arc<dyn IdentityTokenSource>>,
}

impl ForwardingWriter {
    pub fn new(
        client: Client,
        writer_url: impl Into<String>,
        audience: Option<String>,
        tokens: Option<Arc<dyn IdentityTokenSource>>,
    ) -> Self {
        let writer_url = writer_url.into();
        Self {
            audience: audience.unwrap_or_else(|| writer_url.clone()),
            client,
            writer_url,
            tokens,
        }
    }

    /// `None` when no writer is configured.
    pub fn from_config(config: &ForwardConfig) -> Result<Option<Self>> {
        let Some(writer_url) = config.writer_url.clone() else {
            return Ok(None);
        };
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building writer http client")?;
        let tokens: Option<Arc<dyn IdentityTokenSource>> = config.use_identity_token.then(|| {
            Arc::new(MetadataIdentityToken::new(client.clone(), config.metadata_url.clone()))
                as Arc<dyn IdentityTokenSource>
        });
        Ok(Some(Self::new(client, writer_url, config.audience.clone(), tokens)))
    }
}

#[async_trait]
impl PayloadSink for ForwardingWriter {
    async fn deliver(
        &self,
        payload: &WeatherPayload,
        provenance: Provenance,
        fetched_at: DateTime<Utc>,
    ) -> Result<Delivery, IngestError> {
        let mut request = self
            .client
            .post(&self.writer_url)
            .header(FETCHED_AT_HEADER, format_timestamp(&fetched_at))
            .json(payload);
        if let Some(url) = provenance.as_column() {
            request = request.header(SOURCE_URL_HEADER, url);
        }
        if let Some(tokens) = &self.tokens {
            let token = tokens.id_token(&self.audience).await?;
            request = request.bearer_auth(token);
        }

        debug!(writer = %self.writer_url, "forwarding payload");
        let response = request.send().await.map_err(|err| {
            IngestError::SinkUnavailable(format!("writer unreachable: {}", err.without_url()))
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(Delivery::Forwarded {
                writer_status: status.as_u16(),
            });
        }

        let body = response.text().await.unwrap_or_default();
        warn!(%status, "writer refused payload");
        if status.is_server_error() {
            Err(IngestError::SinkUnavailable(format!(
                "writer returned {status}: {body}"
            )))
        } else {
            Err(IngestError::SinkRejected(format!(
                "writer returned {status}: {body}"
            )))
        }
    }
}
