//! Process configuration, read once at startup and handed to each component.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use wxraw_core::parse_date;
use wxraw_sink::{BigQueryConfig, SinkBackend, SinkConfig, TableTarget, DEFAULT_DATASET, DEFAULT_TABLE};
use wxraw_source::{BackoffPolicy, SourceConfig, DEFAULT_BASE_URL};

pub const DEFAULT_LOCATION: &str = "59.3293,18.0686";
pub const DEFAULT_METADATA_URL: &str = "http://metadata.google.internal/computeMetadata/v1";
pub const DEFAULT_SCHEDULE_CRON: &str = "0 0 3 * * *";
pub const DEFAULT_PORT: u16 = 8080;

/// Fallbacks used when an invocation does not name a location or date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestDefaults {
    pub location: String,
    /// Fixed date override; `None` means "yesterday" at resolution time.
    pub date: Option<NaiveDate>,
}

impl Default for IngestDefaults {
    fn default() -> Self {
        Self {
            location: DEFAULT_LOCATION.to_string(),
            date: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForwardConfig {
    pub writer_url: Option<String>,
    pub audience: Option<String>,
    pub use_identity_token: bool,
    pub metadata_url: String,
    pub timeout: Duration,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            writer_url: None,
            audience: None,
            use_identity_token: true,
            metadata_url: DEFAULT_METADATA_URL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub source: SourceConfig,
    pub sink: SinkConfig,
    pub defaults: IngestDefaults,
    pub forward: ForwardConfig,
    pub server: ServerConfig,
    /// Provenance for `/write` bodies that carry none.
    pub default_source_url: Option<String>,
    pub schedule_cron: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            sink: SinkConfig::default(),
            defaults: IngestDefaults::default(),
            forward: ForwardConfig::default(),
            server: ServerConfig { port: DEFAULT_PORT },
            default_source_url: None,
            schedule_cron: DEFAULT_SCHEDULE_CRON.to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let secs = |name: &str, default: u64| {
            get(name)
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(default))
        };

        let http_timeout = secs("WXRAW_HTTP_TIMEOUT_SECS", 30);
        let metadata_url = get("WXRAW_METADATA_URL").unwrap_or_else(|| DEFAULT_METADATA_URL.to_string());

        let source = SourceConfig {
            base_url: get("WEATHER_API_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: get("API_KEY"),
            timeout: http_timeout,
            user_agent: Some(format!("wxraw/{}", env!("CARGO_PKG_VERSION"))),
            backoff: BackoffPolicy {
                max_retries: get("WXRAW_HTTP_MAX_RETRIES")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
                ..Default::default()
            },
        };

        let backend = match get("WXRAW_SINK") {
            Some(value) => SinkBackend::parse(&value).context("parsing WXRAW_SINK")?,
            None => SinkBackend::BigQuery,
        };
        let sink = SinkConfig {
            backend,
            target: TableTarget {
                project: get("BQ_PROJECT"),
                dataset: get("BQ_DATASET").unwrap_or_else(|| DEFAULT_DATASET.to_string()),
                table: get("BQ_TABLE").unwrap_or_else(|| DEFAULT_TABLE.to_string()),
            },
            database_url: get("DATABASE_URL"),
            bigquery: BigQueryConfig {
                api_base_url: get("BQ_API_BASE_URL")
                    .unwrap_or_else(|| wxraw_sink::bigquery::DEFAULT_API_BASE_URL.to_string()),
                ambient_project: get("GOOGLE_CLOUD_PROJECT"),
                access_token: get("BQ_ACCESS_TOKEN"),
                metadata_url: get("BQ_ACCESS_TOKEN")
                    .is_none()
                    .then(|| metadata_url.clone()),
                timeout: http_timeout,
            },
            memory_project: get("GOOGLE_CLOUD_PROJECT").unwrap_or_else(|| "local".to_string()),
        };

        // An explicitly blank LOCATION stays blank so resolution can reject it.
        let defaults = IngestDefaults {
            location: lookup("LOCATION")
                .map(|v| v.trim().to_string())
                .unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
            date: get("DATE")
                .map(|v| parse_date(&v))
                .transpose()
                .context("parsing DATE")?,
        };

        let writer_url = get("WRITER_URL");
        let forward = ForwardConfig {
            audience: get("WRITER_AUDIENCE").or_else(|| writer_url.clone()),
            writer_url,
            use_identity_token: get("USE_IAM_AUTH").map(|v| parse_flag(&v)).unwrap_or(true),
            metadata_url,
            timeout: secs("WXRAW_WRITER_TIMEOUT_SECS", 60),
        };

        let port = match get("PORT") {
            Some(value) => value
                .parse()
                .with_context(|| format!("parsing PORT {value:?}"))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            source,
            sink,
            defaults,
            forward,
            server: ServerConfig { port },
            default_source_url: get("DEFAULT_SOURCE_URL"),
            schedule_cron: get("WXRAW_SCHEDULE_CRON").unwrap_or_else(|| DEFAULT_SCHEDULE_CRON.to_string()),
        })
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}
