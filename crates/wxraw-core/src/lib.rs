//! Core domain model, provenance and error taxonomy for the raw weather ingest.

use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use thiserror::Error;

pub const CRATE_NAME: &str = "wxraw-core";

/// Calendar date format used on the wire and in provenance URLs.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Separator between the source URL and the fetch timestamp in a row key.
pub const ROW_KEY_SEPARATOR: char = ':';

/// Opaque upstream document. Never inspected, only serialized whole.
pub type WeatherPayload = serde_json::Value;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),
    #[error("weather API unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("weather API rejected request{}: {body}", .status.map(|s| format!(" with status {s}")).unwrap_or_default())]
    UpstreamRejected { status: Option<u16>, body: String },
    #[error("sink unavailable: {0}")]
    SinkUnavailable(String),
    #[error("sink rejected row: {0}")]
    SinkRejected(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl IngestError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigurationMissing(_) => "configuration_missing",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::UpstreamRejected { .. } => "upstream_rejected",
            Self::SinkUnavailable(_) => "sink_unavailable",
            Self::SinkRejected(_) => "sink_rejected",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }

    /// HTTP status an HTTP-facing shape should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ConfigurationMissing(_) | Self::SinkRejected(_) => 500,
            Self::UpstreamUnavailable(_) | Self::UpstreamRejected { .. } => 502,
            Self::SinkUnavailable(_) => 503,
            Self::InvalidRequest(_) => 400,
        }
    }
}

pub fn parse_date(input: &str) -> Result<NaiveDate, IngestError> {
    NaiveDate::parse_from_str(input.trim(), DATE_FORMAT)
        .map_err(|err| IngestError::InvalidRequest(format!("date {input:?} is not YYYY-MM-DD: {err}")))
}

/// Yesterday relative to `now`, in UTC.
pub fn default_date(now: DateTime<Utc>) -> NaiveDate {
    (now - Duration::days(1)).date_naive()
}

/// One (location, date) pair to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub location: String,
    pub date: NaiveDate,
}

impl FetchRequest {
    pub fn new(location: impl Into<String>, date: NaiveDate) -> Result<Self, IngestError> {
        let location = location.into().trim().to_string();
        if location.is_empty() {
            return Err(IngestError::ConfigurationMissing(
                "location resolved empty".to_string(),
            ));
        }
        Ok(Self { location, date })
    }

    pub fn date_string(&self) -> String {
        self.date.format(DATE_FORMAT).to_string()
    }
}

/// Where a stored payload came from.
///
/// `Unknown` is explicit so that a missing URL is never confused with an empty one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provenance {
    Url(String),
    Unknown,
}

impl Provenance {
    /// Treats blank input as unknown.
    pub fn from_optional(url: Option<&str>) -> Self {
        match url.map(str::trim) {
            Some(url) if !url.is_empty() => Self::Url(url.to_string()),
            _ => Self::Unknown,
        }
    }

    /// Value for the `source_url` column.
    pub fn as_column(&self) -> Option<&str> {
        match self {
            Self::Url(url) => Some(url),
            Self::Unknown => None,
        }
    }

    fn key_part(&self) -> &str {
        match self {
            Self::Url(url) => url,
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key_part())
    }
}

/// ISO 8601 with an explicit `+00:00` offset; sub-second digits only when present.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, false)
}

/// Deterministic deduplication key: `source_url:fetched_at`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey(String);

impl RowKey {
    pub fn new(provenance: &Provenance, fetched_at: &DateTime<Utc>) -> Self {
        Self(format!(
            "{}{}{}",
            provenance.key_part(),
            ROW_KEY_SEPARATOR,
            format_timestamp(fetched_at)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The unit persisted to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestRecord {
    pub raw_json: String,
    pub provenance: Provenance,
    pub fetched_at: DateTime<Utc>,
}

impl IngestRecord {
    /// Serializes compactly; serde_json leaves non-ASCII text unescaped.
    pub fn from_payload(
        payload: &WeatherPayload,
        provenance: Provenance,
        fetched_at: DateTime<Utc>,
    ) -> Result<Self, IngestError> {
        let raw_json = serde_json::to_string(payload)
            .map_err(|err| IngestError::InvalidRequest(format!("payload is not serializable: {err}")))?;
        Ok(Self {
            raw_json,
            provenance,
            fetched_at,
        })
    }

    pub fn row_key(&self) -> RowKey {
        RowKey::new(&self.provenance, &self.fetched_at)
    }

    pub fn fetched_at_string(&self) -> String {
        format_timestamp(&self.fetched_at)
    }
}

/// Fully qualified `{project}.{dataset}.{table}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableId {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableId {
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

impl Serialize for TableId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Result of a successful raw write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub table: TableId,
    pub inserted: usize,
    /// The store already held this row key; nothing new was written.
    #[serde(skip)]
    pub deduplicated: bool,
}
