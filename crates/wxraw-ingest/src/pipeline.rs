//! The per-invocation orchestrator: resolve, fetch, annotate, persist, report.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;
use wxraw_core::{
    default_date, parse_date, FetchRequest, IngestError, IngestOutcome, Provenance, WeatherPayload,
};
use wxraw_sink::IngestWriter;
use wxraw_source::{now_timestamp, WeatherSource};

use crate::config::IngestDefaults;

/// Caller-supplied parameters; blank values count as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RunParams {
    pub location: Option<String>,
    pub date: Option<String>,
}

impl RunParams {
    pub fn new(location: Option<String>, date: Option<String>) -> Self {
        Self { location, date }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Explicit parameter, then configured default, then yesterday relative to `now`.
pub fn resolve_request(
    params: &RunParams,
    defaults: &IngestDefaults,
    now: DateTime<Utc>,
) -> Result<FetchRequest, IngestError> {
    let location = non_blank(params.location.as_deref())
        .map(str::to_string)
        .unwrap_or_else(|| defaults.location.clone());
    let date = match non_blank(params.date.as_deref()) {
        Some(date) => parse_date(date)?,
        None => defaults.date.unwrap_or_else(|| default_date(now)),
    };
    FetchRequest::new(location, date)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Stored(IngestOutcome),
    Forwarded { writer_status: u16 },
}

/// Final step of a run: persist locally or hand off downstream.
#[async_trait]
pub trait PayloadSink: Send + Sync {
    async fn deliver(
        &self,
        payload: &WeatherPayload,
        provenance: Provenance,
        fetched_at: DateTime<Utc>,
    ) -> Result<Delivery, IngestError>;
}

#[async_trait]
impl PayloadSink for IngestWriter {
    async fn deliver(
        &self,
        payload: &WeatherPayload,
        provenance: Provenance,
        fetched_at: DateTime<Utc>,
    ) -> Result<Delivery, IngestError> {
        self.write_raw(payload, provenance, fetched_at)
            .await
            .map(Delivery::Stored)
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub invocation_id: Uuid,
    pub location: String,
    pub date: String,
    pub delivery: Delivery,
}

impl RunReport {
    /// Success body for the deployment shapes; `status` is the shape's own label.
    pub fn to_json(&self, status: &str) -> JsonValue {
        match &self.delivery {
            Delivery::Stored(outcome) => json!({
                "status": status,
                "location": self.location,
                "date": self.date,
                "table": outcome.table,
                "inserted": outcome.inserted,
            }),
            Delivery::Forwarded { writer_status } => json!({
                "status": status,
                "writer_status": writer_status,
                "location": self.location,
                "date": self.date,
            }),
        }
    }
}

pub struct IngestPipeline {
    source: Arc<dyn WeatherSource>,
    sink: Arc<dyn PayloadSink>,
    defaults: IngestDefaults,
}

impl IngestPipeline {
    pub fn new(
        source: Arc<dyn WeatherSource>,
        sink: Arc<dyn PayloadSink>,
        defaults: IngestDefaults,
    ) -> Self {
        Self {
            source,
            sink,
            defaults,
        }
    }

    pub fn resolve(&self, params: &RunParams) -> Result<FetchRequest, IngestError> {
        resolve_request(params, &self.defaults, Utc::now())
    }

    /// Read-through fetch; nothing is persisted.
    pub async fn fetch_only(
        &self,
        params: &RunParams,
    ) -> Result<(FetchRequest, WeatherPayload), IngestError> {
        let request = self.resolve(params)?;
        let payload = self.source.fetch(&request).await?;
        Ok((request, payload))
    }

    pub async fn run(&self, params: &RunParams) -> Result<RunReport, IngestError> {
        let invocation_id = Uuid::new_v4();
        let request = self.resolve(params)?;
        let span = info_span!(
            "ingest_run",
            %invocation_id,
            location = %request.location,
            date = %request.date_string()
        );

        async {
            info!("fetching weather history");
            let payload = match self.source.fetch(&request).await {
                Ok(payload) => payload,
                Err(err) => {
                    error!(error = %err, kind = err.kind(), "fetch failed; nothing written");
                    return Err(err);
                }
            };

            let provenance = Provenance::Url(self.source.source_url(&request));
            let fetched_at = now_timestamp();
            info!(source_url = %provenance, "persisting raw payload");

            let delivery = match self.sink.deliver(&payload, provenance, fetched_at).await {
                Ok(delivery) => delivery,
                Err(err) => {
                    error!(error = %err, kind = err.kind(), "persist failed");
                    return Err(err);
                }
            };
            info!(?delivery, "ingest run complete");

            Ok(RunReport {
                invocation_id,
                location: request.location.clone(),
                date: request.date_string(),
                delivery,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use wxraw_core::TableId;
    use wxraw_sink::{MemoryStore, TableTarget};
    use wxraw_source::build_source_url;

    const BASE: &str = "https://api.weatherapi.com/v1";

    struct FakeSource {
        calls: AtomicUsize,
        result: Mutex<Option<IngestError>>,
    }

    impl FakeSource {
        fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                result: Mutex::new(None),
            }
        }

        fn failing(err: IngestError) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                result: Mutex::new(Some(err)),
            }
        }
    }

    #[async_trait]
    impl WeatherSource for FakeSource {
        async fn fetch(&self, request: &FetchRequest) -> Result<WeatherPayload, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.result.lock().unwrap().take() {
                return Err(err);
            }
            Ok(json!({
                "location": {"name": "Stockholm", "q": request.location},
                "forecast": {"forecastday": [{"date": request.date_string()}]}
            }))
        }

        fn source_url(&self, request: &FetchRequest) -> String {
            build_source_url(BASE, &request.location, request.date)
        }

        fn has_credential(&self) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct CountingSink {
        calls: AtomicUsize,
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl PayloadSink for CountingSink {
        async fn deliver(
            &self,
            _payload: &WeatherPayload,
            provenance: Provenance,
            fetched_at: DateTime<Utc>,
        ) -> Result<Delivery, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push((provenance.to_string(), wxraw_core::format_timestamp(&fetched_at)));
            Ok(Delivery::Stored(IngestOutcome {
                table: TableId::new("proj", "raw_data", "weather_raw"),
                inserted: 1,
                deduplicated: false,
            }))
        }
    }

    fn explicit(location: &str, date: &str) -> RunParams {
        RunParams::new(Some(location.into()), Some(date.into()))
    }

    #[test]
    fn omitted_date_resolves_to_yesterday() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).single().unwrap();
        let request = resolve_request(&RunParams::default(), &IngestDefaults::default(), now).unwrap();
        assert_eq!(request.date_string(), "2024-03-09");
        assert_eq!(request.location, "59.3293,18.0686");
    }

    #[test]
    fn explicit_beats_configured_default() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).single().unwrap();
        let defaults = IngestDefaults {
            location: "London".into(),
            date: Some(parse_date("2024-02-01").unwrap()),
        };

        let from_defaults = resolve_request(&RunParams::default(), &defaults, now).unwrap();
        assert_eq!(from_defaults.location, "London");
        assert_eq!(from_defaults.date_string(), "2024-02-01");

        let from_explicit = resolve_request(&explicit("Paris", "2024-01-15"), &defaults, now).unwrap();
        assert_eq!(from_explicit.location, "Paris");
        assert_eq!(from_explicit.date_string(), "2024-01-15");

        let blank = resolve_request(&explicit(" ", ""), &defaults, now).unwrap();
        assert_eq!(blank.location, "London");
    }

    #[test]
    fn empty_location_everywhere_is_configuration_missing() {
        let defaults = IngestDefaults {
            location: String::new(),
            date: None,
        };
        let err = resolve_request(&RunParams::default(), &defaults, Utc::now()).unwrap_err();
        assert!(matches!(err, IngestError::ConfigurationMissing(_)));
    }

    #[tokio::test]
    async fn successful_run_passes_provenance_to_sink() {
        let source = Arc::new(FakeSource::ok());
        let sink = Arc::new(CountingSink::default());
        let pipeline = IngestPipeline::new(source.clone(), sink.clone(), IngestDefaults::default());

        let report = pipeline
            .run(&explicit("59.3293,18.0686", "2024-01-15"))
            .await
            .unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        let seen = sink.seen.lock().unwrap();
        assert_eq!(
            seen[0].0,
            "https://api.weatherapi.com/v1/history.json?q=59.3293,18.0686&dt=2024-01-15"
        );
        assert!(seen[0].1.ends_with("+00:00"));

        assert_eq!(
            report.to_json("success"),
            json!({
                "status": "success",
                "location": "59.3293,18.0686",
                "date": "2024-01-15",
                "table": "proj.raw_data.weather_raw",
                "inserted": 1
            })
        );
    }

    #[tokio::test]
    async fn upstream_failure_never_reaches_sink() {
        let source = Arc::new(FakeSource::failing(IngestError::UpstreamUnavailable(
            "http status 503: maintenance".into(),
        )));
        let sink = Arc::new(CountingSink::default());
        let pipeline = IngestPipeline::new(source.clone(), sink.clone(), IngestDefaults::default());

        let err = pipeline.run(&RunParams::default()).await.unwrap_err();
        assert_eq!(err.kind(), "upstream_unavailable");
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_date_fails_before_fetch() {
        let source = Arc::new(FakeSource::ok());
        let sink = Arc::new(CountingSink::default());
        let pipeline = IngestPipeline::new(source.clone(), sink.clone(), IngestDefaults::default());

        let err = pipeline.run(&explicit("x", "2024/01/15")).await.unwrap_err();
        assert!(matches!(err, IngestError::InvalidRequest(_)));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn writer_backed_pipeline_stores_one_row() {
        let store = Arc::new(MemoryStore::new("proj"));
        let writer = Arc::new(IngestWriter::new(store.clone(), TableTarget::default()));
        let pipeline = IngestPipeline::new(Arc::new(FakeSource::ok()), writer, IngestDefaults::default());

        let report = pipeline
            .run(&explicit("59.3293,18.0686", "2024-01-15"))
            .await
            .unwrap();
        let Delivery::Stored(outcome) = &report.delivery else {
            panic!("expected a stored delivery");
        };
        let rows = store.rows(&outcome.table).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].source_url.as_deref(),
            Some("https://api.weatherapi.com/v1/history.json?q=59.3293,18.0686&dt=2024-01-15")
        );
        assert_eq!(rows[0].row_key, format!("{}:{}", rows[0].source_url.as_deref().unwrap(), rows[0].fetched_at));
    }

    #[test]
    fn forwarded_report_shape() {
        let report = RunReport {
            invocation_id: Uuid::new_v4(),
            location: "London".into(),
            date: "2024-01-15".into(),
            delivery: Delivery::Forwarded { writer_status: 200 },
        };
        assert_eq!(
            report.to_json("sent"),
            json!({"status": "sent", "writer_status": 200, "location": "London", "date": "2024-01-15"})
        );
    }
}
