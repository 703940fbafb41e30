//! Weather history source client + provenance helpers.

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use reqwest::StatusCode;
use tracing::{info_span, warn, Instrument};
use wxraw_core::{FetchRequest, IngestError, WeatherPayload, DATE_FORMAT};

pub const CRATE_NAME: &str = "wxraw-source";

pub const DEFAULT_BASE_URL: &str = "https://api.weatherapi.com/v1";
pub const HISTORY_PATH: &str = "history.json";

const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Retries are off unless `max_retries` is raised.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Clone)]
pub struct SourceConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .field("backoff", &self.backoff)
            .finish()
    }
}

pub fn history_endpoint(base_url: &str) -> String {
    format!("{}/{HISTORY_PATH}", base_url.trim_end_matches('/'))
}

/// The fetch URL without the credential parameter, safe to store and log.
pub fn build_source_url(base_url: &str, location: &str, date: NaiveDate) -> String {
    format!(
        "{}?q={}&dt={}",
        history_endpoint(base_url),
        location,
        date.format(DATE_FORMAT)
    )
}

/// Capture instant for a fetched payload, at the microsecond precision stores keep.
pub fn now_timestamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[async_trait]
pub trait WeatherSource: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<WeatherPayload, IngestError>;

    /// Provenance URL matching what `fetch` sends, minus the credential.
    fn source_url(&self, request: &FetchRequest) -> String;

    fn has_credential(&self) -> bool;
}

pub struct WeatherApiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    backoff: BackoffPolicy,
}

impl fmt::Debug for WeatherApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeatherApiClient")
            .field("base_url", &self.base_url)
            .field("has_api_key", &self.api_key.is_some())
            .finish()
    }
}

impl WeatherApiClient {
    pub fn new(config: SourceConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url,
            api_key: config.api_key.filter(|k| !k.trim().is_empty()),
            backoff: config.backoff,
        })
    }

    async fn fetch_with_key(
        &self,
        api_key: &str,
        request: &FetchRequest,
    ) -> Result<WeatherPayload, IngestError> {
        let url = history_endpoint(&self.base_url);
        let date = request.date_string();
        let mut attempt = 0usize;

        loop {
            let resp_result = self
                .client
                .get(&url)
                .query(&[
                    ("key", api_key),
                    ("q", request.location.as_str()),
                    ("dt", date.as_str()),
                ])
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.bytes().await.map_err(|err| {
                            IngestError::UpstreamUnavailable(format!(
                                "reading response body: {}",
                                err.without_url()
                            ))
                        })?;
                        return serde_json::from_slice(&body).map_err(|err| {
                            IngestError::UpstreamRejected {
                                status: Some(status.as_u16()),
                                body: format!("response is not JSON: {err}"),
                            }
                        });
                    }

                    let body = resp.text().await.unwrap_or_default();
                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        warn!(%status, attempt, "weather API returned retryable status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(match disposition {
                        RetryDisposition::Retryable => IngestError::UpstreamUnavailable(format!(
                            "http status {}: {}",
                            status.as_u16(),
                            truncate_body(&body)
                        )),
                        RetryDisposition::NonRetryable => IngestError::UpstreamRejected {
                            status: Some(status.as_u16()),
                            body: truncate_body(&body),
                        },
                    });
                }
                Err(err) => {
                    // reqwest errors carry the request URL, which includes the key.
                    let err = err.without_url();
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "weather API request failed, retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(IngestError::UpstreamUnavailable(err.to_string()));
                }
            }
        }
    }
}

#[async_trait]
impl WeatherSource for WeatherApiClient {
    async fn fetch(&self, request: &FetchRequest) -> Result<WeatherPayload, IngestError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(IngestError::ConfigurationMissing(
                "API_KEY not configured".to_string(),
            ));
        };

        let span = info_span!(
            "weather_fetch",
            location = %request.location,
            date = %request.date_string()
        );
        self.fetch_with_key(api_key, request).instrument(span).await
    }

    fn source_url(&self, request: &FetchRequest) -> String {
        build_source_url(&self.base_url, &request.location, request.date)
    }

    fn has_credential(&self) -> bool {
        self.api_key.is_some()
    }
}

fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_ERROR_BODY_CHARS {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use wxraw_core::parse_date;

    const SECRET: &str = "s3cr3t-api-key-7f2c";

    fn request() -> FetchRequest {
        FetchRequest::new("59.3293,18.0686", parse_date("2024-01-15").unwrap()).unwrap()
    }

    fn client_for(server: &MockServer, api_key: Option<&str>, max_retries: usize) -> WeatherApiClient {
        WeatherApiClient::new(SourceConfig {
            base_url: server.uri(),
            api_key: api_key.map(str::to_string),
            timeout: Duration::from_millis(500),
            user_agent: Some("wxraw-test".into()),
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        })
        .unwrap()
    }

    #[tokio::test]
    async fn fetch_sends_key_location_and_date() {
        let server = MockServer::start().await;
        let payload = serde_json::json!({"location": {"name": "Stockholm"}, "forecast": {"forecastday": []}});
        Mock::given(method("GET"))
            .and(path("/history.json"))
            .and(query_param("key", SECRET))
            .and(query_param("q", "59.3293,18.0686"))
            .and(query_param("dt", "2024-01-15"))
            .respond_with(ResponseTemplate::new(200).set_body_json(payload.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Some(SECRET), 0);
        let got = client.fetch(&request()).await.unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn missing_key_fails_without_network_call() {
        let server = MockServer::start().await;
        let client = client_for(&server, None, 3);
        assert!(!client.has_credential());

        let err = client.fetch(&request()).await.unwrap_err();
        assert!(matches!(err, IngestError::ConfigurationMissing(_)));
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn blank_key_counts_as_missing() {
        let server = MockServer::start().await;
        let client = client_for(&server, Some("   "), 0);
        assert!(!client.has_credential());
    }

    #[tokio::test]
    async fn server_error_is_unavailable_and_not_retried_by_default() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/history.json"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client_for(&server, Some(SECRET), 0)
            .fetch(&request())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::UpstreamUnavailable(_)));
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn client_error_is_rejected_with_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/history.json"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string(r#"{"error":{"code":1006,"message":"No location found matching parameter 'q'"}}"#),
            )
            .mount(&server)
            .await;

        let err = client_for(&server, Some(SECRET), 2)
            .fetch(&request())
            .await
            .unwrap_err();
        match err {
            IngestError::UpstreamRejected { status, body } => {
                assert_eq!(status, Some(400));
                assert!(body.contains("No location found"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retry_policy_recovers_from_transient_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/history.json"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/history.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let got = client_for(&server, Some(SECRET), 2)
            .fetch(&request())
            .await
            .unwrap();
        assert_eq!(got, serde_json::json!({"ok": true}));
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn non_json_success_body_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let err = client_for(&server, Some(SECRET), 0)
            .fetch(&request())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::UpstreamRejected { status: Some(200), .. }));
    }

    #[tokio::test]
    async fn timeout_is_unavailable_and_does_not_leak_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let err = client_for(&server, Some(SECRET), 0)
            .fetch(&request())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::UpstreamUnavailable(_)));
        assert!(!err.to_string().contains(SECRET));
    }

    #[tokio::test]
    async fn source_url_omits_credential() {
        let server = MockServer::start().await;
        let client = client_for(&server, Some(SECRET), 0);
        for (location, date) in [
            ("59.3293,18.0686", "2024-01-15"),
            ("London", "2023-12-31"),
            ("Malmö", "2020-02-29"),
        ] {
            let req = FetchRequest::new(location, parse_date(date).unwrap()).unwrap();
            let url = client.source_url(&req);
            assert!(!url.contains(SECRET));
            assert!(!url.contains("key="));
            assert!(url.ends_with(&format!("?q={location}&dt={date}")));
        }
    }

    #[test]
    fn source_url_matches_history_endpoint() {
        let url = build_source_url(
            "https://api.weatherapi.com/v1/",
            "59.3293,18.0686",
            parse_date("2024-01-15").unwrap(),
        );
        assert_eq!(
            url,
            "https://api.weatherapi.com/v1/history.json?q=59.3293,18.0686&dt=2024-01-15"
        );
    }

    #[test]
    fn debug_output_redacts_key() {
        let config = SourceConfig {
            api_key: Some(SECRET.into()),
            ..Default::default()
        };
        assert!(!format!("{config:?}").contains(SECRET));
    }

    #[test]
    fn now_timestamp_has_microsecond_precision() {
        let ts = now_timestamp();
        assert_eq!(ts.timestamp_subsec_nanos() % 1_000, 0);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "x".repeat(2_000);
        let out = truncate_body(&body);
        assert_eq!(out.chars().count(), MAX_ERROR_BODY_CHARS + 1);
    }
}
