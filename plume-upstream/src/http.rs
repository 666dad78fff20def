use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use plume_core::{ApiGeneration, SensorId};
use reqwest::{Client as HttpClient, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    BatchRequest, BatchResponse, CredentialRejection, SensorConfig, Upstream, UpstreamError,
    current, legacy,
};

/// Endpoint settings for [`HttpUpstream`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub legacy_url: String,
    pub api_url: String,
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            legacy_url: "https://www.purpleair.com/json".to_string(),
            api_url: "https://api.purpleair.com/v1".to_string(),
            timeout_secs: 30,
        }
    }
}

/// The fetch contract both API generations implement.
#[async_trait]
pub trait SensorEndpoint: Send + Sync {
    fn generation(&self) -> ApiGeneration;

    async fn fetch_batch(
        &self,
        http: &HttpClient,
        request: &BatchRequest,
    ) -> Result<BatchResponse, UpstreamError>;
}

pub struct LegacyEndpoint {
    url: String,
    api_issues: AtomicBool,
}

impl LegacyEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_issues: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl SensorEndpoint for LegacyEndpoint {
    fn generation(&self) -> ApiGeneration {
        ApiGeneration::Legacy
    }

    async fn fetch_batch(
        &self,
        http: &HttpClient,
        request: &BatchRequest,
    ) -> Result<BatchResponse, UpstreamError> {
        debug!(url = %self.url, sensors = request.sensors.len(), "Fetching legacy batch");

        let response = http.get(&self.url).query(&legacy::query(request)).send().await?;
        let body = match handle_response(response, ApiGeneration::Legacy).await {
            Ok(body) => body,
            Err(e) => {
                if !self.api_issues.swap(true, Ordering::Relaxed) {
                    warn!(error = %e, "Legacy API returned a bad response");
                }
                return Err(e);
            }
        };

        if self.api_issues.swap(false, Ordering::Relaxed) {
            info!("Legacy API responding normally");
        }

        legacy::parse_response(&body, request.include_device_info)
    }
}

pub struct CurrentEndpoint {
    base_url: String,
    missing_fields: AtomicBool,
}

impl CurrentEndpoint {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            missing_fields: AtomicBool::new(false),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl SensorEndpoint for CurrentEndpoint {
    fn generation(&self) -> ApiGeneration {
        ApiGeneration::Current
    }

    async fn fetch_batch(
        &self,
        http: &HttpClient,
        request: &BatchRequest,
    ) -> Result<BatchResponse, UpstreamError> {
        let api_key = request
            .credential
            .as_deref()
            .ok_or_else(|| UpstreamError::BadRequest("missing API key".into()))?;

        let url = format!("{}/sensors", self.base_url);
        debug!(%url, sensors = request.sensors.len(), "Fetching v1 batch");

        let response = http
            .get(&url)
            .header(current::API_KEY_HEADER, api_key)
            .query(&current::query(request))
            .send()
            .await?;
        let body = handle_response(response, ApiGeneration::Current).await?;

        let parsed = current::parse_response(&body, request.include_device_info)?;
        if parsed.missing_fields.is_empty() {
            if self.missing_fields.swap(false, Ordering::Relaxed) {
                info!("API is now returning all requested fields");
            }
        } else if !self.missing_fields.swap(true, Ordering::Relaxed) {
            warn!(fields = ?parsed.missing_fields, "API response did not include requested fields");
        }

        Ok(parsed.response)
    }
}

/// Endpoint selected per registration by its API generation.
pub enum Endpoint {
    Legacy(LegacyEndpoint),
    Current(CurrentEndpoint),
}

#[async_trait]
impl SensorEndpoint for Endpoint {
    fn generation(&self) -> ApiGeneration {
        match self {
            Self::Legacy(endpoint) => endpoint.generation(),
            Self::Current(endpoint) => endpoint.generation(),
        }
    }

    async fn fetch_batch(
        &self,
        http: &HttpClient,
        request: &BatchRequest,
    ) -> Result<BatchResponse, UpstreamError> {
        match self {
            Self::Legacy(endpoint) => endpoint.fetch_batch(http, request).await,
            Self::Current(endpoint) => endpoint.fetch_batch(http, request).await,
        }
    }
}

/// reqwest-backed [`Upstream`].
pub struct HttpUpstream {
    http: HttpClient,
    legacy: Endpoint,
    current: Endpoint,
    api_url: String,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self::with_http_client(http, config))
    }

    /// Use a preconfigured reqwest client (proxies, TLS roots, etc).
    pub fn with_http_client(http: HttpClient, config: &UpstreamConfig) -> Self {
        let current = CurrentEndpoint::new(&config.api_url);
        Self {
            http,
            legacy: Endpoint::Legacy(LegacyEndpoint::new(&config.legacy_url)),
            api_url: current.base_url().to_string(),
            current: Endpoint::Current(current),
        }
    }

    pub fn endpoint(&self, generation: ApiGeneration) -> &Endpoint {
        match generation {
            ApiGeneration::Legacy => &self.legacy,
            ApiGeneration::Current => &self.current,
        }
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, request: &BatchRequest) -> Result<BatchResponse, UpstreamError> {
        if request.sensors.is_empty() {
            return Ok(BatchResponse::default());
        }

        self.endpoint(request.generation)
            .fetch_batch(&self.http, request)
            .await
    }

    async fn check_read_key(&self, api_key: &str) -> Result<(), UpstreamError> {
        let url = format!("{}/keys", self.api_url);
        let response = self
            .http
            .get(&url)
            .header(current::API_KEY_HEADER, api_key)
            .send()
            .await?;

        let body = handle_response(response, ApiGeneration::Current).await?;
        current::parse_keys(&body)
    }

    async fn lookup_sensor(
        &self,
        api_key: &str,
        sensor_id: SensorId,
        read_key: Option<&str>,
    ) -> Result<SensorConfig, UpstreamError> {
        let url = format!("{}/sensors/{}", self.api_url, sensor_id);
        let response = self
            .http
            .get(&url)
            .header(current::API_KEY_HEADER, api_key)
            .query(&current::lookup_query(read_key))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(UpstreamError::InvalidCredential(
                CredentialRejection::SensorNotFound,
            ));
        }

        let body = handle_response(response, ApiGeneration::Current).await?;
        current::parse_lookup(&body)
    }
}

/// Map non-success statuses onto [`UpstreamError`] and return the body.
async fn handle_response(
    response: reqwest::Response,
    generation: ApiGeneration,
) -> Result<Vec<u8>, UpstreamError> {
    let status = response.status();

    if status.is_success() {
        return Ok(response.bytes().await?.to_vec());
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(UpstreamError::InvalidCredential(
            CredentialRejection::Forbidden,
        )),
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            Err(UpstreamError::RateLimited { retry_after })
        }
        StatusCode::GONE if generation == ApiGeneration::Legacy => Err(UpstreamError::Deprecated),
        StatusCode::BAD_REQUEST => {
            let body = response.bytes().await.unwrap_or_default();
            Err(current::bad_request(&body))
        }
        _ => Err(UpstreamError::Server {
            status: status.as_u16(),
        }),
    }
}
