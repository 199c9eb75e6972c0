//! REST client for the queue coordinator: session creation, the selectable
//! video listing, and offer submission. The coordinator answers the offer
//! asynchronously over the queue channel, so `submit_offer` only yields a
//! job ticket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    base_url: Url,
}

impl CoordinatorConfig {
    pub fn new(base_url: impl AsRef<str>) -> Result<Self, ApiError> {
        let mut base = base_url.as_ref().trim().to_string();
        if base.is_empty() {
            return Err(ApiError::InvalidConfig(
                "coordinator base url cannot be empty".into(),
            ));
        }
        if !base.starts_with("http://") && !base.starts_with("https://") {
            base = format!("http://{}", base);
        }
        let parsed = Url::parse(&base)
            .map_err(|err| ApiError::InvalidConfig(format!("invalid coordinator url: {err}")))?;
        Ok(Self { base_url: parsed })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid coordinator configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ammunition {
    pub atgm: u32,
    pub cluster_shells: u32,
    pub unitary_shells: u32,
    pub fpv_drones: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateSessionRequest {
    pub custom_id: Option<String>,
    pub filename: String,
    pub ammunition: Ammunition,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OfferRequest {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueResponse {
    pub job_id: String,
    /// Advisory only; the coordinator reports `-1` (or nothing) once the
    /// job is no longer waiting in line.
    #[serde(default)]
    pub position: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VideosResponse {
    videos: Vec<String>,
}

#[derive(Clone)]
pub struct CoordinatorClient {
    config: Arc<CoordinatorConfig>,
    backend: Arc<dyn CoordinatorBackend>,
}

impl CoordinatorClient {
    pub fn new(config: CoordinatorConfig) -> Result<Self, ApiError> {
        let backend = Arc::new(ReqwestBackend::new()?);
        Ok(Self {
            config: Arc::new(config),
            backend,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_backend(config: CoordinatorConfig, backend: Arc<dyn CoordinatorBackend>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub async fn list_videos(&self) -> Result<Vec<String>, ApiError> {
        let response = self.backend.list_videos(self.config.base_url()).await?;
        Ok(response.videos)
    }

    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreateSessionResponse, ApiError> {
        let response = self
            .backend
            .create_session(self.config.base_url(), &request)
            .await?;
        if response.session_id.is_empty() {
            return Err(ApiError::InvalidResponse("empty session id".into()));
        }
        Ok(response)
    }

    pub async fn submit_offer(
        &self,
        session_id: &str,
        request: OfferRequest,
    ) -> Result<EnqueueResponse, ApiError> {
        let response = self
            .backend
            .submit_offer(self.config.base_url(), session_id, &request)
            .await?;
        if response.job_id.is_empty() {
            return Err(ApiError::InvalidResponse("empty job id".into()));
        }
        Ok(response)
    }
}

#[async_trait]
pub(crate) trait CoordinatorBackend: Send + Sync {
    async fn list_videos(&self, base_url: &Url) -> Result<VideosResponse, ApiError>;

    async fn create_session(
        &self,
        base_url: &Url,
        request: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse, ApiError>;

    async fn submit_offer(
        &self,
        base_url: &Url,
        session_id: &str,
        request: &OfferRequest,
    ) -> Result<EnqueueResponse, ApiError>;
}

struct ReqwestBackend {
    client: reqwest::Client,
}

impl ReqwestBackend {
    fn new() -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }
}

fn join_endpoint(base_url: &Url, path: &str) -> Result<Url, ApiError> {
    base_url
        .join(path)
        .map_err(|err| ApiError::InvalidConfig(format!("invalid endpoint {path}: {err}")))
}

#[async_trait]
impl CoordinatorBackend for ReqwestBackend {
    async fn list_videos(&self, base_url: &Url) -> Result<VideosResponse, ApiError> {
        let endpoint = join_endpoint(base_url, "videos")?;
        let response = self.client.get(endpoint).send().await?;
        if !response.status().is_success() {
            return Err(ApiError::HttpStatus(response.status()));
        }
        Ok(response.json::<VideosResponse>().await?)
    }

    async fn create_session(
        &self,
        base_url: &Url,
        request: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse, ApiError> {
        let endpoint = join_endpoint(base_url, "session")?;
        let response = self.client.post(endpoint).json(request).send().await?;
        if !response.status().is_success() {
            return Err(ApiError::HttpStatus(response.status()));
        }
        Ok(response.json::<CreateSessionResponse>().await?)
    }

    async fn submit_offer(
        &self,
        base_url: &Url,
        session_id: &str,
        request: &OfferRequest,
    ) -> Result<EnqueueResponse, ApiError> {
        let endpoint = join_endpoint(base_url, &format!("session/{}/offer", session_id))?;
        let response = self.client.post(endpoint).json(request).send().await?;
        if !response.status().is_success() {
            return Err(ApiError::HttpStatus(response.status()));
        }
        Ok(response.json::<EnqueueResponse>().await?)
    }
}
