use finexia_core::wire::{
    LogsResponse, PipelineRunRequest, PipelineRunResponse, SystemStatusResponse,
};
use finexia_core::LogEntry;
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{fmt, future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/api/v1";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub type TokenProvider = Arc<dyn Fn() -> Option<String> + Send + Sync>;
pub type UnauthorizedHook = Arc<dyn Fn() + Send + Sync>;

/// Everything the HTTP collaborator needs, passed in explicitly.
#[derive(Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub token_provider: TokenProvider,
    pub on_unauthorized: UnauthorizedHook,
}

impl ApiClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            token_provider: Arc::new(|| None),
            on_unauthorized: Arc::new(|| {}),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_token_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        self.token_provider = Arc::new(provider);
        self
    }

    /// Fixed token, convenient for the CLI.
    pub fn with_token(self, token: Option<String>) -> Self {
        self.with_token_provider(move || token.clone())
    }

    pub fn with_unauthorized_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_unauthorized = Arc::new(hook);
        self
    }
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl fmt::Debug for ApiClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClientConfig")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("request failed with status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("decode error: {0}")]
    Decode(String),
}

/// The backend calls the status core depends on.
pub trait StatusApi: Send + Sync {
    fn fetch_status(&self) -> impl Future<Output = Result<SystemStatusResponse, ApiError>> + Send;

    fn run_pipeline(
        &self,
        request: &PipelineRunRequest,
    ) -> impl Future<Output = Result<PipelineRunResponse, ApiError>> + Send;

    fn fetch_logs(&self, limit: u32)
        -> impl Future<Output = Result<Vec<LogEntry>, ApiError>> + Send;
}

#[derive(Clone)]
pub struct ApiClient {
    config: ApiClientConfig,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> Result<Self, ApiError> {
        reqwest::Url::parse(&config.base_url)
            .map_err(|err| ApiError::InvalidUrl(format!("{}: {err}", config.base_url)))?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("finexia-client/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &ApiClientConfig {
        &self.config
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request::<T, ()>(Method::GET, path, None).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.request(Method::PUT, path, Some(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request::<T, ()>(Method::DELETE, path, None).await
    }

    async fn request<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ApiError> {
        let url = self.endpoint(path);
        let mut builder = self.http.request(method.clone(), &url);
        if let Some(token) = (self.config.token_provider)().filter(|token| !token.is_empty()) {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        debug!(event = "api_request", method = %method, path);
        let response = builder.send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            warn!(event = "api_unauthorized", method = %method, path);
            (self.config.on_unauthorized)();
            return Err(ApiError::Unauthorized);
        }
        let text = response.text().await?;
        if !status.is_success() {
            let message = error_message(&text).unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            });
            warn!(event = "api_error", method = %method, path, status = status.as_u16(), message = %message);
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }
        serde_json::from_str(&text).map_err(|err| ApiError::Decode(err.to_string()))
    }
}

/// Pulls a human-readable message out of an error body (`detail` or `message`).
fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["detail", "message"].iter().find_map(|key| match value.get(key)? {
        Value::String(text) => Some(text.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

impl StatusApi for ApiClient {
    async fn fetch_status(&self) -> Result<SystemStatusResponse, ApiError> {
        self.get("/system/status").await
    }

    async fn run_pipeline(
        &self,
        request: &PipelineRunRequest,
    ) -> Result<PipelineRunResponse, ApiError> {
        self.post("/system/run-pipeline", request).await
    }

    async fn fetch_logs(&self, limit: u32) -> Result<Vec<LogEntry>, ApiError> {
        let response: LogsResponse = self.get(&format!("/system/logs?limit={limit}")).await?;
        Ok(response.logs)
    }
}
