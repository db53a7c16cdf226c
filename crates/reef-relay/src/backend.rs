use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend answered {status}: {message}")]
    Status { status: u16, message: String },
    #[error("backend request failed")]
    Request(#[from] reqwest::Error),
    #[error("invalid backend configuration: {0}")]
    Config(String),
}

impl BackendError {
    /// Status to report toward the client. Transport-level failures map to
    /// a plain 500.
    pub fn status_code(&self) -> u16 {
        match self {
            BackendError::Status { status, .. } => *status,
            BackendError::Request(_) | BackendError::Config(_) => 500,
        }
    }
}

/// Decoded backend reply: the HTTP status plus the JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status_code: u16,
    pub body: Value,
}

/// Read/write access to the management API. Abstracted so the completion
/// loop and request handlers can run against a fake in tests.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get(&self, path: &str, query: &[(String, String)]) -> Result<ApiResponse, BackendError>;

    async fn post(&self, path: &str, body: &Value) -> Result<ApiResponse, BackendError>;
}

/// Production backend over HTTP. Non-2xx replies become
/// [`BackendError::Status`] with whatever error text the body carries.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self, BackendError> {
        Self::with_headers(base_url, &[])
    }

    /// Headers here ride along on every request, e.g. a service auth token.
    pub fn with_headers(
        base_url: impl Into<String>,
        headers: &[(String, String)],
    ) -> Result<Self, BackendError> {
        let mut defaults = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| BackendError::Config(format!("header name {name}: {err}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| BackendError::Config(format!("header value: {err}")))?;
            defaults.insert(name, value);
        }
        let client = reqwest::Client::builder()
            .default_headers(defaults)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn decode(response: reqwest::Response) -> Result<ApiResponse, BackendError> {
        let status = response.status().as_u16();
        let body = match response.json::<Value>().await {
            Ok(body) => body,
            Err(_) if !(200..300).contains(&status) => Value::Null,
            Err(err) => return Err(err.into()),
        };
        if !(200..300).contains(&status) {
            let message = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("backend request rejected")
                .to_string();
            return Err(BackendError::Status {
                status,
                message,
            });
        }
        Ok(ApiResponse {
            status_code: status,
            body,
        })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn get(&self, path: &str, query: &[(String, String)]) -> Result<ApiResponse, BackendError> {
        debug!(target: "reef.backend", %path, params = query.len(), "get");
        let response = self.client.get(self.url(path)).query(query).send().await?;
        Self::decode(response).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<ApiResponse, BackendError> {
        debug!(target: "reef.backend", %path, "post");
        let response = self.client.post(self.url(path)).json(body).send().await?;
        Self::decode(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_errors_surface_their_code() {
        let err = BackendError::Status {
            status: 403,
            message: "forbidden".into(),
        };
        assert_eq!(err.status_code(), 403);
        assert_eq!(
            BackendError::Config("bad header".into()).status_code(),
            500
        );
    }

    #[test]
    fn urls_join_without_doubled_slashes() {
        let backend = HttpBackend::new("http://manager.local/api/").expect("build backend");
        assert_eq!(backend.url("/command"), "http://manager.local/api/command");
        assert_eq!(backend.url("job"), "http://manager.local/api/job");
    }

    #[test]
    fn invalid_default_headers_are_rejected() {
        let result = HttpBackend::with_headers(
            "http://manager.local",
            &[("bad name".into(), "value".into())],
        );
        assert!(matches!(result, Err(BackendError::Config(_))));
    }
}
