//! Request/response Web API client.
//!
//! Every method is a form-encoded POST carrying the session token; the
//! response is a JSON object whose `ok` field decides success. An
//! `ok=false` response surfaces as [`ApiError::Upstream`] with the
//! upstream reason string.

use serde_json::Value;
use tracing::debug;

/// Largest file body the gateway will fetch and replay.
pub const MAX_FILE_BYTES: usize = 65_536;

const API_BASE: &str = "https://slack.com/api";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("http status {0}")]
    Status(u16),
    #[error("{0}")]
    Upstream(String),
    #[error("malformed response: missing {0}")]
    Malformed(&'static str),
    #[error("file {id} is too large ({size} bytes)")]
    FileTooLarge { id: String, size: usize },
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
}

/// A fetched file body.
#[derive(Debug, Clone)]
pub struct FileContent {
    pub id: String,
    pub content: String,
}

#[derive(Debug)]
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl ApiClient {
    pub fn new(token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: API_BASE.to_owned(),
            token: token.to_owned(),
        }
    }

    /// Call an API method and return the decoded response body.
    pub async fn call(&self, method: &str, params: &[(String, String)]) -> Result<Value, ApiError> {
        debug!(method, "api call");
        let mut form: Vec<(&str, &str)> = vec![("token", self.token.as_str())];
        for (key, value) in params {
            form.push((key, value));
        }

        let response = self
            .http
            .post(format!("{}/{}", self.base, method))
            .form(&form)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }

        let body: Value = response.json().await?;
        if body.get("ok").and_then(Value::as_bool) != Some(true) {
            let reason = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(ApiError::Upstream(reason.to_owned()));
        }
        Ok(body)
    }

    /// Fetch a file's content via `files.info` + its private URL.
    /// Files larger than [`MAX_FILE_BYTES`] are refused.
    pub async fn fetch_file(&self, id: &str) -> Result<FileContent, ApiError> {
        let info = self
            .call("files.info", &[("file".to_owned(), id.to_owned())])
            .await?;
        let file = info.get("file").ok_or(ApiError::Malformed("file"))?;

        let size = file.get("size").and_then(Value::as_u64).unwrap_or(0) as usize;
        if size > MAX_FILE_BYTES {
            return Err(ApiError::FileTooLarge {
                id: id.to_owned(),
                size,
            });
        }

        let url = file
            .get("url_private")
            .and_then(Value::as_str)
            .ok_or(ApiError::Malformed("url_private"))?;

        let response = self.http.get(url).bearer_auth(&self.token).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }
        let bytes = response.bytes().await?;
        if bytes.len() > MAX_FILE_BYTES {
            return Err(ApiError::FileTooLarge {
                id: id.to_owned(),
                size: bytes.len(),
            });
        }

        Ok(FileContent {
            id: id.to_owned(),
            content: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}
