use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::Credential;

pub const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0/";

/// Longest slice of an error response body kept in a `GatewayError`.
pub const ERROR_BODY_LIMIT: usize = 500;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{method} {url} failed: HTTP {status}\n{body}")]
    Status {
        method: Method,
        url: String,
        status: u16,
        body: String,
    },
    #[error("{method} {url} failed: {source}")]
    Transport {
        method: Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{method} {url} returned invalid JSON: {source}")]
    Decode {
        method: Method,
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid Graph path {path}: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("unexpected Graph response: {0}")]
    UnexpectedBody(String),
}

impl GatewayError {
    /// HTTP status for non-2xx failures.
    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Status and body of a successful raw upload, returned verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status_code: u16,
    pub raw_body: String,
}

/// Request helpers the heartbeat is built on. Paths are relative to the
/// Graph base URL (`me/drive`, `users/{upn}/drive`, ...).
#[async_trait]
pub trait GraphApi: Send + Sync {
    async fn get(&self, path: &str, token: &Credential) -> Result<Value, GatewayError>;

    async fn post(
        &self,
        path: &str,
        token: &Credential,
        body: &Value,
    ) -> Result<Value, GatewayError>;

    async fn put_raw(
        &self,
        path: &str,
        token: &Credential,
        content: String,
        content_type: &str,
    ) -> Result<RawResponse, GatewayError>;
}

#[derive(Clone)]
pub struct GraphClient {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for GraphClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GraphClient {
    pub fn new(http: Client, base_url: Url) -> Self {
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, GatewayError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| GatewayError::InvalidPath {
                path: path.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn build_request(
        &self,
        method: Method,
        path: &str,
        token: &Credential,
    ) -> Result<reqwest::RequestBuilder, GatewayError> {
        let url = self.endpoint(path)?;
        Ok(self
            .http
            .request(method, url)
            .bearer_auth(token.access_token()))
    }

    /// Send, read the whole body as text, and turn non-2xx into `GatewayError::Status`.
    async fn execute(
        &self,
        method: Method,
        path: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<(u16, String, String), GatewayError> {
        let request = request.build().map_err(|source| GatewayError::Transport {
            method: method.clone(),
            url: self
                .endpoint(path)
                .map(String::from)
                .unwrap_or_else(|_| path.to_string()),
            source,
        })?;
        let url = request.url().to_string();
        debug!(%method, %url, "graph request");

        let res = self
            .http
            .execute(request)
            .await
            .map_err(|source| GatewayError::Transport {
                method: method.clone(),
                url: url.clone(),
                source,
            })?;
        let status = res.status();
        let body = res.text().await.map_err(|source| GatewayError::Transport {
            method: method.clone(),
            url: url.clone(),
            source,
        })?;

        if !status.is_success() {
            warn!(%method, %url, status = status.as_u16(), "graph call failed");
            return Err(GatewayError::Status {
                method,
                url,
                status: status.as_u16(),
                body: truncate_body(&body, ERROR_BODY_LIMIT),
            });
        }
        debug!(%method, %url, status = status.as_u16(), "graph response");
        Ok((status.as_u16(), url, body))
    }
}

#[async_trait]
impl GraphApi for GraphClient {
    async fn get(&self, path: &str, token: &Credential) -> Result<Value, GatewayError> {
        let request = self.build_request(Method::GET, path, token)?;
        let (_, url, body) = self.execute(Method::GET, path, request).await?;
        decode_json(Method::GET, url, &body)
    }

    async fn post(
        &self,
        path: &str,
        token: &Credential,
        body: &Value,
    ) -> Result<Value, GatewayError> {
        let request = self
            .build_request(Method::POST, path, token)?
            .header("Content-Type", "application/json")
            .body(body.to_string());
        let (_, url, text) = self.execute(Method::POST, path, request).await?;
        if text.trim().is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        decode_json(Method::POST, url, &text)
    }

    async fn put_raw(
        &self,
        path: &str,
        token: &Credential,
        content: String,
        content_type: &str,
    ) -> Result<RawResponse, GatewayError> {
        let request = self
            .build_request(Method::PUT, path, token)?
            .header("Content-Type", content_type)
            .body(content);
        let (status_code, _, raw_body) = self.execute(Method::PUT, path, request).await?;
        Ok(RawResponse {
            status_code,
            raw_body,
        })
    }
}

fn decode_json(method: Method, url: String, body: &str) -> Result<Value, GatewayError> {
    serde_json::from_str(body).map_err(|source| GatewayError::Decode {
        method,
        url,
        source,
    })
}

/// First `limit` characters of `body`, never splitting a code point.
pub fn truncate_body(body: &str, limit: usize) -> String {
    body.chars().take(limit).collect()
}
