use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::{Config, ConfigError, ScopeMode};
use crate::model::Credential;

pub const DELEGATED_SCOPES: &[&str] = &[
    "User.Read",
    "Files.ReadWrite.All",
    "Mail.Send",
    "Calendars.ReadWrite",
    "offline_access",
];
pub const GRAPH_DEFAULT_SCOPE: &str = "https://graph.microsoft.com/.default";

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const SLOW_DOWN_STEP_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("device code expired before sign-in completed")]
    Expired,
    #[error("sign-in failed: {error}{}", describe(.description))]
    Denied {
        error: String,
        description: Option<String>,
    },
    #[error("identity provider unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected identity provider response: {0}")]
    InvalidResponse(String),
}

/// Source of the run's single bearer token.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn acquire_token(&self) -> Result<Credential, AuthError>;
}

/// Where the sign-in instructions go. Stdout in the binary, a buffer in tests.
pub type PromptSink = Box<dyn Fn(&str) + Send + Sync>;

pub struct DeviceCodeProvider {
    http: Client,
    authority: Url,
    tenant_id: String,
    client_id: String,
    scopes: Vec<String>,
    prompt: PromptSink,
}

impl fmt::Debug for DeviceCodeProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCodeProvider")
            .field("authority", &self.authority)
            .field("tenant_id", &self.tenant_id)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

/// Scope list requested for a given mode.
pub fn scopes_for(mode: ScopeMode) -> Vec<String> {
    match mode {
        ScopeMode::Delegated => DELEGATED_SCOPES.iter().map(|s| s.to_string()).collect(),
        ScopeMode::GraphDefault => vec![GRAPH_DEFAULT_SCOPE.to_string()],
    }
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    expires_in: u64,
    #[serde(default)]
    interval: Option<u64>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct TokenSuccess {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct TokenFailure {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl DeviceCodeProvider {
    pub fn new(
        http: Client,
        authority: Url,
        tenant_id: String,
        client_id: String,
        scopes: Vec<String>,
        prompt: PromptSink,
    ) -> Self {
        Self {
            http,
            authority,
            tenant_id,
            client_id,
            scopes,
            prompt,
        }
    }

    pub fn from_config(cfg: &Config, http: Client, prompt: PromptSink) -> Result<Self, ConfigError> {
        Ok(Self::new(
            http,
            cfg.authority_url()?,
            cfg.tenant_id.clone(),
            cfg.client_id.clone(),
            scopes_for(cfg.scope),
            prompt,
        ))
    }

    pub fn scope_param(&self) -> String {
        self.scopes.join(" ")
    }

    fn endpoint(&self, leaf: &str) -> Result<Url, AuthError> {
        self.authority
            .join(&format!("{}/oauth2/v2.0/{}", self.tenant_id, leaf))
            .map_err(|e| AuthError::InvalidResponse(format!("bad authority URL: {e}")))
    }

    async fn request_device_code(&self) -> Result<DeviceCodeResponse, AuthError> {
        let scope = self.scope_param();
        let res = self
            .http
            .post(self.endpoint("devicecode")?)
            .form(&[("client_id", self.client_id.as_str()), ("scope", scope.as_str())])
            .send()
            .await?;

        let status = res.status();
        let body = res.text().await?;
        if !status.is_success() {
            return Err(failure_from_body(&body, status.as_u16()));
        }
        serde_json::from_str(&body)
            .map_err(|e| AuthError::InvalidResponse(format!("device code response: {e}")))
    }

    fn show_instructions(&self, grant: &DeviceCodeResponse) {
        let message = grant.message.clone().unwrap_or_else(|| {
            format!(
                "To sign in, open {} and enter the code {} to authenticate.",
                grant.verification_uri, grant.user_code
            )
        });
        let rule = "=".repeat(49);
        (self.prompt)(&format!(
            "{rule}\nSign in with the account the heartbeat should run as:\n{message}\n{rule}"
        ));
    }

    async fn poll_token(&self, grant: &DeviceCodeResponse) -> Result<Credential, AuthError> {
        let token_url = self.endpoint("token")?;
        let deadline = Instant::now() + Duration::from_secs(grant.expires_in);
        let mut interval = grant.interval.unwrap_or(DEFAULT_POLL_INTERVAL_SECS);

        loop {
            tokio::time::sleep(Duration::from_secs(interval)).await;
            if Instant::now() >= deadline {
                return Err(AuthError::Expired);
            }

            let res = self
                .http
                .post(token_url.clone())
                .form(&[
                    ("grant_type", DEVICE_CODE_GRANT),
                    ("client_id", self.client_id.as_str()),
                    ("device_code", grant.device_code.as_str()),
                ])
                .send()
                .await?;

            let status = res.status();
            let body = res.text().await?;
            if status.is_success() {
                let ok: TokenSuccess = serde_json::from_str(&body)
                    .map_err(|e| AuthError::InvalidResponse(format!("token response: {e}")))?;
                return Ok(Credential::new(ok.access_token));
            }

            let failure: TokenFailure = serde_json::from_str(&body).map_err(|_| {
                AuthError::InvalidResponse(format!(
                    "token endpoint returned HTTP {}",
                    status.as_u16()
                ))
            })?;
            match failure.error.as_str() {
                "authorization_pending" => {}
                "slow_down" => {
                    interval += SLOW_DOWN_STEP_SECS;
                    warn!(interval, "identity provider asked to slow down");
                }
                "expired_token" => return Err(AuthError::Expired),
                _ => {
                    return Err(AuthError::Denied {
                        error: failure.error,
                        description: failure.error_description,
                    })
                }
            }
        }
    }
}

fn describe(description: &Option<String>) -> String {
    description
        .as_deref()
        .map(|d| format!(" ({d})"))
        .unwrap_or_default()
}

fn failure_from_body(body: &str, status: u16) -> AuthError {
    match serde_json::from_str::<TokenFailure>(body) {
        Ok(f) => AuthError::Denied {
            error: f.error,
            description: f.error_description,
        },
        Err(_) => AuthError::InvalidResponse(format!("device code request returned HTTP {status}")),
    }
}

#[async_trait]
impl TokenProvider for DeviceCodeProvider {
    #[instrument(skip_all, fields(tenant = %self.tenant_id))]
    async fn acquire_token(&self) -> Result<Credential, AuthError> {
        info!(scope = %self.scope_param(), "requesting device code");
        let grant = self.request_device_code().await?;
        self.show_instructions(&grant);
        let credential = self.poll_token(&grant).await?;
        info!("sign-in completed");
        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delegated_scopes_cover_every_call() {
        let scopes = scopes_for(ScopeMode::Delegated);
        for needed in ["Files.ReadWrite.All", "Mail.Send", "Calendars.ReadWrite"] {
            assert!(scopes.iter().any(|s| s == needed), "missing {needed}");
        }
    }

    #[test]
    fn default_scope_is_single_entry() {
        assert_eq!(
            scopes_for(ScopeMode::GraphDefault),
            vec!["https://graph.microsoft.com/.default".to_string()]
        );
    }

    #[test]
    fn endpoints_are_tenant_scoped() {
        let provider = DeviceCodeProvider::new(
            Client::new(),
            Url::parse("https://login.microsoftonline.com/").unwrap(),
            "contoso".into(),
            "client".into(),
            scopes_for(ScopeMode::Delegated),
            Box::new(|_: &str| {}),
        );
        assert_eq!(
            provider.endpoint("devicecode").unwrap().as_str(),
            "https://login.microsoftonline.com/contoso/oauth2/v2.0/devicecode"
        );
        assert_eq!(
            provider.scope_param(),
            "User.Read Files.ReadWrite.All Mail.Send Calendars.ReadWrite offline_access"
        );
    }

    #[test]
    fn denied_error_includes_description() {
        let err = failure_from_body(
            r#"{"error":"invalid_client","error_description":"AADSTS7000218"}"#,
            400,
        );
        assert_eq!(err.to_string(), "sign-in failed: invalid_client (AADSTS7000218)");
        assert!(matches!(
            failure_from_body("<html>", 502),
            AuthError::InvalidResponse(_)
        ));
    }
}
