use std::fmt::{Debug, Formatter};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::GraphCredentials;

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
const CACHE_SKEW_SECONDS: i64 = 60;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("missing graph credential: {0}")]
    MissingCredentials(&'static str),

    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("token endpoint rejected request: status={status} body={body}")]
    Rejected { status: u16, body: String },

    #[error("decode token response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl TokenError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(_) => true,
            Self::Rejected { status, .. } => *status == 429 || *status >= 500,
            Self::MissingCredentials(_) | Self::Decode(_) => false,
        }
    }
}

#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

impl Debug for AccessToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn acquire(&self) -> Result<AccessToken, TokenError>;
}

#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: AccessToken,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: AccessToken {
                token: token.into(),
                expires_at: DateTime::<Utc>::MAX_UTC,
            },
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn acquire(&self) -> Result<AccessToken, TokenError> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    expires_in: u64,
}

/// App-only token via the OAuth2 client-credentials grant, cached in memory
/// until shortly before expiry.
pub struct ClientCredentialsTokenProvider {
    client: Client,
    credentials: Option<GraphCredentials>,
    token_url: String,
    cached: Mutex<Option<AccessToken>>,
}

impl ClientCredentialsTokenProvider {
    pub fn new(client: Client, credentials: Option<GraphCredentials>, token_url: String) -> Self {
        Self {
            client,
            credentials,
            token_url,
            cached: Mutex::new(None),
        }
    }

    async fn fetch(&self, credentials: &GraphCredentials) -> Result<AccessToken, TokenError> {
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", credentials.client_id.as_str()),
                ("client_secret", credentials.client_secret.as_str()),
                ("scope", GRAPH_SCOPE),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(TokenError::Rejected {
                status: status.as_u16(),
                body: crate::graph::redact_response_body(&body),
            });
        }

        let payload: OAuthTokenResponse = serde_json::from_str(&body)?;
        Ok(token_from_response(payload, Utc::now()))
    }
}

fn token_from_response(payload: OAuthTokenResponse, now: DateTime<Utc>) -> AccessToken {
    let lifetime = i64::try_from(payload.expires_in).unwrap_or(i64::MAX / 2);
    AccessToken {
        token: payload.access_token,
        expires_at: now + Duration::seconds(lifetime.saturating_sub(CACHE_SKEW_SECONDS)),
    }
}

#[async_trait]
impl TokenProvider for ClientCredentialsTokenProvider {
    async fn acquire(&self) -> Result<AccessToken, TokenError> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or(TokenError::MissingCredentials(
                "AZURE_TENANT_ID/AZURE_CLIENT_ID/AZURE_CLIENT_SECRET",
            ))?;

        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|token| token.is_usable_at(Utc::now())) {
            return Ok(token.clone());
        }

        let fresh = self.fetch(credentials).await?;
        debug!(expires_at = %fresh.expires_at, "acquired graph access token");
        *cached = Some(fresh.clone());
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{
        token_from_response, ClientCredentialsTokenProvider, OAuthTokenResponse,
        StaticTokenProvider, TokenError, TokenProvider,
    };

    #[test]
    fn oauth_token_response_deserializes_and_applies_skew() {
        let payload = r#"{"access_token":"abc","token_type":"Bearer","expires_in":3600,"ext_expires_in":3600}"#;
        let decoded: OAuthTokenResponse =
            serde_json::from_str(payload).expect("decode oauth token response");
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

        let token = token_from_response(decoded, now);
        assert_eq!(token.token, "abc");
        assert_eq!(token.expires_at, now + Duration::seconds(3540));
        assert!(!format!("{token:?}").contains("abc"));
    }

    #[tokio::test]
    async fn missing_credentials_fail_without_network() {
        let provider = ClientCredentialsTokenProvider::new(
            reqwest::Client::new(),
            None,
            "http://127.0.0.1:9/token".to_string(),
        );
        let error = provider.acquire().await.expect_err("no credentials");
        assert!(matches!(error, TokenError::MissingCredentials(_)));
        assert!(!error.is_transient());
    }

    #[tokio::test]
    async fn static_provider_returns_its_token() {
        let provider = StaticTokenProvider::new("fixed");
        let token = provider.acquire().await.expect("acquire");
        assert_eq!(token.token, "fixed");
    }
}
