use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use thiserror::Error;

use crate::db::models::{ChangeType, ClientSecret};

pub mod client;
pub mod mock;
pub mod token;

pub use client::GraphSubscriptionClient;
pub use mock::{MockFailure, MockSubscriptionApi};
pub use token::{AccessToken, ClientCredentialsTokenProvider, StaticTokenProvider, TokenError, TokenProvider};

pub const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

const REDACTED_BODY_MAX_LEN: usize = 200;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("token acquisition failed: {0}")]
    Token(#[from] TokenError),

    #[error("graph request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("graph responded with status={status} body={body}")]
    Status { status: u16, body: String },

    #[error("graph response could not be decoded: {0}")]
    Decode(String),
}

impl GraphError {
    pub fn status(status: StatusCode, body: &str) -> Self {
        Self::Status {
            status: status.as_u16(),
            body: redact_response_body(body),
        }
    }

    /// Network failures, timeouts, throttling and 5xx may succeed on retry.
    /// Everything else (auth, permissions, missing subscription) will not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Token(error) => error.is_transient(),
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            Self::Decode(_) => false,
        }
    }

    /// Graph answers subscription creation with a 400 when it could not
    /// complete the validation handshake against the notification URL.
    pub fn is_handshake_failure(&self) -> bool {
        match self {
            Self::Status { status, body } if *status == 400 => {
                let lowered = body.to_ascii_lowercase();
                lowered.contains("validation request failed")
                    || lowered.contains("validation request timed out")
                    || lowered.contains("notification endpoint must respond with 200")
            }
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub resource: String,
    pub change_type: ChangeType,
    pub notification_url: String,
    pub lifecycle_notification_url: Option<String>,
    pub client_state: ClientSecret,
    pub expiration: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSubscription {
    pub id: String,
    pub resource: String,
    pub expiration: DateTime<Utc>,
}

#[async_trait]
pub trait SubscriptionApi: Send + Sync {
    async fn create(&self, request: &SubscriptionRequest) -> Result<RemoteSubscription, GraphError>;

    async fn renew(&self, id: &str, expiration: DateTime<Utc>) -> Result<DateTime<Utc>, GraphError>;

    async fn delete(&self, id: &str) -> Result<(), GraphError>;
}

pub fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        return trimmed.to_string();
    }
    let mut cut = REDACTED_BODY_MAX_LEN;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…[truncated {} bytes]", &trimmed[..cut], trimmed.len())
}
