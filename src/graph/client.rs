use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::graph::{
    GraphError, RemoteSubscription, SubscriptionApi, SubscriptionRequest, TokenProvider,
};

const MAX_RATE_LIMIT_RETRIES: usize = 5;
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Serialize)]
struct GraphSubscriptionBody<'a> {
    #[serde(rename = "changeType")]
    change_type: String,
    #[serde(rename = "notificationUrl")]
    notification_url: &'a str,
    #[serde(rename = "lifecycleNotificationUrl", skip_serializing_if = "Option::is_none")]
    lifecycle_notification_url: Option<&'a str>,
    resource: &'a str,
    #[serde(rename = "expirationDateTime")]
    expiration_date_time: String,
    #[serde(rename = "clientState")]
    client_state: &'a str,
}

#[derive(Debug, Serialize)]
struct GraphRenewBody {
    #[serde(rename = "expirationDateTime")]
    expiration_date_time: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphSubscription {
    id: String,
    #[serde(default)]
    resource: String,
    #[serde(rename = "expirationDateTime")]
    expiration_date_time: DateTime<Utc>,
}

/// `SubscriptionApi` backed by the Graph `/subscriptions` endpoints.
pub struct GraphSubscriptionClient {
    client: Client,
    tokens: Arc<dyn TokenProvider>,
    api_base: String,
}

impl GraphSubscriptionClient {
    pub fn new(client: Client, tokens: Arc<dyn TokenProvider>, api_base: impl Into<String>) -> Self {
        Self {
            client,
            tokens,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn http_client() -> Result<Client, reqwest::Error> {
        Client::builder()
            .timeout(StdDuration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
    }

    fn subscriptions_url(&self) -> String {
        format!("{}/subscriptions", self.api_base)
    }

    fn subscription_url(&self, id: &str) -> String {
        format!("{}/subscriptions/{id}", self.api_base)
    }

    /// Sends the request built by `build`, waiting out 429 responses using
    /// the `retry-after` header or a doubling fallback capped at 32 seconds.
    async fn send_with_retry<F>(&self, operation: &str, build: F) -> Result<Response, GraphError>
    where
        F: Fn(&Client, &str) -> RequestBuilder,
    {
        let mut backoff_seconds = 1u64;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let token = self.tokens.acquire().await?;
            let response = build(&self.client, &token.token)
                .header("accept", "application/json")
                .send()
                .await?;

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            if attempt == MAX_RATE_LIMIT_RETRIES {
                let body = response.text().await?;
                return Err(GraphError::status(StatusCode::TOO_MANY_REQUESTS, &body));
            }

            let retry_after_seconds = response
                .headers()
                .get("retry-after")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(backoff_seconds);

            warn!(operation, retry_after_seconds, "graph throttled request");
            sleep(StdDuration::from_secs(retry_after_seconds)).await;
            backoff_seconds = (backoff_seconds * 2).min(32);
        }

        Err(GraphError::Decode(format!(
            "{operation} failed without response"
        )))
    }
}

async fn decode_subscription(response: Response) -> Result<GraphSubscription, GraphError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(GraphError::status(status, &body));
    }
    serde_json::from_str(&body).map_err(|error| GraphError::Decode(error.to_string()))
}

fn wire_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[async_trait]
impl SubscriptionApi for GraphSubscriptionClient {
    async fn create(&self, request: &SubscriptionRequest) -> Result<RemoteSubscription, GraphError> {
        let body = GraphSubscriptionBody {
            change_type: request.change_type.to_string(),
            notification_url: &request.notification_url,
            lifecycle_notification_url: request.lifecycle_notification_url.as_deref(),
            resource: &request.resource,
            expiration_date_time: wire_timestamp(request.expiration),
            client_state: request.client_state.expose(),
        };
        let url = self.subscriptions_url();

        let response = self
            .send_with_retry("create subscription", |client, token| {
                client.post(&url).bearer_auth(token).json(&body)
            })
            .await?;
        let created = decode_subscription(response).await?;
        debug!(id = %created.id, expires_at = %created.expiration_date_time, "graph subscription created");

        Ok(RemoteSubscription {
            id: created.id,
            resource: if created.resource.is_empty() {
                request.resource.clone()
            } else {
                created.resource
            },
            expiration: created.expiration_date_time,
        })
    }

    async fn renew(&self, id: &str, expiration: DateTime<Utc>) -> Result<DateTime<Utc>, GraphError> {
        let body = GraphRenewBody {
            expiration_date_time: wire_timestamp(expiration),
        };
        let url = self.subscription_url(id);

        let response = self
            .send_with_retry("renew subscription", |client, token| {
                client.patch(&url).bearer_auth(token).json(&body)
            })
            .await?;
        let renewed = decode_subscription(response).await?;
        Ok(renewed.expiration_date_time)
    }

    async fn delete(&self, id: &str) -> Result<(), GraphError> {
        let url = self.subscription_url(id);
        let response = self
            .send_with_retry("delete subscription", |client, token| {
                client.delete(&url).bearer_auth(token)
            })
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = response.text().await?;
        Err(GraphError::status(status, &body))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{wire_timestamp, GraphSubscription, GraphSubscriptionBody};

    #[test]
    fn create_body_uses_graph_field_names() {
        let body = GraphSubscriptionBody {
            change_type: "created".to_string(),
            notification_url: "https://hooks.example.com/outlook-notify",
            lifecycle_notification_url: None,
            resource: "/users/u/mailFolders('Inbox')/messages",
            expiration_date_time: wire_timestamp(Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()),
            client_state: "opaque",
        };
        let value = serde_json::to_value(&body).expect("serialize body");
        assert_eq!(value["changeType"], "created");
        assert_eq!(value["notificationUrl"], "https://hooks.example.com/outlook-notify");
        assert_eq!(value["expirationDateTime"], "2026-05-01T12:00:00.000Z");
        assert_eq!(value["clientState"], "opaque");
        assert!(value.get("lifecycleNotificationUrl").is_none());
    }

    #[test]
    fn subscription_response_decodes() {
        let payload = r#"{
            "@odata.context": "https://graph.microsoft.com/v1.0/$metadata#subscriptions/$entity",
            "id": "7f105c7d-2dc5-4530-97cd-4e7ae6534c07",
            "resource": "me/mailFolders('Inbox')/messages",
            "changeType": "created",
            "expirationDateTime": "2026-05-03T18:23:45.9356913Z"
        }"#;
        let decoded: GraphSubscription = serde_json::from_str(payload).expect("decode");
        assert_eq!(decoded.id, "7f105c7d-2dc5-4530-97cd-4e7ae6534c07");
        assert_eq!(decoded.resource, "me/mailFolders('Inbox')/messages");
    }
}
