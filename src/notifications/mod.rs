//! Inbound change notifications: wire models plus the validate → dedup →
//! handle pipeline.

use std::fmt::{Debug, Formatter};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::db::models::ChangeType;
use crate::error::RejectReason;

pub mod dedup;
pub mod dispatcher;
pub mod handler;
pub mod lifecycle;
pub mod validator;

pub use dedup::{Claim, DedupCache, DedupKey, Discriminator};
pub use dispatcher::{BatchReport, BatchStatus, DispatchError, ItemOutcome, NotificationDispatcher};
pub use handler::{LogHandler, NotificationHandler, RecordingHandler};
pub use lifecycle::{LifecycleAction, LifecycleProcessor, LifecycleReport};
pub use validator::NotificationValidator;

/// The `{"value": [...]}` wrapper Graph posts. Items stay raw so one bad
/// item cannot fail the whole batch.
#[derive(Debug, Deserialize)]
pub struct NotificationEnvelope {
    pub value: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct NotificationItem {
    #[serde(rename = "subscriptionId")]
    subscription_id: String,
    #[serde(rename = "clientState")]
    client_state: Option<String>,
    #[serde(rename = "changeType")]
    change_type: String,
    resource: String,
    #[serde(rename = "resourceData")]
    resource_data: Option<Value>,
    #[serde(rename = "tenantId")]
    tenant_id: Option<String>,
    #[serde(rename = "subscriptionExpirationDateTime")]
    subscription_expiration: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Notification {
    pub subscription_id: String,
    pub resource: String,
    pub change_type: ChangeType,
    pub resource_data: Option<Value>,
    pub client_state: Option<String>,
    pub tenant_id: Option<String>,
    pub subscription_expiration: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    /// The item exactly as delivered; only used to derive a content hash.
    pub raw: Value,
}

impl Notification {
    pub fn from_value(raw: Value, received_at: DateTime<Utc>) -> Result<Self, RejectReason> {
        let item: NotificationItem = serde_json::from_value(raw.clone())
            .map_err(|error| RejectReason::Malformed(error.to_string()))?;
        let change_type = item
            .change_type
            .parse::<ChangeType>()
            .map_err(RejectReason::Malformed)?;

        Ok(Self {
            subscription_id: item.subscription_id,
            resource: item.resource,
            change_type,
            resource_data: item.resource_data,
            client_state: item.client_state,
            tenant_id: item.tenant_id,
            subscription_expiration: item.subscription_expiration,
            received_at,
            raw,
        })
    }

    pub fn resource_id(&self) -> Option<&str> {
        self.resource_data
            .as_ref()
            .and_then(|data| data.get("id"))
            .and_then(Value::as_str)
    }

    pub fn etag(&self) -> Option<&str> {
        self.resource_data
            .as_ref()
            .and_then(|data| data.get("@odata.etag"))
            .and_then(Value::as_str)
    }
}

impl Debug for Notification {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notification")
            .field("subscription_id", &self.subscription_id)
            .field("resource", &self.resource)
            .field("change_type", &self.change_type)
            .field("resource_id", &self.resource_id())
            .field("client_state", &self.client_state.as_ref().map(|_| "<redacted>"))
            .field("received_at", &self.received_at)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleEvent {
    ReauthorizationRequired,
    SubscriptionRemoved,
    Missed,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Deserialize)]
pub struct LifecycleNotification {
    #[serde(rename = "subscriptionId")]
    pub subscription_id: String,
    #[serde(rename = "clientState")]
    pub client_state: Option<String>,
    #[serde(rename = "lifecycleEvent")]
    pub event: LifecycleEvent,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(rename = "subscriptionExpirationDateTime", default)]
    pub subscription_expiration: Option<DateTime<Utc>>,
}

impl Debug for LifecycleNotification {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleNotification")
            .field("subscription_id", &self.subscription_id)
            .field("event", &self.event)
            .field("client_state", &self.client_state.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::{LifecycleEvent, LifecycleNotification, Notification, NotificationEnvelope};
    use crate::error::RejectReason;

    #[test]
    fn parses_graph_message_notification() {
        let body = json!({
            "value": [{
                "subscriptionId": "7f105c7d-2dc5-4530-97cd-4e7ae6534c07",
                "subscriptionExpirationDateTime": "2026-04-03T10:00:00.0000000Z",
                "changeType": "created",
                "resource": "Users/abc/Messages/AAMkAD",
                "resourceData": {
                    "@odata.type": "#Microsoft.Graph.Message",
                    "@odata.id": "Users/abc/Messages/AAMkAD",
                    "@odata.etag": "W/\"CQAAABYAAAA\"",
                    "id": "AAMkAD"
                },
                "clientState": "opaque-state",
                "tenantId": "84bd8158-6d4d-4958-8b9f-9d6445542f95"
            }]
        });
        let envelope: NotificationEnvelope = serde_json::from_value(body).expect("envelope");
        let item = envelope.value.into_iter().next().expect("one item");
        let notification = Notification::from_value(item, Utc::now()).expect("notification");

        assert_eq!(notification.resource_id(), Some("AAMkAD"));
        assert_eq!(notification.etag(), Some("W/\"CQAAABYAAAA\""));
        assert_eq!(notification.change_type.to_string(), "created");
        assert!(notification.subscription_expiration.is_some());
        assert!(!format!("{notification:?}").contains("opaque-state"));
    }

    #[test]
    fn item_without_subscription_id_is_malformed() {
        let error = Notification::from_value(json!({"changeType": "created", "resource": "x"}), Utc::now())
            .expect_err("missing subscriptionId");
        assert!(matches!(error, RejectReason::Malformed(_)));

        let error = Notification::from_value(
            json!({"subscriptionId": "s", "changeType": "moved", "resource": "x"}),
            Utc::now(),
        )
        .expect_err("bad change type");
        assert!(matches!(error, RejectReason::Malformed(_)));
    }

    #[test]
    fn lifecycle_events_decode() {
        let notification: LifecycleNotification = serde_json::from_value(json!({
            "subscriptionId": "sub-1",
            "clientState": "s",
            "lifecycleEvent": "reauthorizationRequired"
        }))
        .expect("decode");
        assert_eq!(notification.event, LifecycleEvent::ReauthorizationRequired);

        let unknown: LifecycleNotification = serde_json::from_value(json!({
            "subscriptionId": "sub-1",
            "lifecycleEvent": "somethingNew"
        }))
        .expect("decode");
        assert_eq!(unknown.event, LifecycleEvent::Unknown);
    }
}
