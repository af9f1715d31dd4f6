use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::notifications::dispatcher::DispatchError;
use crate::notifications::validator::NotificationValidator;
use crate::notifications::{LifecycleEvent, LifecycleNotification, NotificationEnvelope};
use crate::subscriptions::SubscriptionManager;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "detail", rename_all = "snake_case")]
pub enum LifecycleAction {
    Renewed,
    RenewalFailed(String),
    MarkedExpired,
    Missed,
    Ignored,
    Rejected(String),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LifecycleReport {
    pub actions: Vec<LifecycleAction>,
}

pub struct LifecycleProcessor {
    validator: NotificationValidator,
    manager: Arc<SubscriptionManager>,
}

impl LifecycleProcessor {
    pub fn new(validator: NotificationValidator, manager: Arc<SubscriptionManager>) -> Self {
        Self { validator, manager }
    }

    pub async fn process_body(&self, body: &[u8]) -> Result<LifecycleReport, DispatchError> {
        let envelope: NotificationEnvelope = serde_json::from_slice(body)?;
        Ok(self.process(envelope.value).await)
    }

    pub async fn process(&self, items: Vec<Value>) -> LifecycleReport {
        let mut report = LifecycleReport::default();
        for raw in items {
            report.actions.push(self.process_item(raw).await);
        }
        report
    }

    async fn process_item(&self, raw: Value) -> LifecycleAction {
        let notification: LifecycleNotification = match serde_json::from_value(raw) {
            Ok(notification) => notification,
            Err(error) => return LifecycleAction::Rejected(format!("malformed: {error}")),
        };
        let id = notification.subscription_id.as_str();

        if let Err(reason) = self
            .validator
            .authenticate(id, notification.client_state.as_deref())
        {
            warn!(subscription_id = id, reason = %reason, "lifecycle notification rejected");
            return LifecycleAction::Rejected(reason.to_string());
        }

        match notification.event {
            LifecycleEvent::ReauthorizationRequired => match self.manager.renew(id).await {
                Ok(_) => LifecycleAction::Renewed,
                Err(error) => LifecycleAction::RenewalFailed(error.to_string()),
            },
            LifecycleEvent::SubscriptionRemoved => match self.manager.mark_removed(id) {
                Ok(true) => LifecycleAction::MarkedExpired,
                Ok(false) => LifecycleAction::Ignored,
                Err(error) => LifecycleAction::RenewalFailed(error.to_string()),
            },
            LifecycleEvent::Missed => {
                warn!(subscription_id = id, "provider reports missed notifications");
                LifecycleAction::Missed
            }
            LifecycleEvent::Unknown => {
                info!(subscription_id = id, "ignoring unknown lifecycle event");
                LifecycleAction::Ignored
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    use super::{LifecycleAction, LifecycleProcessor};
    use crate::clock::ManualClock;
    use crate::db::models::{ChangeType, SubscriptionState};
    use crate::db::InMemoryStore;
    use crate::graph::MockSubscriptionApi;
    use crate::notifications::NotificationValidator;
    use crate::subscriptions::{CallbackUrls, RenewalPolicy, SubscriptionManager};

    #[tokio::test]
    async fn lifecycle_events_drive_the_manager() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).unwrap(),
        ));
        let manager = Arc::new(SubscriptionManager::new(
            store.clone(),
            Arc::new(MockSubscriptionApi::new()),
            clock.clone(),
            RenewalPolicy::default(),
            Some(CallbackUrls::from_base("https://hooks.example.com")),
        ));
        let created = manager
            .create("/users/u/mailFolders('Inbox')/messages", &ChangeType::created(), Duration::minutes(60))
            .await
            .expect("create");
        let processor = LifecycleProcessor::new(NotificationValidator::new(store, clock.clone()), manager.clone());
        let secret = created.client_secret.expose().to_string();

        let report = processor
            .process(vec![
                json!({"subscriptionId": created.id, "clientState": secret, "lifecycleEvent": "reauthorizationRequired"}),
                json!({"subscriptionId": created.id, "clientState": "forged", "lifecycleEvent": "subscriptionRemoved"}),
                json!({"subscriptionId": created.id, "clientState": secret, "lifecycleEvent": "missed"}),
            ])
            .await;
        assert_eq!(report.actions[0], LifecycleAction::Renewed);
        assert!(matches!(report.actions[1], LifecycleAction::Rejected(_)));
        assert_eq!(report.actions[2], LifecycleAction::Missed);
        assert_eq!(
            manager.get(&created.id).expect("get").state,
            SubscriptionState::Active
        );

        let report = processor
            .process(vec![json!({
                "subscriptionId": created.id,
                "clientState": secret,
                "lifecycleEvent": "subscriptionRemoved"
            })])
            .await;
        assert_eq!(report.actions, vec![LifecycleAction::MarkedExpired]);
        assert_eq!(
            manager.get(&created.id).expect("get").state,
            SubscriptionState::Expired
        );
    }
}
