use std::sync::Arc;

use tracing::warn;

use crate::clock::Clock;
use crate::db::models::{Subscription, SubscriptionState};
use crate::db::SubscriptionStore;
use crate::error::RejectReason;
use crate::notifications::Notification;

#[derive(Clone)]
pub struct NotificationValidator {
    store: Arc<dyn SubscriptionStore>,
    clock: Arc<dyn Clock>,
}

impl NotificationValidator {
    pub fn new(store: Arc<dyn SubscriptionStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn handshake(token: &str) -> String {
        token.to_string()
    }

    pub fn validate(&self, notification: &Notification) -> Result<Subscription, RejectReason> {
        self.authenticate(
            &notification.subscription_id,
            notification.client_state.as_deref(),
        )
    }

    /// Fails closed. A record still marked accepting but past `expires_at`
    /// is treated as expired even before the scheduler flips its state.
    pub fn authenticate(
        &self,
        subscription_id: &str,
        client_state: Option<&str>,
    ) -> Result<Subscription, RejectReason> {
        let subscription = self
            .store
            .get(subscription_id)
            .map_err(|error| {
                warn!(subscription_id, error = %error, "subscription lookup failed");
                RejectReason::Store(error.to_string())
            })?
            .ok_or_else(|| RejectReason::UnknownSubscription(subscription_id.to_string()))?;

        let provided = client_state.unwrap_or_default();
        let matches = subscription.client_secret.matches(provided);

        if !subscription.state.is_accepting() {
            return Err(RejectReason::InactiveSubscription {
                id: subscription.id,
                state: subscription.state,
            });
        }
        if subscription.expires_at <= self.clock.now() {
            return Err(RejectReason::InactiveSubscription {
                id: subscription.id,
                state: SubscriptionState::Expired,
            });
        }
        if client_state.is_none() || !matches {
            return Err(RejectReason::ClientStateMismatch(subscription.id));
        }
        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    use super::NotificationValidator;
    use crate::clock::{Clock, ManualClock};
    use crate::db::models::{ChangeType, ClientSecret, Subscription, SubscriptionState};
    use crate::db::{InMemoryStore, SubscriptionStore};
    use crate::error::RejectReason;
    use crate::notifications::Notification;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).unwrap(),
        ))
    }

    fn store_with(state: SubscriptionState) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        let now = clock().now();
        store
            .put(&Subscription {
                id: "sub-1".to_string(),
                resource: "/users/u/mailFolders('Inbox')/messages".to_string(),
                change_type: ChangeType::created(),
                notification_url: "https://hooks.example.com/outlook-notify".to_string(),
                client_secret: ClientSecret::from_stored("right"),
                expires_at: now + Duration::minutes(60),
                state,
                created_at: now,
                lifetime: Duration::minutes(60),
                renewal_attempts: 0,
                next_renewal_at: None,
                last_error: None,
            })
            .expect("put");
        store
    }

    fn notification(subscription_id: &str, client_state: Option<&str>) -> Notification {
        let mut raw = json!({
            "subscriptionId": subscription_id,
            "changeType": "created",
            "resource": "Users/u/Messages/1",
        });
        if let Some(state) = client_state {
            raw["clientState"] = json!(state);
        }
        Notification::from_value(raw, Utc::now()).expect("notification")
    }

    #[test]
    fn handshake_echoes_token_verbatim() {
        let token = "Validation: Testing client application reachability for subscription Request-Id: 1 & more";
        assert_eq!(NotificationValidator::handshake(token), token);
    }

    #[test]
    fn accepts_matching_client_state() {
        let validator = NotificationValidator::new(store_with(SubscriptionState::RenewalDue), clock());
        let owner = validator
            .validate(&notification("sub-1", Some("right")))
            .expect("accepted");
        assert_eq!(owner.id, "sub-1");
    }

    #[test]
    fn rejects_in_every_failure_mode() {
        let validator = NotificationValidator::new(store_with(SubscriptionState::Active), clock());
        assert_eq!(
            validator.validate(&notification("sub-1", Some("wrong"))),
            Err(RejectReason::ClientStateMismatch("sub-1".to_string()))
        );
        assert_eq!(
            validator.validate(&notification("sub-1", None)),
            Err(RejectReason::ClientStateMismatch("sub-1".to_string()))
        );
        assert_eq!(
            validator.validate(&notification("sub-2", Some("right"))),
            Err(RejectReason::UnknownSubscription("sub-2".to_string()))
        );

        let expired = NotificationValidator::new(store_with(SubscriptionState::Expired), clock());
        assert!(matches!(
            expired.validate(&notification("sub-1", Some("right"))),
            Err(RejectReason::InactiveSubscription {
                state: SubscriptionState::Expired,
                ..
            })
        ));
    }

    #[test]
    fn accepting_record_past_expiry_is_rejected() {
        let clock = clock();
        let validator =
            NotificationValidator::new(store_with(SubscriptionState::Active), clock.clone());
        assert!(validator.validate(&notification("sub-1", Some("right"))).is_ok());

        clock.advance(Duration::minutes(60));
        assert_eq!(
            validator.validate(&notification("sub-1", Some("right"))),
            Err(RejectReason::InactiveSubscription {
                id: "sub-1".to_string(),
                state: SubscriptionState::Expired,
            })
        );
    }
}
