//! Subscription lifecycle against the remote API.
//!
//! Every state change goes through [`SubscriptionStore::transition`], so two
//! callers racing on the same record cannot both win. Renewal in particular is
//! single-flight: only the caller that moves the record into `Renewing` talks
//! to Graph, and that claim is a lease which the scheduler reclaims once it
//! lapses.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::models::{ChangeType, ClientSecret, Subscription, SubscriptionState};
use crate::db::{SubscriptionStore, Transition};
use crate::error::SubscriptionError;
use crate::graph::{GraphError, SubscriptionApi, SubscriptionRequest};
use crate::subscriptions::backoff::{backoff_delay, jitter_fraction};
use crate::subscriptions::{max_subscription_ttl, RenewalPolicy, STALE_PENDING_AFTER_MINUTES};

const PENDING_ID_PREFIX: &str = "pending:";

pub const NOTIFY_PATH: &str = "/outlook-notify";
pub const LIFECYCLE_PATH: &str = "/outlook-lifecycle";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackUrls {
    pub notification_url: String,
    pub lifecycle_url: Option<String>,
}

impl CallbackUrls {
    pub fn from_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            notification_url: format!("{base}{NOTIFY_PATH}"),
            lifecycle_url: Some(format!("{base}{LIFECYCLE_PATH}")),
        }
    }
}

type PairKey = (String, ChangeType);
type Reservations = Arc<Mutex<HashSet<PairKey>>>;

struct CreateReservation {
    creating: Reservations,
    key: PairKey,
}

impl Drop for CreateReservation {
    fn drop(&mut self) {
        let mut creating = self.creating.lock().unwrap_or_else(PoisonError::into_inner);
        creating.remove(&self.key);
    }
}

pub struct SubscriptionManager {
    store: Arc<dyn SubscriptionStore>,
    api: Arc<dyn SubscriptionApi>,
    clock: Arc<dyn Clock>,
    policy: RenewalPolicy,
    callbacks: Option<CallbackUrls>,
    creating: Reservations,
}

impl SubscriptionManager {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        api: Arc<dyn SubscriptionApi>,
        clock: Arc<dyn Clock>,
        policy: RenewalPolicy,
        callbacks: Option<CallbackUrls>,
    ) -> Self {
        Self {
            store,
            api,
            clock,
            policy,
            callbacks,
            creating: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn SubscriptionStore> {
        &self.store
    }

    pub fn policy(&self) -> &RenewalPolicy {
        &self.policy
    }

    pub fn callbacks(&self) -> Option<&CallbackUrls> {
        self.callbacks.as_ref()
    }

    pub async fn create(
        &self,
        resource: &str,
        change_type: &ChangeType,
        ttl: Duration,
    ) -> Result<Subscription, SubscriptionError> {
        let callbacks = self
            .callbacks
            .clone()
            .ok_or(SubscriptionError::MissingNotificationUrl)?;
        self.create_with(resource, change_type, ttl, &callbacks).await
    }

    #[instrument(skip(self, change_type, callbacks), fields(change_type = %change_type))]
    pub async fn create_with(
        &self,
        resource: &str,
        change_type: &ChangeType,
        ttl: Duration,
        callbacks: &CallbackUrls,
    ) -> Result<Subscription, SubscriptionError> {
        let resource = resource.trim();
        if resource.is_empty() {
            return Err(SubscriptionError::InvalidRequest(
                "resource must not be empty".to_string(),
            ));
        }
        if ttl <= Duration::zero() {
            return Err(SubscriptionError::InvalidRequest(
                "ttl must be positive".to_string(),
            ));
        }
        let ttl = ttl.min(max_subscription_ttl());

        let reservation = self.reserve(resource, change_type)?;
        if let Some(existing) = self.find_accepting(resource, change_type)? {
            return Err(SubscriptionError::AlreadyActive {
                id: existing.id,
                resource: resource.to_string(),
            });
        }

        let client_secret =
            ClientSecret::generate().map_err(|_| SubscriptionError::SecretGeneration)?;
        let now = self.clock.now();
        let placeholder = Subscription {
            id: format!("{PENDING_ID_PREFIX}{}", Uuid::new_v4()),
            resource: resource.to_string(),
            change_type: change_type.clone(),
            notification_url: callbacks.notification_url.clone(),
            client_secret: client_secret.clone(),
            expires_at: now + ttl,
            state: SubscriptionState::Pending,
            created_at: now,
            lifetime: ttl,
            renewal_attempts: 0,
            next_renewal_at: None,
            last_error: None,
        };
        self.store.put(&placeholder)?;

        let request = SubscriptionRequest {
            resource: resource.to_string(),
            change_type: change_type.clone(),
            notification_url: callbacks.notification_url.clone(),
            lifecycle_notification_url: callbacks.lifecycle_url.clone(),
            client_state: client_secret,
            expiration: now + ttl,
        };

        // The remote create and the local write run detached: once Graph has
        // a subscription, the store records it even if this caller goes away.
        let store = Arc::clone(&self.store);
        let api = Arc::clone(&self.api);
        let clock = Arc::clone(&self.clock);
        let task = tokio::spawn(
            async move {
                let _reservation = reservation;
                complete_create(store.as_ref(), api.as_ref(), clock.as_ref(), placeholder, request)
                    .await
            }
            .in_current_span(),
        );
        task.await.map_err(|error| SubscriptionError::Interrupted {
            resource: resource.to_string(),
            reason: error.to_string(),
        })?
    }

    pub async fn ensure(
        &self,
        resource: &str,
        change_type: &ChangeType,
        ttl: Duration,
    ) -> Result<Subscription, SubscriptionError> {
        if let Some(existing) = self.find_accepting(resource.trim(), change_type)? {
            return Ok(existing);
        }
        match self.create(resource, change_type, ttl).await {
            Err(SubscriptionError::AlreadyActive { id, .. }) => self.get(&id),
            other => other,
        }
    }

    #[instrument(skip(self))]
    pub async fn renew(&self, id: &str) -> Result<Subscription, SubscriptionError> {
        let now = self.clock.now();
        let lease_until = now + self.policy.lease;
        let claimed = self.store.transition(
            id,
            &[SubscriptionState::Active, SubscriptionState::RenewalDue],
            &mut |record| {
                record.state = SubscriptionState::Renewing;
                record.next_renewal_at = Some(lease_until);
            },
        )?;
        let subscription = match claimed {
            Transition::Applied(record) => record,
            Transition::Missing => return Err(SubscriptionError::NotFound(id.to_string())),
            Transition::Rejected(record) if record.state == SubscriptionState::Renewing => {
                return Err(SubscriptionError::RenewalInFlight(id.to_string()));
            }
            Transition::Rejected(record) => {
                return Err(SubscriptionError::NotRenewable {
                    id: id.to_string(),
                    state: record.state,
                });
            }
        };

        if subscription.expires_at <= now {
            self.finish_renewal(id, &mut |record| {
                record.state = SubscriptionState::Expired;
                record.next_renewal_at = None;
                record.last_error = Some("expired before renewal".to_string());
            })?;
            error!(id, alert = true, expires_at = %subscription.expires_at, "subscription expired before renewal");
            return Err(SubscriptionError::Expired(id.to_string()));
        }

        let target = (subscription.expires_at + subscription.lifetime).min(now + max_subscription_ttl());
        match self.api.renew(id, target).await {
            Ok(expiration) if expiration > now => {
                let renewed = self.finish_renewal(id, &mut |record| {
                    record.state = SubscriptionState::Active;
                    record.expires_at = expiration;
                    record.renewal_attempts = 0;
                    record.next_renewal_at = None;
                    record.last_error = None;
                })?;
                info!(id, expires_at = %expiration, "subscription renewed");
                Ok(renewed)
            }
            Ok(expiration) => {
                let reason = format!("provider returned past expiration {expiration}");
                self.fail_permanently(id, reason)
            }
            Err(source) if source.is_transient() => self.record_transient_failure(&subscription, now, source),
            Err(source) => self.fail_permanently(id, source.to_string()),
        }
    }

    fn record_transient_failure(
        &self,
        subscription: &Subscription,
        now: DateTime<Utc>,
        source: GraphError,
    ) -> Result<Subscription, SubscriptionError> {
        let id = subscription.id.as_str();
        let attempts = subscription.renewal_attempts.saturating_add(1);
        let reason = source.to_string();

        if attempts >= self.policy.max_attempts {
            self.finish_renewal(id, &mut |record| {
                record.state = SubscriptionState::Failed;
                record.renewal_attempts = attempts;
                record.next_renewal_at = None;
                record.last_error = Some(reason.clone());
            })?;
            error!(id, attempts, alert = true, error = %reason, "subscription renewal exhausted retries");
            return Err(SubscriptionError::RenewalExhausted {
                id: id.to_string(),
                attempts,
                reason,
            });
        }

        let delay = backoff_delay(
            attempts,
            self.policy.backoff_base,
            self.policy.backoff_max,
            jitter_fraction(),
        );
        let tick = Duration::from_std(self.policy.tick).unwrap_or_else(|_| Duration::seconds(60));
        let latest = (subscription.expires_at - tick).max(now);
        let next_attempt = (now + delay).min(latest);

        self.finish_renewal(id, &mut |record| {
            record.state = SubscriptionState::RenewalDue;
            record.renewal_attempts = attempts;
            record.next_renewal_at = Some(next_attempt);
            record.last_error = Some(reason.clone());
        })?;
        warn!(id, attempts, next_attempt = %next_attempt, error = %reason, "subscription renewal failed, will retry");
        Err(SubscriptionError::RenewalTransient {
            id: id.to_string(),
            attempts,
            reason,
        })
    }

    fn fail_permanently(&self, id: &str, reason: String) -> Result<Subscription, SubscriptionError> {
        self.finish_renewal(id, &mut |record| {
            record.state = SubscriptionState::Failed;
            record.next_renewal_at = None;
            record.last_error = Some(reason.clone());
        })?;
        error!(id, alert = true, error = %reason, "subscription renewal failed permanently");
        Err(SubscriptionError::RenewalPermanent {
            id: id.to_string(),
            reason,
        })
    }

    /// Moves a record out of `Renewing`. Fails if it was retired meanwhile.
    fn finish_renewal(
        &self,
        id: &str,
        apply: &mut dyn FnMut(&mut Subscription),
    ) -> Result<Subscription, SubscriptionError> {
        match self
            .store
            .transition(id, &[SubscriptionState::Renewing], apply)?
        {
            Transition::Applied(record) => Ok(record),
            Transition::Rejected(record) => Err(SubscriptionError::NotRenewable {
                id: id.to_string(),
                state: record.state,
            }),
            Transition::Missing => Err(SubscriptionError::NotFound(id.to_string())),
        }
    }

    /// Marks the record Expired and deletes it remotely on a best-effort basis.
    #[instrument(skip(self))]
    pub async fn retire(&self, id: &str) -> Result<Subscription, SubscriptionError> {
        let retired = match self.store.transition(
            id,
            &[
                SubscriptionState::Pending,
                SubscriptionState::Active,
                SubscriptionState::RenewalDue,
                SubscriptionState::Renewing,
            ],
            &mut |record| {
                record.state = SubscriptionState::Expired;
                record.next_renewal_at = None;
            },
        )? {
            Transition::Applied(record) | Transition::Rejected(record) => record,
            Transition::Missing => return Err(SubscriptionError::NotFound(id.to_string())),
        };

        if id.starts_with(PENDING_ID_PREFIX) {
            return Ok(retired);
        }

        match self.api.delete(id).await {
            Ok(()) => {
                info!(id, "subscription retired");
                Ok(retired)
            }
            Err(error) => {
                warn!(id, error = %error, "remote subscription delete failed; local record retired anyway");
                let message = format!("remote delete failed: {error}");
                match self.store.transition(id, &SubscriptionState::ALL, &mut |record| {
                    record.last_error = Some(message.clone());
                })? {
                    Transition::Applied(record) => Ok(record),
                    _ => Ok(retired),
                }
            }
        }
    }

    pub fn expire(&self, id: &str) -> Result<bool, SubscriptionError> {
        let now = self.clock.now();
        let outcome = self.store.transition(id, &SubscriptionState::ACCEPTING, &mut |record| {
            if record.expires_at <= now {
                record.state = SubscriptionState::Expired;
                record.next_renewal_at = None;
                record.last_error = Some("expired".to_string());
            }
        })?;
        Ok(matches!(outcome, Transition::Applied(ref record) if record.state == SubscriptionState::Expired))
    }

    pub fn mark_renewal_due(&self, id: &str) -> Result<bool, SubscriptionError> {
        let now = self.clock.now();
        let margin = self.policy.margin;
        let outcome = self.store.transition(id, &[SubscriptionState::Active], &mut |record| {
            if record.remaining(now) <= margin {
                record.state = SubscriptionState::RenewalDue;
                record.next_renewal_at = None;
            }
        })?;
        Ok(matches!(outcome, Transition::Applied(ref record) if record.state == SubscriptionState::RenewalDue))
    }

    /// Returns a `Renewing` record whose lease has lapsed to `RenewalDue`.
    /// The claimant was dropped or crashed before it could finish.
    pub fn reclaim_renewal(&self, id: &str) -> Result<bool, SubscriptionError> {
        let now = self.clock.now();
        let outcome = self.store.transition(id, &[SubscriptionState::Renewing], &mut |record| {
            if record.next_renewal_at.is_none_or(|lease| lease <= now) {
                record.state = SubscriptionState::RenewalDue;
                record.next_renewal_at = None;
                record.last_error = Some("renewal interrupted".to_string());
            }
        })?;
        Ok(matches!(outcome, Transition::Applied(ref record) if record.state == SubscriptionState::RenewalDue))
    }

    /// Releases every `Renewing` claim regardless of lease. Only valid at
    /// startup, before anything in this process could hold a claim.
    pub fn recover_interrupted_renewals(&self) -> Result<Vec<String>, SubscriptionError> {
        let mut recovered = Vec::new();
        for claimed in self.store.list(Some(&[SubscriptionState::Renewing]))? {
            let outcome = self.store.transition(&claimed.id, &[SubscriptionState::Renewing], &mut |record| {
                record.state = SubscriptionState::RenewalDue;
                record.next_renewal_at = None;
                record.last_error = Some("renewal interrupted".to_string());
            })?;
            if matches!(outcome, Transition::Applied(_)) {
                warn!(id = %claimed.id, "released renewal claim left by a previous run");
                recovered.push(claimed.id);
            }
        }
        Ok(recovered)
    }

    pub fn mark_removed(&self, id: &str) -> Result<bool, SubscriptionError> {
        let outcome = self.store.transition(id, &SubscriptionState::ACCEPTING, &mut |record| {
            record.state = SubscriptionState::Expired;
            record.next_renewal_at = None;
            record.last_error = Some("removed by provider".to_string());
        })?;
        let removed = matches!(outcome, Transition::Applied(_));
        if removed {
            error!(id, alert = true, "subscription removed by provider");
        }
        Ok(removed)
    }

    /// Fails Pending placeholders left behind by an interrupted creation.
    pub fn fail_stale_pending(&self) -> Result<Vec<String>, SubscriptionError> {
        let cutoff = self.clock.now() - Duration::minutes(STALE_PENDING_AFTER_MINUTES);
        let mut failed = Vec::new();
        for pending in self.store.list(Some(&[SubscriptionState::Pending]))? {
            if pending.created_at > cutoff {
                continue;
            }
            let outcome = self.store.transition(&pending.id, &[SubscriptionState::Pending], &mut |record| {
                record.state = SubscriptionState::Failed;
                record.last_error = Some("creation did not complete".to_string());
            })?;
            if matches!(outcome, Transition::Applied(_)) {
                warn!(id = %pending.id, resource = %pending.resource, "abandoned pending subscription failed");
                failed.push(pending.id);
            }
        }
        Ok(failed)
    }

    pub fn get(&self, id: &str) -> Result<Subscription, SubscriptionError> {
        self.store
            .get(id)?
            .ok_or_else(|| SubscriptionError::NotFound(id.to_string()))
    }

    pub fn list(
        &self,
        states: Option<&[SubscriptionState]>,
    ) -> Result<Vec<Subscription>, SubscriptionError> {
        Ok(self.store.list(states)?)
    }

    fn find_accepting(
        &self,
        resource: &str,
        change_type: &ChangeType,
    ) -> Result<Option<Subscription>, SubscriptionError> {
        Ok(self
            .store
            .list(Some(&SubscriptionState::ACCEPTING))?
            .into_iter()
            .find(|subscription| subscription.covers(resource, change_type)))
    }

    fn reserve(
        &self,
        resource: &str,
        change_type: &ChangeType,
    ) -> Result<CreateReservation, SubscriptionError> {
        let key = (resource.to_string(), change_type.clone());
        let mut creating = self.creating.lock().unwrap_or_else(PoisonError::into_inner);
        if !creating.insert(key.clone()) {
            return Err(SubscriptionError::CreateInFlight {
                resource: resource.to_string(),
            });
        }
        Ok(CreateReservation {
            creating: Arc::clone(&self.creating),
            key,
        })
    }
}

async fn complete_create(
    store: &dyn SubscriptionStore,
    api: &dyn SubscriptionApi,
    clock: &dyn Clock,
    placeholder: Subscription,
    request: SubscriptionRequest,
) -> Result<Subscription, SubscriptionError> {
    let resource = placeholder.resource.as_str();
    let outcome = api.create(&request).await;
    store.delete(&placeholder.id)?;

    let remote = match outcome {
        Ok(remote) => remote,
        Err(source) if source.is_handshake_failure() => {
            warn!(resource, error = %source, "graph could not validate notification url");
            return Err(SubscriptionError::HandshakeTimeout {
                resource: resource.to_string(),
                source,
            });
        }
        Err(source) => {
            warn!(resource, error = %source, "subscription create failed");
            return Err(SubscriptionError::Create {
                resource: resource.to_string(),
                source,
            });
        }
    };

    let acknowledged_at = clock.now();
    if remote.expiration <= acknowledged_at {
        return Err(SubscriptionError::Create {
            resource: resource.to_string(),
            source: GraphError::Decode(format!(
                "subscription {} acknowledged with past expiration {}",
                remote.id, remote.expiration
            )),
        });
    }

    let subscription = Subscription {
        id: remote.id,
        expires_at: remote.expiration,
        state: SubscriptionState::Active,
        ..placeholder
    };
    store.put(&subscription)?;
    info!(
        id = %subscription.id,
        resource = %subscription.resource,
        expires_at = %subscription.expires_at,
        "subscription active"
    );
    Ok(subscription)
}
