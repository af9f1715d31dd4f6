use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::RejectReason;
use crate::notifications::dedup::{Claim, DedupCache, DedupKey};
use crate::notifications::handler::NotificationHandler;
use crate::notifications::validator::NotificationValidator;
use crate::notifications::{Notification, NotificationEnvelope};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("notification body is not a valid envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ItemOutcome {
    Delivered,
    Duplicate,
    Rejected(String),
    HandlerFailed(String),
    /// No handler slot freed up before the batch deadline.
    Saturated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Acknowledged,
    /// At least one handler failed; ask for redelivery.
    HandlerFailure,
    /// Out of handler capacity; ask for redelivery later.
    Saturated,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub outcomes: Vec<ItemOutcome>,
}

impl BatchReport {
    fn count(&self, predicate: impl Fn(&ItemOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|outcome| predicate(outcome)).count()
    }

    pub fn delivered(&self) -> usize {
        self.count(|outcome| *outcome == ItemOutcome::Delivered)
    }

    pub fn duplicates(&self) -> usize {
        self.count(|outcome| *outcome == ItemOutcome::Duplicate)
    }

    pub fn rejected(&self) -> usize {
        self.count(|outcome| matches!(outcome, ItemOutcome::Rejected(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, ItemOutcome::HandlerFailed(_)))
    }

    pub fn status(&self) -> BatchStatus {
        if self.failed() > 0 {
            BatchStatus::HandlerFailure
        } else if self.outcomes.contains(&ItemOutcome::Saturated) {
            BatchStatus::Saturated
        } else {
            BatchStatus::Acknowledged
        }
    }
}

/// Releases a dedup claim unless the handler confirmed it. Also covers a
/// handler task that panics.
struct ClaimGuard {
    dedup: Arc<DedupCache>,
    key: Option<DedupKey>,
}

impl ClaimGuard {
    fn confirm(mut self) {
        if let Some(key) = self.key.take() {
            self.dedup.confirm(&key);
        }
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.dedup.release(&key);
        }
    }
}

pub struct NotificationDispatcher {
    validator: NotificationValidator,
    dedup: Arc<DedupCache>,
    handler: Arc<dyn NotificationHandler>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl NotificationDispatcher {
    pub fn new(
        validator: NotificationValidator,
        dedup: Arc<DedupCache>,
        handler: Arc<dyn NotificationHandler>,
        concurrency: usize,
        acquire_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            validator,
            dedup,
            handler,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            acquire_timeout,
            clock,
        }
    }

    pub fn validator(&self) -> &NotificationValidator {
        &self.validator
    }

    pub async fn dispatch_body(&self, body: &[u8]) -> Result<BatchReport, DispatchError> {
        let envelope: NotificationEnvelope = serde_json::from_slice(body)?;
        Ok(self.dispatch(envelope.value).await)
    }

    pub async fn dispatch(&self, items: Vec<Value>) -> BatchReport {
        let received_at = self.clock.now();
        let mut outcomes: Vec<Option<ItemOutcome>> = vec![None; items.len()];
        let mut running = JoinSet::new();
        // One acquire deadline for the whole batch; once it passes, items
        // only take a slot that is free right now.
        let deadline = Instant::now() + self.acquire_timeout;
        let mut saturated = false;

        for (index, raw) in items.into_iter().enumerate() {
            let notification = match Notification::from_value(raw, received_at) {
                Ok(notification) => notification,
                Err(reason) => {
                    warn!(index, reason = %reason, "dropping malformed notification");
                    outcomes[index] = Some(ItemOutcome::Rejected(reason.to_string()));
                    continue;
                }
            };

            if let Err(reason) = self.validator.validate(&notification) {
                log_rejection(&notification, &reason);
                outcomes[index] = Some(ItemOutcome::Rejected(reason.to_string()));
                continue;
            }

            let key = DedupKey::for_notification(&notification);
            if self.dedup.claim(&key) == Claim::Duplicate {
                debug!(
                    subscription_id = %notification.subscription_id,
                    resource_id = notification.resource_id().unwrap_or("-"),
                    "skipping duplicate notification"
                );
                outcomes[index] = Some(ItemOutcome::Duplicate);
                continue;
            }
            let guard = ClaimGuard {
                dedup: Arc::clone(&self.dedup),
                key: Some(key),
            };

            let permit = if saturated {
                Arc::clone(&self.permits).try_acquire_owned().ok()
            } else {
                match timeout_at(deadline, Arc::clone(&self.permits).acquire_owned()).await {
                    Ok(Ok(permit)) => Some(permit),
                    _ => {
                        saturated = true;
                        None
                    }
                }
            };
            let Some(permit) = permit else {
                warn!(
                    subscription_id = %notification.subscription_id,
                    "no handler capacity, deferring notification"
                );
                drop(guard);
                outcomes[index] = Some(ItemOutcome::Saturated);
                continue;
            };

            let handler = Arc::clone(&self.handler);
            running.spawn(async move {
                let _permit = permit;
                let outcome = match handler.handle(&notification).await {
                    Ok(()) => {
                        guard.confirm();
                        ItemOutcome::Delivered
                    }
                    Err(error) => {
                        error!(
                            subscription_id = %notification.subscription_id,
                            resource = %notification.resource,
                            error = %error,
                            "notification handler failed"
                        );
                        drop(guard);
                        ItemOutcome::HandlerFailed(error.to_string())
                    }
                };
                (index, outcome)
            });
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(error) => error!(error = %error, "notification handler task aborted"),
            }
        }

        let report = BatchReport {
            outcomes: outcomes
                .into_iter()
                .map(|outcome| {
                    outcome.unwrap_or_else(|| {
                        ItemOutcome::HandlerFailed("handler task aborted".to_string())
                    })
                })
                .collect(),
        };
        info!(
            items = report.outcomes.len(),
            delivered = report.delivered(),
            duplicates = report.duplicates(),
            rejected = report.rejected(),
            failed = report.failed(),
            "notification batch processed"
        );
        report
    }
}

fn log_rejection(notification: &Notification, reason: &RejectReason) {
    match reason {
        RejectReason::ClientStateMismatch(_) => warn!(
            subscription_id = %notification.subscription_id,
            "notification clientState mismatch, dropping"
        ),
        RejectReason::UnknownSubscription(_) => info!(
            subscription_id = %notification.subscription_id,
            "notification for unknown subscription, dropping"
        ),
        other => info!(
            subscription_id = %notification.subscription_id,
            reason = %other,
            "notification not accepted"
        ),
    }
}
