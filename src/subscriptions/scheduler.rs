use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::db::models::SubscriptionState;
use crate::error::SubscriptionError;
use crate::subscriptions::SubscriptionManager;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TickReport {
    pub expired: Vec<String>,
    pub marked_due: Vec<String>,
    pub renewed: Vec<String>,
    pub retrying: Vec<String>,
    pub failed: Vec<String>,
    pub skipped_in_flight: Vec<String>,
    pub reclaimed: Vec<String>,
    pub abandoned_pending: Vec<String>,
    pub errors: Vec<String>,
}

impl TickReport {
    pub fn alerts(&self) -> Vec<&str> {
        self.expired
            .iter()
            .chain(self.failed.iter())
            .map(String::as_str)
            .collect()
    }

    pub fn is_quiet(&self) -> bool {
        self.expired.is_empty()
            && self.marked_due.is_empty()
            && self.renewed.is_empty()
            && self.retrying.is_empty()
            && self.failed.is_empty()
            && self.skipped_in_flight.is_empty()
            && self.reclaimed.is_empty()
            && self.abandoned_pending.is_empty()
            && self.errors.is_empty()
    }
}

pub struct RenewalScheduler {
    manager: Arc<SubscriptionManager>,
    clock: Arc<dyn Clock>,
}

impl RenewalScheduler {
    pub fn new(manager: Arc<SubscriptionManager>, clock: Arc<dyn Clock>) -> Self {
        Self { manager, clock }
    }

    /// One pass over the store. Issues at most one renewal per due record;
    /// a `Renewing` claim past its lease counts as due again.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        match self.manager.fail_stale_pending() {
            Ok(abandoned) => report.abandoned_pending = abandoned,
            Err(error) => report.errors.push(error.to_string()),
        }

        let accepting = match self.manager.list(Some(&SubscriptionState::ACCEPTING)) {
            Ok(records) => records,
            Err(error) => {
                warn!(error = %error, "renewal tick could not list subscriptions");
                report.errors.push(error.to_string());
                return report;
            }
        };

        let now = self.clock.now();
        let margin = self.manager.policy().margin;
        let mut due = Vec::new();

        for subscription in accepting {
            let id = subscription.id.clone();

            if subscription.expires_at <= now {
                match self.manager.expire(&id) {
                    Ok(true) => {
                        error!(id = %id, alert = true, expires_at = %subscription.expires_at, "subscription expired");
                        report.expired.push(id);
                    }
                    Ok(false) => {}
                    Err(error) => report.errors.push(format!("{id}: {error}")),
                }
                continue;
            }

            match subscription.state {
                SubscriptionState::Renewing
                    if subscription.next_renewal_at.is_some_and(|lease| lease > now) =>
                {
                    report.skipped_in_flight.push(id)
                }
                SubscriptionState::Renewing => match self.manager.reclaim_renewal(&id) {
                    Ok(true) => {
                        warn!(id = %id, "renewal claim lapsed, reclaiming");
                        report.reclaimed.push(id.clone());
                        due.push(id);
                    }
                    Ok(false) => {}
                    Err(error) => report.errors.push(format!("{id}: {error}")),
                },
                SubscriptionState::Active if subscription.remaining(now) <= margin => {
                    match self.manager.mark_renewal_due(&id) {
                        Ok(true) => {
                            debug!(id = %id, "subscription inside renewal margin");
                            report.marked_due.push(id.clone());
                            due.push(id);
                        }
                        Ok(false) => {}
                        Err(error) => report.errors.push(format!("{id}: {error}")),
                    }
                }
                SubscriptionState::RenewalDue => {
                    if subscription.next_renewal_at.is_none_or(|at| at <= now) {
                        due.push(id);
                    }
                }
                _ => {}
            }
        }

        for id in due {
            match self.manager.renew(&id).await {
                Ok(_) => report.renewed.push(id),
                Err(SubscriptionError::RenewalTransient { .. }) => report.retrying.push(id),
                Err(SubscriptionError::RenewalExhausted { .. })
                | Err(SubscriptionError::RenewalPermanent { .. }) => report.failed.push(id),
                Err(SubscriptionError::Expired(_)) => report.expired.push(id),
                Err(SubscriptionError::RenewalInFlight(_)) => report.skipped_in_flight.push(id),
                Err(error) => report.errors.push(format!("{id}: {error}")),
            }
        }

        if !report.is_quiet() {
            debug!(
                renewed = report.renewed.len(),
                retrying = report.retrying.len(),
                failed = report.failed.len(),
                expired = report.expired.len(),
                "renewal tick finished"
            );
        }
        report
    }

    pub fn spawn(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let period = self.manager.policy().tick;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("renewal scheduler stopped");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signals the loop to stop after the current tick and waits for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.task.await {
            warn!(error = %error, "renewal scheduler task ended abnormally");
        }
    }
}
