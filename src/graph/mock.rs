//! In-process stand-in for the Graph subscription endpoints.
//!
//! Used by `MAILWATCH_GRAPH_MODE=mock` for local runs and by the test suites.
//! Failures can be scripted per operation; they are consumed in FIFO order.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::graph::{GraphError, RemoteSubscription, SubscriptionApi, SubscriptionRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Unavailable,
    Forbidden,
    NotFound,
    HandshakeFailed,
}

impl MockFailure {
    fn into_error(self) -> GraphError {
        let (status, body) = match self {
            Self::Unavailable => (503, r#"{"error":{"code":"ServiceUnavailable"}}"#),
            Self::Forbidden => (403, r#"{"error":{"code":"Forbidden"}}"#),
            Self::NotFound => (404, r#"{"error":{"code":"ResourceNotFound"}}"#),
            Self::HandshakeFailed => (
                400,
                r#"{"error":{"code":"ValidationError","message":"Subscription validation request failed. Notification endpoint must respond with 200 OK to validation request."}}"#,
            ),
        };
        GraphError::Status {
            status,
            body: body.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct MockSubscription {
    resource: String,
    expiration: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Scripted {
    create: VecDeque<MockFailure>,
    renew: VecDeque<MockFailure>,
    delete: VecDeque<MockFailure>,
}

#[derive(Debug, Default)]
pub struct MockSubscriptionApi {
    subscriptions: Mutex<BTreeMap<String, MockSubscription>>,
    scripted: Mutex<Scripted>,
    create_calls: AtomicUsize,
    renew_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    create_latency: Mutex<Option<StdDuration>>,
    renewals_held: AtomicBool,
    renewals_released: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockSubscriptionApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_create(&self, failure: MockFailure) {
        lock(&self.scripted).create.push_back(failure);
    }

    pub fn fail_renewals(&self, failure: MockFailure, times: usize) {
        let mut scripted = lock(&self.scripted);
        scripted.renew.extend(std::iter::repeat_n(failure, times));
    }

    pub fn fail_next_delete(&self, failure: MockFailure) {
        lock(&self.scripted).delete.push_back(failure);
    }

    /// Creates register remotely at once but answer only after `latency`.
    pub fn set_create_latency(&self, latency: StdDuration) {
        *lock(&self.create_latency) = Some(latency);
    }

    /// While held, renewals are accepted but never answered.
    pub fn hold_renewals(&self, held: bool) {
        self.renewals_held.store(held, Ordering::SeqCst);
        if !held {
            self.renewals_released.notify_waiters();
        }
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn renew_calls(&self) -> usize {
        self.renew_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn remote_expiration(&self, id: &str) -> Option<DateTime<Utc>> {
        lock(&self.subscriptions).get(id).map(|sub| sub.expiration)
    }

    pub fn remote_count(&self) -> usize {
        lock(&self.subscriptions).len()
    }
}

#[async_trait]
impl SubscriptionApi for MockSubscriptionApi {
    async fn create(&self, request: &SubscriptionRequest) -> Result<RemoteSubscription, GraphError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = lock(&self.scripted).create.pop_front() {
            return Err(failure.into_error());
        }

        let id = format!("mock-sub-{}", Uuid::new_v4());
        lock(&self.subscriptions).insert(
            id.clone(),
            MockSubscription {
                resource: request.resource.clone(),
                expiration: request.expiration,
            },
        );
        let latency = *lock(&self.create_latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(RemoteSubscription {
            id,
            resource: request.resource.clone(),
            expiration: request.expiration,
        })
    }

    async fn renew(&self, id: &str, expiration: DateTime<Utc>) -> Result<DateTime<Utc>, GraphError> {
        self.renew_calls.fetch_add(1, Ordering::SeqCst);
        while self.renewals_held.load(Ordering::SeqCst) {
            let released = self.renewals_released.notified();
            if !self.renewals_held.load(Ordering::SeqCst) {
                break;
            }
            released.await;
        }
        if let Some(failure) = lock(&self.scripted).renew.pop_front() {
            return Err(failure.into_error());
        }

        let mut subscriptions = lock(&self.subscriptions);
        let Some(entry) = subscriptions.get_mut(id) else {
            return Err(MockFailure::NotFound.into_error());
        };
        entry.expiration = expiration;
        tracing::trace!(id, resource = %entry.resource, "mock subscription renewed");
        Ok(expiration)
    }

    async fn delete(&self, id: &str) -> Result<(), GraphError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = lock(&self.scripted).delete.pop_front() {
            let error = failure.into_error();
            if !error.is_not_found() {
                return Err(error);
            }
        }
        lock(&self.subscriptions).remove(id);
        Ok(())
    }
}
