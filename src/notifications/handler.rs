use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::info;

use crate::notifications::Notification;

#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(&self, notification: &Notification) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

#[async_trait]
impl NotificationHandler for LogHandler {
    async fn handle(&self, notification: &Notification) -> Result<()> {
        info!(
            subscription_id = %notification.subscription_id,
            resource = %notification.resource,
            change_type = %notification.change_type,
            resource_id = notification.resource_id().unwrap_or("-"),
            tenant_id = notification.tenant_id.as_deref().unwrap_or("-"),
            "mailbox change received"
        );
        Ok(())
    }
}

/// Keeps every handled notification in memory. Can be told to fail or stall.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    received: Mutex<Vec<Notification>>,
    failures_remaining: AtomicUsize,
    delay: Option<Duration>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn fail_next(&self, times: usize) {
        self.failures_remaining.store(times, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<Notification> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self) -> usize {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl NotificationHandler for RecordingHandler {
    async fn handle(&self, notification: &Notification) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            bail!("downstream rejected notification for {}", notification.subscription_id);
        }
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification.clone());
        Ok(())
    }
}
