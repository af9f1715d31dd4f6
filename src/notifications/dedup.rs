//! Bounded, TTL'd membership set for notification identities.
//!
//! Entries move `InFlight` → `Seen` (confirm) or disappear (release). Expiry
//! uses the monotonic clock so wall-clock jumps cannot resurrect duplicates.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use ring::digest::{digest, SHA256};

use crate::notifications::Notification;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Discriminator {
    /// `resourceData.id` plus its etag; a new etag is a new change.
    ChangeId(String),
    ContentHash(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub subscription_id: String,
    pub resource: String,
    pub change_type: String,
    pub discriminator: Discriminator,
}

impl DedupKey {
    pub fn for_notification(notification: &Notification) -> Self {
        let discriminator = match (notification.resource_id(), notification.etag()) {
            (Some(id), Some(etag)) => Discriminator::ChangeId(format!("{id}@{etag}")),
            _ => Discriminator::ContentHash(content_hash(&notification.raw)),
        };
        Self {
            subscription_id: notification.subscription_id.clone(),
            resource: notification.resource.clone(),
            change_type: notification.change_type.to_string(),
            discriminator,
        }
    }
}

fn content_hash(raw: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(raw).unwrap_or_default();
    STANDARD_NO_PAD.encode(digest(&SHA256, &bytes).as_ref())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller now owns the key and must confirm or release it.
    Claimed,
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    InFlight,
    Seen,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: EntryState,
    inserted_at: Instant,
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<DedupKey, Entry>,
    /// Insertion order. May hold stale pairs for keys re-inserted later;
    /// those are skipped by comparing `inserted_at`.
    order: VecDeque<(DedupKey, Instant)>,
}

impl Entries {
    fn is_live(&self, key: &DedupKey, now: Instant, ttl: Duration) -> bool {
        self.map
            .get(key)
            .is_some_and(|entry| now.saturating_duration_since(entry.inserted_at) < ttl)
    }

    fn insert(&mut self, key: DedupKey, state: EntryState, now: Instant, ttl: Duration, capacity: usize) {
        if !self.map.contains_key(&key) {
            self.make_room(now, ttl, capacity);
        }
        self.order.push_back((key.clone(), now));
        self.map.insert(
            key,
            Entry {
                state,
                inserted_at: now,
            },
        );
    }

    fn make_room(&mut self, now: Instant, ttl: Duration, capacity: usize) {
        self.evict_expired(now, ttl);
        while self.map.len() >= capacity {
            let Some((key, inserted_at)) = self.order.pop_front() else {
                break;
            };
            if self.map.get(&key).is_some_and(|entry| entry.inserted_at == inserted_at) {
                self.map.remove(&key);
            }
        }
    }

    fn evict_expired(&mut self, now: Instant, ttl: Duration) {
        while let Some((key, inserted_at)) = self.order.front() {
            if now.saturating_duration_since(*inserted_at) < ttl {
                break;
            }
            if self.map.get(key).is_some_and(|entry| entry.inserted_at == *inserted_at) {
                self.map.remove(key);
            }
            self.order.pop_front();
        }
    }
}

pub struct DedupCache {
    entries: Mutex<Entries>,
    ttl: Duration,
    capacity: usize,
}

impl DedupCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn seen(&self, key: &DedupKey) -> bool {
        self.seen_at(key, Instant::now())
    }

    pub fn seen_at(&self, key: &DedupKey, now: Instant) -> bool {
        let mut entries = self.lock();
        if entries.is_live(key, now, self.ttl) {
            return false;
        }
        entries.insert(key.clone(), EntryState::Seen, now, self.ttl, self.capacity);
        true
    }

    pub fn claim(&self, key: &DedupKey) -> Claim {
        self.claim_at(key, Instant::now())
    }

    pub fn claim_at(&self, key: &DedupKey, now: Instant) -> Claim {
        let mut entries = self.lock();
        if entries.is_live(key, now, self.ttl) {
            return Claim::Duplicate;
        }
        entries.insert(key.clone(), EntryState::InFlight, now, self.ttl, self.capacity);
        Claim::Claimed
    }

    pub fn confirm(&self, key: &DedupKey) {
        self.confirm_at(key, Instant::now());
    }

    pub fn confirm_at(&self, key: &DedupKey, now: Instant) {
        let mut entries = self.lock();
        entries.insert(key.clone(), EntryState::Seen, now, self.ttl, self.capacity);
    }

    /// Drops an in-flight claim so a redelivery can be handled.
    pub fn release(&self, key: &DedupKey) {
        let mut entries = self.lock();
        if entries
            .map
            .get(key)
            .is_some_and(|entry| entry.state == EntryState::InFlight)
        {
            entries.map.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
