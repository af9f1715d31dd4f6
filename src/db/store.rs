//! Subscription store contract and its two implementations.
//!
//! Every mutation is atomic with respect to other callers: the in-memory store
//! holds a write lock for the whole read-modify-write, the SQLite store runs it
//! inside a transaction behind a connection mutex.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use thiserror::Error;

use crate::db::models::{Subscription, SubscriptionState};
use crate::db::{select_subscription, upsert_subscription, Database, DbError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("subscription store lock poisoned")]
    Poisoned,
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(Subscription),
    Rejected(Subscription),
    Missing,
}

pub trait SubscriptionStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<Subscription>, StoreError>;

    fn list(&self, states: Option<&[SubscriptionState]>) -> Result<Vec<Subscription>, StoreError>;

    fn put(&self, subscription: &Subscription) -> Result<(), StoreError>;

    fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Applies `apply` to the record only if its current state is in `from`.
    fn transition(
        &self,
        id: &str,
        from: &[SubscriptionState],
        apply: &mut dyn FnMut(&mut Subscription),
    ) -> Result<Transition, StoreError>;
}

#[derive(Default)]
pub struct InMemoryStore {
    records: RwLock<HashMap<String, Subscription>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SubscriptionStore for InMemoryStore {
    fn get(&self, id: &str) -> Result<Option<Subscription>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.get(id).cloned())
    }

    fn list(&self, states: Option<&[SubscriptionState]>) -> Result<Vec<Subscription>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        let mut matching: Vec<Subscription> = records
            .values()
            .filter(|record| states.is_none_or(|states| states.contains(&record.state)))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then_with(|| a.id.cmp(&b.id)));
        Ok(matching)
    }

    fn put(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        records.insert(subscription.id.clone(), subscription.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        Ok(records.remove(id).is_some())
    }

    fn transition(
        &self,
        id: &str,
        from: &[SubscriptionState],
        apply: &mut dyn FnMut(&mut Subscription),
    ) -> Result<Transition, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        let Some(record) = records.get_mut(id) else {
            return Ok(Transition::Missing);
        };
        if !from.contains(&record.state) {
            return Ok(Transition::Rejected(record.clone()));
        }
        apply(record);
        Ok(Transition::Applied(record.clone()))
    }
}

/// SQLite-backed store. `rusqlite::Connection` is not `Sync`, so access is
/// serialised through a mutex.
pub struct SqliteStore {
    db: Mutex<Database>,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(Database::open(path)?))
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let db = self.db.lock().map_err(|_| StoreError::Poisoned)?;
        f(&db)
    }
}

impl SubscriptionStore for SqliteStore {
    fn get(&self, id: &str) -> Result<Option<Subscription>, StoreError> {
        self.with_db(|db| Ok(db.get_subscription(id)?))
    }

    fn list(&self, states: Option<&[SubscriptionState]>) -> Result<Vec<Subscription>, StoreError> {
        self.with_db(|db| Ok(db.list_subscriptions(states)?))
    }

    fn put(&self, subscription: &Subscription) -> Result<(), StoreError> {
        self.with_db(|db| Ok(db.upsert_subscription(subscription)?))
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.with_db(|db| Ok(db.delete_subscription(id)? > 0))
    }

    fn transition(
        &self,
        id: &str,
        from: &[SubscriptionState],
        apply: &mut dyn FnMut(&mut Subscription),
    ) -> Result<Transition, StoreError> {
        self.with_db(|db| {
            let tx = db.conn().unchecked_transaction()?;
            let Some(mut record) = select_subscription(&tx, id)? else {
                return Ok(Transition::Missing);
            };
            if !from.contains(&record.state) {
                return Ok(Transition::Rejected(record));
            }
            apply(&mut record);
            upsert_subscription(&tx, &record)?;
            tx.commit()?;
            Ok(Transition::Applied(record))
        })
    }
}
