use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, ToSql};
use thiserror::Error;

use self::models::{Subscription, SubscriptionState};

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Config(String),
}

pub mod migrations;
pub mod models;
pub mod schema;
pub mod store;

pub use store::{InMemoryStore, SqliteStore, StoreError, SubscriptionStore, Transition};

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, resource, change_type, notification_url, client_secret, expires_at, state,
    created_at, lifetime_secs, renewal_attempts, next_renewal_at, last_error
"#;

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::initialize(conn)
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, DbError> {
        migrations::migrate(&conn).map_err(|e| DbError::Config(format!("migration failed: {e}")))?;
        Ok(Self { conn })
    }

    pub fn default_db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir()
            .ok_or_else(|| DbError::Config("failed to determine home directory".to_string()))?;
        Ok(home.join(".mailwatch").join("mailwatch.db"))
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn get_subscription(&self, id: &str) -> Result<Option<Subscription>, DbError> {
        select_subscription(&self.conn, id)
    }

    pub fn list_subscriptions(
        &self,
        states: Option<&[SubscriptionState]>,
    ) -> Result<Vec<Subscription>, DbError> {
        let mut sql = format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions");
        let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(states) = states {
            if states.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = vec!["?"; states.len()].join(", ");
            sql.push_str(&format!(" WHERE state IN ({placeholders})"));
            for state in states {
                params_vec.push(Box::new(state.to_string()));
            }
        }
        sql.push_str(" ORDER BY expires_at ASC, id ASC");

        let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|v| v.as_ref()).collect();
        let mut stmt = self.conn.prepare(&sql)?;
        let subscriptions = stmt
            .query_map(params_refs.as_slice(), Subscription::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(subscriptions)
    }

    pub fn upsert_subscription(&self, subscription: &Subscription) -> Result<(), DbError> {
        upsert_subscription(&self.conn, subscription)
    }

    pub fn delete_subscription(&self, id: &str) -> Result<usize, DbError> {
        let deleted = self
            .conn
            .execute("DELETE FROM subscriptions WHERE id = ?", [id])?;
        Ok(deleted)
    }
}

pub(crate) fn select_subscription(
    conn: &Connection,
    id: &str,
) -> Result<Option<Subscription>, DbError> {
    let sql = format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = ? LIMIT 1");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([id])?;
    if let Some(row) = rows.next()? {
        Ok(Some(Subscription::from_row(row)?))
    } else {
        Ok(None)
    }
}

pub(crate) fn upsert_subscription(
    conn: &Connection,
    subscription: &Subscription,
) -> Result<(), DbError> {
    conn.execute(
        r#"
        INSERT OR REPLACE INTO subscriptions (
            id, resource, change_type, notification_url, client_secret, expires_at, state,
            created_at, lifetime_secs, renewal_attempts, next_renewal_at, last_error
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            subscription.id,
            subscription.resource,
            subscription.change_type.to_string(),
            subscription.notification_url,
            subscription.client_secret.expose(),
            subscription.expires_at.to_rfc3339(),
            subscription.state.to_string(),
            subscription.created_at.to_rfc3339(),
            subscription.lifetime.num_seconds(),
            i64::from(subscription.renewal_attempts),
            subscription.next_renewal_at.map(|at| at.to_rfc3339()),
            subscription.last_error,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::{Duration, TimeZone, Utc};
    use uuid::Uuid;

    use super::Database;
    use crate::db::models::{ChangeType, ClientSecret, Subscription, SubscriptionState};

    fn temp_db_path() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("mailwatch-test-{}.db", Uuid::new_v4()));
        path
    }

    fn sample_subscription(id: &str, state: SubscriptionState, minutes: i64) -> Subscription {
        let created_at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        Subscription {
            id: id.to_string(),
            resource: "/users/owner@example.com/mailFolders('Inbox')/messages".to_string(),
            change_type: ChangeType::created(),
            notification_url: "https://hooks.example.com/outlook-notify".to_string(),
            client_secret: ClientSecret::from_stored("s3cret-value"),
            expires_at: created_at + Duration::minutes(minutes),
            state,
            created_at,
            lifetime: Duration::minutes(60),
            renewal_attempts: 0,
            next_renewal_at: None,
            last_error: None,
        }
    }

    #[test]
    fn subscription_round_trips_through_sqlite() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");

        let mut subscription = sample_subscription("sub-1", SubscriptionState::RenewalDue, 60);
        subscription.renewal_attempts = 2;
        subscription.next_renewal_at = Some(subscription.created_at + Duration::minutes(55));
        subscription.last_error = Some("graph 503".to_string());
        db.upsert_subscription(&subscription)
            .expect("insert subscription");

        let loaded = db
            .get_subscription("sub-1")
            .expect("get subscription")
            .expect("subscription exists");
        assert_eq!(loaded, subscription);
        assert_eq!(loaded.client_secret.expose(), "s3cret-value");

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn list_filters_by_state_and_orders_by_expiry() {
        let db = Database::open_in_memory().expect("open db");
        db.upsert_subscription(&sample_subscription("late", SubscriptionState::Active, 90))
            .expect("insert");
        db.upsert_subscription(&sample_subscription("early", SubscriptionState::Active, 30))
            .expect("insert");
        db.upsert_subscription(&sample_subscription("dead", SubscriptionState::Failed, 10))
            .expect("insert");

        let active = db
            .list_subscriptions(Some(&[SubscriptionState::Active]))
            .expect("list active");
        let ids: Vec<_> = active.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);

        assert_eq!(db.list_subscriptions(None).expect("list all").len(), 3);
        assert!(db
            .list_subscriptions(Some(&[]))
            .expect("list none")
            .is_empty());
    }

    #[test]
    fn delete_reports_removed_rows() {
        let db = Database::open_in_memory().expect("open db");
        db.upsert_subscription(&sample_subscription("sub-1", SubscriptionState::Active, 60))
            .expect("insert");

        assert_eq!(db.delete_subscription("sub-1").expect("delete"), 1);
        assert_eq!(db.delete_subscription("sub-1").expect("delete again"), 0);
    }
}
