use anyhow::Result;
use rusqlite::Connection;

pub fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS subscriptions (
            id TEXT PRIMARY KEY,
            resource TEXT NOT NULL,
            change_type TEXT NOT NULL,
            notification_url TEXT NOT NULL,
            client_secret TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            state TEXT NOT NULL CHECK(state IN (
                'pending', 'active', 'renewal_due', 'renewing', 'expired', 'failed'
            )),
            created_at TEXT NOT NULL,
            lifetime_secs INTEGER NOT NULL,
            renewal_attempts INTEGER NOT NULL DEFAULT 0,
            next_renewal_at TEXT,
            last_error TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_subscriptions_state ON subscriptions(state);
        CREATE INDEX IF NOT EXISTS idx_subscriptions_target ON subscriptions(resource, change_type);
        "#,
    )?;

    Ok(())
}
