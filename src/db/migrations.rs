use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::schema;

const SCHEMA_VERSION_KEY: &str = "schema_version";

type Migration = fn(&Connection) -> Result<()>;

/// Ordered migrations; entry `n` upgrades the schema to version `n + 1`.
const MIGRATIONS: &[Migration] = &[apply_v1];

pub fn latest_version() -> u32 {
    MIGRATIONS.len() as u32
}

pub fn migrate(conn: &Connection) -> Result<()> {
    ensure_sync_state_table(conn)?;

    let current = current_schema_version(conn)?;
    let latest = latest_version();
    if current > latest {
        return Err(anyhow!(
            "database schema version {current} is newer than supported version {latest}"
        ));
    }

    for (index, migration) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        let version = index as u32 + 1;
        let tx = conn
            .unchecked_transaction()
            .with_context(|| format!("begin migration to v{version}"))?;
        migration(&tx).with_context(|| format!("apply schema migration v{version}"))?;
        set_schema_version(&tx, version)?;
        tx.commit()
            .with_context(|| format!("commit migration to v{version}"))?;
    }

    Ok(())
}

fn ensure_sync_state_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );
        "#,
    )
    .context("ensure sync_state table for migration tracking")?;

    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<u32> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM sync_state WHERE key = ?1 LIMIT 1",
            params![SCHEMA_VERSION_KEY],
            |row| row.get(0),
        )
        .optional()
        .context("read current schema version from sync_state")?;

    raw.map_or(Ok(0), |version| {
        version
            .parse::<u32>()
            .with_context(|| format!("invalid schema version in database: {version}"))
    })
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO sync_state (key, value, updated_at)
        VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at
        "#,
        params![SCHEMA_VERSION_KEY, version.to_string()],
    )
    .with_context(|| format!("set schema version to {version}"))?;

    Ok(())
}

fn apply_v1(conn: &Connection) -> Result<()> {
    schema::create_schema(conn)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use rusqlite::Connection;

    use super::{current_schema_version, latest_version, migrate};

    #[test]
    fn migrate_brings_fresh_database_to_latest() -> Result<()> {
        let conn = Connection::open_in_memory()?;

        migrate(&conn)?;
        assert_eq!(current_schema_version(&conn)?, latest_version());

        let tables: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'subscriptions'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(tables, 1);
        Ok(())
    }

    #[test]
    fn migrate_is_idempotent() -> Result<()> {
        let conn = Connection::open_in_memory()?;

        migrate(&conn)?;
        migrate(&conn)?;
        assert_eq!(current_schema_version(&conn)?, latest_version());
        Ok(())
    }

    #[test]
    fn migrate_refuses_newer_schema() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        conn.execute(
            "UPDATE sync_state SET value = '99' WHERE key = 'schema_version'",
            [],
        )?;

        assert!(migrate(&conn).is_err());
        Ok(())
    }
}
