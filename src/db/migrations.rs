use rusqlite::{params, Connection, OptionalExtension};

use crate::db::{schema, DbError};

const SCHEMA_VERSION_KEY: &str = "schema_version";

struct Migration {
    version: u32,
    apply: fn(&Connection) -> rusqlite::Result<()>,
}

/// Ordered, forward-only. Each step commits together with its version bump.
const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    apply: schema::create_schema,
}];

fn latest_version() -> u32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

pub fn migrate(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );
        "#,
    )?;

    let current = current_schema_version(conn)?;
    let latest = latest_version();
    if current > latest {
        return Err(DbError::Config(format!(
            "database schema version {current} is newer than supported version {latest}"
        )));
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn.unchecked_transaction()?;
        (migration.apply)(&tx)?;
        tx.execute(
            r#"
            INSERT INTO sync_state (key, value, updated_at)
            VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![SCHEMA_VERSION_KEY, migration.version.to_string()],
        )?;
        tx.commit()?;
        tracing::debug!(version = migration.version, "applied schema migration");
    }

    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<u32, DbError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM sync_state WHERE key = ?1",
            params![SCHEMA_VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;

    match raw {
        None => Ok(0),
        Some(version) => version
            .parse::<u32>()
            .map_err(|_| DbError::Config(format!("invalid schema version in database: {version}"))),
    }
}
