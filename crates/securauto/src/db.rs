//! SQLite connection setup and schema migrations
//!
//! The document store keeps every collection in a single `documents` table.
//! Migrations are embedded in the binary and tracked in `schema_migrations`.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use tracing::{debug, info};

/// Embedded migrations, applied in order
const MIGRATIONS: &[(&str, &str)] = &[(
    "001_initial_schema",
    include_str!("../db/migrations/001_initial_schema.sql"),
)];

/// Open the database at the given path, running any pending migrations
pub fn init_db(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }
    }

    let conn = Connection::open(db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

    let count = run_migrations(&conn)?;
    if count > 0 {
        info!(count = count, path = %db_path.display(), "Applied migrations");
    }

    Ok(conn)
}

/// Open a throwaway in-memory database with the schema applied
#[cfg(test)]
pub fn init_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
    run_migrations(&conn)?;
    Ok(conn)
}

/// Run pending migrations, returning how many were applied
pub fn run_migrations(conn: &Connection) -> Result<usize> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )
    .context("Failed to create schema_migrations table")?;

    let mut applied = 0;

    for (version, sql) in MIGRATIONS {
        let already_applied: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?1",
            [version],
            |row| row.get(0),
        )?;

        if already_applied {
            continue;
        }

        conn.execute_batch(sql)
            .with_context(|| format!("Failed to apply migration: {}", version))?;

        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            [version],
        )?;

        debug!(version = %version, "Applied migration");
        applied += 1;
    }

    Ok(applied)
}
