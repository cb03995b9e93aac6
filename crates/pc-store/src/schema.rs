use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 1;

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    // Checkpoint every ~400KB instead of the default ~4MB
    conn.pragma_update(None, "wal_autocheckpoint", 100)?;

    // In-memory and fresh databases legitimately fail this.
    if conn
        .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        .is_ok()
    {
        tracing::info!("startup WAL checkpoint complete");
    }

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS facts (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            predicate  TEXT NOT NULL,
            args       TEXT NOT NULL,
            polarity   TEXT NOT NULL CHECK (polarity IN ('positive', 'negative')),
            source     TEXT NOT NULL,
            timestamp  INTEGER NOT NULL,
            confidence REAL NOT NULL,
            UNIQUE (predicate, args, polarity)
        );

        CREATE TABLE IF NOT EXISTS gaps (
            seq         INTEGER PRIMARY KEY AUTOINCREMENT,
            gap_type    TEXT NOT NULL,
            description TEXT NOT NULL,
            context     TEXT NOT NULL DEFAULT '{}',
            priority    REAL NOT NULL,
            attempts    INTEGER NOT NULL DEFAULT 0,
            UNIQUE (gap_type, description)
        );

        CREATE TABLE IF NOT EXISTS cycles (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            cycle         INTEGER NOT NULL,
            timestamp     INTEGER NOT NULL,
            recorded_at   TEXT NOT NULL,
            input         TEXT NOT NULL,
            action        TEXT NOT NULL,
            response      TEXT NOT NULL,
            signal_vector TEXT NOT NULL,
            state_summary TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_facts_predicate ON facts(predicate);
        CREATE INDEX IF NOT EXISTS idx_cycles_action ON cycles(action);
        ",
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT value FROM metadata WHERE key = 'schema_version'")?;
    let version = stmt
        .query_row([], |row| {
            let v: String = row.get(0)?;
            Ok(v.parse::<i64>().unwrap_or(0))
        })
        .optional()?;
    Ok(version)
}
