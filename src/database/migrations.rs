// Database migrations for the speaker store
// Creates and updates the database schema

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Current schema version
const SCHEMA_VERSION: i32 = 1;

/// Run all necessary migrations to bring the database up to date
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Get the current schema version from the database
fn get_schema_version(conn: &Connection) -> Result<i32> {
    let table_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(false);

    if !table_exists {
        return Ok(0);
    }

    let version: i32 = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

/// Initial schema creation (version 1)
fn migrate_v1(conn: &Connection) -> Result<()> {
    log::info!("Running database migration v1");

    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Speakers: one row per voice identity. `deleting` marks a tombstone
        -- left behind while files are being removed.
        CREATE TABLE IF NOT EXISTS speakers (
            name TEXT PRIMARY KEY NOT NULL,
            created_at TEXT NOT NULL,
            trained INTEGER NOT NULL DEFAULT 0,
            trained_at TEXT,
            deleting INTEGER NOT NULL DEFAULT 0
        );

        -- Audio samples in upload order
        CREATE TABLE IF NOT EXISTS audio_samples (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            speaker_name TEXT NOT NULL,
            position INTEGER NOT NULL,
            storage_path TEXT NOT NULL,
            original_path TEXT NOT NULL,
            duration REAL NOT NULL,
            sample_rate INTEGER NOT NULL,
            uploaded_at TEXT NOT NULL,
            transcript TEXT,
            FOREIGN KEY (speaker_name) REFERENCES speakers(name) ON DELETE CASCADE,
            UNIQUE (speaker_name, position)
        );

        CREATE INDEX IF NOT EXISTS idx_audio_samples_speaker
        ON audio_samples(speaker_name, position);

        -- Trained model artifacts, at most one record per speaker
        CREATE TABLE IF NOT EXISTS model_info (
            speaker_name TEXT PRIMARY KEY NOT NULL,
            method TEXT NOT NULL,
            gpt_model_path TEXT NOT NULL,
            sovits_model_path TEXT NOT NULL,
            exp_dir TEXT NOT NULL,
            model_dir TEXT NOT NULL,
            sample_count INTEGER NOT NULL,
            s1_epochs INTEGER NOT NULL,
            s2_epochs INTEGER NOT NULL,
            trained_at TEXT NOT NULL,
            FOREIGN KEY (speaker_name) REFERENCES speakers(name) ON DELETE CASCADE
        );
        "#,
    )
    .context("Failed to create speaker schema")?;

    conn.execute(
        "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )
    .context("Failed to record schema version")?;

    Ok(())
}
