//! `SQLite` schema definitions for carelog.
//!
//! This module contains the SQL statements for creating and managing
//! the database schema.

/// SQL statement to create the records table.
///
/// The payload column holds the schema-free clinical field map as JSON;
/// consent/upload tracking lives in dedicated columns so the upload relay
/// can select eligible records without decoding payloads.
pub const CREATE_RECORDS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS records (
    record_id TEXT PRIMARY KEY,
    subject_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    payload TEXT NOT NULL,
    consented INTEGER NOT NULL DEFAULT 0,
    uploaded_at INTEGER
)
";

/// SQL statement to create an index for per-subject listing.
pub const CREATE_SUBJECT_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_records_subject ON records(subject_id, created_at)
";

/// SQL statement to create an index on `updated_at` for merge scans.
pub const CREATE_UPDATED_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_records_updated ON records(updated_at)
";

/// SQL statement to create the meta table for storing key-value pairs
/// (`lastSync`, the cached key descriptor, the `synced` flag, schema version).
pub const CREATE_META_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_RECORDS_TABLE,
    CREATE_SUBJECT_INDEX,
    CREATE_UPDATED_INDEX,
    CREATE_META_TABLE,
];
