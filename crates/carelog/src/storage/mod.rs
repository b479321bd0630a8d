//! Local record store for carelog.
//!
//! This module provides the durable on-device mapping of record id to
//! record, backed by `SQLite`, plus the small key-value meta area holding
//! the last-sync marker, the cached key descriptor, and the sync flag.
//!
//! The store exclusively owns the authoritative working copy on a device.
//! Mutations are synchronous and durable at return; replication to the
//! remote store is the sync engine's business and never affects local
//! durability. The subject index is recomputed from the store on read
//! rather than maintained by write-through observers.

pub mod migrations;
pub mod schema;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::crypto::KeyDescriptor;
use crate::error::{Error, Result};
use crate::record::{Record, SubjectIndex, UploadState};

/// Meta key for the wall-clock marker of the last completed sync.
const META_LAST_SYNC: &str = "lastSync";

/// Meta key for the cached key descriptor JSON.
const META_KEY: &str = "key";

/// Meta key for the remote-sync flag; `"true"` iff the device is linked.
const META_SYNCED: &str = "synced";

/// Durable on-device record store.
#[derive(Debug)]
pub struct LocalRecordStore {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Connection,
}

impl LocalRecordStore {
    /// Open or create a store database at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    /// Initializes the schema if this is a new database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema
    /// initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening database at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        // Enable WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        migrations::initialize_schema(&conn)?;

        info!("Database opened successfully at {}", path.display());
        Ok(Self { path, conn })
    }

    /// Create an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;

        migrations::initialize_schema(&conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn,
        })
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    // === Records ===

    /// Insert or replace a record.
    ///
    /// Durable at return. Callers that want the change replicated should
    /// request a sync afterwards; the sync outcome never affects local
    /// durability.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn put(&self, record: &Record) -> Result<()> {
        let payload = serde_json::to_string(&record.payload)?;
        self.conn.execute(
            r"
            INSERT OR REPLACE INTO records
                (record_id, subject_id, created_at, updated_at, payload, consented, uploaded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                record.record_id,
                record.subject_id,
                record.created_at,
                record.updated_at,
                payload,
                record.upload_state.consented,
                record.upload_state.uploaded_at,
            ],
        )?;
        debug!("Stored record {}", record.record_id);
        Ok(())
    }

    /// Get a record by its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get(&self, record_id: &str) -> Result<Option<Record>> {
        let result = self
            .conn
            .query_row(
                r"
                SELECT record_id, subject_id, created_at, updated_at, payload, consented, uploaded_at
                FROM records WHERE record_id = ?1
                ",
                [record_id],
                Self::row_to_record,
            )
            .optional()?;
        result.transpose()
    }

    /// Get every record, tombstones included, keyed by record id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn all(&self) -> Result<BTreeMap<String, Record>> {
        let mut stmt = self.conn.prepare(
            r"
            SELECT record_id, subject_id, created_at, updated_at, payload, consented, uploaded_at
            FROM records
            ",
        )?;

        let mut records = BTreeMap::new();
        let rows = stmt.query_map([], Self::row_to_record)?;
        for row in rows {
            let record = row??;
            records.insert(record.record_id.clone(), record);
        }
        Ok(records)
    }

    /// Soft-delete a record by tombstoning it.
    ///
    /// The row stays physically present with the tombstone subject id and a
    /// bumped `updated_at`, so the deletion wins last-writer-wins merges on
    /// other devices. Returns `false` if the record does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn delete(&self, record_id: &str) -> Result<bool> {
        let Some(mut record) = self.get(record_id)? else {
            return Ok(false);
        };
        record.tombstone();
        self.put(&record)?;
        debug!("Tombstoned record {}", record_id);
        Ok(true)
    }

    /// Count all records, tombstones included.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn count(&self) -> Result<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Compute the subject index from the current record set.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn subject_index(&self) -> Result<SubjectIndex> {
        let records = self.all()?;
        Ok(SubjectIndex::build(records.values()))
    }

    // === Upload relay support ===

    /// Records with consent whose last submission is missing or stale.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn needing_upload(&self) -> Result<Vec<Record>> {
        let mut stmt = self.conn.prepare(
            r"
            SELECT record_id, subject_id, created_at, updated_at, payload, consented, uploaded_at
            FROM records
            WHERE consented = 1 AND (uploaded_at IS NULL OR uploaded_at < updated_at)
            ORDER BY updated_at ASC
            ",
        )?;

        let mut records = Vec::new();
        let rows = stmt.query_map([], Self::row_to_record)?;
        for row in rows {
            records.push(row??);
        }
        Ok(records)
    }

    /// Pin a record's upload marker to the given revision.
    ///
    /// Guarded: if the record has been edited past `updated_at` since it
    /// was read, nothing is written and `false` is returned, so the edit
    /// stays eligible for the next export pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn mark_uploaded(&self, record_id: &str, updated_at: i64) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE records SET uploaded_at = ?1 WHERE record_id = ?2 AND updated_at = ?1",
            params![updated_at, record_id],
        )?;
        Ok(affected > 0)
    }

    /// Set the consent flag on every record.
    ///
    /// Granting clears the `uploaded_at` marker only on records that were
    /// opted out, so re-consent after an opt-out re-exports everything
    /// while a repeated grant changes nothing. Revoking leaves the markers
    /// (and anything already sent) untouched. Returns the number of
    /// records whose flag actually changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn set_consent_all(&self, consented: bool) -> Result<usize> {
        let affected = if consented {
            self.conn.execute(
                "UPDATE records SET consented = 1, uploaded_at = NULL WHERE consented = 0",
                [],
            )?
        } else {
            self.conn
                .execute("UPDATE records SET consented = 0 WHERE consented = 1", [])?
        };
        info!(
            "Consent {} on {} records",
            if consented { "granted" } else { "revoked" },
            affected
        );
        Ok(affected)
    }

    // === Meta ===

    /// Get the wall-clock marker of the last completed sync, if any.
    ///
    /// Display only; the marker plays no role in merging.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn last_sync(&self) -> Result<Option<String>> {
        self.meta_get(META_LAST_SYNC)
    }

    /// Record the current wall clock as the last-sync marker.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn set_last_sync_now(&self) -> Result<()> {
        self.meta_set(META_LAST_SYNC, &Utc::now().to_rfc3339())
    }

    /// Get the locally cached key descriptor, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails or the cached
    /// descriptor does not parse.
    pub fn key_descriptor(&self) -> Result<Option<KeyDescriptor>> {
        match self.meta_get(META_KEY)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Cache a key descriptor locally.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn set_key_descriptor(&self, descriptor: &KeyDescriptor) -> Result<()> {
        self.meta_set(META_KEY, &serde_json::to_string(descriptor)?)
    }

    /// Whether this device is linked to a remote account.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn sync_enabled(&self) -> Result<bool> {
        Ok(self.meta_get(META_SYNCED)?.as_deref() == Some("true"))
    }

    /// Mark this device as linked to a remote account.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn enable_sync(&self) -> Result<()> {
        self.meta_set(META_SYNCED, "true")
    }

    /// Unlink this device: clears the sync flag, the last-sync marker, and
    /// the cached key descriptor. Records are left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn disable_sync(&self) -> Result<()> {
        self.meta_delete(META_SYNCED)?;
        self.meta_delete(META_LAST_SYNC)?;
        self.meta_delete(META_KEY)?;
        Ok(())
    }

    fn meta_get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn meta_delete(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM meta WHERE key = ?1", [key])?;
        Ok(())
    }

    /// Convert a database row to a Record.
    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<Result<Record>> {
        let record_id: String = row.get(0)?;
        let subject_id: String = row.get(1)?;
        let created_at: i64 = row.get(2)?;
        let updated_at: i64 = row.get(3)?;
        let payload_raw: String = row.get(4)?;
        let consented: bool = row.get(5)?;
        let uploaded_at: Option<i64> = row.get(6)?;

        Ok(serde_json::from_str(&payload_raw)
            .map_err(Error::from)
            .map(|payload| Record {
                record_id,
                subject_id,
                created_at,
                updated_at,
                payload,
                upload_state: UploadState {
                    consented,
                    uploaded_at,
                },
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TOMBSTONE;
    use serde_json::json;

    fn create_test_store() -> LocalRecordStore {
        LocalRecordStore::open_in_memory().expect("failed to create test store")
    }

    fn create_test_record(subject: &str) -> Record {
        let mut record = Record::new(subject);
        record.set_field("examiner_name", json!("Dr. Example"));
        record.set_field("symptom_number", json!(4));
        record
    }

    #[test]
    fn test_open_in_memory() {
        let store = LocalRecordStore::open_in_memory();
        assert!(store.is_ok());
    }

    #[test]
    fn test_put_and_get() {
        let store = create_test_store();
        let record = create_test_record("s1");

        store.put(&record).unwrap();
        let retrieved = store.get(&record.record_id).unwrap().unwrap();
        assert_eq!(retrieved, record);
    }

    #[test]
    fn test_put_replaces() {
        let store = create_test_store();
        let mut record = create_test_record("s1");
        store.put(&record).unwrap();

        record.set_field("symptom_number", json!(9));
        store.put(&record).unwrap();

        assert_eq!(store.count().unwrap(), 1);
        let retrieved = store.get(&record.record_id).unwrap().unwrap();
        assert_eq!(retrieved.field("symptom_number"), Some(&json!(9)));
    }

    #[test]
    fn test_get_nonexistent() {
        let store = create_test_store();
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_all() {
        let store = create_test_store();
        let a = create_test_record("s1");
        let b = create_test_record("s2");
        store.put(&a).unwrap();
        store.put(&b).unwrap();

        let all = store.all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[&a.record_id], a);
        assert_eq!(all[&b.record_id], b);
    }

    #[test]
    fn test_delete_tombstones() {
        let store = create_test_store();
        let record = create_test_record("s1");
        store.put(&record).unwrap();

        assert!(store.delete(&record.record_id).unwrap());

        // Still physically present so the deletion can propagate.
        let stored = store.get(&record.record_id).unwrap().unwrap();
        assert_eq!(stored.subject_id, TOMBSTONE);
        assert!(stored.updated_at > record.updated_at);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_delete_nonexistent() {
        let store = create_test_store();
        assert!(!store.delete("missing").unwrap());
    }

    #[test]
    fn test_subject_index_excludes_tombstones() {
        let store = create_test_store();
        let kept = create_test_record("s1");
        let dropped = create_test_record("s1");
        store.put(&kept).unwrap();
        store.put(&dropped).unwrap();
        store.delete(&dropped.record_id).unwrap();

        let index = store.subject_index().unwrap();
        assert_eq!(index.records_for("s1"), [kept.record_id.clone()]);
    }

    #[test]
    fn test_subject_index_orders_by_created_at() {
        let store = create_test_store();
        let mut first = create_test_record("s1");
        let mut second = create_test_record("s1");
        first.created_at = 100;
        second.created_at = 200;
        // Insert out of order
        store.put(&second).unwrap();
        store.put(&first).unwrap();

        let index = store.subject_index().unwrap();
        assert_eq!(
            index.records_for("s1"),
            [first.record_id.clone(), second.record_id.clone()]
        );
    }

    #[test]
    fn test_needing_upload_empty_without_consent() {
        let store = create_test_store();
        store.put(&create_test_record("s1")).unwrap();
        assert!(store.needing_upload().unwrap().is_empty());
    }

    #[test]
    fn test_needing_upload_flow() {
        let store = create_test_store();
        let mut record = create_test_record("s1");
        record.upload_state.consented = true;
        store.put(&record).unwrap();

        let pending = store.needing_upload().unwrap();
        assert_eq!(pending.len(), 1);

        record.mark_uploaded();
        store.put(&record).unwrap();
        assert!(store.needing_upload().unwrap().is_empty());

        // An edit advances updated_at past the marker.
        record.set_field("notes", json!("recheck"));
        store.put(&record).unwrap();
        assert_eq!(store.needing_upload().unwrap().len(), 1);
    }

    #[test]
    fn test_mark_uploaded_pins_current_revision() {
        let store = create_test_store();
        let mut record = create_test_record("s1");
        record.upload_state.consented = true;
        store.put(&record).unwrap();

        assert!(store
            .mark_uploaded(&record.record_id, record.updated_at)
            .unwrap());
        let stored = store.get(&record.record_id).unwrap().unwrap();
        assert_eq!(stored.upload_state.uploaded_at, Some(record.updated_at));
    }

    #[test]
    fn test_mark_uploaded_skips_edited_record() {
        let store = create_test_store();
        let mut record = create_test_record("s1");
        record.upload_state.consented = true;
        store.put(&record).unwrap();
        let snapshot = record.updated_at;

        // The record moves on while the export is in flight.
        record.set_field("symptom_number", json!(9));
        store.put(&record).unwrap();

        assert!(!store.mark_uploaded(&record.record_id, snapshot).unwrap());
        let stored = store.get(&record.record_id).unwrap().unwrap();
        assert!(stored.upload_state.uploaded_at.is_none());
        assert_eq!(store.needing_upload().unwrap().len(), 1);
    }

    #[test]
    fn test_grant_consent_clears_markers() {
        let store = create_test_store();
        let mut record = create_test_record("s1");
        record.upload_state.consented = true;
        record.mark_uploaded();
        store.put(&record).unwrap();

        store.set_consent_all(false).unwrap();
        assert!(store.needing_upload().unwrap().is_empty());

        // Opting back in wipes uploaded_at so everything re-exports.
        store.set_consent_all(true).unwrap();
        let pending = store.needing_upload().unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].upload_state.uploaded_at.is_none());
    }

    #[test]
    fn test_repeated_grant_keeps_markers() {
        let store = create_test_store();
        let mut record = create_test_record("s1");
        record.upload_state.consented = true;
        record.mark_uploaded();
        store.put(&record).unwrap();

        // Granting again without an intervening opt-out is a no-op, so
        // already-exported records are not re-submitted.
        assert_eq!(store.set_consent_all(true).unwrap(), 0);
        assert!(store.needing_upload().unwrap().is_empty());
        let stored = store.get(&record.record_id).unwrap().unwrap();
        assert_eq!(stored.upload_state.uploaded_at, record.upload_state.uploaded_at);
    }

    #[test]
    fn test_revoke_consent_keeps_markers() {
        let store = create_test_store();
        let mut record = create_test_record("s1");
        record.upload_state.consented = true;
        record.mark_uploaded();
        let marker = record.upload_state.uploaded_at;
        store.put(&record).unwrap();

        store.set_consent_all(false).unwrap();
        let stored = store.get(&record.record_id).unwrap().unwrap();
        assert!(!stored.upload_state.consented);
        assert_eq!(stored.upload_state.uploaded_at, marker);
    }

    #[test]
    fn test_last_sync_marker() {
        let store = create_test_store();
        assert!(store.last_sync().unwrap().is_none());

        store.set_last_sync_now().unwrap();
        assert!(store.last_sync().unwrap().is_some());
    }

    #[test]
    fn test_key_descriptor_cache() {
        let store = create_test_store();
        assert!(store.key_descriptor().unwrap().is_none());

        let descriptor = KeyDescriptor::generate();
        store.set_key_descriptor(&descriptor).unwrap();
        assert_eq!(store.key_descriptor().unwrap(), Some(descriptor));
    }

    #[test]
    fn test_sync_flag_lifecycle() {
        let store = create_test_store();
        assert!(!store.sync_enabled().unwrap());

        store.enable_sync().unwrap();
        assert!(store.sync_enabled().unwrap());

        store.set_last_sync_now().unwrap();
        store.set_key_descriptor(&KeyDescriptor::generate()).unwrap();

        store.disable_sync().unwrap();
        assert!(!store.sync_enabled().unwrap());
        assert!(store.last_sync().unwrap().is_none());
        assert!(store.key_descriptor().unwrap().is_none());
    }

    #[test]
    fn test_open_file_based() {
        let temp_dir = std::env::temp_dir();
        let db_path = temp_dir.join(format!("carelog_test_{}.db", std::process::id()));

        let record = create_test_record("s1");
        {
            let store = LocalRecordStore::open(&db_path).unwrap();
            store.put(&record).unwrap();
            assert_eq!(store.path(), db_path);
        }

        // Durable across reopen.
        let store = LocalRecordStore::open(&db_path).unwrap();
        assert_eq!(store.get(&record.record_id).unwrap(), Some(record));

        drop(store);
        let _ = std::fs::remove_file(&db_path);
        let _ = std::fs::remove_file(db_path.with_extension("db-wal"));
        let _ = std::fs::remove_file(db_path.with_extension("db-shm"));
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let temp_dir = std::env::temp_dir();
        let nested_path = temp_dir.join(format!(
            "carelog_test_{}/nested/db.sqlite",
            std::process::id()
        ));

        if let Some(parent) = nested_path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }

        let store = LocalRecordStore::open(&nested_path).unwrap();
        assert!(nested_path.exists());

        drop(store);
        if let Some(parent) = nested_path.parent() {
            let _ = std::fs::remove_dir_all(parent.parent().unwrap());
        }
    }

    #[test]
    fn test_unicode_payload() {
        let store = create_test_store();
        let mut record = create_test_record("s1");
        record.set_field("notes", json!("Hello 世界 🌍 مرحبا"));
        store.put(&record).unwrap();

        let retrieved = store.get(&record.record_id).unwrap().unwrap();
        assert_eq!(retrieved.field("notes"), Some(&json!("Hello 世界 🌍 مرحبا")));
    }
}
