//! Core record types for carelog.
//!
//! This module defines the fundamental data structures for representing
//! one clinical test instance and the derived per-subject index.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved subject id marking a record as soft-deleted.
///
/// Tombstoned records are excluded from the subject index but still
/// participate in sync, so a deletion propagates to other devices instead
/// of being treated as "missing".
pub const TOMBSTONE: &str = "deleted";

/// Consent and delivery state for the one-way upload relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadState {
    /// Whether the examiner has consented to export of this record.
    pub consented: bool,
    /// The `updated_at` value the record carried when it was last submitted,
    /// or `None` if it has never been submitted.
    pub uploaded_at: Option<i64>,
}

/// One clinical test instance.
///
/// The payload is schema-free from the store's point of view: a flat mapping
/// of field name to JSON value holding every clinical input the assessment
/// wizards write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Opaque unique identifier, assigned at creation and never reused.
    pub record_id: String,

    /// Identifies the patient. Mutable only to [`TOMBSTONE`].
    pub subject_id: String,

    /// Logical creation timestamp in epoch milliseconds. Immutable.
    pub created_at: i64,

    /// Logical timestamp advanced on every field mutation; the sole
    /// conflict-resolution key during sync.
    pub updated_at: i64,

    /// All clinical inputs, field name to value.
    #[serde(default)]
    pub payload: Map<String, Value>,

    /// Consent and delivery state for the upload relay.
    #[serde(default)]
    pub upload_state: UploadState,
}

/// Current wall clock in epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl Record {
    /// Create a new record for the given subject with a fresh id.
    #[must_use]
    pub fn new(subject_id: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            record_id: uuid::Uuid::new_v4().to_string(),
            subject_id: subject_id.into(),
            created_at: now,
            updated_at: now,
            payload: Map::new(),
            upload_state: UploadState::default(),
        }
    }

    /// Set a payload field and advance `updated_at`.
    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        self.payload.insert(name.into(), value);
        self.touch();
    }

    /// Get a payload field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Advance `updated_at`.
    ///
    /// `updated_at` must be monotonically non-decreasing for a single writer,
    /// and an edit must make the record strictly newer than its own
    /// `uploaded_at` marker even within the same millisecond.
    pub fn touch(&mut self) {
        self.updated_at = now_millis().max(self.updated_at + 1);
    }

    /// Soft-delete this record by moving it to the tombstone subject.
    pub fn tombstone(&mut self) {
        self.subject_id = TOMBSTONE.to_string();
        self.touch();
    }

    /// Check whether this record has been soft-deleted.
    #[must_use]
    pub fn is_tombstoned(&self) -> bool {
        self.subject_id == TOMBSTONE
    }

    /// Check whether the upload relay should submit this record:
    /// consent given, and never submitted or edited since last submission.
    #[must_use]
    pub fn needs_upload(&self) -> bool {
        self.upload_state.consented
            && self
                .upload_state
                .uploaded_at
                .map_or(true, |at| at < self.updated_at)
    }

    /// Record a delivery attempt by pinning `uploaded_at` to `updated_at`.
    pub fn mark_uploaded(&mut self) {
        self.upload_state.uploaded_at = Some(self.updated_at);
    }
}

/// Derived index grouping records by subject.
///
/// Maps `subject_id` to record ids ascending by `created_at`, excluding
/// tombstoned records. Never persisted; always recomputed from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectIndex {
    groups: BTreeMap<String, Vec<String>>,
}

impl SubjectIndex {
    /// Build the index from a set of records.
    #[must_use]
    pub fn build<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a Record>,
    {
        let mut sortable: BTreeMap<String, Vec<(i64, String)>> = BTreeMap::new();
        for record in records {
            if record.is_tombstoned() {
                continue;
            }
            sortable
                .entry(record.subject_id.clone())
                .or_default()
                .push((record.created_at, record.record_id.clone()));
        }

        let groups = sortable
            .into_iter()
            .map(|(subject, mut entries)| {
                entries.sort();
                let ids = entries.into_iter().map(|(_, id)| id).collect();
                (subject, ids)
            })
            .collect();

        Self { groups }
    }

    /// Record ids for one subject, ascending by creation time.
    #[must_use]
    pub fn records_for(&self, subject_id: &str) -> &[String] {
        self.groups.get(subject_id).map_or(&[], Vec::as_slice)
    }

    /// All indexed subject ids.
    pub fn subjects(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Number of indexed subjects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Check whether the index contains no subjects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
