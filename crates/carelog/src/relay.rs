//! Consent-gated export relay.
//!
//! Records whose owner has opted in are forwarded, de-identified, to an
//! external form endpoint as a single URL-encoded JSON query parameter.
//! Submission is fire-and-forget: the endpoint gives no usable response,
//! so a record is marked exported once the request has been attempted,
//! and a later edit makes it eligible again.

use std::sync::{Mutex, PoisonError};

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::record::Record;
use crate::storage::LocalRecordStore;

/// Payload fields that may leave the device. Everything else is dropped.
const EXPORT_FIELDS: &[&str] = &[
    "test_type",
    "symptom_number",
    "symptom_severity",
    "orientation",
    "immediate_memory",
    "concentration",
    "delayed_recall",
    "balance_errors",
];

/// Payload field carrying the examiner's name; exported as a hash so
/// exports from the same examiner correlate without identifying them.
const EXAMINER_FIELD: &str = "examiner_name";

/// Relay submitting consented records to the export endpoint.
#[derive(Debug, Clone)]
pub struct UploadRelay {
    client: reqwest::Client,
    endpoint: reqwest::Url,
    entry_field: String,
    enabled: bool,
}

impl UploadRelay {
    /// Create a relay from the relay configuration section.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigValidation`] if the endpoint URL does not
    /// parse.
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let endpoint = reqwest::Url::parse(&config.endpoint_url).map_err(|e| {
            Error::ConfigValidation {
                message: format!("relay.endpoint_url is not a valid URL: {e}"),
            }
        })?;
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
            entry_field: config.entry_field.clone(),
            enabled: config.enabled,
        })
    }

    /// Submit every consented record whose last export is missing or
    /// stale. Returns the number of records submitted.
    ///
    /// Endpoint failures are logged and swallowed; each attempted record
    /// is marked exported either way. The marker is pinned with a guarded
    /// update keyed on the snapshot's `updated_at`, so a record edited
    /// while its request was in flight keeps the edit and stays pending.
    ///
    /// # Errors
    ///
    /// Returns an error only if the local store cannot be read or
    /// updated.
    pub async fn flush(&self, store: &Mutex<LocalRecordStore>) -> Result<usize> {
        if !self.enabled {
            debug!("Relay disabled; skipping export");
            return Ok(0);
        }

        let pending = self.lock(store).needing_upload()?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut submitted = 0;
        for record in pending {
            let url = self.submission_url(&record)?;
            match self.client.get(url).send().await {
                Ok(_) => debug!("Exported record {}", record.record_id),
                // The endpoint gives no usable response anyway.
                Err(e) => debug!("Export of {} not confirmed: {}", record.record_id, e),
            }
            if !self
                .lock(store)
                .mark_uploaded(&record.record_id, record.updated_at)?
            {
                debug!(
                    "Record {} changed during export; left pending",
                    record.record_id
                );
            }
            submitted += 1;
        }

        info!("Relay flushed {} records", submitted);
        Ok(submitted)
    }

    /// Build the submission URL for one record.
    fn submission_url(&self, record: &Record) -> Result<reqwest::Url> {
        let payload = serde_json::to_string(&export_payload(record))?;
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair(&self.entry_field, &payload)
            .append_pair("submit", "Submit");
        Ok(url)
    }

    fn lock<'a>(
        &self,
        store: &'a Mutex<LocalRecordStore>,
    ) -> std::sync::MutexGuard<'a, LocalRecordStore> {
        store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The de-identified field subset exported for one record.
///
/// Carries the record id and timestamps, the allow-listed assessment
/// fields, and a hash of the examiner name. Subject ids and free-text
/// fields never leave the device.
#[must_use]
pub fn export_payload(record: &Record) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("record_id".to_string(), json!(record.record_id));
    payload.insert("created_at".to_string(), json!(record.created_at));
    payload.insert("updated_at".to_string(), json!(record.updated_at));

    for field in EXPORT_FIELDS {
        if let Some(value) = record.field(field) {
            payload.insert((*field).to_string(), value.clone());
        }
    }

    if let Some(Value::String(name)) = record.field(EXAMINER_FIELD) {
        let digest = blake3::hash(name.as_bytes());
        payload.insert(EXAMINER_FIELD.to_string(), json!(digest.to_hex().as_str()));
    }

    payload
}
