//! Sync engine: merges the remote record set into the local store and
//! pushes the merged full state back, encrypted.
//!
//! Conflict resolution is last-writer-wins per record on `updated_at`,
//! with ties keeping the local copy. The push always carries the complete
//! merged set, so a sync against an empty or stale remote is
//! self-healing, and pushing twice with no intervening edits writes an
//! identical blob.
//!
//! One [`SyncSession`] exists per linked device. Its internal state sits
//! behind an async mutex, so concurrent sync requests serialize instead
//! of racing the remote; callers that just want "a sync soon" go through
//! [`SyncHandle`], which coalesces bursts of requests.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::crypto;
use crate::error::{Error, Result};
use crate::identity::{IdentityProvider, UserIdentity};
use crate::keys::{KeyManager, LoadedKey};
use crate::record::Record;
use crate::remote::{BlobStore, DATA_BLOB, KEY_BLOB};
use crate::storage::LocalRecordStore;

/// Per-session state serialized behind the async mutex.
struct SessionState {
    blobs: Box<dyn BlobStore>,
    keys: KeyManager,
    user: Option<UserIdentity>,
}

/// A device's connection to the remote store.
pub struct SyncSession {
    store: Arc<std::sync::Mutex<LocalRecordStore>>,
    provider: Box<dyn IdentityProvider>,
    state: tokio::sync::Mutex<SessionState>,
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession").finish_non_exhaustive()
    }
}

impl SyncSession {
    /// Create a session over the given store, identity provider, and
    /// remote blob store.
    #[must_use]
    pub fn new(
        store: Arc<std::sync::Mutex<LocalRecordStore>>,
        provider: Box<dyn IdentityProvider>,
        blobs: Box<dyn BlobStore>,
    ) -> Self {
        Self {
            store,
            provider,
            state: tokio::sync::Mutex::new(SessionState {
                blobs,
                keys: KeyManager::new(),
                user: None,
            }),
        }
    }

    /// The local store this session syncs.
    #[must_use]
    pub fn store(&self) -> &Arc<std::sync::Mutex<LocalRecordStore>> {
        &self.store
    }

    /// Link this device: sign in, mark sync enabled, and run an initial
    /// full sync. Returns the signed-in identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] if sign-in fails, and any sync error from
    /// the initial exchange.
    pub async fn link(&self) -> Result<UserIdentity> {
        let user = {
            let mut state = self.state.lock().await;
            self.connect_user(&mut state).await?
        };
        self.local().enable_sync()?;
        info!("Linked device as {}", user.email);

        self.sync().await?;
        Ok(user)
    }

    /// Unlink this device: best-effort delete of the remote blobs, then
    /// clear the sync flag, the cached key, and the cached credential.
    /// Local records stay put.
    ///
    /// # Errors
    ///
    /// Returns an error only if the local store cannot be updated; remote
    /// deletion failures are logged and swallowed.
    pub async fn unlink(&self) -> Result<()> {
        let mut state = self.state.lock().await;

        if let Ok(user) = self.connect_user(&mut state).await {
            for blob in [DATA_BLOB, KEY_BLOB] {
                if let Err(e) = state.blobs.delete(&user.bearer_token, blob).await {
                    warn!("Could not delete remote blob '{}': {}", blob, e);
                }
            }
        } else {
            warn!("Unlinking without a usable credential; remote blobs left behind");
        }

        state.keys.forget();
        state.user = None;
        self.local().disable_sync()?;
        info!("Device unlinked");
        Ok(())
    }

    /// Run one full sync: pull the remote record set, merge it in, and
    /// push the merged state back.
    ///
    /// Returns `false` without touching the remote if the device is not
    /// linked. Concurrent calls serialize; each waiter runs its own full
    /// exchange once the one in flight finishes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] if no usable credential can be obtained,
    /// [`Error::Integrity`] if the remote data cannot be authenticated or
    /// parsed, and [`Error::Network`] on transport failure.
    pub async fn sync(&self) -> Result<bool> {
        if !self.local().sync_enabled()? {
            debug!("Sync requested but device is not linked; skipping");
            return Ok(false);
        }

        let mut guard = self.state.lock().await;
        // Reborrow so keys and blobs can be borrowed disjointly below.
        let state = &mut *guard;
        let user = self.connect_user(state).await?;
        let token = user.bearer_token.clone();

        let key = state
            .keys
            .get_key(&self.store, state.blobs.as_mut(), &token)
            .await?;

        if let Some(raw) = state.blobs.get(&token, DATA_BLOB).await? {
            let remote = decode_record_set(&raw, &key)?;
            let adopted = self.adopt_remote(&remote)?;
            debug!("Merged {} remote records, adopted {}", remote.len(), adopted);
        } else {
            debug!("No remote data blob yet; first push");
        }

        let merged = self.local().all()?;
        let body = encode_record_set(&merged, &key)?;
        state.blobs.set(&token, DATA_BLOB, &body).await?;

        self.local().set_last_sync_now()?;
        info!("Sync complete; {} records", merged.len());
        Ok(true)
    }

    /// Return the cached credential if still usable, otherwise run the
    /// provider's sign-in flow.
    async fn connect_user(&self, state: &mut SessionState) -> Result<UserIdentity> {
        if let Some(user) = &state.user {
            if user.is_usable() {
                return Ok(user.clone());
            }
            debug!("Cached credential expired; signing in again");
        }

        let user = self.provider.sign_in().await?;
        if !user.is_usable() {
            return Err(Error::auth("sign-in produced an expired credential"));
        }
        state.user = Some(user.clone());
        Ok(user)
    }

    /// Merge remote records into the local store. A remote record is
    /// adopted when it is absent locally or strictly newer; ties keep the
    /// local copy.
    fn adopt_remote(&self, remote: &BTreeMap<String, Record>) -> Result<usize> {
        let store = self.local();
        let mut adopted = 0;
        for (record_id, remote_record) in remote {
            let newer = match store.get(record_id)? {
                Some(local) => remote_record.updated_at > local.updated_at,
                None => true,
            };
            if newer {
                store.put(remote_record)?;
                adopted += 1;
            }
        }
        Ok(adopted)
    }

    fn local(&self) -> std::sync::MutexGuard<'_, LocalRecordStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Decrypt and parse the remote data blob into a record set.
fn decode_record_set(raw: &[u8], key: &LoadedKey) -> Result<BTreeMap<String, Record>> {
    let ciphertext: Vec<u8> = serde_json::from_slice(raw)
        .map_err(|e| Error::integrity(format!("remote data blob is malformed: {e}")))?;
    let plaintext = crypto::decrypt(&key.params, &key.key, &ciphertext)?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| Error::integrity(format!("decrypted record set is malformed: {e}")))
}

/// Serialize and encrypt a record set into the data blob body.
fn encode_record_set(records: &BTreeMap<String, Record>, key: &LoadedKey) -> Result<Vec<u8>> {
    let plaintext = serde_json::to_vec(records)?;
    let ciphertext = crypto::encrypt(&key.params, &key.key, &plaintext)?;
    Ok(serde_json::to_vec(&ciphertext)?)
}

/// Cheap handle for requesting background syncs.
///
/// Requests are coalesced: while one sync is pending, further requests
/// fold into it instead of queueing.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<()>,
}

impl SyncHandle {
    /// Ask for a sync soon. Never blocks; a request that arrives while
    /// one is already pending is absorbed by it.
    pub fn request_sync(&self) {
        match self.tx.try_send(()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(())) => {
                debug!("Sync already pending; request coalesced");
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                warn!("Sync worker is gone; request dropped");
            }
        }
    }
}

/// Spawn the background sync worker and return its handle.
///
/// The worker drains requests one at a time; sync failures are logged
/// and never tear the worker down.
#[must_use]
pub fn spawn_sync_worker(session: Arc<SyncSession>) -> SyncHandle {
    let (tx, mut rx) = mpsc::channel(1);
    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            match session.sync().await {
                Ok(true) => {}
                Ok(false) => debug!("Background sync skipped; device not linked"),
                Err(e) => warn!("Background sync failed: {}", e),
            }
        }
    });
    SyncHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyDescriptor;
    use crate::identity::StaticIdentityProvider;
    use crate::record::TOMBSTONE;
    use crate::remote::MemoryBlobStore;
    use chrono::Utc;
    use serde_json::json;

    fn test_identity() -> UserIdentity {
        UserIdentity {
            name: "Dr. Example".to_string(),
            email: "examiner@example.org".to_string(),
            picture_url: None,
            bearer_token: "token-1".to_string(),
            expires_at: Utc::now().timestamp() + 3600,
        }
    }

    fn linked_session(blobs: MemoryBlobStore) -> SyncSession {
        let store = LocalRecordStore::open_in_memory().expect("failed to create test store");
        store.enable_sync().unwrap();
        SyncSession::new(
            Arc::new(std::sync::Mutex::new(store)),
            Box::new(StaticIdentityProvider::new(test_identity())),
            Box::new(blobs),
        )
    }

    /// Decrypt the remote data blob the way a second device would.
    fn remote_records(blobs: &MemoryBlobStore) -> BTreeMap<String, Record> {
        let descriptor: KeyDescriptor =
            serde_json::from_slice(&blobs.peek(KEY_BLOB).unwrap()).unwrap();
        let key = crate::keys::LoadedKey::from_descriptor(descriptor).unwrap();
        decode_record_set(&blobs.peek(DATA_BLOB).unwrap(), &key).unwrap()
    }

    fn put(session: &SyncSession, record: &Record) {
        session.local().put(record).unwrap();
    }

    #[tokio::test]
    async fn test_sync_skipped_when_not_linked() {
        let blobs = MemoryBlobStore::new();
        let store = LocalRecordStore::open_in_memory().unwrap();
        let session = SyncSession::new(
            Arc::new(std::sync::Mutex::new(store)),
            Box::new(StaticIdentityProvider::new(test_identity())),
            Box::new(blobs.clone()),
        );

        assert!(!session.sync().await.unwrap());
        assert!(blobs.names().is_empty());
    }

    #[tokio::test]
    async fn test_first_sync_pushes_everything() {
        let blobs = MemoryBlobStore::new();
        let session = linked_session(blobs.clone());

        let mut record = Record::new("s1");
        record.set_field("symptom_number", json!(4));
        put(&session, &record);

        assert!(session.sync().await.unwrap());
        assert_eq!(
            blobs.names(),
            vec![DATA_BLOB.to_string(), KEY_BLOB.to_string()]
        );

        let remote = remote_records(&blobs);
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[&record.record_id], record);

        assert!(session.local().last_sync().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let blobs = MemoryBlobStore::new();
        let session = linked_session(blobs.clone());
        put(&session, &Record::new("s1"));

        session.sync().await.unwrap();
        let first = blobs.peek(DATA_BLOB).unwrap();

        session.sync().await.unwrap();
        let second = blobs.peek(DATA_BLOB).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_newer_remote_record_wins() {
        let blobs = MemoryBlobStore::new();

        // Device A pushes the newer revision.
        let device_a = linked_session(blobs.clone());
        let mut record = Record::new("s1");
        record.set_field("symptom_number", json!(1));
        record.updated_at = 100;

        let device_b = linked_session(blobs.clone());
        put(&device_b, &record);

        record.set_field("symptom_number", json!(2));
        record.updated_at = 150;
        put(&device_a, &record);
        device_a.sync().await.unwrap();

        device_b.sync().await.unwrap();
        let merged = device_b.local().get(&record.record_id).unwrap().unwrap();
        assert_eq!(merged.field("symptom_number"), Some(&json!(2)));
        assert_eq!(merged.updated_at, 150);
    }

    #[tokio::test]
    async fn test_newer_local_record_survives() {
        let blobs = MemoryBlobStore::new();

        let device_a = linked_session(blobs.clone());
        let mut record = Record::new("s1");
        record.set_field("symptom_number", json!(1));
        record.updated_at = 100;
        put(&device_a, &record);
        device_a.sync().await.unwrap();

        // Device B edits the record after A pushed.
        let device_b = linked_session(blobs.clone());
        let mut edited = record.clone();
        edited.set_field("symptom_number", json!(7));
        edited.updated_at = 200;
        put(&device_b, &edited);

        device_b.sync().await.unwrap();
        let kept = device_b.local().get(&record.record_id).unwrap().unwrap();
        assert_eq!(kept.field("symptom_number"), Some(&json!(7)));

        // And the push carried B's revision outward.
        let remote = remote_records(&blobs);
        assert_eq!(remote[&record.record_id].updated_at, 200);
    }

    #[tokio::test]
    async fn test_equal_timestamps_keep_local() {
        let blobs = MemoryBlobStore::new();

        let device_a = linked_session(blobs.clone());
        let mut record = Record::new("s1");
        record.set_field("examiner_name", json!("remote"));
        record.updated_at = 100;
        put(&device_a, &record);
        device_a.sync().await.unwrap();

        let device_b = linked_session(blobs.clone());
        let mut local = record.clone();
        local.set_field("examiner_name", json!("local"));
        local.updated_at = 100;
        put(&device_b, &local);

        device_b.sync().await.unwrap();
        let kept = device_b.local().get(&record.record_id).unwrap().unwrap();
        assert_eq!(kept.field("examiner_name"), Some(&json!("local")));
    }

    #[tokio::test]
    async fn test_tombstone_propagates() {
        let blobs = MemoryBlobStore::new();

        let device_a = linked_session(blobs.clone());
        let record = Record::new("s1");
        put(&device_a, &record);
        device_a.sync().await.unwrap();

        // Device B picks the record up, then A deletes it.
        let device_b = linked_session(blobs.clone());
        device_b.sync().await.unwrap();
        assert!(device_b.local().get(&record.record_id).unwrap().is_some());

        device_a.local().delete(&record.record_id).unwrap();
        device_a.sync().await.unwrap();

        device_b.sync().await.unwrap();
        let merged = device_b.local().get(&record.record_id).unwrap().unwrap();
        assert_eq!(merged.subject_id, TOMBSTONE);
        assert!(device_b.local().subject_index().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_data_blob_is_integrity_error() {
        let mut blobs = MemoryBlobStore::new();
        let session = linked_session(blobs.clone());
        session.sync().await.unwrap();

        blobs.set("t", DATA_BLOB, b"[1,2,3]").await.unwrap();
        let err = session.sync().await.unwrap_err();
        assert!(err.is_integrity_error());
    }

    #[tokio::test]
    async fn test_sign_in_failure_is_auth_error() {
        let store = LocalRecordStore::open_in_memory().unwrap();
        store.enable_sync().unwrap();
        let session = SyncSession::new(
            Arc::new(std::sync::Mutex::new(store)),
            Box::new(StaticIdentityProvider::unavailable()),
            Box::new(MemoryBlobStore::new()),
        );

        let err = session.sync().await.unwrap_err();
        assert!(err.is_auth_error());
    }

    #[tokio::test]
    async fn test_concurrent_syncs_serialize() {
        let blobs = MemoryBlobStore::new();
        let session = Arc::new(linked_session(blobs.clone()));
        put(&session, &Record::new("s1"));

        let (a, b) = tokio::join!(session.sync(), session.sync());
        assert!(a.unwrap());
        assert!(b.unwrap());
        assert_eq!(remote_records(&blobs).len(), 1);
    }

    #[tokio::test]
    async fn test_link_runs_initial_sync() {
        let blobs = MemoryBlobStore::new();
        let store = LocalRecordStore::open_in_memory().unwrap();
        store.put(&Record::new("s1")).unwrap();
        let session = SyncSession::new(
            Arc::new(std::sync::Mutex::new(store)),
            Box::new(StaticIdentityProvider::new(test_identity())),
            Box::new(blobs.clone()),
        );

        let user = session.link().await.unwrap();
        assert_eq!(user.email, "examiner@example.org");
        assert!(session.local().sync_enabled().unwrap());
        assert_eq!(remote_records(&blobs).len(), 1);
    }

    #[tokio::test]
    async fn test_unlink_clears_remote_and_local_state() {
        let blobs = MemoryBlobStore::new();
        let session = linked_session(blobs.clone());
        let record = Record::new("s1");
        put(&session, &record);
        session.sync().await.unwrap();

        session.unlink().await.unwrap();
        assert!(blobs.names().is_empty());
        assert!(!session.local().sync_enabled().unwrap());
        assert!(session.local().key_descriptor().unwrap().is_none());

        // Local records survive the unlink.
        assert!(session.local().get(&record.record_id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sync_handle_coalesces_and_survives() {
        let blobs = MemoryBlobStore::new();
        let session = Arc::new(linked_session(blobs.clone()));
        put(&session, &Record::new("s1"));

        let handle = spawn_sync_worker(Arc::clone(&session));
        handle.request_sync();
        handle.request_sync();
        handle.request_sync();

        // Give the worker a moment to drain.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(remote_records(&blobs).len(), 1);
    }
}
