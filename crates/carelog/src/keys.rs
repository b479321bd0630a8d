//! Key lifecycle for encrypted sync.
//!
//! One symmetric key protects the whole remote record set. It is looked
//! up in three places, nearest first: the in-memory cache, the local meta
//! area, then the remote key blob. If nowhere has one, a fresh key is
//! generated and pushed before any data leaves the device. Every
//! resolution path ends with the descriptor cached locally, so a device
//! that has synced once can keep encrypting offline.

use std::sync::{Mutex, PoisonError};

use tracing::{debug, info};

use crate::crypto::{AlgorithmParams, KeyDescriptor, KEY_BYTES};
use crate::error::{Error, Result};
use crate::remote::{BlobStore, KEY_BLOB};
use crate::storage::LocalRecordStore;

/// A key descriptor with the key material already decoded.
#[derive(Clone)]
pub struct LoadedKey {
    /// Algorithm parameters from the descriptor.
    pub params: AlgorithmParams,
    /// Decoded key material.
    pub key: [u8; KEY_BYTES],
    /// The descriptor this key was decoded from.
    descriptor: KeyDescriptor,
}

impl LoadedKey {
    /// Decode a descriptor's key material.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Integrity`] if the material is malformed.
    pub fn from_descriptor(descriptor: KeyDescriptor) -> Result<Self> {
        let key = descriptor.key_material()?;
        Ok(Self {
            params: descriptor.algorithm.clone(),
            key,
            descriptor,
        })
    }

    /// The descriptor this key was decoded from.
    #[must_use]
    pub fn descriptor(&self) -> &KeyDescriptor {
        &self.descriptor
    }
}

// Key material stays out of logs.
impl std::fmt::Debug for LoadedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedKey")
            .field("algorithm", &self.params.name)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Resolves and caches the account key.
#[derive(Debug, Default)]
pub struct KeyManager {
    cached: Option<LoadedKey>,
}

impl KeyManager {
    /// Create a manager with an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the account key: memory cache, then local store, then the
    /// remote key blob, generating and publishing a fresh key if none
    /// exists anywhere.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Integrity`] if a found descriptor is malformed,
    /// and [`Error::Network`] or [`Error::Auth`] on remote failure.
    pub async fn get_key(
        &mut self,
        store: &Mutex<LocalRecordStore>,
        blobs: &mut dyn BlobStore,
        token: &str,
    ) -> Result<LoadedKey> {
        if let Some(key) = &self.cached {
            return Ok(key.clone());
        }

        if let Some(descriptor) = Self::local_descriptor(store)? {
            debug!("Using locally cached key descriptor");
            let key = LoadedKey::from_descriptor(descriptor)?;
            self.cached = Some(key.clone());
            return Ok(key);
        }

        let descriptor = match blobs.get(token, KEY_BLOB).await? {
            Some(raw) => {
                debug!("Fetched key descriptor from remote");
                serde_json::from_slice::<KeyDescriptor>(&raw).map_err(|e| {
                    Error::integrity(format!("remote key descriptor is malformed: {e}"))
                })?
            }
            None => {
                info!("No key anywhere; generating a fresh one");
                let descriptor = KeyDescriptor::generate();
                blobs
                    .set(token, KEY_BLOB, &serde_json::to_vec(&descriptor)?)
                    .await?;
                descriptor
            }
        };

        Self::cache_local(store, &descriptor)?;
        let key = LoadedKey::from_descriptor(descriptor)?;
        self.cached = Some(key.clone());
        Ok(key)
    }

    /// Drop the in-memory key. Used when the device unlinks.
    pub fn forget(&mut self) {
        self.cached = None;
    }

    fn local_descriptor(store: &Mutex<LocalRecordStore>) -> Result<Option<KeyDescriptor>> {
        store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .key_descriptor()
    }

    fn cache_local(store: &Mutex<LocalRecordStore>, descriptor: &KeyDescriptor) -> Result<()> {
        store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_key_descriptor(descriptor)
    }
}
