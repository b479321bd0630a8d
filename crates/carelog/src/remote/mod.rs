//! Remote blob store for carelog.
//!
//! The remote side of sync is nothing more than named opaque blobs in a
//! location private to the application and the authenticated user. The
//! store is trusted for durability only; everything it holds is encrypted
//! on-device before it leaves.

pub mod drive;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::{Error, Result};

pub use drive::DriveBlobStore;

/// Name of the blob holding the key descriptor.
pub const KEY_BLOB: &str = "key.json";

/// Name of the blob holding the encrypted record set.
pub const DATA_BLOB: &str = "data.json";

/// Named opaque blobs in a user-scoped remote location.
///
/// Implementations resolve a handle per name on first use and reuse it;
/// `delete` invalidates the cached handle.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch a blob's content, or `None` if no blob has that name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] or [`Error::Auth`] on remote failure.
    async fn get(&mut self, token: &str, name: &str) -> Result<Option<Vec<u8>>>;

    /// Create or overwrite a blob.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] or [`Error::Auth`] on remote failure.
    async fn set(&mut self, token: &str, name: &str, bytes: &[u8]) -> Result<()>;

    /// Delete a blob.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no blob has that name, and
    /// [`Error::Network`] or [`Error::Auth`] on remote failure.
    async fn delete(&mut self, token: &str, name: &str) -> Result<()>;
}

/// In-memory blob store.
///
/// Clones share one backing map, so several "devices" in a test can point
/// at the same remote.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of all stored blobs.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Peek at a blob's content without going through the trait.
    #[must_use]
    pub fn peek(&self, name: &str) -> Option<Vec<u8>> {
        self.lock().get(name).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&mut self, _token: &str, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock().get(name).cloned())
    }

    async fn set(&mut self, _token: &str, name: &str, bytes: &[u8]) -> Result<()> {
        self.lock().insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn delete(&mut self, _token: &str, name: &str) -> Result<()> {
        match self.lock().remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::not_found(name)),
        }
    }
}
