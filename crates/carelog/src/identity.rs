//! Identity provider contract for remote sync.
//!
//! The interactive sign-in flow is an external collaborator; carelog only
//! consumes the bearer credential it produces. This module defines the
//! credential shape, the expiry policy, and the provider seam the sync
//! engine talks through.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A credential this close to expiry (in seconds) is treated as already
/// expired, so a sync never starts with a token about to lapse mid-flight.
pub const EXPIRY_SKEW_SECONDS: i64 = 5 * 60;

/// An authenticated user as returned by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    /// Display name.
    pub name: String,
    /// Account email.
    pub email: String,
    /// Avatar URL, if the provider supplied one.
    #[serde(default)]
    pub picture_url: Option<String>,
    /// Bearer token for the remote blob store.
    pub bearer_token: String,
    /// Token expiry in epoch seconds.
    pub expires_at: i64,
}

impl UserIdentity {
    /// Check whether the credential is still usable at the given wall clock
    /// (epoch seconds), applying [`EXPIRY_SKEW_SECONDS`].
    #[must_use]
    pub fn is_usable_at(&self, now: i64) -> bool {
        self.expires_at > now + EXPIRY_SKEW_SECONDS
    }

    /// Check whether the credential is still usable right now.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.is_usable_at(Utc::now().timestamp())
    }
}

/// Source of bearer credentials.
///
/// Implementors front whatever interactive or stored sign-in mechanism the
/// platform offers; the sync engine only ever asks for a fresh credential.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Obtain a credential, running the external sign-in flow if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] if no credential can be obtained.
    async fn sign_in(&self) -> Result<UserIdentity>;
}

/// Identity provider reading the credential file the external sign-in flow
/// deposits on disk.
#[derive(Debug, Clone)]
pub struct FileIdentityProvider {
    path: PathBuf,
}

impl FileIdentityProvider {
    /// Create a provider reading from the given credential file.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl IdentityProvider for FileIdentityProvider {
    async fn sign_in(&self) -> Result<UserIdentity> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::auth(format!(
                "no credential at {}: {e}; sign in first",
                self.path.display()
            ))
        })?;
        let identity: UserIdentity = serde_json::from_str(&raw)
            .map_err(|e| Error::auth(format!("malformed credential file: {e}")))?;
        if !identity.is_usable() {
            return Err(Error::auth("credential expired; sign in again"));
        }
        Ok(identity)
    }
}

/// Identity provider returning a fixed credential. Test double.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityProvider {
    identity: Option<UserIdentity>,
}

impl StaticIdentityProvider {
    /// Provider that always returns the given identity.
    #[must_use]
    pub fn new(identity: UserIdentity) -> Self {
        Self {
            identity: Some(identity),
        }
    }

    /// Provider that always fails authentication.
    #[must_use]
    pub fn unavailable() -> Self {
        Self { identity: None }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn sign_in(&self) -> Result<UserIdentity> {
        self.identity
            .clone()
            .ok_or_else(|| Error::auth("no identity available"))
    }
}
