//! Drive-backed blob store.
//!
//! Talks to a Drive-style HTTP API: blobs live as files in the
//! application-data folder, addressed by an opaque file id. Ids are
//! resolved by listing the folder and matching on name, then cached for
//! the life of the session.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::RemoteConfig;
use crate::error::{Error, Result};

use super::BlobStore;

/// File listing response.
#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<FileEntry>,
}

/// One file in a listing.
#[derive(Debug, Deserialize)]
struct FileEntry {
    id: String,
    name: String,
}

/// Minimal file resource returned by uploads.
#[derive(Debug, Deserialize)]
struct FileResource {
    id: String,
}

/// Blob store over a Drive-style HTTP API.
#[derive(Debug, Clone)]
pub struct DriveBlobStore {
    client: reqwest::Client,
    /// Base URL for metadata operations (list, delete).
    api_base: String,
    /// Base URL for content uploads (create, overwrite).
    upload_base: String,
    /// Cached name-to-file-id handles.
    handles: HashMap<String, String>,
}

impl DriveBlobStore {
    /// Create a store against the given API bases.
    #[must_use]
    pub fn new(api_base: impl Into<String>, upload_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into(),
            upload_base: upload_base.into(),
            handles: HashMap::new(),
        }
    }

    /// Create a store from the remote configuration section.
    #[must_use]
    pub fn from_config(config: &RemoteConfig) -> Self {
        Self::new(
            config.api_base_url.trim_end_matches('/'),
            config.upload_base_url.trim_end_matches('/'),
        )
    }

    fn list_url(&self) -> String {
        format!("{}/files?spaces=appDataFolder", self.api_base)
    }

    fn file_url(&self, id: &str) -> String {
        format!("{}/files/{id}", self.api_base)
    }

    fn content_url(&self, id: &str) -> String {
        format!("{}/files/{id}?alt=media", self.api_base)
    }

    fn overwrite_url(&self, id: &str) -> String {
        format!("{}/files/{id}?uploadType=media", self.upload_base)
    }

    fn create_url(&self) -> String {
        format!("{}/files?uploadType=resumable", self.upload_base)
    }

    /// Resolve the file id for a blob name, consulting the cache first.
    async fn resolve_handle(&mut self, token: &str, name: &str) -> Result<Option<String>> {
        if let Some(id) = self.handles.get(name) {
            return Ok(Some(id.clone()));
        }

        let response = self
            .client
            .get(self.list_url())
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?;
        let list: FileList = response.json().await?;

        let id = list.files.into_iter().find(|f| f.name == name).map(|f| f.id);
        if let Some(id) = &id {
            debug!("Resolved blob '{}' to handle {}", name, id);
            self.handles.insert(name.to_string(), id.clone());
        }
        Ok(id)
    }

    /// Overwrite an existing file's content.
    async fn overwrite(&mut self, token: &str, name: &str, id: &str, bytes: &[u8]) -> Result<()> {
        let response = self
            .client
            .patch(self.overwrite_url(id))
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(bytes.to_vec())
            .send()
            .await?
            .error_for_status()?;

        let resource: FileResource = response.json().await?;
        self.handles.insert(name.to_string(), resource.id);
        Ok(())
    }

    /// Create a new file: metadata first, then content against the upload
    /// session the metadata call opens.
    async fn create(&mut self, token: &str, name: &str, bytes: &[u8]) -> Result<()> {
        let metadata = json!({
            "name": name,
            "parents": ["appDataFolder"],
            "mimeType": "application/json",
        });
        let response = self
            .client
            .post(self.create_url())
            .bearer_auth(token)
            .header("X-Upload-Content-Type", "application/json")
            .json(&metadata)
            .send()
            .await?
            .error_for_status()?;

        let session_url = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .ok_or_else(|| {
                Error::network("upload session response carried no Location header")
            })?;

        let response = self
            .client
            .put(session_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(bytes.to_vec())
            .send()
            .await?
            .error_for_status()?;

        let resource: FileResource = response.json().await?;
        debug!("Created blob '{}' as handle {}", name, resource.id);
        self.handles.insert(name.to_string(), resource.id);
        Ok(())
    }
}

#[async_trait]
impl BlobStore for DriveBlobStore {
    async fn get(&mut self, token: &str, name: &str) -> Result<Option<Vec<u8>>> {
        // The handle cache can go stale if another device recreated the
        // file; one re-resolve by name recovers that, and a blob that is
        // truly gone reads as absent.
        for _ in 0..2 {
            let Some(id) = self.resolve_handle(token, name).await? else {
                return Ok(None);
            };

            let response = self
                .client
                .get(self.content_url(&id))
                .bearer_auth(token)
                .send()
                .await?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                self.handles.remove(name);
                continue;
            }
            let response = response.error_for_status()?;
            return Ok(Some(response.bytes().await?.to_vec()));
        }
        Ok(None)
    }

    async fn set(&mut self, token: &str, name: &str, bytes: &[u8]) -> Result<()> {
        match self.resolve_handle(token, name).await? {
            Some(id) => self.overwrite(token, name, &id, bytes).await,
            None => self.create(token, name, bytes).await,
        }
    }

    async fn delete(&mut self, token: &str, name: &str) -> Result<()> {
        let Some(id) = self.resolve_handle(token, name).await? else {
            return Err(Error::not_found(name));
        };

        let response = self
            .client
            .delete(self.file_url(&id))
            .bearer_auth(token)
            .send()
            .await?;
        self.handles.remove(name);
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found(name));
        }
        response.error_for_status()?;
        debug!("Deleted blob '{}'", name);
        Ok(())
    }
}
