//!
//! photowall storage gateway
//! -------------------------
//! Capability interface over the cloud file-storage provider: listing and
//! uploading files, folder management, public permission grants, byte
//! fetching for the image proxy, and the activity/audit log query that feeds
//! the reconciler. Handlers and the intake/bootstrap paths only ever see this
//! trait; the HTTP implementation lives in [`drive`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::auth::AuthError;
use crate::reconcile::ActivityRecord;

pub mod drive;

pub use drive::DriveGateway;

/// Mime type the provider uses for folders.
pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("{context}: provider returned status {status}")]
    Status { context: &'static str, status: u16 },
    #[error("{context}: {source}")]
    Transport {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{context}: unexpected response shape")]
    Malformed { context: &'static str },
}

/// Provider file metadata as returned by list/get calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub parents: Vec<String>,
}

/// Capability set consumed from the storage provider.
///
/// All calls are synchronous network I/O bounded by the HTTP client's
/// timeout; none of them touch registry state.
#[async_trait]
pub trait StorageGateway: fmt::Debug + Send + Sync {
    /// List image files, optionally scoped to a folder.
    async fn list_files(&self, folder_id: Option<&str>) -> Result<Vec<DriveFile>, GatewayError>;

    /// Upload file bytes, returning the provider-assigned file id.
    async fn create_file(
        &self,
        name: &str,
        parent: Option<&str>,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String, GatewayError>;

    /// Fetch metadata for a single file or folder.
    async fn get_file(&self, id: &str) -> Result<DriveFile, GatewayError>;

    /// Grant anyone-with-the-link read access.
    async fn set_public_permission(&self, id: &str) -> Result<(), GatewayError>;

    /// Create a folder, returning its id.
    async fn create_folder(&self, name: &str, parent: Option<&str>)
        -> Result<String, GatewayError>;

    /// Look up a folder by name (optionally under a parent). `Ok(None)` when
    /// no such folder exists.
    async fn find_folder(
        &self,
        name: &str,
        parent: Option<&str>,
    ) -> Result<Option<String>, GatewayError>;

    /// Query the activity log for changes under a folder since a timestamp.
    async fn query_activity(
        &self,
        ancestor_folder_id: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ActivityRecord>, GatewayError>;

    /// Fetch file bytes plus their mime type, for the image proxy.
    async fn download(&self, id: &str) -> Result<(Vec<u8>, String), GatewayError>;
}
