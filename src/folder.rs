//!
//! photowall folder bootstrap
//! --------------------------
//! Idempotently resolves the upload destination in the provider: prefer a
//! previously configured folder id while it still resolves, fall back to
//! finding or creating `<collection>/<ISO-date>`, and degrade further to the
//! provider root ("no folder") if creation itself fails. Startup never aborts
//! because of a folder problem.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::gateway::StorageGateway;

/// Resolved upload destination. `id: None` means the provider root.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FolderInfo {
    pub id: Option<String>,
    pub name: String,
    pub parent: String,
}

impl FolderInfo {
    pub fn root() -> Self {
        FolderInfo { id: None, name: "root".to_string(), parent: String::new() }
    }

    /// Human-readable path for health and folder-info reporting.
    pub fn path(&self) -> String {
        if self.id.is_none() {
            return "root".to_string();
        }
        if self.parent.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.parent, self.name)
        }
    }
}

/// Today's folder name, `YYYY-MM-DD`.
pub fn date_folder_name() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

/// Resolve or create the two-level upload folder path.
pub async fn resolve_upload_folder(
    gateway: &dyn StorageGateway,
    configured_id: Option<&str>,
    collection: &str,
) -> FolderInfo {
    // A configured folder wins as long as it still resolves.
    if let Some(id) = configured_id.filter(|s| !s.is_empty()) {
        match gateway.get_file(id).await {
            Ok(meta) => {
                let parent = match meta.parents.first() {
                    Some(pid) => gateway
                        .get_file(pid)
                        .await
                        .map(|p| p.name)
                        .unwrap_or_default(),
                    None => String::new(),
                };
                info!(folder = %meta.name, id, "using configured upload folder");
                return FolderInfo { id: Some(id.to_string()), name: meta.name, parent };
            }
            Err(e) => {
                warn!("configured folder {id} not accessible: {e}");
            }
        }
    }

    match find_or_create_dated(gateway, collection).await {
        Ok(info) => info,
        Err(e) => {
            warn!("could not create folder structure: {e}");
            info!("falling back to provider root folder");
            FolderInfo::root()
        }
    }
}

async fn find_or_create_dated(
    gateway: &dyn StorageGateway,
    collection: &str,
) -> Result<FolderInfo, crate::gateway::GatewayError> {
    let collection_id = match gateway.find_folder(collection, None).await? {
        Some(id) => {
            info!(name = collection, id = %id, "found existing collection folder");
            id
        }
        None => {
            let id = gateway.create_folder(collection, None).await?;
            info!(name = collection, id = %id, "created collection folder");
            id
        }
    };

    let date_name = date_folder_name();
    let date_id = match gateway.find_folder(&date_name, Some(&collection_id)).await? {
        Some(id) => {
            info!(name = %date_name, id = %id, "found existing date folder");
            id
        }
        None => {
            let id = gateway.create_folder(&date_name, Some(&collection_id)).await?;
            info!(name = %date_name, id = %id, "created date folder");
            id
        }
    };

    Ok(FolderInfo {
        id: Some(date_id),
        name: date_name,
        parent: collection.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_path_renders_as_root() {
        assert_eq!(FolderInfo::root().path(), "root");
    }

    #[test]
    fn resolved_path_joins_parent_and_name() {
        let info = FolderInfo {
            id: Some("D1".into()),
            name: "2026-08-30".into(),
            parent: "live_photo_collage".into(),
        };
        assert_eq!(info.path(), "live_photo_collage/2026-08-30");
    }

    #[test]
    fn date_folder_name_is_iso_date() {
        let name = date_folder_name();
        assert_eq!(name.len(), 10);
        assert_eq!(name.as_bytes()[4], b'-');
        assert_eq!(name.as_bytes()[7], b'-');
    }
}
