//!
//! photowall upload intake
//! -----------------------
//! Takes raw photo bytes from a request, stores them with the provider under
//! a collision-resistant filename, registers the resulting proxy URL and
//! broadcasts it to viewers. Either the reference is fully appended and
//! broadcast, or nothing happens.

use getrandom::getrandom;
use tracing::warn;

use crate::error::AppError;
use crate::gateway::{GatewayError, StorageGateway};
use crate::notify::Notifier;
use crate::reconcile::proxy_url;
use crate::registry::{ImageRef, ImageRegistry};

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub file_id: String,
    pub url: String,
}

/// `photo_<timestamp>_<random>.jpg`, unique enough for concurrent uploads.
pub fn generate_filename() -> String {
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let mut bytes = [0u8; 4];
    let _ = getrandom(&mut bytes);
    let mut suffix = String::with_capacity(8);
    use std::fmt::Write as _;
    for b in &bytes {
        let _ = write!(&mut suffix, "{:02x}", b);
    }
    format!("photo_{timestamp}_{suffix}.jpg")
}

/// Store one uploaded photo and publish it.
///
/// The permission grant is best-effort: the file is still served through the
/// proxy when the grant fails, so a permission error is logged and ignored.
pub async fn upload_photo(
    gateway: &dyn StorageGateway,
    registry: &ImageRegistry,
    notifier: &Notifier,
    folder_id: Option<&str>,
    bytes: Vec<u8>,
) -> Result<UploadOutcome, AppError> {
    let filename = generate_filename();
    let file_id = gateway
        .create_file(&filename, folder_id, "image/jpeg", bytes)
        .await
        .map_err(|e| match e {
            GatewayError::Auth(inner) => AppError::auth("auth_failure", inner.to_string()),
            other => AppError::upload("upload_failed", format!("storing photo failed: {other}")),
        })?;

    if let Err(e) = gateway.set_public_permission(&file_id).await {
        warn!("could not set public permission on {file_id}: {e}");
    }

    let url = proxy_url(&file_id);
    let added = registry.append_if_absent(ImageRef { id: file_id.clone(), url: url.clone() });
    if added {
        notifier.broadcast(vec![url.clone()]);
    }
    Ok(UploadOutcome { file_id, url })
}
