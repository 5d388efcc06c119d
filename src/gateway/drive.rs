//! HTTP implementation of [`StorageGateway`] against the drive-style REST
//! APIs: the files API for listing/upload/permissions and the activity API
//! for the audit log. Bearer tokens come from the credential provider on
//! every call so a mid-run refresh is picked up transparently.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::auth::CredentialProvider;
use crate::reconcile::ActivityRecord;

use super::{DriveFile, GatewayError, StorageGateway, FOLDER_MIME};

const DEFAULT_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const DEFAULT_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const DEFAULT_ACTIVITY_BASE: &str = "https://driveactivity.googleapis.com/v2";

/// Network timeout for every provider call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Activity page size, matching the original polling window.
const ACTIVITY_PAGE_SIZE: u32 = 10;

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct CreatedFile {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ActivityList {
    #[serde(default)]
    activities: Vec<ActivityRecord>,
}

#[derive(Debug)]
pub struct DriveGateway {
    client: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    api_base: String,
    upload_base: String,
    activity_base: String,
}

impl DriveGateway {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Result<Self, GatewayError> {
        Self::with_bases(
            credentials,
            DEFAULT_API_BASE,
            DEFAULT_UPLOAD_BASE,
            DEFAULT_ACTIVITY_BASE,
        )
    }

    /// Construct against alternate endpoints (configuration and tests).
    pub fn with_bases(
        credentials: Arc<dyn CredentialProvider>,
        api_base: &str,
        upload_base: &str,
        activity_base: &str,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| GatewayError::Transport { context: "build http client", source })?;
        Ok(DriveGateway {
            client,
            credentials,
            api_base: api_base.trim_end_matches('/').to_string(),
            upload_base: upload_base.trim_end_matches('/').to_string(),
            activity_base: activity_base.trim_end_matches('/').to_string(),
        })
    }

    async fn bearer(&self) -> Result<String, GatewayError> {
        Ok(self.credentials.token().await?)
    }

    async fn check(
        response: reqwest::Response,
        context: &'static str,
    ) -> Result<reqwest::Response, GatewayError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(GatewayError::Status { context, status: status.as_u16() })
        }
    }

    /// Escape a literal for use inside a single-quoted query term.
    fn escape_term(term: &str) -> String {
        term.replace('\\', "\\\\").replace('\'', "\\'")
    }
}

#[async_trait]
impl StorageGateway for DriveGateway {
    async fn list_files(&self, folder_id: Option<&str>) -> Result<Vec<DriveFile>, GatewayError> {
        let context = "list files";
        let mut q = "mimeType contains 'image/'".to_string();
        if let Some(folder) = folder_id {
            q.push_str(&format!(" and '{}' in parents", Self::escape_term(folder)));
        }
        let token = self.bearer().await?;
        let response = self
            .client
            .get(format!("{}/files", self.api_base))
            .bearer_auth(token)
            .query(&[("q", q.as_str()), ("fields", "nextPageToken, files(id, name, mimeType)")])
            .send()
            .await
            .map_err(|source| GatewayError::Transport { context, source })?;
        let listing: FileList = Self::check(response, context)
            .await?
            .json()
            .await
            .map_err(|_| GatewayError::Malformed { context })?;
        debug!(count = listing.files.len(), folder = ?folder_id, "listed image files");
        Ok(listing.files)
    }

    async fn create_file(
        &self,
        name: &str,
        parent: Option<&str>,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String, GatewayError> {
        let context = "create file";
        let mut metadata = json!({ "name": name });
        if let Some(folder) = parent {
            metadata["parents"] = json!([folder]);
        }
        let form = reqwest::multipart::Form::new()
            .part(
                "metadata",
                reqwest::multipart::Part::text(metadata.to_string())
                    .mime_str("application/json")
                    .map_err(|source| GatewayError::Transport { context, source })?,
            )
            .part(
                "media",
                reqwest::multipart::Part::bytes(bytes)
                    .file_name(name.to_string())
                    .mime_str(mime_type)
                    .map_err(|source| GatewayError::Transport { context, source })?,
            );
        let token = self.bearer().await?;
        let response = self
            .client
            .post(format!("{}/files", self.upload_base))
            .bearer_auth(token)
            .query(&[("uploadType", "multipart"), ("fields", "id")])
            .multipart(form)
            .send()
            .await
            .map_err(|source| GatewayError::Transport { context, source })?;
        let created: CreatedFile = Self::check(response, context)
            .await?
            .json()
            .await
            .map_err(|_| GatewayError::Malformed { context })?;
        debug!(id = %created.id, name, "uploaded file");
        Ok(created.id)
    }

    async fn get_file(&self, id: &str) -> Result<DriveFile, GatewayError> {
        let context = "get file";
        let token = self.bearer().await?;
        let response = self
            .client
            .get(format!("{}/files/{}", self.api_base, id))
            .bearer_auth(token)
            .query(&[("fields", "id, name, mimeType, parents")])
            .send()
            .await
            .map_err(|source| GatewayError::Transport { context, source })?;
        Self::check(response, context)
            .await?
            .json()
            .await
            .map_err(|_| GatewayError::Malformed { context })
    }

    async fn set_public_permission(&self, id: &str) -> Result<(), GatewayError> {
        let context = "set public permission";
        let token = self.bearer().await?;
        let response = self
            .client
            .post(format!("{}/files/{}/permissions", self.api_base, id))
            .bearer_auth(token)
            .json(&json!({ "role": "reader", "type": "anyone" }))
            .send()
            .await
            .map_err(|source| GatewayError::Transport { context, source })?;
        Self::check(response, context).await?;
        debug!(id, "file set to publicly accessible");
        Ok(())
    }

    async fn create_folder(
        &self,
        name: &str,
        parent: Option<&str>,
    ) -> Result<String, GatewayError> {
        let context = "create folder";
        let mut metadata = json!({ "name": name, "mimeType": FOLDER_MIME });
        if let Some(folder) = parent {
            metadata["parents"] = json!([folder]);
        }
        let token = self.bearer().await?;
        let response = self
            .client
            .post(format!("{}/files", self.api_base))
            .bearer_auth(token)
            .query(&[("fields", "id")])
            .json(&metadata)
            .send()
            .await
            .map_err(|source| GatewayError::Transport { context, source })?;
        let created: CreatedFile = Self::check(response, context)
            .await?
            .json()
            .await
            .map_err(|_| GatewayError::Malformed { context })?;
        Ok(created.id)
    }

    async fn find_folder(
        &self,
        name: &str,
        parent: Option<&str>,
    ) -> Result<Option<String>, GatewayError> {
        let context = "find folder";
        let mut q = format!(
            "name='{}' and mimeType='{}'",
            Self::escape_term(name),
            FOLDER_MIME
        );
        if let Some(folder) = parent {
            q.push_str(&format!(" and '{}' in parents", Self::escape_term(folder)));
        }
        let token = self.bearer().await?;
        let response = self
            .client
            .get(format!("{}/files", self.api_base))
            .bearer_auth(token)
            .query(&[("q", q.as_str()), ("fields", "files(id, name)")])
            .send()
            .await
            .map_err(|source| GatewayError::Transport { context, source })?;
        let listing: FileList = Self::check(response, context)
            .await?
            .json()
            .await
            .map_err(|_| GatewayError::Malformed { context })?;
        Ok(listing.files.into_iter().next().map(|f| f.id))
    }

    async fn query_activity(
        &self,
        ancestor_folder_id: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ActivityRecord>, GatewayError> {
        let context = "query activity";
        let ancestor = match ancestor_folder_id {
            Some(id) => format!("items/{id}"),
            None => "items/root".to_string(),
        };
        let mut body = json!({ "ancestorName": ancestor, "pageSize": ACTIVITY_PAGE_SIZE });
        if let Some(start) = since {
            body["filter"] = json!(format!("time >= \"{}\"", start.to_rfc3339()));
        }
        let token = self.bearer().await?;
        let response = self
            .client
            .post(format!("{}/activity:query", self.activity_base))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|source| GatewayError::Transport { context, source })?;
        let listing: ActivityList = Self::check(response, context)
            .await?
            .json()
            .await
            .map_err(|_| GatewayError::Malformed { context })?;
        debug!(count = listing.activities.len(), "fetched activity records");
        Ok(listing.activities)
    }

    async fn download(&self, id: &str) -> Result<(Vec<u8>, String), GatewayError> {
        let context = "download file";
        // Metadata first so the proxy can serve the right content type. A
        // failed metadata call propagates; only an absent mime field falls
        // back to the default.
        let meta = self.get_file(id).await?;
        let mime = if meta.mime_type.is_empty() {
            "image/jpeg".to_string()
        } else {
            meta.mime_type
        };
        let token = self.bearer().await?;
        let response = self
            .client
            .get(format!("{}/files/{}", self.api_base, id))
            .bearer_auth(token)
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(|source| GatewayError::Transport { context, source })?;
        let bytes = Self::check(response, context)
            .await?
            .bytes()
            .await
            .map_err(|source| GatewayError::Transport { context, source })?;
        Ok((bytes.to_vec(), mime))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path as RoutePath, Query};
    use axum::http::{header, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;

    use crate::auth::{AuthError, CredentialProvider};

    #[derive(Debug)]
    struct FixedToken;

    #[async_trait]
    impl CredentialProvider for FixedToken {
        async fn token(&self) -> Result<String, AuthError> {
            Ok("test-token".to_string())
        }
    }

    async fn spawn_api(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn gateway_against(base: &str) -> DriveGateway {
        DriveGateway::with_bases(Arc::new(FixedToken), base, base, base).unwrap()
    }

    async fn files_route(
        RoutePath(id): RoutePath<String>,
        Query(params): Query<HashMap<String, String>>,
    ) -> axum::response::Response {
        if params.get("alt").map(String::as_str) == Some("media") {
            ([(header::CONTENT_TYPE, "application/octet-stream")], vec![1u8, 2, 3])
                .into_response()
        } else if id == "nomime" {
            Json(json!({ "id": id, "name": "x" })).into_response()
        } else {
            Json(json!({ "id": id, "name": "x.png", "mimeType": "image/png" })).into_response()
        }
    }

    #[tokio::test]
    async fn download_serves_bytes_with_metadata_mime() {
        let base = spawn_api(Router::new().route("/files/{id}", get(files_route))).await;
        let gateway = gateway_against(&base);
        let (bytes, mime) = gateway.download("F1").await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(mime, "image/png");
    }

    #[tokio::test]
    async fn download_defaults_mime_only_when_field_is_absent() {
        let base = spawn_api(Router::new().route("/files/{id}", get(files_route))).await;
        let gateway = gateway_against(&base);
        let (_, mime) = gateway.download("nomime").await.unwrap();
        assert_eq!(mime, "image/jpeg");
    }

    #[tokio::test]
    async fn download_propagates_metadata_failure() {
        let app = Router::new()
            .route("/files/{id}", get(|| async { StatusCode::FORBIDDEN }));
        let base = spawn_api(app).await;
        let gateway = gateway_against(&base);
        match gateway.download("F1").await {
            Err(GatewayError::Status { status: 403, .. }) => {}
            other => panic!("expected status 403 to propagate, got {other:?}"),
        }
    }

    #[test]
    fn query_terms_are_escaped() {
        assert_eq!(DriveGateway::escape_term("plain"), "plain");
        assert_eq!(DriveGateway::escape_term("it's"), "it\\'s");
        assert_eq!(DriveGateway::escape_term("a\\b"), "a\\\\b");
    }

    #[test]
    fn file_list_parses_with_missing_fields() {
        let listing: FileList = serde_json::from_value(serde_json::json!({
            "nextPageToken": "tok",
            "files": [ { "id": "F1" }, { "id": "F2", "name": "x.png", "mimeType": "image/png" } ]
        }))
        .unwrap();
        assert_eq!(listing.files.len(), 2);
        assert_eq!(listing.files[0].id, "F1");
        assert_eq!(listing.files[1].mime_type, "image/png");
    }

    #[test]
    fn activity_list_parses_provider_shape() {
        let listing: ActivityList = serde_json::from_value(serde_json::json!({
            "activities": [
                { "targets": [ { "file": { "id": "F1", "mimeType": "image/jpeg" } } ] }
            ]
        }))
        .unwrap();
        assert_eq!(listing.activities.len(), 1);
    }
}
