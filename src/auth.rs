//!
//! photowall credential provider
//! -----------------------------
//! Supplies a valid bearer token for the storage provider's APIs. The
//! interactive OAuth consent dance is out of scope: this module only knows
//! how to read a previously saved authorized-user token file and refresh it
//! against the provider's token endpoint when it has expired, persisting the
//! refreshed token back to disk.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token file {path}: {source}")]
    TokenFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("token file {path}: invalid contents: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("token expired and no refresh credentials are available")]
    NoRefreshPath,
    #[error("token refresh request failed: {0}")]
    RefreshTransport(#[from] reqwest::Error),
    #[error("token refresh rejected with status {0}")]
    RefreshRejected(u16),
}

/// Capability consumed by the gateway: produce a currently valid access token.
#[async_trait]
pub trait CredentialProvider: fmt::Debug + Send + Sync {
    async fn token(&self) -> Result<String, AuthError>;
}

/// On-disk authorized-user token, in the shape the provider's own tooling
/// writes (`token.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredToken {
    token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expiry: Option<DateTime<Utc>>,
}

impl StoredToken {
    /// Expired (or about to, within the slack window) means refresh first.
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expiry {
            Some(expiry) => expiry > now + Duration::seconds(60),
            None => true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// File-backed credential provider with refresh-on-expiry.
#[derive(Debug)]
pub struct TokenFile {
    path: PathBuf,
    client: reqwest::Client,
    // Serializes refreshes so concurrent requests do not race on the file.
    refresh_lock: Mutex<()>,
}

impl TokenFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        TokenFile {
            path: path.as_ref().to_path_buf(),
            client: reqwest::Client::new(),
            refresh_lock: Mutex::new(()),
        }
    }

    fn path_str(&self) -> String {
        self.path.display().to_string()
    }

    async fn load(&self) -> Result<StoredToken, AuthError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| AuthError::TokenFile { path: self.path_str(), source })?;
        serde_json::from_str(&raw)
            .map_err(|source| AuthError::Parse { path: self.path_str(), source })
    }

    async fn persist(&self, stored: &StoredToken) -> Result<(), AuthError> {
        let raw = serde_json::to_string_pretty(stored)
            .map_err(|source| AuthError::Parse { path: self.path_str(), source })?;
        tokio::fs::write(&self.path, raw)
            .await
            .map_err(|source| AuthError::TokenFile { path: self.path_str(), source })?;
        Ok(())
    }

    async fn refresh(&self, mut stored: StoredToken) -> Result<StoredToken, AuthError> {
        let (Some(refresh_token), Some(token_uri), Some(client_id), Some(client_secret)) = (
            stored.refresh_token.clone(),
            stored.token_uri.clone(),
            stored.client_id.clone(),
            stored.client_secret.clone(),
        ) else {
            return Err(AuthError::NoRefreshPath);
        };

        debug!("access token expired, refreshing against {token_uri}");
        let response = self
            .client
            .post(&token_uri)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AuthError::RefreshRejected(response.status().as_u16()));
        }
        let refreshed: RefreshResponse = response.json().await?;

        stored.token = refreshed.access_token;
        stored.expiry = refreshed
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs));
        self.persist(&stored).await?;
        info!("refreshed access token saved to {}", self.path_str());
        Ok(stored)
    }
}

#[async_trait]
impl CredentialProvider for TokenFile {
    async fn token(&self) -> Result<String, AuthError> {
        let _guard = self.refresh_lock.lock().await;
        let stored = self.load().await?;
        if stored.is_fresh(Utc::now()) {
            return Ok(stored.token);
        }
        let refreshed = self.refresh(stored).await?;
        Ok(refreshed.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};

    fn write_token_file(dir: &tempfile::TempDir, contents: &serde_json::Value) -> PathBuf {
        let path = dir.path().join("token.json");
        std::fs::write(&path, serde_json::to_string(contents).unwrap()).unwrap();
        path
    }

    async fn spawn_token_endpoint(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/token")
    }

    fn expired_token_json(token_uri: &str) -> serde_json::Value {
        let expiry = Utc::now() - Duration::hours(1);
        serde_json::json!({
            "token": "stale",
            "refresh_token": "r1",
            "token_uri": token_uri,
            "client_id": "cid",
            "client_secret": "cs",
            "expiry": expiry.to_rfc3339(),
        })
    }

    #[tokio::test]
    async fn fresh_token_is_returned_without_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let expiry = Utc::now() + Duration::hours(1);
        let path = write_token_file(
            &dir,
            &serde_json::json!({ "token": "abc123", "expiry": expiry.to_rfc3339() }),
        );
        let provider = TokenFile::new(&path);
        assert_eq!(provider.token().await.unwrap(), "abc123");
    }

    #[tokio::test]
    async fn token_without_expiry_is_treated_as_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_token_file(&dir, &serde_json::json!({ "token": "abc123" }));
        let provider = TokenFile::new(&path);
        assert_eq!(provider.token().await.unwrap(), "abc123");
    }

    #[tokio::test]
    async fn expired_token_without_refresh_credentials_fails() {
        let dir = tempfile::tempdir().unwrap();
        let expiry = Utc::now() - Duration::hours(1);
        let path = write_token_file(
            &dir,
            &serde_json::json!({ "token": "stale", "expiry": expiry.to_rfc3339() }),
        );
        let provider = TokenFile::new(&path);
        match provider.token().await {
            Err(AuthError::NoRefreshPath) => {}
            other => panic!("expected NoRefreshPath, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_persisted() {
        let app = Router::new().route(
            "/token",
            post(|| async {
                Json(serde_json::json!({ "access_token": "fresh-token", "expires_in": 3600 }))
            }),
        );
        let token_uri = spawn_token_endpoint(app).await;

        let dir = tempfile::tempdir().unwrap();
        let path = write_token_file(&dir, &expired_token_json(&token_uri));
        let provider = TokenFile::new(&path);
        assert_eq!(provider.token().await.unwrap(), "fresh-token");

        // The refreshed token and its new expiry were written back.
        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["token"], "fresh-token");
        assert_eq!(saved["refresh_token"], "r1");
        let expiry: DateTime<Utc> = saved["expiry"].as_str().unwrap().parse().unwrap();
        assert!(expiry > Utc::now());

        // A second call is served from the persisted token, no refresh needed.
        assert_eq!(provider.token().await.unwrap(), "fresh-token");
    }

    #[tokio::test]
    async fn rejected_refresh_surfaces_status() {
        let app = Router::new().route("/token", post(|| async { StatusCode::UNAUTHORIZED }));
        let token_uri = spawn_token_endpoint(app).await;

        let dir = tempfile::tempdir().unwrap();
        let path = write_token_file(&dir, &expired_token_json(&token_uri));
        let provider = TokenFile::new(&path);
        match provider.token().await {
            Err(AuthError::RefreshRejected(401)) => {}
            other => panic!("expected RefreshRejected(401), got {other:?}"),
        }
        // The stale token file is left untouched.
        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["token"], "stale");
    }

    #[tokio::test]
    async fn missing_file_surfaces_token_file_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider = TokenFile::new(dir.path().join("nope.json"));
        match provider.token().await {
            Err(AuthError::TokenFile { .. }) => {}
            other => panic!("expected TokenFile error, got {other:?}"),
        }
    }

    #[test]
    fn freshness_uses_slack_window() {
        let now = Utc::now();
        let nearly_expired = StoredToken {
            token: "t".into(),
            refresh_token: None,
            token_uri: None,
            client_id: None,
            client_secret: None,
            expiry: Some(now + Duration::seconds(30)),
        };
        assert!(!nearly_expired.is_fresh(now));
    }
}
