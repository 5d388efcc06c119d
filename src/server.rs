//!
//! photowall HTTP/WS server
//! ------------------------
//! This module defines the Axum-based HTTP API and WebSocket interface for
//! photowall.
//!
//! Responsibilities:
//! - Upload endpoint accepting multipart photos from mobile clients.
//! - Refresh endpoint polling the provider activity log and reconciling it
//!   into the image registry.
//! - Listing, health and folder-info endpoints for viewers and monitoring.
//! - Image proxy that re-fetches provider bytes on demand, so clients never
//!   depend on expiring direct links.
//! - WebSocket endpoint pushing `new_images` batches to connected viewers.
//! - Startup folder bootstrap and best-effort registry preload.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};

use crate::auth::TokenFile;
use crate::error::AppError;
use crate::folder::{resolve_upload_folder, FolderInfo};
use crate::gateway::{DriveGateway, GatewayError, StorageGateway};
use crate::intake;
use crate::notify::Notifier;
use crate::reconcile::{self, ActivityCursor};
use crate::registry::{ImageRef, SharedRegistry};

/// Server configuration, read from the environment with defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_port: u16,
    pub folder_id: Option<String>,
    pub collection: String,
    pub token_file: String,
    pub api_base: Option<String>,
    pub upload_api_base: Option<String>,
    pub activity_api_base: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let http_port = std::env::var("PHOTOWALL_HTTP_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(5000);
        let folder_id = std::env::var("PHOTOWALL_FOLDER_ID")
            .ok()
            .filter(|s| !s.is_empty());
        let collection = std::env::var("PHOTOWALL_COLLECTION")
            .unwrap_or_else(|_| "live_photo_collage".to_string());
        let token_file =
            std::env::var("PHOTOWALL_TOKEN_FILE").unwrap_or_else(|_| "token.json".to_string());
        ServerConfig {
            http_port,
            folder_id,
            collection,
            token_file,
            api_base: std::env::var("PHOTOWALL_API_BASE").ok(),
            upload_api_base: std::env::var("PHOTOWALL_UPLOAD_API_BASE").ok(),
            activity_api_base: std::env::var("PHOTOWALL_ACTIVITY_API_BASE").ok(),
        }
    }
}

/// Shared server state injected into all handlers.
///
/// Holds the image registry, the activity cursor, the storage gateway handle,
/// the viewer notifier and the resolved upload folder. The registry and
/// cursor replace the module-level globals of older incarnations; every
/// mutation goes through their locks.
#[derive(Clone)]
pub struct AppState {
    pub registry: SharedRegistry,
    pub cursor: Arc<Mutex<ActivityCursor>>,
    pub gateway: Arc<dyn StorageGateway>,
    pub notifier: Notifier,
    pub folder: Arc<RwLock<FolderInfo>>,
    pub collection: String,
}

impl AppState {
    pub fn new(gateway: Arc<dyn StorageGateway>, collection: String) -> Self {
        AppState {
            registry: SharedRegistry::new(),
            cursor: Arc::new(Mutex::new(None)),
            gateway,
            notifier: Notifier::new(),
            folder: Arc::new(RwLock::new(FolderInfo::root())),
            collection,
        }
    }
}

/// Start the photowall server with configuration from the environment.
pub async fn run() -> anyhow::Result<()> {
    let cfg = ServerConfig::from_env();
    let credentials = Arc::new(TokenFile::new(&cfg.token_file));
    let gateway: Arc<dyn StorageGateway> = match (&cfg.api_base, &cfg.upload_api_base, &cfg.activity_api_base) {
        (None, None, None) => Arc::new(DriveGateway::new(credentials)?),
        (api, upload, activity) => Arc::new(DriveGateway::with_bases(
            credentials,
            api.as_deref().unwrap_or("https://www.googleapis.com/drive/v3"),
            upload.as_deref().unwrap_or("https://www.googleapis.com/upload/drive/v3"),
            activity.as_deref().unwrap_or("https://driveactivity.googleapis.com/v2"),
        )?),
    };
    run_with_gateway(cfg, gateway).await
}

/// Start the server against an already constructed gateway.
///
/// Folder bootstrap and registry preload are best-effort: a provider that is
/// not reachable yet must not keep the server from starting, images load
/// after `/api/auth` succeeds.
pub async fn run_with_gateway(
    cfg: ServerConfig,
    gateway: Arc<dyn StorageGateway>,
) -> anyhow::Result<()> {
    let state = AppState::new(gateway, cfg.collection.clone());

    let folder = resolve_upload_folder(&*state.gateway, cfg.folder_id.as_deref(), &cfg.collection).await;
    info!(path = %folder.path(), "upload folder resolved");
    match preload_registry(&state, folder.id.as_deref()).await {
        Ok(count) => info!(count, "loaded initial images"),
        Err(e) => warn!("could not load initial images: {e}; images will load after authentication"),
    }
    *state.folder.write().await = folder;

    let app = router(state);
    let addr: SocketAddr = format!("0.0.0.0:{}", cfg.http_port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "photowall ok" }))
        .route("/api/upload", post(upload))
        .route("/api/refresh-images", post(refresh_images))
        .route("/api/images", get(images))
        .route("/api/health", get(health))
        .route("/api/folder-info", get(folder_info))
        .route("/api/auth", post(authenticate))
        .route("/proxy/image/{id}", get(proxy_image))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Fill the registry from a full provider listing, replacing the current
/// contents. Listed files are published under the same proxy URL scheme the
/// reconciler uses, so the uniqueness check holds across both paths.
async fn preload_registry(
    state: &AppState,
    folder_id: Option<&str>,
) -> Result<usize, GatewayError> {
    let files = state.gateway.list_files(folder_id).await?;
    let refs: Vec<ImageRef> = files
        .into_iter()
        .map(|f| ImageRef { url: reconcile::proxy_url(&f.id), id: f.id })
        .collect();
    state.registry.replace_all(refs);
    Ok(state.registry.count())
}

fn error_response(e: &AppError) -> (StatusCode, Json<serde_json::Value>) {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "error": e.message() })))
}

async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> impl IntoResponse {
    let mut photo: Option<Vec<u8>> = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("photo") {
            match field.bytes().await {
                Ok(bytes) => photo = Some(bytes.to_vec()),
                Err(e) => {
                    error!("reading multipart photo field failed: {e}");
                    return (StatusCode::BAD_REQUEST, Json(json!({ "error": "No photo file provided" })));
                }
            }
            break;
        }
    }
    let Some(bytes) = photo else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "No photo file provided" })));
    };
    if bytes.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "No file selected" })));
    }

    let folder_id = {
        let folder = state.folder.read().await;
        folder.id.clone()
    };

    match intake::upload_photo(
        &*state.gateway,
        &state.registry,
        &state.notifier,
        folder_id.as_deref(),
        bytes,
    )
    .await
    {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "status": "success",
                "message": "Photo uploaded successfully",
                "file_id": outcome.file_id,
                "url": outcome.url,
                "folder_id": folder_id,
            })),
        ),
        Err(e) => {
            error!("upload failed: {e}");
            error_response(&e)
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshPayload {
    folder_id: Option<String>,
}

async fn refresh_images(
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    // The JSON body is optional; an empty or non-JSON body means "use the
    // resolved upload folder".
    let folder_override = serde_json::from_slice::<RefreshPayload>(&body)
        .ok()
        .and_then(|p| p.folder_id);
    let folder_id = match folder_override {
        Some(id) => Some(id),
        None => state.folder.read().await.id.clone(),
    };
    let cursor = *state.cursor.lock();

    let records = match state.gateway.query_activity(folder_id.as_deref(), cursor).await {
        Ok(records) => records,
        Err(e) => {
            // A failed fetch leaves the cursor where it was, so this window
            // is retried on the next refresh.
            error!("error refreshing images: {e}");
            return error_response(&AppError::from(e));
        }
    };

    let outcome = reconcile::reconcile(&records, &state.registry, cursor);
    // A concurrent refresh may have stored a newer cursor while this fetch
    // was in flight; the clamped write keeps it moving forward only.
    reconcile::advance_cursor(&state.cursor, outcome.next_cursor);

    let new_urls: Vec<String> = outcome.new_refs.iter().map(|r| r.url.clone()).collect();
    state.notifier.broadcast(new_urls.clone());

    (
        StatusCode::OK,
        Json(json!({ "status": "Checked for new images", "new_urls": new_urls })),
    )
}

async fn images(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.urls())
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let folder = state.folder.read().await;
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "images_count": state.registry.count(),
        "upload_folder": folder.path(),
        "folder_id": folder.id.clone().unwrap_or_else(|| "root".to_string()),
    }))
}

async fn folder_info(State(state): State<AppState>) -> impl IntoResponse {
    let folder = state.folder.read().await;
    Json(json!({
        "folder_structure": format!("{}/YYYY-MM-DD", state.collection),
        "folder_id": folder.id,
        "path": folder.path(),
        "current_date_folder": folder.name,
        "parent_folder": if folder.parent.is_empty() { "root".to_string() } else { folder.parent.clone() },
    }))
}

/// Force a credential check and reload the registry from a full listing.
async fn authenticate(State(state): State<AppState>) -> impl IntoResponse {
    let folder_id = state.folder.read().await.id.clone();
    match preload_registry(&state, folder_id.as_deref()).await {
        Ok(count) => {
            info!(count, "authentication successful, registry reloaded");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "success",
                    "message": "Authentication successful",
                    "images_count": count,
                })),
            )
        }
        Err(e) => {
            error!("authentication error: {e}");
            error_response(&AppError::from(e))
        }
    }
}

async fn proxy_image(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.gateway.download(&id).await {
        Ok((bytes, mime)) => {
            let content_type = HeaderValue::from_str(&mime)
                .unwrap_or_else(|_| HeaderValue::from_static("image/jpeg"));
            ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
        }
        Err(e) => {
            warn!("proxying image {id} failed: {e}");
            (StatusCode::NOT_FOUND, "Image not found").into_response()
        }
    }
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        use futures_util::{SinkExt, StreamExt};
        let (mut sender, mut receiver) = socket.split();
        let mut rx = state.notifier.subscribe();
        loop {
            tokio::select! {
                batch = rx.recv() => {
                    match batch {
                        Ok(urls) => {
                            if sender.send(Message::Text(Notifier::frame(&urls).into())).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("viewer connection lagged, dropped {n} batches");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                incoming = receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(_)) => break,
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    })
}
