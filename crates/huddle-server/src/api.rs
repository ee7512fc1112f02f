use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Method},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use huddle_hub::{ChunkAck, Hub};
use huddle_shared::constants::CHUNK_SIZE;
use huddle_shared::types::{MessageId, Topic, UserId};
use huddle_store::AttachmentMetadata;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::ws::ws_handler;

/// Header carrying the caller's user id, set by the session layer in front
/// of this server.
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .route("/attachment/meta", post(register_metadata))
        .route("/attachment/meta/:msg_id", get(get_metadata))
        .route("/attachment/chunk/:msg_id", post(upload_chunk))
        .route(
            "/attachment/:msg_id",
            get(download_attachment).delete(delete_attachment),
        )
        // Room for the multipart-free raw chunk plus a little slack.
        .layer(DefaultBodyLimit::max(CHUNK_SIZE + 64 * 1024))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(&state.config)),
        )
        .with_state(state)
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    let allow_origin = if origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
}

/// The caller's user id, if the identity header is present.
pub fn optional_caller(headers: &HeaderMap) -> Result<Option<UserId>, ServerError> {
    let Some(value) = headers.get(USER_ID_HEADER) else {
        return Ok(None);
    };
    let raw = value
        .to_str()
        .map_err(|_| ServerError::BadRequest(format!("Invalid {USER_ID_HEADER} header")))?;
    raw.parse::<UserId>()
        .map(Some)
        .map_err(|e| ServerError::BadRequest(e.to_string()))
}

fn require_caller(headers: &HeaderMap) -> Result<UserId, ServerError> {
    optional_caller(headers)?
        .ok_or_else(|| ServerError::Unauthorized(format!("Missing {USER_ID_HEADER} header")))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    connections: usize,
}

async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>, ServerError> {
    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connections: state.hub.connection_count().await?,
    }))
}

#[derive(Deserialize)]
struct RegisterMetadataRequest {
    #[serde(rename = "ID")]
    id: MessageId,
    name: String,
    #[serde(rename = "meta")]
    mime: String,
    size: u64,
}

async fn register_metadata(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<RegisterMetadataRequest>,
) -> Result<Json<AttachmentMetadata>, ServerError> {
    let caller = require_caller(&headers)?;
    let meta = state
        .hub
        .register_attachment(AttachmentMetadata::new(req.id, req.name, req.mime, req.size))
        .await?;
    info!(msg = %meta.id, uploader = %caller.short(), size = meta.size, "Attachment registered");
    Ok(Json(meta))
}

async fn get_metadata(
    State(state): State<AppState>,
    Path(msg_id): Path<MessageId>,
) -> Result<Json<AttachmentMetadata>, ServerError> {
    Ok(Json(state.hub.attachment_metadata(msg_id).await?))
}

/// Who hears about an upload's progress: the viewers of a channel, or the
/// other party of a direct conversation. The uploader always does.
#[derive(Debug, Default, Deserialize)]
struct AudienceQuery {
    channel_id: Option<Uuid>,
    uid: Option<UserId>,
}

#[derive(Serialize)]
struct ChunkResponse {
    accepted: bool,
    complete: bool,
    ratio: f32,
}

impl From<ChunkAck> for ChunkResponse {
    fn from(ack: ChunkAck) -> Self {
        match ack {
            ChunkAck::Stored { ratio, .. } => Self {
                accepted: true,
                complete: false,
                ratio,
            },
            ChunkAck::Complete => Self {
                accepted: true,
                complete: true,
                ratio: 1.0,
            },
        }
    }
}

async fn upload_chunk(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(msg_id): Path<MessageId>,
    Query(audience): Query<AudienceQuery>,
    body: Bytes,
) -> Result<Json<ChunkResponse>, ServerError> {
    let uploader = require_caller(&headers)?;
    if body.len() > CHUNK_SIZE {
        return Err(ServerError::PayloadTooLarge(format!(
            "chunk of {} bytes exceeds {}",
            body.len(),
            CHUNK_SIZE
        )));
    }

    let mut recipients = match (audience.channel_id, audience.uid) {
        (Some(channel), _) => state.hub.topic_members(Topic::channel(&channel)).await?,
        (None, Some(uid)) => HashSet::from([uid]),
        (None, None) => HashSet::new(),
    };
    recipients.insert(uploader);

    let ack = state
        .hub
        .upload_chunk(uploader, msg_id, body, recipients)
        .await?;
    Ok(Json(ack.into()))
}

async fn download_attachment(
    State(state): State<AppState>,
    Path(msg_id): Path<MessageId>,
) -> Result<Response, ServerError> {
    let download = state.hub.download_attachment(msg_id).await?;
    let meta = &download.metadata;

    let disposition = format!(
        "attachment; filename=\"{}\"",
        meta.name.replace(['"', '\\', '\r', '\n'], "_")
    );
    let content_type = HeaderValue::from_str(&meta.mime)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let disposition = HeaderValue::from_str(&disposition)
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
    let length = download.len();

    let chunks = futures::stream::iter(
        download
            .chunks
            .into_iter()
            .map(Ok::<Bytes, std::io::Error>),
    );

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
            (header::CONTENT_LENGTH, HeaderValue::from(length)),
        ],
        Body::from_stream(chunks),
    )
        .into_response())
}

async fn delete_attachment(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(msg_id): Path<MessageId>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let caller = require_caller(&headers)?;
    let deleted = state.hub.delete_attachment(msg_id, Some(caller)).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
