use crate::config::Config;
use crate::discovery;
use crate::scheduler;
use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{StreamExt, TryStreamExt};
use globe_core::cluster::wire::{
    CheckpointBody, CheckpointListBody, DownloadQuery, IndexBody, ListQuery, PositionBody,
    UploadQuery,
};
use globe_core::discovery::EnvelopeBody;
use globe_core::frame::{decode_frames, encode_frames};
use globe_core::transport::ErrorBody;
use globe_core::{
    DynDiscovery, FsNode, GlobeError, GlobeNode, HttpDiscoveryService, HttpPeers,
    LocalDiscoveryService, PublicKey, Result, Signed, SignedCheckpoint,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub struct ServerState {
    pub node: Arc<GlobeNode>,
    pub config: Config,
}

/// A `GlobeError` rendered as `{kind, message}` with its status code.
pub struct ApiError(GlobeError);

impl From<GlobeError> for ApiError {
    fn from(error: GlobeError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::warn!("Request failed: {}", self.0);
        } else {
            tracing::debug!("Request rejected: {}", self.0);
        }
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub async fn run_server(config: Config) -> Result<()> {
    let client = reqwest::Client::new();

    let embedded = if config.discovery.embedded {
        Some(Arc::new(LocalDiscoveryService::new()))
    } else {
        None
    };
    let directory: DynDiscovery = match (&embedded, &config.discovery.url) {
        (Some(local), _) => local.clone() as DynDiscovery,
        (None, Some(url)) => Arc::new(HttpDiscoveryService::new(url, client.clone())?),
        (None, None) => {
            return Err(GlobeError::Config(
                "discovery needs either embedded = true or a url".to_string(),
            ));
        }
    };

    let peers = Arc::new(HttpPeers::new(config.peers.clone(), client));
    let node = Arc::new(GlobeNode::open(
        config.node_config(),
        &config.node.data_dir,
        directory,
        peers,
    )?);

    for owner in config.watched_owners()? {
        if let Err(e) = node.watch_owner(owner).await {
            tracing::warn!("Failed to look up watched owner {}: {}", owner, e);
        }
    }

    scheduler::spawn_reconcilers(node.clone(), &config.replication);

    let bind_addr = config.node.bind_addr.clone();
    let state = Arc::new(ServerState { node, config });
    let app = build_router(state, embedded);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on {}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

pub fn build_router(state: Arc<ServerState>, embedded: Option<Arc<LocalDiscoveryService>>) -> Router {
    let mut app = Router::new()
        .route("/health", get(health_handler))
        .route("/fs/upload/:owner/*file", post(upload_handler))
        .route("/fs/download/:owner/*file", get(download_handler))
        .route("/fs/latest/:owner/*file", get(latest_handler))
        .route("/fs/index/:owner/*file", get(index_handler))
        .route("/fs/list/:owner", get(list_handler))
        .route("/fs/delete/:owner", post(delete_handler))
        .with_state(state);

    if let Some(local) = embedded {
        tracing::info!("Serving embedded discovery directory");
        app = app.merge(discovery::routes(local));
    }

    app.layer(TraceLayer::new_for_http())
}

pub(crate) fn parse_envelope<T: DeserializeOwned>(body: &EnvelopeBody) -> ApiResult<Signed<T>> {
    Signed::from_hex(&body.envelope)
        .map_err(|e| ApiError(GlobeError::InvalidRequest(format!("bad envelope: {}", e))))
}

pub(crate) fn parse_owner(owner: &str) -> ApiResult<PublicKey> {
    PublicKey::from_hex(owner)
        .map_err(|e| ApiError(GlobeError::InvalidRequest(format!("bad owner key: {}", e))))
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let response = serde_json::json!({
        "server_id": state.node.server_id(),
        "data_dir": state.config.node.data_dir,
        "status": "ok",
    });

    (StatusCode::OK, Json(response))
}

async fn upload_handler(
    State(state): State<Arc<ServerState>>,
    Path((owner, file)): Path<(String, String)>,
    Query(query): Query<UploadQuery>,
    body: Body,
) -> ApiResult<Json<PositionBody>> {
    let owner = parse_owner(&owner)?;
    let bytes = body
        .into_data_stream()
        .map_err(|e| GlobeError::Http(e.to_string()))
        .boxed();

    let position = state
        .node
        .upload(owner, &file, query.offset, decode_frames(bytes))
        .await?;
    Ok(Json(PositionBody { position }))
}

async fn download_handler(
    State(state): State<Arc<ServerState>>,
    Path((owner, file)): Path<(String, String)>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let owner = parse_owner(&owner)?;
    let frames = state
        .node
        .download(owner, &file, query.offset, query.length)
        .await?;

    let body = Body::from_stream(encode_frames(frames));
    Ok((StatusCode::OK, body).into_response())
}

async fn latest_handler(
    State(state): State<Arc<ServerState>>,
    Path((owner, file)): Path<(String, String)>,
) -> ApiResult<Json<CheckpointBody>> {
    let owner = parse_owner(&owner)?;
    let latest = state.node.latest(owner, &file).await?;
    Ok(Json(CheckpointBody::encode(latest.as_ref())?))
}

async fn index_handler(
    State(state): State<Arc<ServerState>>,
    Path((owner, file)): Path<(String, String)>,
) -> ApiResult<Json<IndexBody>> {
    let owner = parse_owner(&owner)?;
    let positions = state.node.list_index(owner, &file).await?;
    Ok(Json(IndexBody { positions }))
}

async fn list_handler(
    State(state): State<Arc<ServerState>>,
    Path(owner): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<CheckpointListBody>> {
    let owner = parse_owner(&owner)?;
    let checkpoints = state.node.list(owner, &query.glob).await?;
    Ok(Json(CheckpointListBody::encode(&checkpoints)?))
}

async fn delete_handler(
    State(state): State<Arc<ServerState>>,
    Path(owner): Path<String>,
    Json(body): Json<EnvelopeBody>,
) -> ApiResult<StatusCode> {
    let owner = parse_owner(&owner)?;
    let tombstone: SignedCheckpoint = parse_envelope(&body)?;
    state.node.delete(owner, tombstone).await?;
    Ok(StatusCode::NO_CONTENT)
}
