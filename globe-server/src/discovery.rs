//! Embedded discovery directory, served under `/discovery` when no external one is configured.

use crate::server::{ApiError, parse_envelope, parse_owner};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use globe_core::discovery::EnvelopeBody;
use globe_core::{
    Announcement, DiscoveryService, GlobeError, KeyHash, LocalDiscoveryService, Signed,
    SharedKey,
};
use std::sync::Arc;

type Directory = Arc<LocalDiscoveryService>;

pub fn routes(directory: Directory) -> Router {
    Router::new()
        .route("/discovery/announce/:owner", put(announce_handler))
        .route("/discovery/find/:owner", get(find_handler))
        .route("/discovery/share/:owner", post(share_handler))
        .route(
            "/discovery/shared/:owner/:receiver/:hash",
            get(shared_key_handler),
        )
        .with_state(directory)
}

fn envelope_response<T>(record: Option<Signed<T>>) -> Result<Response, ApiError> {
    match record {
        Some(record) => {
            let body = EnvelopeBody {
                envelope: record.to_hex()?,
            };
            Ok((StatusCode::OK, Json(body)).into_response())
        }
        None => Err(ApiError::from(GlobeError::NotFound(
            "no such discovery record".to_string(),
        ))),
    }
}

async fn announce_handler(
    State(directory): State<Directory>,
    Path(owner): Path<String>,
    Json(body): Json<EnvelopeBody>,
) -> Result<StatusCode, ApiError> {
    let owner = parse_owner(&owner)?;
    let announcement: Signed<Announcement> = parse_envelope(&body)?;
    directory.announce(owner, announcement).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn find_handler(
    State(directory): State<Directory>,
    Path(owner): Path<String>,
) -> Result<Response, ApiError> {
    let owner = parse_owner(&owner)?;
    envelope_response(directory.find(owner).await?)
}

async fn share_handler(
    State(directory): State<Directory>,
    Path(owner): Path<String>,
    Json(body): Json<EnvelopeBody>,
) -> Result<StatusCode, ApiError> {
    let owner = parse_owner(&owner)?;
    let record: Signed<SharedKey> = parse_envelope(&body)?;
    directory.share_key(owner, record).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn shared_key_handler(
    State(directory): State<Directory>,
    Path((owner, receiver, hash)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let owner = parse_owner(&owner)?;
    let receiver = parse_owner(&receiver)?;
    let hash = KeyHash::from_hex(&hash)
        .map_err(|e| GlobeError::InvalidRequest(format!("bad key hash: {}", e)))?;
    envelope_response(directory.get_shared_key(owner, receiver, hash).await?)
}
