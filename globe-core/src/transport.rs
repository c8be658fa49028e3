//! HTTP plumbing shared by the peer and discovery clients.

use crate::error::{GlobeError, Result};
use reqwest::{Response, Url};
use serde::{Deserialize, Serialize};

/// Error body returned by every Globe HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

impl From<&GlobeError> for ErrorBody {
    fn from(error: &GlobeError) -> Self {
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

pub fn base_url(address: &str) -> Result<Url> {
    let address = address.trim().trim_end_matches('/');
    let with_scheme = if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    };
    Url::parse(&with_scheme)
        .map_err(|e| GlobeError::Config(format!("invalid address '{}': {}", address, e)))
}

/// Append path segments to `base`, percent-encoding each one. A filename is split
/// on '/' so that nested names map onto nested segments.
pub fn endpoint(base: &Url, segments: &[&str], filename: Option<&str>) -> Result<Url> {
    let mut url = base.clone();
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| GlobeError::Config(format!("address '{}' cannot be a base", base)))?;
        path.pop_if_empty();
        path.extend(segments);
        if let Some(filename) = filename {
            path.extend(filename.split('/'));
        }
    }
    Ok(url)
}

pub fn request_error(error: reqwest::Error) -> GlobeError {
    GlobeError::PeerUnavailable(error.to_string())
}

/// Pass successful responses through; turn error responses back into `GlobeError`.
pub async fn check_response(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.map_err(request_error)?;
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => Err(GlobeError::from_kind(&body.kind, body.message)),
        Err(_) if status.as_u16() == 404 => Err(GlobeError::NotFound(text)),
        Err(_) => Err(GlobeError::Http(format!("{}: {}", status, text))),
    }
}
