use thiserror::Error;

#[derive(Error, Debug)]
pub enum GlobeError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Checkpoint conflict: {0}")]
    Conflict(String),

    #[error("File is tombstoned: {0}")]
    Tombstoned(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("Peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("Upload already in progress: {0}")]
    UploadInProgress(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for GlobeError {
    fn from(error: serde_json::Error) -> Self {
        GlobeError::Serialization(error.to_string())
    }
}

impl From<postcard::Error> for GlobeError {
    fn from(error: postcard::Error) -> Self {
        GlobeError::Serialization(error.to_string())
    }
}

impl GlobeError {
    /// Stable, wire-visible name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            GlobeError::NotFound(_) => "not_found",
            GlobeError::Conflict(_) => "conflict",
            GlobeError::Tombstoned(_) => "tombstoned",
            GlobeError::Verification(_) => "verification",
            GlobeError::KeyUnavailable(_) => "key_unavailable",
            GlobeError::PeerUnavailable(_) => "peer_unavailable",
            GlobeError::UploadInProgress(_) => "upload_in_progress",
            GlobeError::InvalidRequest(_) => "invalid_request",
            _ => "internal",
        }
    }

    /// Rebuild an error received from a peer.
    pub fn from_kind(kind: &str, message: String) -> Self {
        match kind {
            "not_found" => GlobeError::NotFound(message),
            "conflict" => GlobeError::Conflict(message),
            "tombstoned" => GlobeError::Tombstoned(message),
            "verification" => GlobeError::Verification(message),
            "key_unavailable" => GlobeError::KeyUnavailable(message),
            "peer_unavailable" => GlobeError::PeerUnavailable(message),
            "upload_in_progress" => GlobeError::UploadInProgress(message),
            "invalid_request" => GlobeError::InvalidRequest(message),
            _ => GlobeError::Internal(message),
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            GlobeError::NotFound(_) => 404,
            GlobeError::Conflict(_) | GlobeError::UploadInProgress(_) => 409,
            GlobeError::Tombstoned(_) => 410,
            GlobeError::Verification(_) => 422,
            GlobeError::InvalidRequest(_) => 400,
            GlobeError::KeyUnavailable(_) => 424,
            GlobeError::PeerUnavailable(_) => 503,
            _ => 500,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GlobeError::NotFound(_))
    }

    pub fn is_peer_unavailable(&self) -> bool {
        matches!(self, GlobeError::PeerUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, GlobeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        let errors = vec![
            GlobeError::NotFound("a".to_string()),
            GlobeError::Conflict("b".to_string()),
            GlobeError::Tombstoned("c".to_string()),
            GlobeError::Verification("d".to_string()),
            GlobeError::UploadInProgress("e".to_string()),
        ];

        for error in errors {
            let rebuilt = GlobeError::from_kind(error.kind(), "x".to_string());
            assert_eq!(rebuilt.kind(), error.kind());
            assert_eq!(rebuilt.http_status(), error.http_status());
        }

        let io = GlobeError::from(std::io::Error::other("disk"));
        assert_eq!(io.kind(), "internal");
        assert_eq!(io.http_status(), 500);
    }
}
