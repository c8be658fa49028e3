use crate::error::Result;
use crate::frame::SignedCheckpoint;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadQuery {
    #[serde(default)]
    pub offset: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadQuery {
    #[serde(default)]
    pub offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
}

fn default_glob() -> String {
    "*".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_glob")]
    pub glob: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionBody {
    pub position: u64,
}

/// Hex-encoded signed checkpoints, as exchanged between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointBody {
    pub checkpoint: Option<String>,
}

impl CheckpointBody {
    pub fn encode(checkpoint: Option<&SignedCheckpoint>) -> Result<Self> {
        Ok(Self {
            checkpoint: checkpoint.map(SignedCheckpoint::to_hex).transpose()?,
        })
    }

    pub fn decode(&self) -> Result<Option<SignedCheckpoint>> {
        self.checkpoint
            .as_deref()
            .map(SignedCheckpoint::from_hex)
            .transpose()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointListBody {
    pub checkpoints: Vec<String>,
}

impl CheckpointListBody {
    pub fn encode(checkpoints: &[SignedCheckpoint]) -> Result<Self> {
        Ok(Self {
            checkpoints: checkpoints
                .iter()
                .map(SignedCheckpoint::to_hex)
                .collect::<Result<_>>()?,
        })
    }

    pub fn decode(&self) -> Result<Vec<SignedCheckpoint>> {
        self.checkpoints
            .iter()
            .map(|hex| SignedCheckpoint::from_hex(hex))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexBody {
    pub positions: Vec<u64>,
}
