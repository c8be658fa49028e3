use globe_core::{GlobeError, NodeConfig, PublicKey, Result, ServerId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeSection,
    /// Server id to HTTP address. Ids missing here are dialed as addresses.
    #[serde(default)]
    pub peers: HashMap<ServerId, String>,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    /// Owners (hex public keys) looked up at startup so catch-up covers them early.
    #[serde(default)]
    pub watch_owners: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    pub server_id: ServerId,
    pub bind_addr: String,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Serve an in-memory discovery directory under `/discovery` on this node.
    #[serde(default = "default_embedded")]
    pub embedded: bool,
    #[serde(default)]
    pub url: Option<String>,
}

fn default_embedded() -> bool {
    true
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            embedded: default_embedded(),
            url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_announcement_ttl_secs")]
    pub announcement_ttl_secs: u64,
    #[serde(default = "default_announcement_cache_capacity")]
    pub announcement_cache_capacity: usize,
    #[serde(default = "default_max_segment_bytes")]
    pub max_segment_bytes: usize,
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,
    #[serde(default)]
    pub evict_after_push: bool,
    #[serde(default = "default_push_interval_secs")]
    pub push_interval_secs: u64,
    #[serde(default = "default_catch_up_interval_secs")]
    pub catch_up_interval_secs: u64,
    #[serde(default = "default_fetch_interval_secs")]
    pub fetch_interval_secs: u64,
}

fn default_announcement_ttl_secs() -> u64 {
    30
}

fn default_announcement_cache_capacity() -> usize {
    1024
}

fn default_max_segment_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_read_chunk_bytes() -> usize {
    64 * 1024
}

fn default_push_interval_secs() -> u64 {
    60
}

fn default_catch_up_interval_secs() -> u64 {
    60
}

fn default_fetch_interval_secs() -> u64 {
    300
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            announcement_ttl_secs: default_announcement_ttl_secs(),
            announcement_cache_capacity: default_announcement_cache_capacity(),
            max_segment_bytes: default_max_segment_bytes(),
            read_chunk_bytes: default_read_chunk_bytes(),
            evict_after_push: false,
            push_interval_secs: default_push_interval_secs(),
            catch_up_interval_secs: default_catch_up_interval_secs(),
            fetch_interval_secs: default_fetch_interval_secs(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(
                ::config::Environment::with_prefix("GLOBE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| GlobeError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| GlobeError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.node.server_id.trim().is_empty() {
            return Err(GlobeError::Config("node.server_id must not be empty".to_string()));
        }
        if !self.discovery.embedded && self.discovery.url.is_none() {
            return Err(GlobeError::Config(
                "discovery needs either embedded = true or a url".to_string(),
            ));
        }
        if self.replication.read_chunk_bytes == 0 || self.replication.max_segment_bytes == 0 {
            return Err(GlobeError::Config(
                "replication byte limits must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn node_config(&self) -> NodeConfig {
        let replication = &self.replication;
        let mut node = NodeConfig::new(self.node.server_id.clone());
        node.announcement_ttl = Duration::from_secs(replication.announcement_ttl_secs);
        node.announcement_cache_capacity = replication.announcement_cache_capacity;
        node.max_segment_bytes = replication.max_segment_bytes;
        node.read_chunk_bytes = replication.read_chunk_bytes;
        node.evict_after_push = replication.evict_after_push;
        node
    }

    pub fn watched_owners(&self) -> Result<Vec<PublicKey>> {
        self.watch_owners
            .iter()
            .map(|hex| PublicKey::from_hex(hex))
            .collect()
    }
}
