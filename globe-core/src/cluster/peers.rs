use super::client::HttpFsNode;
use crate::discovery::ServerId;
use crate::error::{GlobeError, Result};
use crate::node::FsNode;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Routing table from server identifiers to reachable nodes.
pub trait PeerResolver: Send + Sync {
    fn resolve(&self, server_id: &str) -> Result<Arc<dyn FsNode>>;
}

/// Fixed set of in-process nodes.
#[derive(Default)]
pub struct StaticPeers {
    nodes: RwLock<HashMap<ServerId, Arc<dyn FsNode>>>,
}

impl StaticPeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, server_id: impl Into<ServerId>, node: Arc<dyn FsNode>) {
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.insert(server_id.into(), node);
        }
    }

    pub fn remove(&self, server_id: &str) -> Option<Arc<dyn FsNode>> {
        self.nodes.write().ok()?.remove(server_id)
    }
}

impl PeerResolver for StaticPeers {
    fn resolve(&self, server_id: &str) -> Result<Arc<dyn FsNode>> {
        let nodes = self
            .nodes
            .read()
            .map_err(|_| GlobeError::Internal("peer table poisoned".to_string()))?;
        nodes
            .get(server_id)
            .cloned()
            .ok_or_else(|| GlobeError::PeerUnavailable(format!("unknown server {}", server_id)))
    }
}

/// Resolves server identifiers to HTTP clients. An identifier without an explicit
/// address is used as the address itself.
pub struct HttpPeers {
    addresses: HashMap<ServerId, String>,
    client: reqwest::Client,
}

impl HttpPeers {
    pub fn new(addresses: HashMap<ServerId, String>, client: reqwest::Client) -> Self {
        Self { addresses, client }
    }
}

impl PeerResolver for HttpPeers {
    fn resolve(&self, server_id: &str) -> Result<Arc<dyn FsNode>> {
        let address = self
            .addresses
            .get(server_id)
            .map(String::as_str)
            .unwrap_or(server_id);
        Ok(Arc::new(HttpFsNode::new(address, self.client.clone())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_peers_unknown_server() {
        let peers = StaticPeers::new();
        let error = peers.resolve("nowhere").err().unwrap();
        assert!(error.is_peer_unavailable());
    }

    #[test]
    fn test_http_peers_resolve() {
        let mut addresses = HashMap::new();
        addresses.insert("alpha".to_string(), "127.0.0.1:7001".to_string());
        let peers = HttpPeers::new(addresses, reqwest::Client::new());
        assert!(peers.resolve("alpha").is_ok());
        assert!(peers.resolve("127.0.0.1:7002").is_ok());
    }
}
