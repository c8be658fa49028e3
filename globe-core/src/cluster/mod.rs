pub mod client;
pub mod peers;
pub mod wire;

pub use client::HttpFsNode;
pub use peers::{HttpPeers, PeerResolver, StaticPeers};
