//! Bootstrap node ranking.

use crate::core::ChannelType;

use super::directory::{ChannelSupport, ClusterNodeInfo};

/// Connection candidate handed to an attaching endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDescriptor {
    /// Reachable host name or address.
    pub host: String,
    /// Transport port.
    pub port: u16,
    /// Channels the node serves.
    pub channels: Vec<ChannelSupport>,
    /// Node public key, for endpoint-side session encryption.
    pub public_key: Vec<u8>,
}

impl From<&ClusterNodeInfo> for NodeDescriptor {
    fn from(info: &ClusterNodeInfo) -> Self {
        Self {
            host: info.host.clone(),
            port: info.port,
            channels: info.channels.clone(),
            public_key: info.public_key.clone(),
        }
    }
}

/// Rank candidate nodes for an endpoint requesting `channel`.
///
/// Nodes that support the channel come first, ordered by ascending
/// pending-to-processed load ratio; non-supporting nodes trail as a
/// last resort, in their own load order. Ties keep the input order.
pub fn rank(channel: ChannelType, nodes: &[ClusterNodeInfo]) -> Vec<NodeDescriptor> {
    let mut candidates: Vec<&ClusterNodeInfo> = nodes.iter().collect();
    candidates.sort_by(|a, b| {
        b.supports(channel)
            .cmp(&a.supports(channel))
            .then_with(|| {
                let la = load_for(a, channel);
                let lb = load_for(b, channel);
                la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
            })
    });
    candidates.into_iter().map(NodeDescriptor::from).collect()
}

fn load_for(node: &ClusterNodeInfo, channel: ChannelType) -> f64 {
    node.stats_for(channel).map_or(0.0, |stats| stats.load_ratio())
}
