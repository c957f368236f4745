//! Primary discovery: ask aggregator endpoints for the full cluster node list.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::discovery::types::{Health, Identity, Node};
use crate::rpc::{ClusterNodeRecord, RpcClient, methods, parse_cluster_nodes};

/// Winning endpoint and the nodes it produced.
#[derive(Debug, Clone)]
pub struct ClusterOutcome {
    pub endpoint: String,
    pub nodes: Vec<Node>,
}

/// Override first, then the last successful endpoint, then the fallbacks.
pub fn endpoint_priority(
    endpoint_override: Option<&str>,
    active_endpoint: Option<&str>,
    fallbacks: &[String],
) -> Vec<String> {
    let mut ordered: Vec<String> = Vec::new();
    let candidates = endpoint_override
        .into_iter()
        .chain(active_endpoint)
        .chain(fallbacks.iter().map(String::as_str));
    for endpoint in candidates {
        let endpoint = endpoint.trim();
        if !endpoint.is_empty() && !ordered.iter().any(|e| e == endpoint) {
            ordered.push(endpoint.to_string());
        }
    }
    ordered
}

/// IPs of the reference list. Entries may be `ip:port` or a bare IP.
pub fn reference_ips(addresses: &[String]) -> HashSet<IpAddr> {
    addresses
        .iter()
        .filter_map(|a| {
            a.parse::<SocketAddr>()
                .map(|s| s.ip())
                .or_else(|_| a.parse::<IpAddr>())
                .ok()
        })
        .collect()
}

fn parse_endpoint(field: Option<&str>) -> Option<SocketAddr> {
    field.and_then(|f| f.parse().ok())
}

/// Maps a cluster listing entry to a node. Health is optimistic because the
/// aggregator only lists nodes it currently sees in gossip.
///
/// Entries without a pubkey get an address-derived key; entries with neither
/// a pubkey nor a usable address cannot be tracked and are dropped.
pub fn node_from_record(record: ClusterNodeRecord) -> Option<Node> {
    let address = parse_endpoint(record.gossip.as_deref()).or_else(|| parse_endpoint(record.rpc.as_deref()));

    let id = match record.pubkey.filter(|k| !k.is_empty()) {
        Some(pubkey) => Identity::Reported(pubkey),
        None => match address {
            Some(addr) => Identity::synthesize(&addr),
            None => {
                debug!(gossip = ?record.gossip, rpc = ?record.rpc, "Dropping cluster entry without identity or address");
                return None;
            }
        },
    };

    let mut node = Node::new(id, record.version);
    node.health = Health::Healthy;
    node.address = address;
    node.rpc = record.rpc;
    node.tpu = record.tpu;
    node.feature_set = record.feature_set;
    node.shred_version = record.shred_version;
    Some(node)
}

fn matches_reference(node: &Node, reference: &HashSet<IpAddr>) -> bool {
    let ip_of = |s: &Option<String>| parse_endpoint(s.as_deref()).map(|a| a.ip());
    node.address.map(|a| a.ip()).into_iter()
        .chain(ip_of(&node.rpc))
        .chain(ip_of(&node.tpu))
        .any(|ip| reference.contains(&ip))
}

/// Keeps target-version nodes and reference-address nodes, unioned by key.
/// When neither subset matches anything the full listing is returned.
pub fn select_nodes(all: Vec<Node>, reference: &HashSet<IpAddr>) -> Vec<Node> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut selected = Vec::new();

    let targets = all.iter().filter(|n| n.is_target());
    let known = all.iter().filter(|n| matches_reference(n, reference));
    for node in targets.chain(known) {
        if seen.insert(node.key().to_string()) {
            selected.push(node.clone());
        }
    }

    if selected.is_empty() {
        debug!(total = all.len(), "No target or reference nodes matched, keeping full listing");
        return all;
    }
    selected
}

/// Tries each endpoint once, in order, stopping at the first well-formed
/// listing. Returns `None` when every endpoint failed.
pub async fn discover(
    rpc: &RpcClient,
    endpoints: &[String],
    reference: &HashSet<IpAddr>,
    timeout: Duration,
) -> Option<ClusterOutcome> {
    for endpoint in endpoints {
        let outcome = rpc
            .call(endpoint, methods::GET_CLUSTER_NODES, Vec::new(), timeout)
            .await;

        let Some(records) = outcome.result.as_ref().and_then(parse_cluster_nodes) else {
            warn!(endpoint = %endpoint, elapsed_ms = outcome.latency_ms(), "Cluster discovery endpoint failed, trying next");
            continue;
        };

        let total = records.len();
        let all: Vec<Node> = records.into_iter().filter_map(node_from_record).collect();
        let nodes = select_nodes(all, reference);
        info!(endpoint = %endpoint, listed = total, selected = nodes.len(), "Cluster discovery succeeded");

        return Some(ClusterOutcome {
            endpoint: endpoint.clone(),
            nodes,
        });
    }

    warn!(tried = endpoints.len(), "Cluster discovery exhausted all endpoints");
    None
}
