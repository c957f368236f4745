//! Fallback discovery: poll every known address directly.
//!
//! Addresses are probed in fixed-width batches. Each probe issues four
//! independent calls (health, version, identity, neighbor listing); a failure
//! in one never cancels the others.

use futures_util::future::join_all;
use serde_json::Value;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::discovery::cluster::node_from_record;
use crate::discovery::types::{Health, Identity, Node};
use crate::rpc::{RpcClient, RpcOutcome, methods, parse_cluster_nodes};

#[derive(Debug, Clone)]
pub struct DirectOutcome {
    pub nodes: Vec<Node>,
    /// Addresses that produced at least one non-empty response.
    pub reachable: usize,
    pub polled: usize,
    pub batches: usize,
}

impl DirectOutcome {
    /// Diagnostic for the case where every known address stayed silent.
    pub fn unreachable_diagnostic(&self) -> Option<String> {
        (self.reachable == 0 && !self.nodes.is_empty()).then(|| {
            format!(
                "none of the {} known addresses answered any RPC method; they are likely firewalled",
                self.polled
            )
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DirectQueryConfig {
    pub batch_size: usize,
    pub health_timeout: Duration,
    pub call_timeout: Duration,
}

struct Probe {
    node: Node,
    neighbors: Vec<Node>,
    reachable: bool,
}

/// Reference list first, then custom additions, without duplicates.
pub fn polling_list(known: &[String], custom: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    known
        .iter()
        .chain(custom)
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty() && seen.insert(a.clone()))
        .collect()
}

fn health_from(outcome: &RpcOutcome) -> Option<Health> {
    outcome.result.as_ref().map(|v| match v.as_str() {
        Some("ok") => Health::Healthy,
        _ => Health::Unhealthy,
    })
}

fn version_from(value: &Value) -> Option<String> {
    value
        .get("solana-core")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn identity_from(value: &Value) -> Option<String> {
    value
        .get("identity")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

async fn probe(rpc: &RpcClient, addr: SocketAddr, cfg: DirectQueryConfig) -> Probe {
    let target = addr.to_string();
    let (health, version, identity, neighbors) = tokio::join!(
        rpc.call(&target, methods::GET_HEALTH, Vec::new(), cfg.health_timeout),
        rpc.call(&target, methods::GET_VERSION, Vec::new(), cfg.call_timeout),
        rpc.call(&target, methods::GET_IDENTITY, Vec::new(), cfg.call_timeout),
        rpc.call(&target, methods::GET_CLUSTER_NODES, Vec::new(), cfg.call_timeout),
    );

    let reachable = [&health, &version, &identity, &neighbors]
        .iter()
        .any(|o| o.result.is_some());

    let id = match identity.result.as_ref().and_then(identity_from) {
        Some(key) => Identity::Reported(key),
        None => Identity::synthesize(&addr),
    };
    let mut node = Node::new(id, version.result.as_ref().and_then(version_from));
    node.address = Some(addr);

    node.health = match health_from(&health) {
        Some(h) => h,
        None if version.result.is_some() || identity.result.is_some() => Health::Healthy,
        None => Health::Unknown,
    };
    node.latency_ms = [&health, &version, &identity]
        .iter()
        .find(|o| o.result.is_some())
        .map(|o| o.latency_ms());

    let neighbors = neighbors
        .result
        .as_ref()
        .and_then(parse_cluster_nodes)
        .map(|records| records.into_iter().filter_map(node_from_record).collect())
        .unwrap_or_default();

    debug!(
        address = %addr,
        node = %node.id(),
        health = node.health.as_str(),
        reachable,
        "Probed known address"
    );

    Probe {
        node,
        neighbors,
        reachable,
    }
}

/// Polls every address in `batch_size` chunks, waiting for each chunk to
/// finish before starting the next. Results keep address-list order, with
/// newly seen neighbors appended after the node that reported them.
pub async fn poll_known_addresses(
    rpc: &RpcClient,
    addresses: &[String],
    cfg: DirectQueryConfig,
) -> DirectOutcome {
    let parsed: Vec<SocketAddr> = addresses
        .iter()
        .filter_map(|a| match a.parse() {
            Ok(addr) => Some(addr),
            Err(_) => {
                warn!(address = %a, "Skipping unparseable known address");
                None
            }
        })
        .collect();

    let batch_size = cfg.batch_size.max(1);
    let mut nodes: Vec<Node> = Vec::new();
    let mut present: HashSet<String> = HashSet::new();
    let mut reachable = 0;
    let mut batches = 0;

    for chunk in parsed.chunks(batch_size) {
        batches += 1;
        let probes = join_all(chunk.iter().map(|addr| probe(rpc, *addr, cfg))).await;

        for p in probes {
            if p.reachable {
                reachable += 1;
            }
            present.insert(p.node.key().to_string());
            nodes.push(p.node);
            for neighbor in p.neighbors {
                if present.insert(neighbor.key().to_string()) {
                    nodes.push(neighbor);
                }
            }
        }
    }

    info!(
        polled = parsed.len(),
        batches,
        reachable,
        nodes = nodes.len(),
        "Direct polling finished"
    );

    DirectOutcome {
        nodes,
        reachable,
        polled: parsed.len(),
        batches,
    }
}
