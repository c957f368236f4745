use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC "method not found".
pub const METHOD_NOT_FOUND: i64 = -32601;

pub mod methods {
    pub const GET_CLUSTER_NODES: &str = "getClusterNodes";
    pub const GET_HEALTH: &str = "getHealth";
    pub const GET_VERSION: &str = "getVersion";
    pub const GET_IDENTITY: &str = "getIdentity";
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: Vec<Value>,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// One entry of a `getClusterNodes` result.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNodeRecord {
    pub pubkey: Option<String>,
    pub gossip: Option<String>,
    pub tpu: Option<String>,
    pub rpc: Option<String>,
    pub version: Option<String>,
    pub feature_set: Option<u32>,
    pub shred_version: Option<u16>,
}

/// Parses a `getClusterNodes` result. Entries that do not deserialize are
/// skipped; a result that is not an array yields `None`.
pub fn parse_cluster_nodes(result: &Value) -> Option<Vec<ClusterNodeRecord>> {
    let entries = result.as_array()?;
    Some(
        entries
            .iter()
            .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
            .collect(),
    )
}
