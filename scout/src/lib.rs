//! Discovers cluster nodes over JSON-RPC, classifies and merges them,
//! enriches them with locations and serves the result over HTTP and
//! WebSocket.

pub mod discovery;
pub mod geo;
pub mod host;
pub mod infrastructure;
pub mod orchestrator;
pub mod rpc;
pub mod view;
pub mod ws;
