//! JSON-RPC client with ranked transports and per-attempt timeouts.
//!
//! Failures never propagate to callers: a call yields either a result value
//! or nothing, together with the time it took.

pub mod transport;
pub mod types;

pub use transport::{DirectTransport, RelayTransport, Transport, TransportError};
pub use types::{ClusterNodeRecord, RpcRequest, RpcResponse, methods, parse_cluster_nodes};

use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::infrastructure::config::RpcSettings;

/// Result of one logical call across all attempted transports.
#[derive(Debug, Clone)]
pub struct RpcOutcome {
    pub result: Option<Value>,
    pub elapsed: Duration,
}

impl RpcOutcome {
    pub fn latency_ms(&self) -> u64 {
        self.elapsed.as_millis() as u64
    }
}

pub struct RpcClient {
    transports: Vec<Arc<dyn Transport>>,
    default_timeout: Duration,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Builds the client and probes the relay once; the probe result holds for
    /// the lifetime of the client.
    pub async fn connect(settings: &RpcSettings) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("node-scout/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let mut transports: Vec<Arc<dyn Transport>> = Vec::with_capacity(2);
        if let Some(relay_url) = settings.relay_url.as_deref() {
            let relay = RelayTransport::new(http.clone(), relay_url);
            if relay.probe(settings.relay_probe_timeout()).await {
                transports.push(Arc::new(relay));
            }
        }
        transports.push(Arc::new(DirectTransport::new(http)));

        Ok(Self::with_transports(transports, settings.default_timeout()))
    }

    pub fn with_transports(transports: Vec<Arc<dyn Transport>>, default_timeout: Duration) -> Self {
        Self {
            transports,
            default_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn relay_active(&self) -> bool {
        self.transports.iter().any(|t| t.name() == "relay")
    }

    pub async fn call(
        &self,
        address: &str,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> RpcOutcome {
        let request = RpcRequest::new(self.next_id.fetch_add(1, Ordering::Relaxed), method, params);
        let started = Instant::now();
        let mut outcome_label = "no_result";
        let mut result = None;

        for transport in &self.transports {
            let attempt = tokio::time::timeout(timeout, transport.send(address, &request))
                .await
                .unwrap_or(Err(TransportError::Timeout(timeout)));

            match attempt {
                Ok(response) => {
                    if let Some(err) = response.error {
                        if err.code == types::METHOD_NOT_FOUND {
                            debug!(address, method, "Method not supported by endpoint");
                        } else {
                            warn!(address, method, code = err.code, message = %err.message, "RPC error response");
                        }
                        outcome_label = "rpc_error";
                    } else {
                        result = response.result.filter(|v| !v.is_null());
                        if result.is_some() {
                            outcome_label = "ok";
                        }
                    }
                    break;
                }
                Err(e) if e.is_transport_level() => {
                    trace!(address, method, transport = transport.name(), error = %e, "Transport attempt failed");
                    outcome_label = if matches!(e, TransportError::Timeout(_)) {
                        "timeout"
                    } else {
                        "transport_error"
                    };
                }
                Err(e) => {
                    debug!(address, method, transport = transport.name(), error = %e, "Malformed RPC response");
                    outcome_label = "malformed";
                    break;
                }
            }
        }

        metrics::counter!("scout_rpc_calls_total", "method" => method.to_string(), "outcome" => outcome_label)
            .increment(1);

        RpcOutcome {
            result,
            elapsed: started.elapsed(),
        }
    }

    /// Same as [`RpcClient::call`] with the client default timeout.
    pub async fn call_default(&self, address: &str, method: &str) -> RpcOutcome {
        self.call(address, method, Vec::new(), self.default_timeout).await
    }
}
