//! Ranked request transports: a local relay and a direct HTTP POST.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::rpc::types::{RpcRequest, RpcResponse};

/// Header carrying the final destination when a request goes through the relay.
pub const RELAY_TARGET_HEADER: &str = "x-relay-target";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Transport-level failures let the next ranked transport try; a decode
    /// failure means the peer answered and there is nothing to retry.
    pub fn is_transport_level(&self) -> bool {
        !matches!(self, Self::Decode(_))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, target: &str, request: &RpcRequest) -> Result<RpcResponse, TransportError>;
}

/// Turns `host:port` into an HTTP URL; full URLs pass through.
pub fn target_url(target: &str) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        target.to_string()
    } else {
        format!("http://{}", target)
    }
}

async fn decode(response: reqwest::Response) -> Result<RpcResponse, TransportError> {
    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::Status(status.as_u16()));
    }
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| TransportError::Decode(e.to_string()))
}

#[derive(Clone)]
pub struct DirectTransport {
    client: Client,
}

impl DirectTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for DirectTransport {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn send(&self, target: &str, request: &RpcRequest) -> Result<RpcResponse, TransportError> {
        let response = self
            .client
            .post(target_url(target))
            .json(request)
            .send()
            .await?;
        decode(response).await
    }
}

/// Forwards requests through a relay that re-issues them to the target named
/// in [`RELAY_TARGET_HEADER`].
#[derive(Clone)]
pub struct RelayTransport {
    client: Client,
    relay_url: String,
}

impl RelayTransport {
    pub fn new(client: Client, relay_url: impl Into<String>) -> Self {
        Self {
            client,
            relay_url: relay_url.into(),
        }
    }

    /// One bounded reachability check. Any HTTP answer counts, including
    /// 404 or 405 from a relay that only routes POST.
    pub async fn probe(&self, timeout: Duration) -> bool {
        let attempt = tokio::time::timeout(timeout, self.client.get(&self.relay_url).send()).await;
        let reachable = match attempt {
            Ok(Ok(resp)) => {
                debug!(relay = %self.relay_url, status = resp.status().as_u16(), "Relay answered reachability check");
                true
            }
            _ => false,
        };
        if reachable {
            info!(relay = %self.relay_url, "Relay transport reachable");
        } else {
            debug!(relay = %self.relay_url, "Relay transport unavailable, using direct requests only");
        }
        reachable
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn name(&self) -> &'static str {
        "relay"
    }

    async fn send(&self, target: &str, request: &RpcRequest) -> Result<RpcResponse, TransportError> {
        let response = self
            .client
            .post(&self.relay_url)
            .header(RELAY_TARGET_HEADER, target_url(target))
            .json(request)
            .send()
            .await?;
        decode(response).await
    }
}
