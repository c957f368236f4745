use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tracing::info;

use crate::geo::{GeoLookup, IpApiClient};
use crate::infrastructure::config::Settings;
use crate::infrastructure::preferences::{
    FilePreferenceStore, MemoryPreferenceStore, PreferenceStore,
};
use crate::orchestrator::Orchestrator;
use crate::rpc::RpcClient;
use crate::ws::Broadcaster;

/// State shared by the HTTP server, the WebSocket handler and the scheduler.
pub struct ScoutHostState {
    pub orchestrator: Arc<Orchestrator>,
    pub metrics: Option<PrometheusHandle>,
}

impl ScoutHostState {
    pub fn new(orchestrator: Arc<Orchestrator>, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            orchestrator,
            metrics,
        }
    }

    /// Wires the production collaborators from configuration.
    pub async fn from_settings(
        settings: &Settings,
        metrics: Option<PrometheusHandle>,
    ) -> Result<Self> {
        let rpc = RpcClient::connect(&settings.rpc)
            .await
            .context("failed to build rpc client")?;
        info!(relay = rpc.relay_active(), "RPC client ready");

        let geo: Arc<dyn GeoLookup> =
            Arc::new(IpApiClient::new(&settings.geo).context("failed to build geo client")?);

        let store: Arc<dyn PreferenceStore> = match &settings.preferences.path {
            Some(path) => Arc::new(FilePreferenceStore::new(path.clone())),
            None => {
                info!("No preference path configured, preferences are kept in memory");
                Arc::new(MemoryPreferenceStore::default())
            }
        };

        let orchestrator = Orchestrator::new(
            settings.clone(),
            Arc::new(rpc),
            geo,
            store,
            Broadcaster::new(),
        )
        .context("failed to load preferences")?;

        Ok(Self::new(Arc::new(orchestrator), metrics))
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        self.orchestrator.snapshot_store().broadcaster()
    }
}
