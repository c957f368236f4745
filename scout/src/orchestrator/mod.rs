//! Refresh cycles: discovery, merge, statistics, then background enrichment.
//!
//! Discovery passes are single-flight. A trigger that arrives while a pass is
//! running is coalesced and reported as [`RefreshOutcome::AlreadyRunning`].
//! Enrichment has a single lane: settling a new cycle cancels the previous
//! cycle's enrichment, carries known locations over by identity key, and
//! starts one run for the nodes still missing one. All runs share one pacer,
//! so the spacing between geo requests holds across cycles.

pub mod snapshot;

pub use snapshot::{ConnectionState, Phase, Snapshot, SnapshotStore, Stats};

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::discovery::{
    self, DirectQueryConfig, Location, Node, endpoint_priority, merge, polling_list, reference_ips,
};
use crate::geo::{self, EnrichmentPolicy, EnrichmentReport, GeoLookup, Pacer};
use crate::infrastructure::audit::{self, AuditEvent};
use crate::infrastructure::config::Settings;
use crate::infrastructure::preferences::{PreferenceError, PreferenceStore, Preferences};
use crate::rpc::RpcClient;
use crate::ws::Broadcaster;

/// Source tag for node sets produced by direct polling.
pub const DIRECT_SOURCE: &str = "direct";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("'{0}' is not a valid ip:port address")]
    InvalidAddress(String),
    #[error("endpoint must not be empty")]
    EmptyEndpoint,
    #[error(transparent)]
    Preferences(#[from] PreferenceError),
}

#[derive(Debug)]
pub enum RefreshOutcome {
    AlreadyRunning,
    Failed {
        cycle: u64,
        reason: String,
    },
    Completed {
        cycle: u64,
        nodes: usize,
        source: String,
        /// Background enrichment of this cycle, if any candidate qualified.
        enrichment: Option<JoinHandle<EnrichmentReport>>,
    },
}

struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Orchestrator {
    rpc: Arc<RpcClient>,
    geo: Arc<dyn GeoLookup>,
    store: Arc<dyn PreferenceStore>,
    settings: Settings,
    prefs: RwLock<Preferences>,
    snapshot: SnapshotStore,
    discovering: AtomicBool,
    cycle: AtomicU64,
    geo_pacer: Pacer,
    enrichment: Mutex<Option<AbortHandle>>,
}

impl Orchestrator {
    pub fn new(
        settings: Settings,
        rpc: Arc<RpcClient>,
        geo: Arc<dyn GeoLookup>,
        store: Arc<dyn PreferenceStore>,
        broadcaster: Broadcaster,
    ) -> Result<Self, PreferenceError> {
        let prefs = store.load()?;
        info!(
            endpoint_override = ?prefs.endpoint_override,
            active_endpoint = ?prefs.active_endpoint,
            custom_addresses = prefs.custom_addresses.len(),
            "Loaded discovery preferences"
        );
        let geo_pacer = Pacer::new(settings.geo.request_spacing());
        Ok(Self {
            rpc,
            geo,
            store,
            settings,
            prefs: RwLock::new(prefs),
            snapshot: SnapshotStore::new(broadcaster),
            discovering: AtomicBool::new(false),
            cycle: AtomicU64::new(0),
            geo_pacer,
            enrichment: Mutex::new(None),
        })
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.read()
    }

    pub fn snapshot_store(&self) -> &SnapshotStore {
        &self.snapshot
    }

    pub fn is_discovering(&self) -> bool {
        self.discovering.load(Ordering::Acquire)
    }

    pub fn relay_active(&self) -> bool {
        self.rpc.relay_active()
    }

    pub fn preferences(&self) -> Preferences {
        self.prefs.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn direct_config(&self) -> DirectQueryConfig {
        DirectQueryConfig {
            batch_size: self.settings.discovery.batch_size,
            health_timeout: self.settings.rpc.health_timeout(),
            call_timeout: self.rpc.default_timeout(),
        }
    }

    fn enrichment_policy(&self) -> EnrichmentPolicy {
        EnrichmentPolicy {
            max_lookups: self.settings.geo.max_lookups,
            timeout: self.settings.geo.request_timeout(),
        }
    }

    /// Runs one discovery pass and starts enrichment in the background.
    pub async fn refresh(self: &Arc<Self>) -> RefreshOutcome {
        let Some(_guard) = FlightGuard::acquire(&self.discovering) else {
            debug!("Discovery already in progress, coalescing trigger");
            return RefreshOutcome::AlreadyRunning;
        };

        let cycle = self.cycle.fetch_add(1, Ordering::AcqRel) + 1;
        let span = info_span!("discovery_cycle", cycle, cycle_id = %uuid::Uuid::new_v4());
        self.run_cycle(cycle).instrument(span).await
    }

    async fn run_cycle(self: &Arc<Self>, cycle: u64) -> RefreshOutcome {
        let started = Instant::now();
        self.snapshot.update(|s| {
            s.cycle = cycle;
            s.phase = Phase::Discovering;
            s.connection = ConnectionState::Connecting;
        });

        let prefs = self.preferences();
        let endpoints = endpoint_priority(
            prefs.endpoint_override.as_deref(),
            prefs.active_endpoint.as_deref(),
            &self.settings.discovery.fallback_endpoints,
        );
        let reference = reference_ips(&self.settings.discovery.known_addresses);

        let cluster = discovery::discover(
            &self.rpc,
            &endpoints,
            &reference,
            self.settings.discovery.cluster_timeout(),
        )
        .await;

        let mut cluster_nodes = Vec::new();
        if let Some(outcome) = cluster {
            self.record_active_endpoint(&outcome.endpoint);
            if !outcome.nodes.is_empty() {
                let nodes = merge(outcome.nodes);
                return self.settle(cycle, nodes, outcome.endpoint, None, None, started);
            }
            cluster_nodes = outcome.nodes;
        }

        info!("Cluster discovery produced no nodes, polling known addresses directly");
        let addresses = polling_list(&self.settings.discovery.known_addresses, &prefs.custom_addresses);
        let direct = discovery::poll_known_addresses(&self.rpc, &addresses, self.direct_config()).await;
        let diagnostic = direct.unreachable_diagnostic();
        if let Some(ref msg) = diagnostic {
            warn!(polled = direct.polled, "{}", msg);
        }

        let nodes = merge(cluster_nodes.into_iter().chain(direct.nodes));
        if nodes.is_empty() {
            let reason = if endpoints.is_empty() && addresses.is_empty() {
                "no discovery endpoints or known addresses are configured".to_string()
            } else {
                format!(
                    "cluster discovery failed on {} endpoint(s) and direct polling of {} address(es) produced no nodes",
                    endpoints.len(),
                    addresses.len()
                )
            };
            return self.fail(cycle, reason, started);
        }

        self.settle(
            cycle,
            nodes,
            DIRECT_SOURCE.to_string(),
            diagnostic,
            Some(direct.reachable),
            started,
        )
    }

    fn fail(&self, cycle: u64, reason: String, started: Instant) -> RefreshOutcome {
        error!(reason = %reason, "Discovery cycle failed");
        self.snapshot.update(|s| {
            s.phase = Phase::SettledError;
            s.connection = ConnectionState::Error;
            s.source = None;
            s.reachable = None;
            s.error = Some(reason.clone());
            s.nodes.clear();
            s.stats = Stats::default();
        });
        record_cycle_metrics("error", &Stats::default(), started);
        RefreshOutcome::Failed { cycle, reason }
    }

    /// Locations already published for nodes that kept the same key and IP.
    fn carry_over_locations(&self, nodes: &mut [Node]) -> usize {
        let known: HashMap<(String, IpAddr), Location> = self
            .snapshot
            .read()
            .nodes
            .into_iter()
            .filter_map(|n| {
                let ip = n.address?.ip();
                Some(((n.key().to_string(), ip), n.location?))
            })
            .collect();

        let mut carried = 0;
        for node in nodes.iter_mut().filter(|n| n.location.is_none()) {
            let Some(ip) = node.address.map(|a| a.ip()) else {
                continue;
            };
            if let Some(location) = known.get(&(node.key().to_string(), ip)) {
                node.set_location(location.clone());
                carried += 1;
            }
        }
        carried
    }

    fn settle(
        self: &Arc<Self>,
        cycle: u64,
        mut nodes: Vec<Node>,
        source: String,
        diagnostic: Option<String>,
        reachable: Option<usize>,
        started: Instant,
    ) -> RefreshOutcome {
        let mut lane = self.enrichment.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = lane.take().filter(|h| !h.is_finished()) {
            debug!("Cancelling enrichment of the previous cycle");
            previous.abort();
        }

        let policy = self.enrichment_policy();
        let carried = self.carry_over_locations(&mut nodes);
        let candidates = geo::select_candidates(&nodes, policy.max_lookups);
        let stats = Stats::compute(&nodes);
        let count = nodes.len();

        info!(
            source = %source,
            nodes = count,
            healthy = stats.healthy,
            target = stats.target,
            geo_candidates = candidates.len(),
            locations_carried = carried,
            "Discovery cycle settled"
        );
        record_cycle_metrics("ok", &stats, started);

        self.snapshot.update(|s| {
            s.nodes = nodes;
            s.stats = stats;
            s.connection = ConnectionState::Connected;
            s.source = Some(source.clone());
            s.error = diagnostic;
            s.reachable = reachable;
            s.phase = if candidates.is_empty() {
                Phase::SettledOk
            } else {
                Phase::Enriching
            };
        });

        let enrichment = (!candidates.is_empty()).then(|| {
            let this = Arc::clone(self);
            let span = info_span!("geo_enrichment", cycle);
            tokio::spawn(
                async move {
                    let report = geo::enrich(&*this.geo, &this.geo_pacer, &candidates, policy, |id, location| {
                        this.snapshot.apply_location(id, location);
                    })
                    .await;
                    this.snapshot.update(|s| {
                        if s.cycle == cycle && s.phase == Phase::Enriching {
                            s.phase = Phase::SettledOk;
                        }
                    });
                    report
                }
                .instrument(span),
            )
        });
        *lane = enrichment.as_ref().map(|h| h.abort_handle());
        drop(lane);

        RefreshOutcome::Completed {
            cycle,
            nodes: count,
            source,
            enrichment,
        }
    }

    /// Starts a refresh without waiting for it. Returns false when a
    /// discovery pass is already running.
    pub fn trigger(self: &Arc<Self>) -> bool {
        if self.is_discovering() {
            return false;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.refresh().await;
        });
        true
    }

    /// Timer loop. The first tick fires immediately; with periodic refresh
    /// disabled only that initial pass runs.
    pub async fn run(self: Arc<Self>, shutdown: Arc<Notify>) {
        let stop = shutdown.notified();
        tokio::pin!(stop);

        let Some(period) = self.settings.discovery.refresh_interval() else {
            info!("Periodic refresh disabled");
            self.trigger();
            stop.await;
            return;
        };

        info!(interval_secs = period.as_secs(), "Refresh scheduler started");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.trigger() {
                        debug!("Skipping timer tick, discovery still running");
                    }
                }
                _ = &mut stop => {
                    info!("Refresh scheduler stopping");
                    break;
                }
            }
        }
    }

    fn record_active_endpoint(&self, endpoint: &str) {
        let mut prefs = self.prefs.write().unwrap_or_else(PoisonError::into_inner);
        if prefs.active_endpoint.as_deref() == Some(endpoint) {
            return;
        }
        let previous = prefs.active_endpoint.replace(endpoint.to_string());
        if let Err(e) = self.store.save(&prefs) {
            warn!(error = %e, "Failed to persist active endpoint");
        }
        audit::log_audit(AuditEvent::ActiveEndpointChanged {
            previous,
            current: endpoint.to_string(),
        });
    }

    /// Applies a change to the preferences and persists it. The in-memory
    /// value only changes when the write succeeded.
    fn change_preferences<F>(&self, f: F) -> Result<Preferences, OrchestratorError>
    where
        F: FnOnce(&mut Preferences),
    {
        let mut prefs = self.prefs.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = prefs.clone();
        f(&mut next);
        self.store.save(&next)?;
        *prefs = next.clone();
        Ok(next)
    }

    pub fn set_endpoint_override(&self, endpoint: Option<String>) -> Result<(), OrchestratorError> {
        let endpoint = match endpoint.map(|e| e.trim().to_string()) {
            Some(e) if e.is_empty() => return Err(OrchestratorError::EmptyEndpoint),
            other => other,
        };
        let mut old = None;
        self.change_preferences(|p| {
            old = std::mem::replace(&mut p.endpoint_override, endpoint.clone());
        })?;
        audit::log_audit(AuditEvent::ConfigChanged {
            key: "endpoint_override".into(),
            old_val: old.unwrap_or_else(|| "<unset>".into()),
            new_val: endpoint.unwrap_or_else(|| "<unset>".into()),
        });
        Ok(())
    }

    /// Returns false when the address was already present.
    pub fn add_custom_address(&self, address: &str) -> Result<bool, OrchestratorError> {
        let address = address.trim();
        let parsed: SocketAddr = address
            .parse()
            .map_err(|_| OrchestratorError::InvalidAddress(address.to_string()))?;
        let normalized = parsed.to_string();

        if self.preferences().custom_addresses.contains(&normalized) {
            return Ok(false);
        }
        self.change_preferences(|p| p.custom_addresses.push(normalized.clone()))?;
        audit::log_audit(AuditEvent::ConfigChanged {
            key: "custom_addresses".into(),
            old_val: String::new(),
            new_val: format!("+{}", normalized),
        });
        Ok(true)
    }

    /// Returns false when the address was not present.
    pub fn remove_custom_address(&self, address: &str) -> Result<bool, OrchestratorError> {
        let address = address.trim().to_string();
        if !self.preferences().custom_addresses.contains(&address) {
            return Ok(false);
        }
        self.change_preferences(|p| p.custom_addresses.retain(|a| a != &address))?;
        audit::log_audit(AuditEvent::ConfigChanged {
            key: "custom_addresses".into(),
            old_val: format!("-{}", address),
            new_val: String::new(),
        });
        Ok(true)
    }
}

fn record_cycle_metrics(outcome: &'static str, stats: &Stats, started: Instant) {
    metrics::counter!("scout_discovery_cycles_total", "outcome" => outcome).increment(1);
    metrics::histogram!("scout_discovery_duration_seconds").record(started.elapsed().as_secs_f64());
    metrics::gauge!("scout_nodes").set(stats.total as f64);
    metrics::gauge!("scout_nodes_healthy").set(stats.healthy as f64);
    metrics::gauge!("scout_nodes_target").set(stats.target as f64);
}
