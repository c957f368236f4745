//! Rate-limited location enrichment.
//!
//! The upstream service allows roughly 45 requests per minute, so a cycle
//! enriches a capped prefix of candidates, one request at a time. Every
//! request goes through one [`Pacer`] shared by all cycles, which keeps the
//! fixed pause between requests even when enrichment runs are replaced.

pub mod client;

pub use client::{GeoError, GeoLookup, IpApiClient};

use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::discovery::{Identity, Location, Node};

#[derive(Debug, Clone, Copy)]
pub struct EnrichmentPolicy {
    pub max_lookups: usize,
    pub timeout: Duration,
}

/// Minimum gap between the end of one lookup and the start of the next,
/// across every run that shares it. A fresh pacer lets the first lookup go
/// out immediately.
pub struct Pacer {
    spacing: Duration,
    last: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            last: Mutex::new(None),
        }
    }

    /// Runs `request` once the gap since the previous one has passed. Callers
    /// queue behind each other. The slot is stamped before the request starts
    /// too, so a run cancelled mid-request still holds the next one back.
    pub async fn paced<F, T>(&self, request: F) -> T
    where
        F: Future<Output = T>,
    {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.spacing;
            if ready_at > Instant::now() {
                trace!(wait_ms = (ready_at - Instant::now()).as_millis() as u64, "Waiting for geo slot");
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
        let out = request.await;
        *last = Some(Instant::now());
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeoCandidate {
    pub id: Identity,
    pub ip: IpAddr,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichmentReport {
    pub attempted: usize,
    pub located: usize,
}

/// Public, routable addresses only.
pub fn is_usable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_unspecified()
                || v4.is_link_local()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            !(v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_unique_local()
                || v6.is_unicast_link_local())
        }
    }
}

/// First `cap` nodes in snapshot order that have a usable address and no
/// location yet.
pub fn select_candidates(nodes: &[Node], cap: usize) -> Vec<GeoCandidate> {
    nodes
        .iter()
        .filter(|n| n.location.is_none())
        .filter_map(|n| {
            let ip = n.address?.ip();
            is_usable(ip).then(|| GeoCandidate {
                id: n.id().clone(),
                ip,
            })
        })
        .take(cap)
        .collect()
}

/// Looks up candidates strictly in sequence, paced by `pacer`. `on_located`
/// runs as soon as each lookup succeeds so observers see progress mid-cycle.
/// Failures leave the node untouched and move on to the next candidate.
pub async fn enrich<F>(
    lookup: &dyn GeoLookup,
    pacer: &Pacer,
    candidates: &[GeoCandidate],
    policy: EnrichmentPolicy,
    mut on_located: F,
) -> EnrichmentReport
where
    F: FnMut(&Identity, Location),
{
    let mut report = EnrichmentReport::default();

    for candidate in candidates.iter().take(policy.max_lookups) {
        report.attempted += 1;

        let result = pacer
            .paced(tokio::time::timeout(policy.timeout, lookup.locate(candidate.ip)))
            .await
            .unwrap_or(Err(GeoError::Timeout));

        match result {
            Ok(location) => {
                report.located += 1;
                metrics::counter!("scout_geo_lookups_total", "outcome" => "ok").increment(1);
                on_located(&candidate.id, location);
            }
            Err(e) => {
                metrics::counter!("scout_geo_lookups_total", "outcome" => "failed").increment(1);
                debug!(node = %candidate.id, ip = %candidate.ip, error = %e, "Geo lookup failed");
            }
        }
    }

    info!(attempted = report.attempted, located = report.located, "Geo enrichment finished");
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeLookup {
        calls: Mutex<Vec<(IpAddr, Instant)>>,
        fail_for: Option<IpAddr>,
    }

    impl FakeLookup {
        fn new(fail_for: Option<IpAddr>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_for,
            }
        }
    }

    #[async_trait]
    impl GeoLookup for FakeLookup {
        async fn locate(&self, ip: IpAddr) -> Result<Location, GeoError> {
            self.calls.lock().unwrap().push((ip, Instant::now()));
            if Some(ip) == self.fail_for {
                return Err(GeoError::Status(500));
            }
            Ok(Location {
                country: "Testland".into(),
                country_code: "TL".into(),
                city: "Testville".into(),
                lat: 1.0,
                lon: 2.0,
            })
        }
    }

    fn policy() -> EnrichmentPolicy {
        EnrichmentPolicy {
            max_lookups: 17,
            timeout: Duration::from_secs(10),
        }
    }

    fn pacer() -> Pacer {
        Pacer::new(Duration::from_millis(1_500))
    }

    fn public_nodes(count: u8) -> Vec<Node> {
        (0..count)
            .map(|i| {
                let mut n = Node::new(Identity::Reported(format!("n{i}")), None);
                n.address = Some(format!("45.1.{i}.1:8001").parse().unwrap());
                n
            })
            .collect()
    }

    #[test]
    fn private_and_loopback_are_excluded() {
        for ip in ["127.0.0.1", "10.1.2.3", "192.168.1.1", "172.16.0.5", "0.0.0.0", "169.254.1.1", "::1", "fd00::1"] {
            assert!(!is_usable(ip.parse().unwrap()), "{ip} should be excluded");
        }
        for ip in ["1.2.3.4", "45.1.1.1", "2001:4860::8888"] {
            assert!(is_usable(ip.parse().unwrap()), "{ip} should be usable");
        }
    }

    #[test]
    fn selection_skips_unaddressed_and_located_nodes() {
        let mut nodes = public_nodes(3);
        nodes[0].address = None;
        nodes[1].location = Some(Location {
            country: String::new(),
            country_code: String::new(),
            city: String::new(),
            lat: 0.0,
            lon: 0.0,
        });
        let mut private = Node::new(Identity::Reported("p".into()), None);
        private.address = Some("192.168.0.9:8001".parse().unwrap());
        nodes.push(private);

        let picked = select_candidates(&nodes, 17);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id.key(), "n2");
    }

    #[test]
    fn selection_is_capped() {
        assert_eq!(select_candidates(&public_nodes(30), 17).len(), 17);
    }

    #[tokio::test(start_paused = true)]
    async fn thirty_candidates_yield_at_most_seventeen_locations() {
        let nodes = public_nodes(30);
        let lookup = FakeLookup::new(None);
        let mut located = Vec::new();

        let candidates = select_candidates(&nodes, 17);
        let report = enrich(&lookup, &pacer(), &candidates, policy(), |id, _| located.push(id.clone())).await;

        assert_eq!(report.located, 17);
        assert_eq!(located.len(), 17);
        assert_eq!(lookup.calls.lock().unwrap().len(), 17);
    }

    #[tokio::test(start_paused = true)]
    async fn lookups_are_spaced_and_sequential() {
        let nodes = public_nodes(17);
        let lookup = FakeLookup::new(None);
        let started = Instant::now();

        enrich(&lookup, &pacer(), &select_candidates(&nodes, 17), policy(), |_, _| {}).await;

        assert!(started.elapsed() >= Duration::from_secs(24));
        let calls = lookup.calls.lock().unwrap();
        for pair in calls.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= Duration::from_millis(1_500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn no_pause_after_last_lookup() {
        let nodes = public_nodes(1);
        let lookup = FakeLookup::new(None);
        let started = Instant::now();
        enrich(&lookup, &pacer(), &select_candidates(&nodes, 17), policy(), |_, _| {}).await;
        assert!(started.elapsed() < Duration::from_millis(1_500));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_abort_the_run() {
        let nodes = public_nodes(3);
        let bad: IpAddr = "45.1.1.1".parse().unwrap();
        let lookup = FakeLookup::new(Some(bad));
        let mut located = Vec::new();

        let report = enrich(&lookup, &pacer(), &select_candidates(&nodes, 17), policy(), |id, _| {
            located.push(id.key().to_string())
        })
        .await;

        assert_eq!(report, EnrichmentReport { attempted: 3, located: 2 });
        assert_eq!(located, vec!["n0", "n2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn runs_sharing_a_pacer_keep_the_spacing() {
        let lookup = FakeLookup::new(None);
        let pacer = pacer();
        let nodes = public_nodes(4);

        let first_candidates = select_candidates(&nodes[..2], 17);
        let second_candidates = select_candidates(&nodes[2..], 17);
        let first = enrich(&lookup, &pacer, &first_candidates, policy(), |_, _| {});
        let second = enrich(&lookup, &pacer, &second_candidates, policy(), |_, _| {});
        tokio::join!(first, second);

        let mut starts: Vec<Instant> = lookup.calls.lock().unwrap().iter().map(|(_, at)| *at).collect();
        starts.sort();
        assert_eq!(starts.len(), 4);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(1_500));
        }
    }
}
