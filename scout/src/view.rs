//! Read-only filtered and sorted views over a snapshot, plus export formats.

use serde::Deserialize;
use std::cmp::Ordering;
use std::str::FromStr;
use thiserror::Error;

use crate::discovery::{Health, Node};

#[derive(Debug, Error, PartialEq)]
pub enum ViewError {
    #[error("{0}")]
    InvalidHealth(String),
    #[error("unknown sort key '{0}'")]
    InvalidSortKey(String),
    #[error("unknown sort order '{0}', expected asc or desc")]
    InvalidOrder(String),
    #[error("unknown export format '{0}', expected json or csv")]
    InvalidFormat(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterCriteria {
    /// Case-insensitive match against identity, version, address, city and country.
    pub search: Option<String>,
    pub health: Option<Health>,
    /// Exact version match.
    pub version: Option<String>,
    pub target_only: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortKey {
    #[default]
    Identity,
    Version,
    Health,
    Latency,
    Country,
    LastUpdate,
}

impl FromStr for SortKey {
    type Err = ViewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identity" | "pubkey" => Ok(Self::Identity),
            "version" => Ok(Self::Version),
            "health" => Ok(Self::Health),
            "latency" => Ok(Self::Latency),
            "country" | "location" => Ok(Self::Country),
            "last_update" => Ok(Self::LastUpdate),
            other => Err(ViewError::InvalidSortKey(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SortSpec {
    pub key: SortKey,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = ViewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(ViewError::InvalidFormat(other.to_string())),
        }
    }
}

/// Query-string shape shared by the node listing and export routes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeQuery {
    pub search: Option<String>,
    pub health: Option<String>,
    pub version: Option<String>,
    pub target_only: bool,
    pub sort: Option<String>,
    pub order: Option<String>,
    pub format: Option<String>,
}

impl NodeQuery {
    pub fn criteria(&self) -> Result<FilterCriteria, ViewError> {
        let health = self
            .health
            .as_deref()
            .filter(|h| !h.is_empty() && *h != "all")
            .map(|h| h.parse::<Health>().map_err(ViewError::InvalidHealth))
            .transpose()?;
        Ok(FilterCriteria {
            search: self.search.clone().filter(|s| !s.trim().is_empty()),
            health,
            version: self.version.clone().filter(|v| !v.is_empty() && v != "all"),
            target_only: self.target_only,
        })
    }

    pub fn sort_spec(&self) -> Result<SortSpec, ViewError> {
        let key = match self.sort.as_deref() {
            Some(k) => k.parse()?,
            None => SortKey::default(),
        };
        let direction = match self.order.as_deref() {
            None | Some("asc") => SortDirection::Ascending,
            Some("desc") => SortDirection::Descending,
            Some(other) => return Err(ViewError::InvalidOrder(other.to_string())),
        };
        Ok(SortSpec { key, direction })
    }

    pub fn export_format(&self) -> Result<ExportFormat, ViewError> {
        self.format
            .as_deref()
            .map(str::parse)
            .transpose()
            .map(Option::unwrap_or_default)
    }
}

fn matches(node: &Node, criteria: &FilterCriteria) -> bool {
    if criteria.target_only && !node.is_target() {
        return false;
    }
    if criteria.health.is_some_and(|h| node.health != h) {
        return false;
    }
    if let Some(version) = &criteria.version {
        if node.version() != Some(version.as_str()) {
            return false;
        }
    }
    if let Some(search) = &criteria.search {
        let needle = search.trim().to_lowercase();
        let address = node.address.map(|a| a.to_string());
        let haystacks = [
            Some(node.key()),
            node.version(),
            address.as_deref(),
            node.location.as_ref().map(|l| l.city.as_str()),
            node.location.as_ref().map(|l| l.country.as_str()),
        ];
        if !haystacks
            .iter()
            .flatten()
            .any(|h| h.to_lowercase().contains(&needle))
        {
            return false;
        }
    }
    true
}

fn health_rank(h: Health) -> u8 {
    match h {
        Health::Healthy => 0,
        Health::Unhealthy => 1,
        Health::Unknown => 2,
    }
}

/// Missing values sort last regardless of direction.
fn compare_optional<T: Ord>(a: Option<T>, b: Option<T>, direction: SortDirection) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => directed(a.cmp(&b), direction),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn directed(ordering: Ordering, direction: SortDirection) -> Ordering {
    match direction {
        SortDirection::Ascending => ordering,
        SortDirection::Descending => ordering.reverse(),
    }
}

fn compare(a: &Node, b: &Node, spec: SortSpec) -> Ordering {
    let d = spec.direction;
    match spec.key {
        SortKey::Identity => directed(a.key().cmp(b.key()), d),
        SortKey::Version => compare_optional(a.version(), b.version(), d),
        SortKey::Health => directed(health_rank(a.health).cmp(&health_rank(b.health)), d),
        SortKey::Latency => compare_optional(a.latency_ms, b.latency_ms, d),
        SortKey::Country => compare_optional(
            a.location.as_ref().map(|l| l.country.as_str()),
            b.location.as_ref().map(|l| l.country.as_str()),
            d,
        ),
        SortKey::LastUpdate => directed(a.last_update.cmp(&b.last_update), d),
    }
}

pub fn apply(nodes: &[Node], criteria: &FilterCriteria, sort: SortSpec) -> Vec<Node> {
    let mut view: Vec<Node> = nodes.iter().filter(|n| matches(n, criteria)).cloned().collect();
    view.sort_by(|a, b| compare(a, b, sort).then_with(|| a.key().cmp(b.key())));
    view
}

pub const CSV_HEADER: &str = "identity,synthesized,kind,version,health,latency_ms,address,country,country_code,city,lat,lon,last_update";

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

pub fn to_csv(nodes: &[Node]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for node in nodes {
        let loc = node.location.as_ref();
        let kind = if node.is_target() { "target" } else { "generic" };
        let fields = [
            csv_field(node.key()),
            node.id().is_synthesized().to_string(),
            kind.to_string(),
            csv_field(node.version().unwrap_or("")),
            node.health.as_str().to_string(),
            node.latency_ms.map(|l| l.to_string()).unwrap_or_default(),
            node.address.map(|a| a.to_string()).unwrap_or_default(),
            csv_field(loc.map(|l| l.country.as_str()).unwrap_or("")),
            csv_field(loc.map(|l| l.country_code.as_str()).unwrap_or("")),
            csv_field(loc.map(|l| l.city.as_str()).unwrap_or("")),
            loc.map(|l| l.lat.to_string()).unwrap_or_default(),
            loc.map(|l| l.lon.to_string()).unwrap_or_default(),
            node.last_update.to_string(),
        ];
        out.push_str(&fields.join(","));
        out.push('\n');
    }
    out
}

pub fn to_json(nodes: &[Node]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{Identity, Location};

    fn node(key: &str, version: Option<&str>, health: Health, latency: Option<u64>) -> Node {
        let mut n = Node::new(Identity::Reported(key.into()), version.map(Into::into));
        n.health = health;
        n.latency_ms = latency;
        n.address = Some("1.2.3.4:8001".parse().unwrap());
        n
    }

    fn sample() -> Vec<Node> {
        let mut tokyo = node("bravo", Some("0.806.30102"), Health::Healthy, Some(80));
        tokyo.location = Some(Location {
            country: "Japan".into(),
            country_code: "JP".into(),
            city: "Tokyo".into(),
            lat: 35.6,
            lon: 139.7,
        });
        vec![
            node("charlie", Some("2.0.15"), Health::Unknown, None),
            tokyo,
            node("alpha", Some("0.806.30102"), Health::Unhealthy, Some(20)),
        ]
    }

    fn keys(nodes: &[Node]) -> Vec<&str> {
        nodes.iter().map(|n| n.key()).collect()
    }

    #[test]
    fn default_view_sorts_by_identity() {
        let nodes = sample();
        let view = apply(&nodes, &FilterCriteria::default(), SortSpec::default());
        assert_eq!(keys(&view), vec!["alpha", "bravo", "charlie"]);
        assert_eq!(keys(&nodes), vec!["charlie", "bravo", "alpha"]);
    }

    #[test]
    fn filters_combine() {
        let nodes = sample();
        let target = FilterCriteria {
            target_only: true,
            ..FilterCriteria::default()
        };
        assert_eq!(keys(&apply(&nodes, &target, SortSpec::default())), vec!["alpha", "bravo"]);

        let healthy_targets = FilterCriteria {
            target_only: true,
            health: Some(Health::Healthy),
            ..FilterCriteria::default()
        };
        assert_eq!(keys(&apply(&nodes, &healthy_targets, SortSpec::default())), vec!["bravo"]);

        let by_city = FilterCriteria {
            search: Some("TOKYO".into()),
            ..FilterCriteria::default()
        };
        assert_eq!(keys(&apply(&nodes, &by_city, SortSpec::default())), vec!["bravo"]);

        let by_version = FilterCriteria {
            version: Some("2.0.15".into()),
            ..FilterCriteria::default()
        };
        assert_eq!(keys(&apply(&nodes, &by_version, SortSpec::default())), vec!["charlie"]);
    }

    #[test]
    fn missing_latency_sorts_last_both_ways() {
        let nodes = sample();
        let asc = SortSpec {
            key: SortKey::Latency,
            direction: SortDirection::Ascending,
        };
        let desc = SortSpec {
            key: SortKey::Latency,
            direction: SortDirection::Descending,
        };
        let none = FilterCriteria::default();
        assert_eq!(keys(&apply(&nodes, &none, asc)), vec!["alpha", "bravo", "charlie"]);
        assert_eq!(keys(&apply(&nodes, &none, desc)), vec!["bravo", "alpha", "charlie"]);
    }

    #[test]
    fn query_parsing_validates_inputs() {
        let q = NodeQuery {
            health: Some("healthy".into()),
            sort: Some("latency".into()),
            order: Some("desc".into()),
            format: Some("CSV".into()),
            ..NodeQuery::default()
        };
        assert_eq!(q.criteria().unwrap().health, Some(Health::Healthy));
        assert_eq!(
            q.sort_spec().unwrap(),
            SortSpec {
                key: SortKey::Latency,
                direction: SortDirection::Descending
            }
        );
        assert_eq!(q.export_format().unwrap(), ExportFormat::Csv);

        let all = NodeQuery {
            health: Some("all".into()),
            ..NodeQuery::default()
        };
        assert_eq!(all.criteria().unwrap().health, None);
        assert_eq!(all.export_format().unwrap(), ExportFormat::Json);

        let bad = NodeQuery {
            sort: Some("shoe-size".into()),
            order: Some("sideways".into()),
            ..NodeQuery::default()
        };
        assert!(matches!(bad.sort_spec(), Err(ViewError::InvalidSortKey(_))));
    }

    #[test]
    fn csv_escapes_and_fills_blanks() {
        let mut n = node("we,ird\"key", None, Health::Unknown, None);
        n.address = None;
        n.last_update = 7;
        let csv = to_csv(&[n]);
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some(CSV_HEADER));
        assert_eq!(
            lines.next(),
            Some("\"we,ird\"\"key\",false,generic,,unknown,,,,,,,,7")
        );
    }

    #[test]
    fn json_export_is_an_array() {
        let json = to_json(&sample()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 3);
    }
}
