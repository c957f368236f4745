use serde::{Serialize, Serializer};
use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::discovery::classifier;

/// Identity key of a node.
///
/// `Reported` keys come from the node itself (or an aggregator listing it) and
/// are authoritative. `Synthesized` keys are derived from the node address when
/// no identity could be obtained and must never be treated as authoritative.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum Identity {
    Reported(String),
    Synthesized(String),
}

impl Identity {
    /// Builds a non-authoritative key from an address, e.g. `10_0_0_1_8899`.
    pub fn synthesize(addr: &SocketAddr) -> Self {
        let ip = addr.ip().to_string().replace(['.', ':'], "_");
        Self::Synthesized(format!("{}_{}", ip, addr.port()))
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Reported(k) | Self::Synthesized(k) => k,
        }
    }

    pub fn is_synthesized(&self) -> bool {
        matches!(self, Self::Synthesized(_))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.key())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Target,
    Generic,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Unhealthy,
    Unknown,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for Health {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "healthy" => Ok(Self::Healthy),
            "unhealthy" => Ok(Self::Unhealthy),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown health filter '{other}'")),
        }
    }
}

/// Geo enrichment result for one IP.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Location {
    pub country: String,
    pub country_code: String,
    pub city: String,
    pub lat: f64,
    pub lon: f64,
}

/// One network participant as seen by the current discovery cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    #[serde(rename = "identity")]
    id: Identity,
    /// Mirrors `id`, which never changes after construction.
    synthesized: bool,
    version: Option<String>,
    kind: NodeKind,
    pub health: Health,
    pub latency_ms: Option<u64>,
    pub address: Option<SocketAddr>,
    pub location: Option<Location>,
    pub rpc: Option<String>,
    pub tpu: Option<String>,
    pub feature_set: Option<u32>,
    pub shred_version: Option<u16>,
    pub last_update: u64,
}

impl Node {
    pub fn new(id: Identity, version: Option<String>) -> Self {
        let kind = classifier::classify(version.as_deref());
        Self {
            synthesized: id.is_synthesized(),
            id,
            version,
            kind,
            health: Health::Unknown,
            latency_ms: None,
            address: None,
            location: None,
            rpc: None,
            tpu: None,
            feature_set: None,
            shred_version: None,
            last_update: now_millis(),
        }
    }

    pub fn id(&self) -> &Identity {
        &self.id
    }

    pub fn key(&self) -> &str {
        self.id.key()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Kind always follows the version; there is no other way to change it.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_target(&self) -> bool {
        self.kind == NodeKind::Target
    }

    pub fn set_location(&mut self, location: Location) {
        self.location = Some(location);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_update = now_millis();
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
