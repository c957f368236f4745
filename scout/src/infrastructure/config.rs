//! Layered settings: built-in defaults, `config/default.toml`,
//! `config/{SCOUT_RUN_MODE}.toml`, then `SCOUT__SECTION__KEY` environment
//! variables.

use config::{Config, ConfigError, Environment, File};
use secrecy::SecretString;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub telemetry: TelemetrySettings,
    pub rpc: RpcSettings,
    pub discovery: DiscoverySettings,
    pub geo: GeoSettings,
    pub preferences: PreferenceSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub log_level: String,
    pub json_logs: bool,
    /// Daily rolling log files are written here when set.
    pub log_dir: Option<PathBuf>,
    pub otlp_endpoint: Option<String>,
    pub sampling_ratio: f64,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            json_logs: false,
            log_dir: None,
            otlp_endpoint: None,
            sampling_ratio: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcSettings {
    pub relay_url: Option<String>,
    pub relay_probe_timeout_ms: u64,
    pub default_timeout_ms: u64,
    pub health_timeout_ms: u64,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            relay_url: None,
            relay_probe_timeout_ms: 2_000,
            default_timeout_ms: 12_000,
            health_timeout_ms: 5_000,
        }
    }
}

impl RpcSettings {
    pub fn relay_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_probe_timeout_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Aggregator endpoints tried after the override and the active endpoint.
    pub fallback_endpoints: Vec<String>,
    /// Reference `ip:port` list. Polled directly when cluster discovery yields
    /// no nodes. Cluster listings keep nodes at these IPs next to target
    /// nodes. Empty disables the direct fallback; `config/default.toml`
    /// carries a sample.
    /// Also settable as `SCOUT__DISCOVERY__KNOWN_ADDRESSES=a:p,b:p`.
    pub known_addresses: Vec<String>,
    pub cluster_timeout_ms: u64,
    pub batch_size: usize,
    /// Zero disables periodic refresh.
    pub refresh_interval_secs: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            fallback_endpoints: vec![
                "https://api.mainnet-beta.solana.com".into(),
                "https://api.testnet.solana.com".into(),
                "https://api.devnet.solana.com".into(),
            ],
            known_addresses: Vec::new(),
            cluster_timeout_ms: 15_000,
            batch_size: 8,
            refresh_interval_secs: 30,
        }
    }
}

impl DiscoverySettings {
    pub fn cluster_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeoSettings {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    /// Lookups per cycle. The upstream allows about 45 requests per minute.
    pub max_lookups: usize,
    pub request_spacing_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for GeoSettings {
    fn default() -> Self {
        Self {
            base_url: "http://ip-api.com".into(),
            api_key: None,
            max_lookups: 17,
            request_spacing_ms: 1_500,
            request_timeout_ms: 10_000,
        }
    }
}

impl GeoSettings {
    pub fn request_spacing(&self) -> Duration {
        Duration::from_millis(self.request_spacing_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PreferenceSettings {
    /// Endpoint override and custom addresses are persisted here. In-memory
    /// only when unset.
    pub path: Option<PathBuf>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("SCOUT_RUN_MODE").unwrap_or_else(|_| "development".into());

        Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(
                Environment::with_prefix("SCOUT")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("discovery.fallback_endpoints")
                    .with_list_parse_key("discovery.known_addresses"),
            )
            .build()?
            .try_deserialize()
    }

    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn defaults_match_rate_budgets() {
        let settings = Settings::default();
        assert_eq!(settings.geo.max_lookups, 17);
        assert_eq!(settings.geo.request_spacing(), Duration::from_millis(1_500));
        assert_eq!(settings.rpc.default_timeout(), Duration::from_secs(12));
        assert_eq!(settings.rpc.relay_probe_timeout(), Duration::from_secs(2));
        assert_eq!(settings.discovery.cluster_timeout(), Duration::from_secs(15));
        assert_eq!(settings.discovery.batch_size, 8);
        assert_eq!(settings.discovery.refresh_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn zero_interval_disables_refresh() {
        let settings = Settings::from_toml("[discovery]\nrefresh_interval_secs = 0\n").unwrap();
        assert_eq!(settings.discovery.refresh_interval(), None);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let settings = Settings::from_toml(
            r#"
            [discovery]
            known_addresses = ["1.2.3.4:8899", "5.6.7.8:8899"]

            [geo]
            api_key = "hunter2"
            "#,
        )
        .unwrap();
        assert_eq!(settings.discovery.known_addresses.len(), 2);
        assert_eq!(settings.discovery.batch_size, 8);
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.geo.api_key.as_ref().unwrap().expose_secret(), "hunter2");
    }

    #[test]
    fn shipped_config_sample_addresses_parse() {
        let shipped = include_str!("../../../config/default.toml");
        let settings = Settings::from_toml(shipped).unwrap();
        assert!(settings.discovery.known_addresses.is_empty());

        let mut in_sample = false;
        let enabled: Vec<String> = shipped
            .lines()
            .filter_map(|line| {
                if line.starts_with("# known_addresses") {
                    in_sample = true;
                }
                if in_sample {
                    in_sample = line != "# ]";
                    return Some(line.trim_start_matches("# ").to_string());
                }
                (line != "known_addresses = []").then(|| line.to_string())
            })
            .collect();
        let settings = Settings::from_toml(&enabled.join("\n")).unwrap();

        let known = &settings.discovery.known_addresses;
        assert_eq!(known.len(), 3);
        assert!(known.iter().all(|a| a.parse::<std::net::SocketAddr>().is_ok()));
    }
}
