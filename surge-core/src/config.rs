//! Centralized configuration for Surge.
//!
//! All tunable parameters live here: the server the HTTP transport talks to,
//! the default test settings every session starts from, the web surface and
//! the simulated link.

use std::time::Duration;

use serde_json::Value;

use crate::network::{SimulatedLink, SimulatedTransport};
use crate::session::TestSettings;

/// Central configuration for all Surge components.
///
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct SurgeConfig {
    pub server: ServerConfig,
    /// Settings every session starts from before per-run overrides
    pub defaults: TestSettings,
    pub web: WebConfig,
    pub simulation: SimulationConfig,
}

/// Speed test backend the HTTP transport measures against.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Base URL phase endpoints are resolved against
    pub base_url: String,
    /// User agent for HTTP requests
    pub user_agent: String,
    /// TCP connect timeout for every request
    pub connect_timeout: Duration,
    /// Whole-request timeout for ping, client lookup and telemetry
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/".to_string(),
            user_agent: concat!("surge/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// HTTP surface of `surge serve`.
#[derive(Debug, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl WebConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Simulated link used instead of the network in simulation mode.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Use the simulated transport instead of HTTP
    pub enabled: bool,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    /// One-way latency in milliseconds
    pub latency_ms: u64,
    /// Peak deviation of scripted round trips in milliseconds
    pub jitter_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            download_mbps: 100.0,
            upload_mbps: 20.0,
            latency_ms: 20,
            jitter_ms: 3,
        }
    }
}

impl SimulationConfig {
    /// Creates a configuration for fast deterministic tests.
    pub fn deterministic_testing() -> Self {
        Self {
            enabled: true,
            download_mbps: 80.0,
            upload_mbps: 40.0,
            latency_ms: 5,
            jitter_ms: 0,
        }
    }

    /// Link parameters of this simulation.
    pub fn link(&self) -> SimulatedLink {
        SimulatedLink {
            download_bytes_per_sec: mbps_to_bytes(self.download_mbps),
            upload_bytes_per_sec: mbps_to_bytes(self.upload_mbps),
            latency: Duration::from_millis(self.latency_ms),
            ..SimulatedLink::default()
        }
    }

    /// Repeating round-trip pattern around twice the one-way latency.
    pub fn rtt_script(&self) -> Vec<Duration> {
        let base = self.latency_ms * 2;
        let jitter = self.jitter_ms;
        [base, base + jitter, base.saturating_sub(jitter), base + jitter / 2]
            .into_iter()
            .map(Duration::from_millis)
            .collect()
    }

    /// Builds the simulated transport described by this configuration.
    pub fn transport(&self) -> SimulatedTransport {
        SimulatedTransport::new(self.link()).with_rtt_script(self.rtt_script())
    }
}

fn mbps_to_bytes(mbps: f64) -> u64 {
    (mbps.max(0.001) * 1_000_000.0 / 8.0) as u64
}

/// Environment variables mapped onto default test settings.
const SETTING_VARS: [(&str, &str); 7] = [
    ("SURGE_TEST_ORDER", "test_order"),
    ("SURGE_TIME_DL", "time_dl"),
    ("SURGE_TIME_UL", "time_ul"),
    ("SURGE_COUNT_PING", "count_ping"),
    ("SURGE_DL_STREAMS", "dl_streams"),
    ("SURGE_UL_STREAMS", "ul_streams"),
    ("SURGE_TELEMETRY_LEVEL", "telemetry_level"),
];

impl SurgeConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Invalid values are logged and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("SURGE_SERVER_URL") {
            config.server.base_url = url;
        }

        if let Some(seconds) = env_parse::<u64>("SURGE_CONNECT_TIMEOUT") {
            config.server.connect_timeout = Duration::from_secs(seconds);
        }

        if let Some(seconds) = env_parse::<u64>("SURGE_REQUEST_TIMEOUT") {
            config.server.request_timeout = Duration::from_secs(seconds);
        }

        for (var, key) in SETTING_VARS {
            if let Ok(raw) = std::env::var(var) {
                if let Err(e) = config.defaults.apply_override(key, &Value::String(raw)) {
                    tracing::warn!("Ignoring {}: {}", var, e);
                }
            }
        }

        if let Ok(host) = std::env::var("SURGE_WEB_HOST") {
            config.web.host = host;
        }

        if let Some(port) = env_parse::<u16>("SURGE_WEB_PORT") {
            config.web.port = port;
        }

        if let Ok(enabled) = std::env::var("SURGE_SIMULATION_MODE") {
            config.simulation.enabled = enabled.parse().unwrap_or(false);
        }

        if let Some(mbps) = env_parse::<f64>("SURGE_SIM_DOWNLOAD_MBPS") {
            config.simulation.download_mbps = mbps;
        }

        if let Some(mbps) = env_parse::<f64>("SURGE_SIM_UPLOAD_MBPS") {
            config.simulation.upload_mbps = mbps;
        }

        if let Some(latency) = env_parse::<u64>("SURGE_SIM_LATENCY_MS") {
            config.simulation.latency_ms = latency;
        }

        config
    }

    /// Creates a configuration optimized for testing: short phases, few
    /// streams and small payloads over a fast simulated link.
    pub fn for_testing() -> Self {
        Self {
            defaults: TestSettings {
                download_duration: Duration::from_secs(2),
                upload_duration: Duration::from_secs(2),
                download_grace: Duration::from_millis(500),
                upload_grace: Duration::from_millis(500),
                ping_count: 5,
                download_streams: 2,
                upload_streams: 2,
                stream_delay: Duration::from_millis(50),
                upload_blob_mib: 1,
                download_chunk_mib: 1,
                ..TestSettings::default()
            },
            simulation: SimulationConfig::deterministic_testing(),
            ..Default::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring {}: cannot parse {:?}", var, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = SurgeConfig::default();

        assert_eq!(config.server.base_url, "http://127.0.0.1:8080/");
        assert!(config.server.user_agent.starts_with("surge/"));
        assert_eq!(config.server.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.defaults, TestSettings::default());
        assert_eq!(config.web.bind_address(), "127.0.0.1:8080");
        assert!(!config.simulation.enabled);
    }

    #[test]
    fn test_simulation_link() {
        let simulation = SimulationConfig::default();
        let link = simulation.link();
        assert_eq!(link.download_bytes_per_sec, 12_500_000);
        assert_eq!(link.upload_bytes_per_sec, 2_500_000);
        assert_eq!(link.latency, Duration::from_millis(20));

        let script = simulation.rtt_script();
        assert_eq!(script.len(), 4);
        assert_eq!(script[0], Duration::from_millis(40));
        assert_eq!(script[1], Duration::from_millis(43));
        assert_eq!(script[2], Duration::from_millis(37));
    }

    #[test]
    fn test_config_presets() {
        let config = SurgeConfig::for_testing();
        assert!(config.simulation.enabled);
        assert_eq!(config.simulation.jitter_ms, 0);
        assert_eq!(config.defaults.ping_count, 5);
        assert_eq!(config.defaults.download_duration, Duration::from_secs(2));
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("SURGE_SERVER_URL", "http://speed.example.com/backend/");
            std::env::set_var("SURGE_CONNECT_TIMEOUT", "3");
            std::env::set_var("SURGE_TEST_ORDER", "pd");
            std::env::set_var("SURGE_DL_STREAMS", "not-a-number");
            std::env::set_var("SURGE_SIMULATION_MODE", "true");
            std::env::set_var("SURGE_WEB_PORT", "9090");
        }

        let config = SurgeConfig::from_env();

        assert_eq!(config.server.base_url, "http://speed.example.com/backend/");
        assert_eq!(config.server.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.defaults.order.to_string(), "PD");
        assert_eq!(config.defaults.download_streams, 10);
        assert!(config.simulation.enabled);
        assert_eq!(config.web.port, 9090);

        unsafe {
            std::env::remove_var("SURGE_SERVER_URL");
            std::env::remove_var("SURGE_CONNECT_TIMEOUT");
            std::env::remove_var("SURGE_TEST_ORDER");
            std::env::remove_var("SURGE_DL_STREAMS");
            std::env::remove_var("SURGE_SIMULATION_MODE");
            std::env::remove_var("SURGE_WEB_PORT");
        }
    }
}
