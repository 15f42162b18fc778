//! Application configuration (TOML-based)
//!
//! Loaded at startup from `GATEWAY_CONFIG` or the platform config directory;
//! a missing or unreadable file falls back to the built-in defaults so the
//! gateway can run out of the box against a local CSMS.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::GatewayResult;

/// User-Agent presented to the CSMS. Kept verbatim from the first gateway
/// deployment for CSMS compatibility.
pub const UPSTREAM_USER_AGENT: &str = "Gateway-TCharge-Python";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub upstream: UpstreamConfig,
    pub server: ServerConfig,
    pub meter: MeterConfig,
    pub metrics: MetricsConfig,
    pub control: ControlConfig,
    pub buffer: BufferConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

/// CSMS connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL; the charger ID is appended as the last path segment
    pub url: String,
    pub connect_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    /// Skip server certificate verification on `wss://` URLs.
    /// On by default for CSMS endpoints fronted by self-signed certs.
    pub tls_insecure_skip_verify: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9999/ocpp".to_string(),
            connect_timeout_secs: 10,
            reconnect_delay_secs: 10,
            tls_insecure_skip_verify: true,
        }
    }
}

/// Charger-facing WebSocket listener
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Energy-meter HTTP listener
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    pub host: String,
    pub port: u16,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

impl MeterConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Prometheus scrape listener
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub host: String,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9100,
        }
    }
}

impl MetricsConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Demand-control parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Site-wide ceiling in watts (the installation's supply limit)
    pub max_total_power_w: f64,
    /// Learned-max seed for chargers never seen before
    pub default_max_power_seed_w: f64,
    /// Per-charger allocation floor in watts
    pub min_charge_power_w: f64,
    pub demand_interval_secs: u64,
    pub trigger_interval_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            max_total_power_w: 60_000.0,
            default_max_power_seed_w: 3_600.0,
            min_charge_power_w: 1_380.0,
            demand_interval_secs: 10,
            trigger_interval_secs: 60,
        }
    }
}

/// Store-and-forward buffer bound
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum buffered frames per charger; overflow is dropped from the tail
    pub max_frames: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { max_frames: 1000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub learned_powers_file: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            learned_powers_file: PathBuf::from("learned_powers.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Parse configuration from a TOML file.
    pub fn load(path: &Path) -> GatewayResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

/// Default config location: `~/.config/ocpp-gateway/config.toml`
pub fn default_config_path() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ocpp-gateway")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_constants() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.address(), "127.0.0.1:9000");
        assert_eq!(cfg.meter.address(), "127.0.0.1:8000");
        assert_eq!(cfg.control.max_total_power_w, 60_000.0);
        assert_eq!(cfg.control.default_max_power_seed_w, 3_600.0);
        assert_eq!(cfg.control.min_charge_power_w, 1_380.0);
        assert!(cfg.upstream.tls_insecure_skip_verify);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [upstream]
            url = "wss://csms.example.com/ocpp"

            [control]
            max_total_power_w = 45000.0
            "#,
        )
        .unwrap();

        assert_eq!(cfg.upstream.url, "wss://csms.example.com/ocpp");
        assert_eq!(cfg.upstream.reconnect_delay_secs, 10);
        assert_eq!(cfg.control.max_total_power_w, 45_000.0);
        assert_eq!(cfg.control.min_charge_power_w, 1_380.0);
        assert_eq!(cfg.buffer.max_frames, 1000);
    }
}
