// src/config.rs

//! Configuration loading for every fleet role (hub, brain, server, cluster).
//!
//! Follows the same two-stage pattern the rest of this ecosystem uses: a
//! `RawConfig` mirrors the TOML file shape with `#[serde(default = ..)]`
//! fallbacks, then `Config::from_file` turns it into a validated `Config`.

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::Path;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cert_path() -> Option<String> {
    None
}

fn default_total_servers() -> usize {
    1
}

fn default_clusters_per_server() -> usize {
    1
}

fn default_shards_per_cluster() -> usize {
    1
}

#[derive(Debug, Deserialize, Default)]
struct RawFleetSection {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    token: Option<String>,
    #[serde(default = "default_cert_path")]
    certificate_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawBrainSection {
    #[serde(default = "default_total_servers")]
    total_servers: usize,
    #[serde(default = "default_clusters_per_server")]
    clusters_per_server: usize,
    #[serde(default = "default_shards_per_cluster")]
    shards_per_cluster: usize,
}

#[derive(Debug, Deserialize, Default)]
struct RawLogSection {
    #[serde(default = "default_log_level")]
    level: String,
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    fleet: RawFleetSection,
    #[serde(default)]
    brain: RawBrainSection,
    #[serde(default)]
    log: RawLogSection,
}

/// Validated, fully-resolved fleet configuration.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub host: String,
    pub port: u16,
    pub token: String,
    pub certificate_path: Option<String>,
    pub total_servers: usize,
    pub clusters_per_server: usize,
    pub shards_per_cluster: usize,
    pub log_level: String,
}

impl FleetConfig {
    /// Load and validate configuration from a TOML file, then apply
    /// `FLEET_HOST` / `FLEET_PORT` / `FLEET_TOKEN` environment overrides on
    /// top of whatever the file says.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file '{}'", path.display()))?;

        let mut config = Self {
            host: raw.fleet.host,
            port: raw.fleet.port,
            token: raw.fleet.token.unwrap_or_default(),
            certificate_path: raw.fleet.certificate_path,
            total_servers: raw.brain.total_servers,
            clusters_per_server: raw.brain.clusters_per_server,
            shards_per_cluster: raw.brain.shards_per_cluster,
            log_level: raw.log.level,
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("FLEET_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("FLEET_PORT")
            && let Ok(port) = port.parse::<u16>()
        {
            self.port = port;
        }
        if let Ok(token) = std::env::var("FLEET_TOKEN") {
            self.token = token;
        }
    }

    /// Checks invariants a parsed-but-nonsensical config could violate.
    fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(anyhow!("'fleet.host' must not be empty"));
        }
        if self.port == 0 {
            return Err(anyhow!("'fleet.port' must not be 0"));
        }
        if self.token.is_empty() {
            return Err(anyhow!("'fleet.token' must be set"));
        }
        if self.total_servers == 0 {
            return Err(anyhow!("'brain.total_servers' must be at least 1"));
        }
        if self.clusters_per_server == 0 {
            return Err(anyhow!("'brain.clusters_per_server' must be at least 1"));
        }
        if self.shards_per_cluster == 0 {
            return Err(anyhow!("'brain.shards_per_cluster' must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let file = write_temp_config("[fleet]\ntoken = \"secret\"\n");
        let config = FleetConfig::from_file(file.path()).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8765);
        assert_eq!(config.token, "secret");
        assert_eq!(config.total_servers, 1);
    }

    #[test]
    fn rejects_missing_token() {
        let file = write_temp_config("[fleet]\nhost = \"127.0.0.1\"\n");
        assert!(FleetConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn rejects_zero_port() {
        let file = write_temp_config("[fleet]\ntoken = \"t\"\nport = 0\n");
        assert!(FleetConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn parses_brain_section() {
        let file = write_temp_config(
            "[fleet]\ntoken = \"t\"\n[brain]\ntotal_servers = 3\nclusters_per_server = 2\nshards_per_cluster = 4\n",
        );
        let config = FleetConfig::from_file(file.path()).unwrap();
        assert_eq!(config.total_servers, 3);
        assert_eq!(config.clusters_per_server, 2);
        assert_eq!(config.shards_per_cluster, 4);
    }

    #[test]
    fn env_override_replaces_port() {
        let file = write_temp_config("[fleet]\ntoken = \"t\"\nport = 1111\n");
        // SAFETY: test-only, single-threaded access to this env var.
        unsafe { std::env::set_var("FLEET_PORT", "2222") };
        let config = FleetConfig::from_file(file.path()).unwrap();
        unsafe { std::env::remove_var("FLEET_PORT") };
        assert_eq!(config.port, 2222);
    }
}
