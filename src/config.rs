use std::{collections::HashMap, fmt::Debug, net::SocketAddr, time::Duration};

use anyhow::{anyhow, Result};
use data_model::{FrameworkInfo, Partition, RuntimeInfo, DEFAULT_PARTITION};
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use message_bus::BusConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enable_tracing: bool,
    pub enable_metrics: bool,
    pub endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_tracing: false,
            enable_metrics: false,
            endpoint: None,
        }
    }
}

/// Timers and thresholds of the reconciliation engine, in seconds unless the
/// name says otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalsConfig {
    pub database_scan: u64,
    pub droplets_analysis: u64,
    pub request_queue: u64,
    pub droplet_lost: u64,
    pub flapping_death: u32,
    pub flapping_timeout: u64,
    pub min_restart_delay: u64,
    pub max_restart_delay: u64,
    pub giveup_crash_number: u32,
    pub restart_timeout: u64,
    pub stable_state: u64,
    pub inactivity_period_for_spindown: Option<u64>,
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            database_scan: 60,
            droplets_analysis: 10,
            request_queue: 1,
            droplet_lost: 30,
            flapping_death: 3,
            flapping_timeout: 180,
            min_restart_delay: 60,
            max_restart_delay: 480,
            giveup_crash_number: 4,
            restart_timeout: 20,
            stable_state: 60,
            inactivity_period_for_spindown: None,
        }
    }
}

impl IntervalsConfig {
    pub fn database_scan(&self) -> Duration {
        Duration::from_secs(self.database_scan)
    }

    pub fn droplets_analysis(&self) -> Duration {
        Duration::from_secs(self.droplets_analysis)
    }

    pub fn request_queue(&self) -> Duration {
        Duration::from_secs(self.request_queue)
    }

    pub fn droplet_lost(&self) -> Duration {
        Duration::from_secs(self.droplet_lost)
    }

    pub fn flapping_timeout(&self) -> Duration {
        Duration::from_secs(self.flapping_timeout)
    }

    pub fn min_restart_delay(&self) -> Duration {
        Duration::from_secs(self.min_restart_delay)
    }

    pub fn max_restart_delay(&self) -> Duration {
        Duration::from_secs(self.max_restart_delay)
    }

    pub fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_timeout)
    }

    pub fn stable_state(&self) -> Duration {
        Duration::from_secs(self.stable_state)
    }

    pub fn inactivity_period_for_spindown(&self) -> Option<Duration> {
        self.inactivity_period_for_spindown.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlacementMode {
    /// Broadcast `dea.discover` and take the first host that answers.
    #[default]
    Discover,
    /// Pick from the scored pool built out of `dea.advertise` messages.
    Pool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    pub mode: PlacementMode,
    pub discover_timeout: u64,
    pub advertisement_expiry: u64,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            mode: PlacementMode::Discover,
            discover_timeout: 2,
            advertisement_expiry: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    pub poll_interval_ms: u64,
    pub time_limit: u64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            time_limit: 360,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CatalogConfig {
    pub runtimes: HashMap<String, RuntimeInfo>,
    pub frameworks: HashMap<String, FrameworkInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub env: String,
    pub instance_id: Option<String>,
    pub listen_addr: String,
    pub structured_logging: bool,
    pub telemetry: TelemetryConfig,
    pub cc_partition: String,
    pub intervals: IntervalsConfig,
    pub dequeueing_rate: usize,
    pub placement: PlacementConfig,
    pub staging: StagingConfig,
    pub external_uri: String,
    pub catalog: CatalogConfig,
    pub desired_state_path: Option<String>,
    pub bus: BusConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: "local".to_string(),
            instance_id: None,
            listen_addr: "0.0.0.0:8950".to_string(),
            structured_logging: false,
            telemetry: TelemetryConfig::default(),
            cc_partition: DEFAULT_PARTITION.to_string(),
            intervals: IntervalsConfig::default(),
            dequeueing_rate: 50,
            placement: PlacementConfig::default(),
            staging: StagingConfig::default(),
            external_uri: "http://127.0.0.1:9022".to_string(),
            catalog: CatalogConfig::default(),
            desired_state_path: None,
            bus: BusConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    pub fn from_yaml_str(config_str: &str) -> Result<ServerConfig> {
        let config: ServerConfig = Figment::new().merge(Yaml::string(config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!("invalid listen address: {}", self.listen_addr));
        }
        if self.cc_partition.trim().is_empty() {
            return Err(anyhow!("cc_partition cannot be empty"));
        }
        if self.dequeueing_rate == 0 {
            return Err(anyhow!("dequeueing_rate must be greater than zero"));
        }
        let intervals = &self.intervals;
        if intervals.min_restart_delay > intervals.max_restart_delay {
            return Err(anyhow!(
                "min_restart_delay ({}) is greater than max_restart_delay ({})",
                intervals.min_restart_delay,
                intervals.max_restart_delay
            ));
        }
        if intervals.giveup_crash_number < intervals.flapping_death {
            return Err(anyhow!(
                "giveup_crash_number ({}) is lower than flapping_death ({})",
                intervals.giveup_crash_number,
                intervals.flapping_death
            ));
        }
        if intervals.droplets_analysis == 0 ||
            intervals.database_scan == 0 ||
            intervals.request_queue == 0
        {
            return Err(anyhow!("timer intervals must be greater than zero"));
        }
        if self.staging.poll_interval_ms == 0 {
            return Err(anyhow!("staging.poll_interval_ms must be greater than zero"));
        }
        Ok(())
    }

    pub fn partition(&self) -> Partition {
        Partition::new(self.cc_partition.clone())
    }

    pub fn instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| format!("health-manager-{}", self.env))
    }

    pub fn structured_logging(&self) -> bool {
        self.structured_logging
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = ServerConfig::from_yaml_str(
            r#"
cc_partition: west
dequeueing_rate: 10
intervals:
  flapping_death: 2
  min_restart_delay: 1
  max_restart_delay: 3
  giveup_crash_number: 5
  inactivity_period_for_spindown: 120
placement:
  mode: pool
catalog:
  runtimes:
    ruby19:
      version: "1.9.2p180"
      description: Ruby 1.9
      executable: /usr/bin/ruby
"#,
        )
        .unwrap();

        assert_eq!(config.partition().get(), "west");
        assert_eq!(config.dequeueing_rate, 10);
        assert_eq!(config.intervals.flapping_death, 2);
        assert_eq!(config.intervals.droplet_lost, 30);
        assert_eq!(
            config.intervals.inactivity_period_for_spindown(),
            Some(Duration::from_secs(120))
        );
        assert_eq!(config.placement.mode, PlacementMode::Pool);
        assert_eq!(config.placement.discover_timeout, 2);
        let ruby = &config.catalog.runtimes["ruby19"];
        assert_eq!(ruby.version.as_deref(), Some("1.9.2p180"));
        assert_eq!(ruby.options["executable"], "/usr/bin/ruby");
    }

    #[test]
    fn test_validate_rejects_inverted_restart_delays() {
        let mut config = ServerConfig::default();
        config.intervals.min_restart_delay = 10;
        config.intervals.max_restart_delay = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_giveup_below_flapping_death() {
        let mut config = ServerConfig::default();
        config.intervals.flapping_death = 5;
        config.intervals.giveup_crash_number = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_listen_addr_and_rate() {
        let mut config = ServerConfig::default();
        config.listen_addr = "nope".to_string();
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.dequeueing_rate = 0;
        assert!(config.validate().is_err());
        assert!(ServerConfig::default().validate().is_ok());
    }
}
