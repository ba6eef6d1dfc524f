//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DaemonError, DaemonResult};

/// Configuration for the stratad control-plane daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Gateway listen address (worker WebSocket connections)
    pub listen_addr: String,

    /// Path to persistent state directory
    pub state_path: PathBuf,

    /// Routing configurator admin API base URL
    pub routing_url: String,

    /// Routing configurator API key
    #[serde(default)]
    pub routing_api_key: String,

    /// Health classifier tick in seconds
    #[serde(default = "default_classifier_interval")]
    pub classifier_interval_secs: u64,

    /// Heartbeat age before a node is Degraded
    #[serde(default = "default_degraded_after")]
    pub degraded_after_secs: u64,

    /// Heartbeat age before a node is Down
    #[serde(default = "default_down_after")]
    pub down_after_secs: u64,

    /// Heartbeat freshness required for new placements
    #[serde(default = "default_health_threshold")]
    pub scheduler_health_threshold_secs: u64,

    /// Deadline attached to outbound commands
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Send attempts per command
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Built deployments older than this are failed
    #[serde(default = "default_deployment_timeout")]
    pub deployment_timeout_secs: u64,

    /// Built-deployment poll tick
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Stale-node sweep / backlog tick
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Cutover health probe interval
    #[serde(default = "default_cutover_interval")]
    pub cutover_health_interval_secs: u64,

    /// Cutover health gate timeout
    #[serde(default = "default_cutover_timeout")]
    pub cutover_health_timeout_secs: u64,

    /// Overall shutdown budget
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_classifier_interval() -> u64 {
    10
}

fn default_degraded_after() -> u64 {
    30
}

fn default_down_after() -> u64 {
    60
}

fn default_health_threshold() -> u64 {
    30
}

fn default_command_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_deployment_timeout() -> u64 {
    30 * 60
}

fn default_poll_interval() -> u64 {
    2
}

fn default_check_interval() -> u64 {
    5
}

fn default_cutover_interval() -> u64 {
    5
}

fn default_cutover_timeout() -> u64 {
    5 * 60
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:18800".to_string(),
            state_path: PathBuf::from("/var/lib/stratad"),
            routing_url: "http://127.0.0.1:2019".to_string(),
            routing_api_key: String::new(),
            classifier_interval_secs: default_classifier_interval(),
            degraded_after_secs: default_degraded_after(),
            down_after_secs: default_down_after(),
            scheduler_health_threshold_secs: default_health_threshold(),
            command_timeout_secs: default_command_timeout(),
            max_retries: default_max_retries(),
            deployment_timeout_secs: default_deployment_timeout(),
            poll_interval_secs: default_poll_interval(),
            check_interval_secs: default_check_interval(),
            cutover_health_interval_secs: default_cutover_interval(),
            cutover_health_timeout_secs: default_cutover_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> DaemonResult<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| DaemonError::Config(format!("read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| DaemonError::Config(format!("parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> DaemonResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn validate(&self) -> DaemonResult<()> {
        if self.degraded_after_secs >= self.down_after_secs {
            return Err(DaemonError::Config(format!(
                "degraded_after_secs ({}) must be below down_after_secs ({})",
                self.degraded_after_secs, self.down_after_secs
            )));
        }
        for (name, value) in [
            ("classifier_interval_secs", self.classifier_interval_secs),
            ("poll_interval_secs", self.poll_interval_secs),
            ("check_interval_secs", self.check_interval_secs),
            ("cutover_health_interval_secs", self.cutover_health_interval_secs),
            ("command_timeout_secs", self.command_timeout_secs),
        ] {
            if value == 0 {
                return Err(DaemonError::Config(format!("{name} must be nonzero")));
            }
        }
        if self.max_retries == 0 {
            return Err(DaemonError::Config("max_retries must be nonzero".to_string()));
        }
        Ok(())
    }

    pub fn classifier_thresholds(&self) -> strata_node::classifier::HealthThresholds {
        strata_node::classifier::HealthThresholds {
            check_interval: Duration::from_secs(self.classifier_interval_secs),
            degraded_after: Duration::from_secs(self.degraded_after_secs),
            down_after: Duration::from_secs(self.down_after_secs),
        }
    }

    pub fn scheduler_config(&self) -> strata_sched::SchedulerConfig {
        strata_sched::SchedulerConfig {
            health_threshold: Duration::from_secs(self.scheduler_health_threshold_secs),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            max_retries: self.max_retries,
            deployment_timeout: Duration::from_secs(self.deployment_timeout_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            check_interval: Duration::from_secs(self.check_interval_secs),
            ..strata_sched::SchedulerConfig::default()
        }
    }

    pub fn deployer_config(&self) -> strata_deploy::DeployerConfig {
        strata_deploy::DeployerConfig {
            health_interval: Duration::from_secs(self.cutover_health_interval_secs),
            health_timeout: Duration::from_secs(self.cutover_health_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = DaemonConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.classifier_interval_secs, 10);
        assert_eq!(config.degraded_after_secs, 30);
        assert_eq!(config.down_after_secs, 60);
        assert_eq!(config.command_timeout_secs, 10);
        assert_eq!(config.deployment_timeout_secs, 1800);
        assert_eq!(config.cutover_health_timeout_secs, 300);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = DaemonConfig {
            listen_addr: "127.0.0.1:9999".to_string(),
            state_path: dir.path().to_path_buf(),
            ..DaemonConfig::default()
        };
        config.save(&path).unwrap();

        let loaded = DaemonConfig::load(&path).unwrap();
        assert_eq!(loaded.listen_addr, "127.0.0.1:9999");
        assert_eq!(loaded.max_retries, 3);
    }

    #[test]
    fn inverted_thresholds_rejected() {
        let config = DaemonConfig {
            degraded_after_secs: 90,
            down_after_secs: 60,
            ..DaemonConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_tick_rejected() {
        let config = DaemonConfig {
            poll_interval_secs: 0,
            ..DaemonConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_missing_file_is_error() {
        assert!(DaemonConfig::load(Path::new("/nonexistent/stratad.json")).is_err());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let raw = r#"{
            "listen_addr": "0.0.0.0:18800",
            "state_path": "/tmp/stratad",
            "routing_url": "http://127.0.0.1:2019"
        }"#;
        let config: DaemonConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.down_after_secs, 60);
        assert_eq!(config.shutdown_timeout_secs, 30);
    }
}
