//! surge.toml configuration parser.
//!
//! The config file declares the metrics backend, the node inventory for
//! standalone runs, and one `[[target]]` block per autoscaled workload.
//! `validate()` enforces the parameter invariants the control loop
//! depends on; any violation is fatal at startup.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurgeConfig {
    /// Evaluation interval for every target (e.g. "30s").
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
    /// Directory holding the persistent state database.
    pub data_dir: Option<PathBuf>,
    /// Metrics backend to query; absent in standalone replay mode.
    pub metrics: Option<MetricsConfig>,
    /// Node inventory for standalone runs.
    #[serde(default, rename = "node")]
    pub nodes: Vec<NodeConfig>,
    /// Autoscaled workloads.
    #[serde(default, rename = "target")]
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Base URL of the time-series backend (e.g. "http://127.0.0.1:9090").
    pub endpoint: String,
    /// Per-query timeout (e.g. "5s").
    #[serde(default = "default_metric_timeout")]
    pub timeout: String,
    /// Staleness bound: samples older than this are unavailable.
    #[serde(default = "default_metric_window")]
    pub window: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    /// Topology labels (`zone`, `fault-domain`, ...).
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    #[serde(default = "default_min_replicas")]
    pub min_replicas: u32,
    #[serde(default = "default_max_replicas")]
    pub max_replicas: u32,
    /// Minimum time between consecutive scale actions (e.g. "30s").
    #[serde(default = "default_cooldown")]
    pub cooldown: String,
    /// Metric value one replica is expected to absorb.
    pub threshold: f64,
    /// Metric values below this leave the signal inactive.
    #[serde(default)]
    pub activation_threshold: f64,
    /// Replicas that may be voluntarily unavailable at once.
    #[serde(default = "default_max_unavailable")]
    pub max_unavailable: u32,
    /// Query expression sent to the metrics backend (opaque).
    pub query: String,
    /// Avoid co-locating replicas on one node (best effort).
    #[serde(default = "default_true")]
    pub anti_affinity: bool,
    /// Topology spread constraints, in tie-break priority order.
    #[serde(default, rename = "spread")]
    pub spreads: Vec<SpreadConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpreadConfig {
    /// Node label to spread over (e.g. "zone").
    pub key: String,
    /// Largest allowed replica-count difference between domains.
    pub max_skew: u32,
}

impl SurgeConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
        let config: SurgeConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Check every startup invariant. Any violation refuses the whole config.
    pub fn validate(&self) -> ConfigResult<()> {
        match parse_duration(&self.poll_interval) {
            Some(d) if !d.is_zero() => {}
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "poll_interval {:?} is not a positive duration",
                    self.poll_interval
                )));
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.validate()?;
        }

        let mut node_ids = HashSet::new();
        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(ConfigError::Invalid("node with empty id".to_string()));
            }
            if !node_ids.insert(node.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate node id {:?}", node.id)));
            }
        }

        let mut target_names = HashSet::new();
        for target in &self.targets {
            target.validate()?;
            if !target_names.insert(target.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate target name {:?}",
                    target.name
                )));
            }
        }

        Ok(())
    }
}

impl MetricsConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.endpoint.is_empty() {
            return Err(ConfigError::Invalid("metrics endpoint is empty".to_string()));
        }
        for (field, value) in [("timeout", &self.timeout), ("window", &self.window)] {
            match parse_duration(value) {
                Some(d) if !d.is_zero() => {}
                _ => {
                    return Err(ConfigError::Invalid(format!(
                        "metrics {field} {value:?} is not a positive duration"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl TargetConfig {
    /// Check this target's parameter invariants.
    pub fn validate(&self) -> ConfigResult<()> {
        let name = &self.name;
        if name.is_empty() {
            return Err(ConfigError::Invalid("target with empty name".to_string()));
        }
        if self.query.is_empty() {
            return Err(ConfigError::Invalid(format!("target {name}: query is empty")));
        }
        if self.min_replicas > self.max_replicas {
            return Err(ConfigError::Invalid(format!(
                "target {name}: min_replicas {} exceeds max_replicas {}",
                self.min_replicas, self.max_replicas
            )));
        }
        if !self.threshold.is_finite() || self.threshold <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "target {name}: threshold {} must be a positive finite number",
                self.threshold
            )));
        }
        if !self.activation_threshold.is_finite() || self.activation_threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "target {name}: activation_threshold {} must be finite and non-negative",
                self.activation_threshold
            )));
        }
        if self.activation_threshold >= self.threshold {
            return Err(ConfigError::Invalid(format!(
                "target {name}: activation_threshold {} must be below threshold {}",
                self.activation_threshold, self.threshold
            )));
        }
        if self.max_unavailable >= self.min_replicas {
            return Err(ConfigError::Invalid(format!(
                "target {name}: max_unavailable {} must be below min_replicas {}",
                self.max_unavailable, self.min_replicas
            )));
        }
        if parse_duration(&self.cooldown).is_none() {
            return Err(ConfigError::Invalid(format!(
                "target {name}: cooldown {:?} is not a duration",
                self.cooldown
            )));
        }
        let mut spread_keys = HashSet::new();
        for spread in &self.spreads {
            if spread.key.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "target {name}: spread with empty key"
                )));
            }
            if spread.max_skew == 0 {
                return Err(ConfigError::Invalid(format!(
                    "target {name}: spread {:?} max_skew must be at least 1",
                    spread.key
                )));
            }
            if !spread_keys.insert(spread.key.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "target {name}: duplicate spread key {:?}",
                    spread.key
                )));
            }
        }
        Ok(())
    }
}

fn default_poll_interval() -> String {
    "30s".to_string()
}

fn default_metric_timeout() -> String {
    "5s".to_string()
}

fn default_metric_window() -> String {
    "60s".to_string()
}

fn default_min_replicas() -> u32 {
    2
}

fn default_max_replicas() -> u32 {
    10
}

fn default_cooldown() -> String {
    "30s".to_string()
}

fn default_max_unavailable() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

/// Parse a duration string like "5s", "500ms", "1m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
