//! Runtime configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Alerting thresholds the monitor compares metrics against.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MonitorThresholds {
    /// Heartbeat age that raises a warning ("check agent").
    pub heartbeat_warning_secs: i64,
    /// Heartbeat age that raises a critical alert ("restart agent").
    /// Also the default stale-claim threshold.
    pub heartbeat_critical_secs: i64,
    /// Queue depth that raises a warning ("scale workers").
    pub queue_depth_warning: usize,
    /// Queue depth that raises a critical alert ("investigate
    /// bottleneck").
    pub queue_depth_critical: usize,
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self {
            heartbeat_warning_secs: 60,
            heartbeat_critical_secs: 300,
            queue_depth_warning: 10,
            queue_depth_critical: 50,
        }
    }
}

/// Process-wide configuration, assembled once at startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Root directory for durable state. `None` keeps everything in
    /// memory (tests).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_root: Option<PathBuf>,
    /// How long a claim may sit without a heartbeat before the hook
    /// reclaims it. Defaults to the monitor's critical threshold.
    pub stale_claim_secs: i64,
    /// Interval between continuous executor cycles.
    pub cycle_interval_secs: u64,
    /// Park unschedulable items instead of failing fast.
    pub park_unmatched: bool,
    pub monitor: MonitorThresholds,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let monitor = MonitorThresholds::default();
        Self {
            data_root: None,
            stale_claim_secs: monitor.heartbeat_critical_secs,
            cycle_interval_secs: 5,
            park_unmatched: true,
            monitor,
        }
    }
}

impl RuntimeConfig {
    pub fn with_data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.data_root = Some(root.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_claims_default_to_the_critical_threshold() {
        let config = RuntimeConfig::default();
        assert_eq!(config.stale_claim_secs, 300);
        assert_eq!(config.monitor.heartbeat_warning_secs, 60);
        assert_eq!(config.monitor.queue_depth_critical, 50);
    }
}
