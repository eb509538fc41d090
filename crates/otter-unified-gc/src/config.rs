//! Collector configuration

use std::time::Duration;

use serde::Deserialize;

use crate::error::GcResult;

/// GC configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Entries per mark-stack batch before it is published for stealing (default: 64)
    pub work_node_capacity: usize,
    /// Period after which a thread missing its safepoint is reported (default: 2s).
    /// The coordinator keeps waiting after reporting.
    pub safepoint_timeout_ms: u64,
    /// Sleep between cross-VM reconciliation rounds (default: 50us)
    pub xgc_poll_interval_us: u64,
    /// Mark local heaps on scoped worker threads (default: true)
    pub parallel_marking: bool,
    /// Maximum live objects per heap (default: 1M)
    pub heap_capacity: usize,
    /// Sweep after a completed `collect_garbage` mark (default: true)
    pub sweep_after_collection: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            work_node_capacity: 64,
            safepoint_timeout_ms: 2000,
            xgc_poll_interval_us: 50,
            parallel_marking: true,
            heap_capacity: 1 << 20,
            sweep_after_collection: true,
        }
    }
}

impl GcConfig {
    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(source: &str) -> GcResult<Self> {
        let mut config: GcConfig = toml::from_str(source)?;
        config.work_node_capacity = config.work_node_capacity.max(1);
        Ok(config)
    }

    /// Safepoint report period
    pub fn safepoint_timeout(&self) -> Duration {
        Duration::from_millis(self.safepoint_timeout_ms)
    }

    /// Reconciliation poll interval
    pub fn xgc_poll_interval(&self) -> Duration {
        Duration::from_micros(self.xgc_poll_interval_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GcConfig::default();
        assert_eq!(config.work_node_capacity, 64);
        assert!(config.parallel_marking);
        assert_eq!(config.safepoint_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_toml() {
        let config = GcConfig::from_toml_str(
            "work_node_capacity = 8\nparallel_marking = false\n",
        )
        .unwrap();
        assert_eq!(config.work_node_capacity, 8);
        assert!(!config.parallel_marking);
        assert_eq!(config.heap_capacity, 1 << 20);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let config = GcConfig::from_toml_str("work_node_capacity = 0").unwrap();
        assert_eq!(config.work_node_capacity, 1);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(GcConfig::from_toml_str("parallel_marking = \"yes\"").is_err());
    }
}
