use crate::error::HarnessError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Window lengths used by the orchestrator and the recovery suite.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentTimings {
    /// Workload runs this long before the failure is injected.
    #[serde(with = "humantime_serde")]
    pub warming: Duration,
    /// Length of the measurement window while the failure is active.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Length of the window after the failure has been removed.
    #[serde(with = "humantime_serde")]
    pub recovery: Duration,
    /// Pause between two scenarios of the suite.
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
    /// Pause after stopping the workload, before the teardown checks.
    #[serde(with = "humantime_serde")]
    pub stop_delay: Duration,
}

impl Default for ExperimentTimings {
    fn default() -> Self {
        ExperimentTimings {
            warming: Duration::from_secs(5),
            duration: Duration::from_secs(10),
            recovery: Duration::from_secs(30),
            settle: Duration::from_secs(20),
            stop_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    // Cluster shape
    pub node_count: usize,

    // Schema / workload
    pub n_accounts: u32,
    pub transfer_amount: i64,
    pub expected_total: i64, // every account starts at 0

    // Workload loops
    #[serde(with = "humantime_serde")]
    pub failure_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub worker_threads: usize, // 1 = current-thread runtime

    // Setup retries (initdb)
    pub setup_tries: usize,
    #[serde(with = "humantime_serde")]
    pub setup_delay: Duration,

    // Shutdown
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,

    pub timings: ExperimentTimings,

    pub log_level: log::LevelFilter,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            node_count: 3,

            n_accounts: 1000,
            transfer_amount: 1,
            expected_total: 0,

            failure_backoff: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(1),
            worker_threads: 1,

            setup_tries: 40,
            setup_delay: Duration::from_secs(1),

            stop_grace: Duration::from_secs(5),

            timings: ExperimentTimings::default(),

            log_level: log::LevelFilter::Info,
        }
    }
}

impl HarnessConfig {
    /// Parses a JSON document; missing fields fall back to the defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, HarnessError> {
        let config: HarnessConfig =
            serde_json::from_str(raw).map_err(|e| HarnessError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, HarnessError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| HarnessError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.node_count == 0 {
            return Err(HarnessError::Config("node_count must be at least 1".into()));
        }
        // transfers pick a in [1, n_accounts - 2]
        if self.n_accounts < 3 {
            return Err(HarnessError::Config(format!(
                "n_accounts must be at least 3, got {}",
                self.n_accounts
            )));
        }
        if self.worker_threads == 0 {
            return Err(HarnessError::Config("worker_threads must be at least 1".into()));
        }
        if self.setup_tries == 0 {
            return Err(HarnessError::Config("setup_tries must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HarnessConfig::default();
        assert_eq!(config.node_count, 3);
        assert_eq!(config.n_accounts, 1000);
        assert_eq!(config.transfer_amount, 1);
        assert_eq!(config.failure_backoff, Duration::from_millis(500));
        assert_eq!(config.setup_tries, 40);
        assert_eq!(config.timings.duration, Duration::from_secs(10));
        assert_eq!(config.timings.recovery, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let raw = r#"{
            "n_accounts": 50,
            "failure_backoff": "100ms",
            "timings": { "duration": "2s" },
            "log_level": "debug"
        }"#;
        let config = HarnessConfig::from_json_str(raw).unwrap();
        assert_eq!(config.n_accounts, 50);
        assert_eq!(config.failure_backoff, Duration::from_millis(100));
        assert_eq!(config.timings.duration, Duration::from_secs(2));
        assert_eq!(config.timings.recovery, Duration::from_secs(30));
        assert_eq!(config.log_level, log::LevelFilter::Debug);
        assert_eq!(config.node_count, 3);
    }

    #[test]
    fn rejects_too_few_accounts() {
        let err = HarnessConfig::from_json_str(r#"{ "n_accounts": 2 }"#).unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(HarnessConfig::from_json_str("not json").is_err());
    }
}
