//! Daemon configuration parameters.
//!
//! All tunable knobs for the daemon and the serial transport.  Values can be
//! overridden by a JSON configuration file passed on the daemon command line;
//! anything absent falls back to the defaults below.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Hard ceiling on worker threads; [`DaemonConfig::max_workers`] may only
/// lower it.  Matches the fixed worker-slot table size.
pub const MAX_WORKERS: usize = 16;

/// Per-device event-subscription slots.  Fixed at compile time because the
/// subscription table is a flat array.
pub const MAX_SUBSCRIPTIONS: usize = 48;

/// Scheduling policy for inbound requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPolicy {
    /// Enqueue on the worker with the shortest queue.
    LeastBusy,
    /// Pin all requests for motors sharing a serial bus to one worker.
    #[default]
    DriverGroup,
}

/// Core daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    // --- Workers ---
    /// Upper bound on worker threads (clamped to [`MAX_WORKERS`]).
    pub max_workers: usize,
    /// Which scheduler decides the worker for an inbound request.
    pub scheduler: SchedulerPolicy,

    // --- Serial transport ---
    /// Default retry budget per transaction, in addition to the first try.
    pub max_retries: u32,
    /// Minimum gap enforced between transactions on one bus (nanoseconds).
    pub min_tx_gap_nsec: u64,
    /// Line speed assumed when a connection string omits one.
    pub default_port_speed: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_workers: MAX_WORKERS,
            scheduler: SchedulerPolicy::DriverGroup,
            max_retries: 1,
            min_tx_gap_nsec: 0,
            default_port_speed: 9600,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a JSON file, falling back to defaults for
    /// missing fields.  Rejects out-of-range values instead of clamping.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_workers == 0 || self.max_workers > MAX_WORKERS {
            anyhow::bail!("max_workers must be in 1..={MAX_WORKERS}");
        }
        if !crate::mdrive::BAUD_RATES
            .iter()
            .any(|b| b.human == self.default_port_speed)
        {
            anyhow::bail!("default_port_speed {} is not valid", self.default_port_speed);
        }
        Ok(())
    }

    /// Minimum inter-transaction gap as a [`Duration`].
    pub fn min_tx_gap(&self) -> Duration {
        Duration::from_nanos(self.min_tx_gap_nsec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = DaemonConfig::default();
        assert_eq!(c.max_workers, 16);
        assert_eq!(c.scheduler, SchedulerPolicy::DriverGroup);
        assert_eq!(c.max_retries, 1);
        assert_eq!(c.min_tx_gap_nsec, 0);
        assert_eq!(c.default_port_speed, 9600);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let c: DaemonConfig = serde_json::from_str(r#"{"max_workers": 4}"#).unwrap();
        assert_eq!(c.max_workers, 4);
        assert_eq!(c.scheduler, SchedulerPolicy::DriverGroup);
    }

    #[test]
    fn rejects_zero_workers() {
        let c: DaemonConfig = serde_json::from_str(r#"{"max_workers": 0}"#).unwrap();
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_bogus_port_speed() {
        let c: DaemonConfig =
            serde_json::from_str(r#"{"default_port_speed": 1234}"#).unwrap();
        assert!(c.validate().is_err());
    }

    #[test]
    fn scheduler_policy_parses_snake_case() {
        let c: DaemonConfig =
            serde_json::from_str(r#"{"scheduler": "least_busy"}"#).unwrap();
        assert_eq!(c.scheduler, SchedulerPolicy::LeastBusy);
    }
}
