use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::error::{SiloError, SiloResult};

/// Engine tuning knobs. An embedding layer may deserialize this from its
/// own configuration file; every field has a production default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum summed weight of simultaneously running calls.
    pub concurrency_threshold: u32,
    /// Interval between task-queue dispatch cycles.
    #[serde(with = "duration_secs")]
    pub dispatch_interval: Duration,
    /// Interval between re-checks while waiting on a call's state.
    #[serde(with = "duration_secs")]
    pub task_state_poll_interval: Duration,
    /// Interval between scheduler firing cycles.
    #[serde(with = "duration_secs")]
    pub scheduler_dispatch_interval: Duration,
    /// Age past which archived calls are reaped. Zero reaps everything on
    /// the next maintenance pass.
    #[serde(with = "duration_secs")]
    pub archived_call_lifetime: Duration,
    /// Interval between maintenance passes (archive reaping).
    #[serde(with = "duration_secs")]
    pub maintenance_interval: Duration,
    /// How long terminal reports stay queryable in the live queue before
    /// the completed-call cache drops them.
    #[serde(with = "duration_secs")]
    pub completed_call_cache_life: Duration,
    /// Upper bound on waiting calls before enqueue fails.
    pub queue_backlog_limit: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency_threshold: 9,
            dispatch_interval: Duration::from_millis(500),
            task_state_poll_interval: Duration::from_millis(500),
            scheduler_dispatch_interval: Duration::from_secs(30),
            archived_call_lifetime: Duration::from_secs(7 * 24 * 3600),
            maintenance_interval: Duration::from_secs(3600),
            completed_call_cache_life: Duration::from_secs(20),
            queue_backlog_limit: 4096,
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> SiloResult<()> {
        if self.concurrency_threshold == 0 {
            return Err(SiloError::invalid_input("concurrency_threshold must be positive"));
        }
        if self.dispatch_interval.is_zero() {
            return Err(SiloError::invalid_input("dispatch_interval must be positive"));
        }
        if self.task_state_poll_interval.is_zero() {
            return Err(SiloError::invalid_input(
                "task_state_poll_interval must be positive",
            ));
        }
        if self.scheduler_dispatch_interval.is_zero() {
            return Err(SiloError::invalid_input(
                "scheduler_dispatch_interval must be positive",
            ));
        }
        if self.queue_backlog_limit == 0 {
            return Err(SiloError::invalid_input("queue_backlog_limit must be positive"));
        }
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        DispatchConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn deserializes_durations_as_seconds() {
        let config: DispatchConfig = serde_json::from_value(serde_json::json!({
            "concurrency_threshold": 4,
            "dispatch_interval": 0.05,
            "archived_call_lifetime": 0,
        }))
        .expect("deserialize");
        assert_eq!(config.concurrency_threshold, 4);
        assert_eq!(config.dispatch_interval, Duration::from_millis(50));
        assert_eq!(config.archived_call_lifetime, Duration::ZERO);
        assert_eq!(config.queue_backlog_limit, 4096);
    }

    #[test]
    fn rejects_negative_durations() {
        let result: Result<DispatchConfig, _> =
            serde_json::from_value(serde_json::json!({ "dispatch_interval": -1.0 }));
        assert!(result.is_err());
    }
}
