//! Clustering hooks. Only the configuration surface lives here; leader
//! election and lease handling are provided by an external locker.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_TARGETS_WATCH_TIMER: Duration = Duration::from_secs(10);
const DEFAULT_SERVICES_WATCH_TIMER: Duration = Duration::from_secs(60);
const DEFAULT_LEADER_WAIT_TIMER: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ClusteringConfig {
    #[serde(default)]
    pub cluster_name: String,

    #[serde(default)]
    pub instance_name: String,

    #[serde(default, with = "humantime_serde")]
    pub services_watch_timer: Option<Duration>,

    #[serde(default, with = "humantime_serde")]
    pub targets_watch_timer: Option<Duration>,

    #[serde(default, with = "humantime_serde")]
    pub leader_wait_timer: Option<Duration>,

    /// Opaque locker backend configuration, handed to the external locker.
    #[serde(default)]
    pub locker: BTreeMap<String, serde_yaml::Value>,
}

impl ClusteringConfig {
    pub fn services_watch_timer(&self) -> Duration {
        non_zero(self.services_watch_timer, DEFAULT_SERVICES_WATCH_TIMER)
    }

    pub fn targets_watch_timer(&self) -> Duration {
        non_zero(self.targets_watch_timer, DEFAULT_TARGETS_WATCH_TIMER)
    }

    pub fn leader_wait_timer(&self) -> Duration {
        non_zero(self.leader_wait_timer, DEFAULT_LEADER_WAIT_TIMER)
    }
}

fn non_zero(value: Option<Duration>, default: Duration) -> Duration {
    value.filter(|v| *v > Duration::ZERO).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let config: ClusteringConfig = serde_yaml::from_str("cluster-name: lab").unwrap();
        assert_eq!(config.cluster_name, "lab");
        assert_eq!(config.targets_watch_timer(), Duration::from_secs(10));
        assert_eq!(config.services_watch_timer(), Duration::from_secs(60));
        assert_eq!(config.leader_wait_timer(), Duration::from_secs(5));
    }

    #[test]
    fn explicit_timers_win() {
        let config: ClusteringConfig = serde_yaml::from_str(
            r#"
cluster-name: lab
targets-watch-timer: 30s
"#,
        )
        .unwrap();
        assert_eq!(config.targets_watch_timer(), Duration::from_secs(30));
    }
}
