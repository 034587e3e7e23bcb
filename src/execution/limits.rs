use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Budget applied to a single execution.
///
/// Only `wall_clock_timeout` is enforced portably. The CPU and memory
/// ceilings are checked against what the agent declares and against
/// whatever the sandbox measures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    #[serde(with = "secs::option")]
    pub cpu_time: Option<Duration>,
    pub memory_ceiling_mb: Option<u64>,
    #[serde(with = "secs")]
    pub wall_clock_timeout: Duration,
    pub max_subprocesses: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_time: Some(Duration::from_secs(30)),
            memory_ceiling_mb: Some(500),
            wall_clock_timeout: Duration::from_secs(60),
            max_subprocesses: 5,
        }
    }
}

impl ResourceLimits {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.wall_clock_timeout = timeout;
        self
    }
}

/// Declarative allow-list. Anything not listed is denied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    pub allow_network: bool,
    pub allow_filesystem: bool,
    pub allowed_imports: BTreeSet<String>,
    pub allowed_modules: BTreeSet<String>,
    pub allowed_syscalls: BTreeSet<String>,
}

impl SecurityPolicy {
    /// Policy that allows network and filesystem access
    pub fn permissive() -> Self {
        Self {
            allow_network: true,
            allow_filesystem: true,
            ..Self::default()
        }
    }

    pub fn allows_module(&self, name: &str) -> bool {
        self.allowed_modules.contains(name) || self.allowed_imports.contains(name)
    }

    pub fn allows_syscall(&self, name: &str) -> bool {
        self.allowed_syscalls.contains(name)
    }
}

/// Durations as fractional seconds in JSON
mod secs {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{de::Error, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_some(&d.as_secs_f64()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<f64>::deserialize(deserializer)?
                .map(|secs| Duration::try_from_secs_f64(secs).map_err(D::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_limits() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.wall_clock_timeout, Duration::from_secs(60));
        assert_eq!(limits.max_subprocesses, 5);
        assert_eq!(limits.memory_ceiling_mb, Some(500));
    }

    #[test]
    fn test_limits_use_fractional_seconds() {
        let limits: ResourceLimits =
            serde_json::from_value(json!({"wall_clock_timeout": 0.25, "cpu_time": null})).unwrap();
        assert_eq!(limits.wall_clock_timeout, Duration::from_millis(250));
        assert_eq!(limits.cpu_time, None);
        assert_eq!(limits.max_subprocesses, 5);

        let value = serde_json::to_value(&limits).unwrap();
        assert_eq!(value["wall_clock_timeout"], json!(0.25));
    }

    #[test]
    fn test_negative_timeout_is_rejected() {
        let result: Result<ResourceLimits, _> =
            serde_json::from_value(json!({"wall_clock_timeout": -1.0}));
        assert!(result.is_err());
    }

    #[test]
    fn test_default_policy_denies_everything() {
        let policy = SecurityPolicy::default();
        assert!(!policy.allow_network);
        assert!(!policy.allow_filesystem);
        assert!(!policy.allows_module("os"));
        assert!(!policy.allows_syscall("fork"));
    }

    #[test]
    fn test_imports_count_as_allowed_modules() {
        let policy: SecurityPolicy =
            serde_json::from_value(json!({"allowed_imports": ["json"], "allowed_modules": ["re"]}))
                .unwrap();
        assert!(policy.allows_module("json"));
        assert!(policy.allows_module("re"));
        assert!(!policy.allows_module("socket"));
    }
}
