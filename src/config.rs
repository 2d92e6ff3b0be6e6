//! Configuration for the coordination core, loaded from environment
//! variables (prefixed `FLEETMESH__`) and, optionally, a config file.

use serde::Deserialize;
use std::time::Duration;

/// Root configuration for a coordinator process.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    #[serde(default)]
    pub registry: RegistrySettings,

    #[serde(default)]
    pub coordinator: CoordinatorSettings,

    #[serde(default)]
    pub invoker: InvokerSettings,

    #[serde(default)]
    pub observability: ObservabilitySettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub max_failures: u32,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            max_failures: 5,
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    pub max_concurrency: usize,
    pub max_retries: u32,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 100,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InvokerSettings {
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for InvokerSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    pub log_level: String,
    pub json_logging: bool,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logging: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerSettings::default(),
            registry: RegistrySettings::default(),
            coordinator: CoordinatorSettings::default(),
            invoker: InvokerSettings::default(),
            observability: ObservabilitySettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from `FLEETMESH__*` environment variables only.
    /// Missing sections fall back to their `#[serde(default)]` values. Reads
    /// a `.env` file first, if one is present, since the host process
    /// embedding this crate may not have loaded one itself.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let builder = config::Config::builder()
            .add_source(config::Environment::with_prefix("FLEETMESH").separator("__"));
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Load configuration from a file (TOML/YAML/JSON, by extension),
    /// overridable by `FLEETMESH__*` environment variables.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("FLEETMESH").separator("__"));
        Ok(builder.build()?.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.circuit_breaker.max_failures, 5);
        assert_eq!(cfg.circuit_breaker.timeout, Duration::from_secs(60));
        assert_eq!(cfg.coordinator.max_concurrency, 100);
        assert_eq!(cfg.registry.sweep_interval, Duration::from_secs(30));
        assert_eq!(cfg.registry.stale_after, Duration::from_secs(60));
    }
}
