use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_EXECUTION_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_TERMINATION_GRACE_MS: u64 = 2000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_SETUP_TIMEOUT_SECONDS: u64 = 10;
pub const DEFAULT_PYTHON_BIN: &str = "python3";

/// Knobs for a single [`Engine`](crate::Engine) instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Wall-clock budget for one execution, measured from unit start.
    pub execution_timeout: Duration,
    /// Time a unit gets to exit after a graceful stop before it is killed.
    pub termination_grace: Duration,
    /// Upper bound for one delegated backend poll tick.
    pub poll_interval: Duration,
    /// Upper bound for unit setup (pre-flight compile, worker acquisition).
    pub setup_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(DEFAULT_EXECUTION_TIMEOUT_SECONDS),
            termination_grace: Duration::from_millis(DEFAULT_TERMINATION_GRACE_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            setup_timeout: Duration::from_secs(DEFAULT_SETUP_TIMEOUT_SECONDS),
        }
    }
}

impl EngineConfig {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            execution_timeout: timeout,
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            execution_timeout: Duration::from_secs(env_or(
                "PYTHON_EXECUTION_TIMEOUT",
                DEFAULT_EXECUTION_TIMEOUT_SECONDS,
            )?),
            termination_grace: Duration::from_millis(env_or(
                "TERMINATION_GRACE_MS",
                DEFAULT_TERMINATION_GRACE_MS,
            )?),
            poll_interval: Duration::from_millis(env_or(
                "BACKEND_POLL_INTERVAL_MS",
                DEFAULT_POLL_INTERVAL_MS,
            )?),
            setup_timeout: defaults.setup_timeout,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Subprocess,
    InProcess,
    Delegated,
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "subprocess" | "process" => Ok(Self::Subprocess),
            "in_process" | "in-process" | "inprocess" => Ok(Self::InProcess),
            "delegated" | "worker" => Ok(Self::Delegated),
            other => Err(format!(
                "unknown strategy {other}; expected subprocess, in_process or delegated"
            )),
        }
    }
}

/// Reads `name` from the environment, falling back to `default` when unset.
pub fn env_or<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => {
            value
                .trim()
                .parse::<T>()
                .map_err(|err| ConfigError::Invalid {
                    name,
                    value: value.clone(),
                    reason: err.to_string(),
                })
        }
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.execution_timeout, Duration::from_secs(30));
        assert_eq!(config.termination_grace, Duration::from_secs(2));
        assert_eq!(config.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn with_timeout_keeps_other_defaults() {
        let config = EngineConfig::with_timeout(Duration::from_secs(5));
        assert_eq!(config.execution_timeout, Duration::from_secs(5));
        assert_eq!(config.termination_grace, Duration::from_secs(2));
    }

    #[test]
    fn strategy_names_parse() {
        assert_eq!(
            "subprocess".parse::<StrategyKind>(),
            Ok(StrategyKind::Subprocess)
        );
        assert_eq!(
            "In-Process".parse::<StrategyKind>(),
            Ok(StrategyKind::InProcess)
        );
        assert_eq!(
            "delegated".parse::<StrategyKind>(),
            Ok(StrategyKind::Delegated)
        );
        assert!("docker".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn env_or_falls_back_when_unset() {
        let value: u64 = env_or("ENGINE_TEST_SURELY_UNSET_VARIABLE", 7).unwrap();
        assert_eq!(value, 7);
    }
}
