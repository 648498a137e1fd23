use std::str::FromStr;
use std::time::Duration;

use engine::config::{DEFAULT_PYTHON_BIN, env_or};
use engine::{ConfigError, EngineConfig, StrategyKind};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:5173";
pub const DEFAULT_MAX_CODE_LENGTH: usize = 3000;
pub const DEFAULT_MAX_INFLIGHT: usize = 128;
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_SANDBOX_POOL_SIZE: usize = 2;
pub const DEFAULT_DOCKER_RUNTIME: &str = "runsc";
pub const DEFAULT_DOCKER_IMAGE: &str = "rust:latest";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherKind {
    Local,
    Docker,
}

impl FromStr for LauncherKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "docker" => Ok(Self::Docker),
            other => Err(format!("unknown launcher {other}; expected local or docker")),
        }
    }
}

/// How sandbox workers are started for the delegated strategy.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub kind: LauncherKind,
    pub python_bin: String,
    pub docker_runtime: String,
    pub docker_image: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub max_code_length: usize,
    pub max_inflight: usize,
    pub request_timeout: Duration,
    pub strategy: StrategyKind,
    pub python_bin: String,
    pub sandbox_pool_size: usize,
    pub launch: LaunchConfig,
    pub engine: EngineConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let python_bin: String = env_or("PYTHON_BIN", DEFAULT_PYTHON_BIN.to_owned())?;
        let origins: String = env_or("ALLOWED_ORIGINS", DEFAULT_ALLOWED_ORIGINS.to_owned())?;
        Ok(Self {
            host: env_or("HOST", DEFAULT_HOST.to_owned())?,
            port: env_or("PORT", DEFAULT_PORT)?,
            allowed_origins: split_origins(&origins),
            max_code_length: env_or("MAX_CODE_LENGTH", DEFAULT_MAX_CODE_LENGTH)?,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECONDS),
            strategy: env_or("EXECUTION_STRATEGY", StrategyKind::Subprocess)?,
            sandbox_pool_size: env_or("SANDBOX_POOL_SIZE", DEFAULT_SANDBOX_POOL_SIZE)?,
            launch: LaunchConfig {
                kind: env_or("SANDBOX_LAUNCHER", LauncherKind::Local)?,
                python_bin: python_bin.clone(),
                docker_runtime: env_or("SANDBOX_DOCKER_RUNTIME", DEFAULT_DOCKER_RUNTIME.to_owned())?,
                docker_image: env_or("SANDBOX_DOCKER_IMAGE", DEFAULT_DOCKER_IMAGE.to_owned())?,
            },
            python_bin,
            engine: EngineConfig::from_env()?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn split_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_owned)
        .collect()
}
