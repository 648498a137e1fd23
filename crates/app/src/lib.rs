pub mod backend;
pub mod client;
pub mod config;
pub mod launcher;
pub mod pool;
pub mod protocol;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engine::{
    DelegatedStrategy, Engine, EngineConfig, ExecutionStrategy, StrategyKind, SubprocessStrategy,
    TaskResult,
};

use backend::WorkerBackend;
use config::AppConfig;
use pool::WorkerPool;
use protocol::RunRequest;

/// Shared by every route of the server.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub max_code_length: usize,
}

/// A warm sandbox worker that runs one request at a time.
#[async_trait]
pub trait WorkerHandle: Send {
    async fn run(&mut self, request: RunRequest) -> Result<TaskResult, String>;
    async fn terminate(&mut self);
    /// Process to interrupt when a running task is revoked gracefully.
    fn pid(&self) -> Option<u32>;
    fn identifier(&self) -> String;
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn WorkerHandle>, String>;
}

pub async fn build_engine(config: &AppConfig) -> Result<Engine, String> {
    let engine_config = config.engine.clone();
    let strategy: Arc<dyn ExecutionStrategy> = match config.strategy {
        StrategyKind::Subprocess => Arc::new(
            SubprocessStrategy::new(&config.python_bin)
                .with_setup_timeout(engine_config.setup_timeout),
        ),
        StrategyKind::InProcess => in_process_strategy()?,
        StrategyKind::Delegated => {
            let launcher = launcher::build_launcher(&config.launch)?;
            let pool = WorkerPool::new(launcher, config.sandbox_pool_size).await?;
            let backend = WorkerBackend::new(Arc::new(pool), worker_run_timeout(&engine_config));
            Arc::new(
                DelegatedStrategy::new(Arc::new(backend))
                    .with_poll_interval(engine_config.poll_interval)
                    .with_setup_timeout(engine_config.setup_timeout),
            )
        }
    };
    tracing::info!(
        strategy = strategy.name(),
        timeout_secs = engine_config.execution_timeout.as_secs_f64(),
        "execution engine ready"
    );
    Ok(Engine::new(strategy, engine_config))
}

/// Strategy a sandbox worker uses for the code it is handed.
pub fn worker_strategy(python_bin: &str) -> Arc<dyn ExecutionStrategy> {
    in_process_strategy()
        .unwrap_or_else(|_| Arc::new(SubprocessStrategy::new(python_bin)))
}

#[cfg(feature = "in-process")]
fn in_process_strategy() -> Result<Arc<dyn ExecutionStrategy>, String> {
    Ok(Arc::new(engine::InProcessStrategy::new()))
}

#[cfg(not(feature = "in-process"))]
fn in_process_strategy() -> Result<Arc<dyn ExecutionStrategy>, String> {
    Err("in_process strategy requires the `in-process` feature".to_owned())
}

/// Workers enforce their own limit as a backstop, one grace window after the
/// engine's deadline.
fn worker_run_timeout(config: &EngineConfig) -> Duration {
    config.execution_timeout + config.termination_grace
}
