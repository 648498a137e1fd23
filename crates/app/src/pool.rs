use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::{WorkerHandle, WorkerLauncher};

/// Keeps `target_idle` launched workers warm so a submission does not pay
/// for process or container startup.
pub struct WorkerPool {
    launcher: Arc<dyn WorkerLauncher>,
    idle: Mutex<VecDeque<Box<dyn WorkerHandle>>>,
    target_idle: usize,
    refilling: AtomicBool,
}

impl WorkerPool {
    pub async fn new(launcher: Arc<dyn WorkerLauncher>, target_idle: usize) -> Result<Self, String> {
        let pool = Self {
            launcher,
            idle: Mutex::new(VecDeque::new()),
            target_idle,
            refilling: AtomicBool::new(false),
        };
        pool.refill_strict().await?;
        tracing::info!(workers = pool.idle_len(), "sandbox pool warmed");
        Ok(pool)
    }

    pub async fn acquire(self: &Arc<Self>) -> Result<Box<dyn WorkerHandle>, String> {
        let handle = match self.pop_idle() {
            Some(handle) => handle,
            None => self.launcher.launch().await?,
        };
        self.spawn_refill();
        Ok(handle)
    }

    /// Returns a healthy worker for reuse.
    pub async fn release(self: &Arc<Self>, mut handle: Box<dyn WorkerHandle>) {
        {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            if idle.len() < self.target_idle {
                idle.push_back(handle);
                return;
            }
        }
        handle.terminate().await;
    }

    /// Shuts a worker down for good and tops the pool back up.
    pub async fn retire(self: &Arc<Self>, mut handle: Box<dyn WorkerHandle>) {
        tracing::debug!(worker = %handle.identifier(), "retiring sandbox worker");
        handle.terminate().await;
        self.spawn_refill();
    }

    pub fn idle_len(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn pop_idle(&self) -> Option<Box<dyn WorkerHandle>> {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn push_idle(&self, handle: Box<dyn WorkerHandle>) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(handle);
    }

    async fn refill_strict(&self) -> Result<(), String> {
        while self.idle_len() < self.target_idle {
            let handle = self.launcher.launch().await?;
            self.push_idle(handle);
        }
        Ok(())
    }

    fn spawn_refill(self: &Arc<Self>) {
        if self.refilling.swap(true, Ordering::SeqCst) {
            return;
        }
        let pool = self.clone();
        tokio::spawn(async move {
            pool.refill_best_effort().await;
            pool.refilling.store(false, Ordering::SeqCst);
        });
    }

    async fn refill_best_effort(&self) {
        while self.idle_len() < self.target_idle {
            match self.launcher.launch().await {
                Ok(handle) => self.push_idle(handle),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to refill sandbox pool");
                    break;
                }
            }
        }
    }
}
