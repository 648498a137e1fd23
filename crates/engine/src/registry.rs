use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::event::ExecutionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
}

/// Lookup record for one live execution. The engine owns the unit itself;
/// the entry only carries what `stop` and liveness queries need.
#[derive(Debug)]
pub struct RegistryEntry {
    pub started_at: Instant,
    pub status: ExecutionStatus,
    pub unit: Option<String>,
    pub cancel: CancellationToken,
    /// `Some(stopped)` once the workflow has deregistered.
    pub finished: watch::Receiver<Option<bool>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveExecution {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub unit: Option<String>,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

fn as_millis<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}

#[derive(Debug, Default)]
pub struct ExecutionRegistry {
    entries: Mutex<HashMap<ExecutionId, RegistryEntry>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ExecutionId, RegistryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a pending entry. Returns `false` if the id is already taken.
    pub fn register(
        &self,
        execution_id: ExecutionId,
        cancel: CancellationToken,
        finished: watch::Receiver<Option<bool>>,
    ) -> bool {
        let mut entries = self.entries();
        if entries.contains_key(&execution_id) {
            return false;
        }
        entries.insert(
            execution_id,
            RegistryEntry {
                started_at: Instant::now(),
                status: ExecutionStatus::Pending,
                unit: None,
                cancel,
                finished,
            },
        );
        true
    }

    pub fn mark_running(&self, execution_id: &ExecutionId, unit: String) -> bool {
        match self.entries().get_mut(execution_id) {
            Some(entry) => {
                entry.status = ExecutionStatus::Running;
                entry.started_at = Instant::now();
                entry.unit = Some(unit);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, execution_id: &ExecutionId) -> Option<RegistryEntry> {
        self.entries().remove(execution_id)
    }

    pub fn contains(&self, execution_id: &ExecutionId) -> bool {
        self.entries().contains_key(execution_id)
    }

    pub fn ids(&self) -> Vec<ExecutionId> {
        let mut ids: Vec<ExecutionId> = self.entries().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> Vec<ActiveExecution> {
        let entries = self.entries();
        let mut active: Vec<ActiveExecution> = entries
            .iter()
            .map(|(execution_id, entry)| ActiveExecution {
                execution_id: execution_id.clone(),
                status: entry.status,
                unit: entry.unit.clone(),
                elapsed: entry.started_at.elapsed(),
            })
            .collect();
        active.sort_by(|a, b| a.execution_id.cmp(&b.execution_id));
        active
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
