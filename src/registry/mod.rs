//! In-memory run registry and state machine.
//!
//! The registry exclusively owns run records for their full lifecycle. All
//! state lives behind a lock-guarded map keyed by run id; every status
//! change goes through [`RunRegistry::transition`], which rejects sequences
//! the state machine does not permit and keeps the timestamp invariants in
//! one place. Run state is process-lifetime only, never persisted.

mod types;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::RegistryError;

pub use types::{AgentInfo, RunRecord, RunStatus};

/// Terminal outcome details applied together with the final transition.
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub output: Option<serde_json::Value>,
    pub patch: Option<String>,
    pub error: Option<String>,
    pub logs: Option<Vec<String>>,
}

/// Lock-guarded owner of all run records.
#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<RwLock<HashMap<String, RunRecord>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new record. Fails if the run id is already present.
    pub async fn create(&self, record: RunRecord) -> Result<(), RegistryError> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&record.run_id) {
            return Err(RegistryError::DuplicateRun(record.run_id));
        }
        runs.insert(record.run_id.clone(), record);
        Ok(())
    }

    /// Returns a copy of the record for `run_id`.
    pub async fn get(&self, run_id: &str) -> Result<RunRecord, RegistryError> {
        self.runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| RegistryError::RunNotFound(run_id.to_string()))
    }

    /// Lists runs, optionally filtered by status, newest first, up to `limit`.
    pub async fn list(&self, status: Option<RunStatus>, limit: usize) -> Vec<RunRecord> {
        let runs = self.runs.read().await;
        let mut selected: Vec<RunRecord> = runs
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        selected.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        selected.truncate(limit);
        selected
    }

    /// Removes the record unconditionally, returning it.
    pub async fn remove(&self, run_id: &str) -> Result<RunRecord, RegistryError> {
        self.runs
            .write()
            .await
            .remove(run_id)
            .ok_or_else(|| RegistryError::RunNotFound(run_id.to_string()))
    }

    /// Applies one state-machine transition, updating timestamps.
    ///
    /// Sets `started_at` on entry to Running; on entry to a terminal state
    /// sets `completed_at` and derives `duration_seconds` when `started_at`
    /// is present.
    async fn transition(
        &self,
        run_id: &str,
        next: RunStatus,
        apply: impl FnOnce(&mut RunRecord),
    ) -> Result<(), RegistryError> {
        let mut runs = self.runs.write().await;
        let record = runs
            .get_mut(run_id)
            .ok_or_else(|| RegistryError::RunNotFound(run_id.to_string()))?;

        if !record.status.can_transition_to(next) {
            warn!(
                run_id = %run_id,
                from = %record.status,
                to = %next,
                "Rejected illegal run state transition"
            );
            return Err(RegistryError::InvalidTransition {
                run_id: run_id.to_string(),
                from: record.status.to_string(),
                to: next.to_string(),
            });
        }

        record.status = next;
        if next == RunStatus::Running {
            record.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            let completed = Utc::now();
            record.completed_at = Some(completed);
            if let Some(started) = record.started_at {
                record.duration_seconds =
                    Some((completed - started).num_milliseconds() as f64 / 1000.0);
            }
        }
        apply(record);
        Ok(())
    }

    /// Marks a Pending run as accepted for background execution.
    pub async fn mark_queued(&self, run_id: &str) -> Result<(), RegistryError> {
        self.transition(run_id, RunStatus::Queued, |_| {}).await
    }

    /// Marks a Queued run as executing in a sandbox.
    pub async fn mark_running(&self, run_id: &str) -> Result<(), RegistryError> {
        self.transition(run_id, RunStatus::Running, |_| {}).await
    }

    /// Records the number of extracted context files on the record.
    pub async fn set_files_count(&self, run_id: &str, count: usize) -> Result<(), RegistryError> {
        let mut runs = self.runs.write().await;
        let record = runs
            .get_mut(run_id)
            .ok_or_else(|| RegistryError::RunNotFound(run_id.to_string()))?;
        record.files_count = Some(count);
        Ok(())
    }

    /// Records the resolved agent artifact path on the record.
    pub async fn set_agent_path(
        &self,
        run_id: &str,
        path: std::path::PathBuf,
    ) -> Result<(), RegistryError> {
        let mut runs = self.runs.write().await;
        let record = runs
            .get_mut(run_id)
            .ok_or_else(|| RegistryError::RunNotFound(run_id.to_string()))?;
        record.agent_path = Some(path);
        Ok(())
    }

    /// Finishes a Running run as Completed with its outcome.
    pub async fn complete(&self, run_id: &str, outcome: RunOutcome) -> Result<(), RegistryError> {
        self.transition(run_id, RunStatus::Completed, |r| {
            r.output = outcome.output;
            r.patch = outcome.patch;
            r.error = outcome.error;
            r.logs = outcome.logs;
        })
        .await
    }

    /// Finishes a run as Failed. Legal from Pending (pre-execution failure),
    /// Queued, and Running.
    pub async fn fail(&self, run_id: &str, error: impl Into<String>) -> Result<(), RegistryError> {
        let error = error.into();
        self.transition(run_id, RunStatus::Failed, |r| {
            r.error = Some(error);
        })
        .await
    }

    /// Finishes a Running run as Failed, attaching the sandbox outcome.
    pub async fn fail_with_outcome(
        &self,
        run_id: &str,
        outcome: RunOutcome,
    ) -> Result<(), RegistryError> {
        self.transition(run_id, RunStatus::Failed, |r| {
            r.output = outcome.output;
            r.patch = outcome.patch;
            r.error = outcome.error;
            r.logs = outcome.logs;
        })
        .await
    }

    /// Finishes a Running run as Timeout.
    pub async fn mark_timeout(
        &self,
        run_id: &str,
        error: impl Into<String>,
    ) -> Result<(), RegistryError> {
        let error = error.into();
        self.transition(run_id, RunStatus::Timeout, |r| {
            r.error = Some(error);
        })
        .await
    }

    /// Marks a Queued or Running run as Cancelled.
    pub async fn cancel(&self, run_id: &str) -> Result<(), RegistryError> {
        self.transition(run_id, RunStatus::Cancelled, |_| {}).await
    }

    /// Number of records currently held.
    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }
}
