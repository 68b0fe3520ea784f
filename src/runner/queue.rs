//! Bounded work queue and fixed worker pool for run execution.
//!
//! Submissions are admitted through a bounded channel; a full channel
//! rejects the submission immediately so the caller can fail the run
//! terminally instead of blocking the request path. A fixed number of
//! workers drain the channel, so at most that many sandboxes execute
//! concurrently.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::error::{RegistryError, SandboxError};
use crate::registry::{RunOutcome, RunRegistry};
use crate::runner::output::extract_patch;
use crate::runner::sandbox::{SandboxRun, SandboxRunner};

/// Everything a worker needs to execute one run.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub run_id: String,
    /// Path to the downloaded agent artifact on the host.
    pub agent_path: PathBuf,
    pub problem_statement: String,
    /// External inference endpoint, handed to the proxy only.
    pub inference_url: String,
    pub api_key: String,
    /// Extracted file context, relative path → bytes.
    pub files: Option<BTreeMap<String, Vec<u8>>>,
}

/// Submission side of the bounded execution queue.
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::Sender<ExecutionRequest>,
}

impl WorkQueue {
    /// Creates a bounded queue, returning the submission handle and the
    /// receiver to hand to [`spawn_workers`].
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<ExecutionRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Submits a run for execution without blocking. Errors when the queue
    /// is at capacity or the workers have shut down.
    pub fn try_submit(&self, request: ExecutionRequest) -> Result<(), SandboxError> {
        self.tx.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                SandboxError::Execution("execution queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                SandboxError::Execution("execution workers are not running".to_string())
            }
        })
    }
}

/// Spawns `count` workers draining the queue. Each worker executes one run
/// at a time; the pool size bounds sandbox concurrency.
pub fn spawn_workers(
    receiver: mpsc::Receiver<ExecutionRequest>,
    count: usize,
    registry: RunRegistry,
    runner: Arc<SandboxRunner>,
) {
    let receiver = Arc::new(Mutex::new(receiver));
    for worker_id in 0..count {
        let receiver = Arc::clone(&receiver);
        let registry = registry.clone();
        let runner = Arc::clone(&runner);
        tokio::spawn(async move {
            info!(worker = worker_id, "Execution worker started");
            loop {
                let request = {
                    let mut rx = receiver.lock().await;
                    rx.recv().await
                };
                let Some(request) = request else {
                    info!(worker = worker_id, "Execution worker shutting down");
                    break;
                };
                execute_run(&registry, &runner, request).await;
            }
        });
    }
}

/// Drives one run through the sandbox and records the terminal outcome.
async fn execute_run(registry: &RunRegistry, runner: &SandboxRunner, request: ExecutionRequest) {
    let run_id = request.run_id.clone();

    if let Err(e) = registry.mark_running(&run_id).await {
        // Run was deleted or cancelled while queued
        warn!(run_id = %run_id, error = %e, "Skipping run no longer eligible for execution");
        return;
    }
    info!(run_id = %run_id, "Executing run");

    let result = runner.run(&request).await;
    if let Err(e) = record_outcome(registry, &run_id, result).await {
        // Terminal recording can only fail when the run vanished or was
        // cancelled mid-flight; the sandbox has already been torn down.
        warn!(run_id = %run_id, error = %e, "Could not record run outcome");
    } else {
        info!(run_id = %run_id, "Run finished");
    }
}

/// Maps a sandbox result onto the run's terminal state.
///
/// A deadline miss becomes Timeout, any other sandbox error Failed. For a
/// finished sandbox, a non-zero exit is an orchestration fault (Failed);
/// on a zero exit the output document's `success` flag decides Completed
/// vs Failed.
async fn record_outcome(
    registry: &RunRegistry,
    run_id: &str,
    result: Result<SandboxRun, SandboxError>,
) -> Result<(), RegistryError> {
    match result {
        Ok(run) => {
            let patch = extract_patch(&run.output);
            let doc_error = run
                .output
                .get("error")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string);
            let outcome = RunOutcome {
                output: Some(run.output.clone()),
                patch: Some(patch),
                error: doc_error,
                logs: Some(run.logs),
            };

            let agent_succeeded = run
                .output
                .get("success")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(run.exit_code == 0);

            if run.exit_code != 0 {
                // Orchestration fault: the bootstrap itself died
                let outcome = RunOutcome {
                    error: Some(format!("sandbox exited with code {}", run.exit_code)),
                    ..outcome
                };
                registry.fail_with_outcome(run_id, outcome).await
            } else if agent_succeeded {
                registry.complete(run_id, outcome).await
            } else {
                registry.fail_with_outcome(run_id, outcome).await
            }
        }
        Err(SandboxError::Timeout { seconds }) => {
            registry
                .mark_timeout(run_id, format!("Execution timed out after {seconds} seconds"))
                .await
        }
        Err(e) => {
            error!(run_id = %run_id, error = %e, "Run execution failed");
            registry.fail(run_id, format!("Execution error: {e}")).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RunStatus;
    use serde_json::json;

    fn request(run_id: &str) -> ExecutionRequest {
        ExecutionRequest {
            run_id: run_id.to_string(),
            agent_path: PathBuf::from("/tmp/agent.py"),
            problem_statement: "p".to_string(),
            inference_url: "https://api.example.com".to_string(),
            api_key: "sk-test".to_string(),
            files: None,
        }
    }

    #[tokio::test]
    async fn test_submit_within_capacity() {
        let (queue, mut rx) = WorkQueue::bounded(2);
        queue.try_submit(request("a")).unwrap();
        queue.try_submit(request("b")).unwrap();
        assert_eq!(rx.recv().await.unwrap().run_id, "a");
        assert_eq!(rx.recv().await.unwrap().run_id, "b");
    }

    #[tokio::test]
    async fn test_full_queue_rejects_immediately() {
        let (queue, _rx) = WorkQueue::bounded(1);
        queue.try_submit(request("a")).unwrap();
        let err = queue.try_submit(request("b")).unwrap_err();
        assert!(err.to_string().contains("queue is full"));
    }

    #[tokio::test]
    async fn test_closed_queue_rejects() {
        let (queue, rx) = WorkQueue::bounded(1);
        drop(rx);
        assert!(queue.try_submit(request("a")).is_err());
    }

    async fn running_registry(run_id: &str) -> RunRegistry {
        let registry = RunRegistry::new();
        registry
            .create(crate::registry::RunRecord::new(run_id, "agent-1", "p"))
            .await
            .unwrap();
        registry.mark_queued(run_id).await.unwrap();
        registry.mark_running(run_id).await.unwrap();
        registry
    }

    fn sandbox_run(exit_code: i64, output: serde_json::Value) -> SandboxRun {
        SandboxRun {
            success: exit_code == 0,
            output,
            logs: vec!["line".to_string()],
            exit_code,
            execution_time: 1.0,
        }
    }

    #[tokio::test]
    async fn test_timeout_reaches_timeout_and_nothing_else() {
        let registry = running_registry("r1").await;
        record_outcome(
            &registry,
            "r1",
            Err(SandboxError::Timeout { seconds: 300 }),
        )
        .await
        .unwrap();

        let record = registry.get("r1").await.unwrap();
        assert_eq!(record.status, RunStatus::Timeout);
        assert!(record.error.as_deref().unwrap().contains("300 seconds"));
        // The terminal state is final: no later Completed/Failed
        assert!(registry.complete("r1", Default::default()).await.is_err());
        assert!(registry.fail("r1", "late").await.is_err());
        assert_eq!(registry.get("r1").await.unwrap().status, RunStatus::Timeout);
    }

    #[tokio::test]
    async fn test_clean_exit_with_success_flag_completes() {
        let registry = running_registry("r1").await;
        let output = json!({"success": true, "patch": "diff --git a b"});
        record_outcome(&registry, "r1", Ok(sandbox_run(0, output)))
            .await
            .unwrap();

        let record = registry.get("r1").await.unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.patch.as_deref(), Some("diff --git a b"));
        assert!(record.logs.is_some());
    }

    #[tokio::test]
    async fn test_clean_exit_with_failure_flag_fails() {
        let registry = running_registry("r1").await;
        let output = json!({"success": false, "error": "agent raised"});
        record_outcome(&registry, "r1", Ok(sandbox_run(0, output)))
            .await
            .unwrap();

        let record = registry.get("r1").await.unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("agent raised"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_orchestration_failure() {
        let registry = running_registry("r1").await;
        let output = json!({"success": true});
        record_outcome(&registry, "r1", Ok(sandbox_run(137, output)))
            .await
            .unwrap();

        let record = registry.get("r1").await.unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("exited with code 137"));
    }

    #[tokio::test]
    async fn test_sandbox_error_fails_run() {
        let registry = running_registry("r1").await;
        record_outcome(
            &registry,
            "r1",
            Err(SandboxError::Workspace("disk full".to_string())),
        )
        .await
        .unwrap();

        let record = registry.get("r1").await.unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("disk full"));
    }
}
