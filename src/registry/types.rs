//! Run records, statuses, and catalog agent metadata.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of an agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run record created, no execution resource allocated yet.
    Pending,
    /// Background execution accepted.
    Queued,
    /// Sandbox execution in progress.
    Running,
    /// Sandbox finished and the agent reported success.
    Completed,
    /// Pre-execution failure or agent/orchestration failure.
    Failed,
    /// Run exceeded the configured wall-clock deadline.
    Timeout,
    /// Run was stopped on request.
    Cancelled,
}

impl RunStatus {
    /// Returns true if the status is terminal (no further mutation permitted).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Timeout | RunStatus::Cancelled
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Legal sequences are `Pending → Queued → Running → terminal` and the
    /// pre-execution short-circuit `Pending → Failed`.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Failed)
                | (Queued, Running)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Timeout)
                | (Running, Cancelled)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Queued => write!(f, "queued"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Timeout => write!(f, "timeout"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Complete record of one agent run.
///
/// Invariants enforced by the registry: `completed_at` is set iff the status
/// is terminal, and `duration_seconds` is set iff both `started_at` and
/// `completed_at` are set (and equals their difference).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Unique identifier for the run.
    pub run_id: String,
    /// Agent version id used.
    pub agent_id: String,
    /// Current status.
    pub status: RunStatus,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When sandbox execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Execution duration in seconds (derived).
    pub duration_seconds: Option<f64>,
    /// The problem statement submitted.
    pub problem_statement: String,
    /// Structured output document produced by the sandbox.
    pub output: Option<serde_json::Value>,
    /// Canonical patch derived from the output.
    pub patch: Option<String>,
    /// Error message if the run failed.
    pub error: Option<String>,
    /// Combined container log lines.
    pub logs: Option<Vec<String>>,
    /// Number of context files provided with the submission.
    pub files_count: Option<usize>,
    /// Path to the resolved agent artifact.
    pub agent_path: Option<PathBuf>,
}

impl RunRecord {
    /// Creates a new Pending record.
    pub fn new(
        run_id: impl Into<String>,
        agent_id: impl Into<String>,
        problem_statement: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            agent_id: agent_id.into(),
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            problem_statement: problem_statement.into(),
            output: None,
            patch: None,
            error: None,
            logs: None,
            files_count: None,
            agent_path: None,
        }
    }
}

/// Metadata for one catalog agent version.
///
/// Owned and mutated only by the catalog; the execution core treats it as
/// read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Unique version identifier.
    pub version_id: String,
    /// Owning identity of the agent.
    pub miner_hotkey: String,
    /// Version number.
    pub version_num: i64,
    /// When this version was created.
    pub created_at: DateTime<Utc>,
    /// Leaderboard score, if evaluated.
    pub score: Option<f64>,
    /// Upload marker, if recorded.
    pub block_uploaded: Option<i64>,
}
