//! Error types for agent-harbor operations.
//!
//! Defines error types for the major subsystems:
//! - Run registry and state machine transitions
//! - Agent catalog fetch/download
//! - Docker container management
//! - Sandbox orchestration (workspace, execution, timeout)
//! - Inference proxy credential resolution and upstream relay
//! - Upload archive extraction

use thiserror::Error;

/// Errors that can occur during run registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Run '{0}' not found")]
    RunNotFound(String),

    #[error("Run '{0}' already exists")]
    DuplicateRun(String),

    #[error("Invalid state transition from '{from}' to '{to}' for run '{run_id}'")]
    InvalidTransition {
        run_id: String,
        from: String,
        to: String,
    },
}

/// Errors that can occur while talking to the agent catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Agent '{0}' not found in catalog")]
    AgentNotFound(String),

    #[error("Failed to fetch agents from catalog: {0}")]
    Fetch(String),

    #[error("Failed to download agent '{version_id}': {reason}")]
    DownloadFailed { version_id: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur during Docker operations.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Failed to pull image '{image}': {reason}")]
    PullFailed { image: String, reason: String },

    #[error("Docker run failed: {0}")]
    RunFailed(String),

    #[error("Container '{id}' not found")]
    ContainerNotFound { id: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while executing an agent in a sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Execution timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Agent '{0}' does not expose an agent_main entry point")]
    UnsupportedAgent(String),

    #[error("Failed to materialize workspace: {0}")]
    Workspace(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Docker error: {0}")]
    Docker(#[from] DockerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by the inference proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("No inference credentials configured for this run")]
    NoCredentials,

    #[error("Inference request timed out")]
    UpstreamTimeout,

    #[error("Failed to connect to inference provider: {0}")]
    UpstreamUnreachable(String),

    #[error("Inference provider error ({status}): {body}")]
    UpstreamStatus { status: u16, body: String },
}

/// Errors that can occur while extracting an uploaded file archive.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Invalid ZIP archive: {0}")]
    Archive(String),

    #[error("Archive entry '{0}' escapes the extraction root")]
    UnsafePath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
