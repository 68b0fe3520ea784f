//! Sandboxed run execution: workspace materialization, container lifecycle,
//! bounded work queue, and output recovery.

pub mod bootstrap;
pub mod config;
pub mod output;
pub mod queue;
pub mod sandbox;

pub use config::RunnerConfig;
pub use output::{extract_output_from_logs, extract_patch};
pub use queue::{spawn_workers, ExecutionRequest, WorkQueue};
pub use sandbox::{SandboxRun, SandboxRunner};
