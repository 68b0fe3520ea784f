//! Sandbox manager: one isolated container per run.
//!
//! `SandboxRunner::run` materializes a throwaway workspace, registers the
//! run's credentials with the inference proxy, launches a resource-bounded
//! container, polls it to completion against a wall-clock deadline, and
//! recovers the structured output document. Teardown runs on every exit
//! path and each of its steps is independent best-effort: the container is
//! force-removed, the proxy credentials unregistered, and the workspace
//! deleted regardless of which steps fail.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::SandboxError;
use crate::execution::{ContainerSpec, ContainerState, DockerClient};
use crate::runner::bootstrap::{has_agent_main, render_bootstrap, REQUIREMENTS};
use crate::runner::config::RunnerConfig;
use crate::runner::output::extract_output_from_logs;
use crate::runner::queue::ExecutionRequest;

/// Container command: install git, install the dependency manifest, run the
/// bootstrap.
const SANDBOX_CMD: &str = "apt-get update -qq && apt-get install -y -qq git > /dev/null 2>&1 \
                           && pip install -q -r requirements.txt && python runner.py";

/// Result of one sandboxed execution.
#[derive(Debug, Clone)]
pub struct SandboxRun {
    /// Whether the bootstrap process exited cleanly.
    pub success: bool,
    /// Structured output document (read from the workspace, or recovered
    /// from logs).
    pub output: serde_json::Value,
    /// Combined stdout/stderr lines.
    pub logs: Vec<String>,
    /// Container exit code.
    pub exit_code: i64,
    /// Wall-clock execution time in seconds.
    pub execution_time: f64,
}

/// Launches, monitors, and tears down sandbox containers.
pub struct SandboxRunner {
    docker: DockerClient,
    config: RunnerConfig,
    http: reqwest::Client,
    /// run_id → container id for currently tracked runs.
    containers: Arc<RwLock<HashMap<String, String>>>,
}

impl SandboxRunner {
    pub fn new(docker: DockerClient, config: RunnerConfig) -> Self {
        Self {
            docker,
            config,
            http: reqwest::Client::new(),
            containers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Executes one agent run in an isolated container.
    ///
    /// Exactly one container is launched per call. Cleanup of the container,
    /// the proxy registration, and the workspace happens on every exit path.
    pub async fn run(&self, request: &ExecutionRequest) -> Result<SandboxRun, SandboxError> {
        let source = fs::read_to_string(&request.agent_path).map_err(|e| {
            SandboxError::Workspace(format!(
                "failed to read agent artifact {}: {e}",
                request.agent_path.display()
            ))
        })?;

        // Capability check against the declared entry-point interface,
        // before any execution resource is allocated.
        if !has_agent_main(&source) {
            return Err(SandboxError::UnsupportedAgent(
                request
                    .agent_path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| request.run_id.clone()),
            ));
        }

        let workspace = materialize_workspace(&self.config, request, &source)?;
        debug!(run_id = %request.run_id, workspace = %workspace.path().display(), "Workspace ready");

        // Best-effort: a failed registration must not abort the run; the
        // proxy falls back to its process defaults.
        self.register_credentials(request).await;

        let start = Instant::now();
        let result = self.execute(request, workspace.path()).await;
        let execution_time = start.elapsed().as_secs_f64();

        self.teardown(&request.run_id, workspace).await;

        result.map(|mut run| {
            run.execution_time = execution_time;
            run
        })
    }

    /// Launches the container and polls it to completion or deadline.
    async fn execute(
        &self,
        request: &ExecutionRequest,
        workspace: &Path,
    ) -> Result<SandboxRun, SandboxError> {
        let spec = ContainerSpec {
            name: format!("agent-run-{}", request.run_id),
            image: self.config.image.clone(),
            cmd: vec!["bash".to_string(), "-c".to_string(), SANDBOX_CMD.to_string()],
            // The external inference endpoint is deliberately absent: all
            // inference traffic must transit the proxy.
            env: vec![
                "PYTHONUNBUFFERED=1".to_string(),
                format!("AGENT_PROXY_URL={}", self.config.proxy_internal_url),
                format!("API_KEY={}", request.api_key),
            ],
            working_dir: "/workspace".to_string(),
            limits: self.config.limits.clone(),
            binds: vec![format!("{}:/workspace:rw", workspace.display())],
            network_mode: self.config.network.clone(),
        };

        self.docker.ensure_image(&spec.image).await?;
        let container_id = self.docker.create_container(&spec).await?;
        self.containers
            .write()
            .await
            .insert(request.run_id.clone(), container_id.clone());

        self.docker.start_container(&container_id).await?;
        let short_id = &container_id[..12.min(container_id.len())];
        info!(run_id = %request.run_id, container = %short_id, "Sandbox container started");

        let exit_code = self.wait_for_exit(request, &container_id).await?;

        let raw_logs = self.docker.logs(&container_id).await.unwrap_or_default();
        let logs: Vec<String> = raw_logs.lines().map(str::to_string).collect();

        let output_path = workspace.join("output.json");
        let output = match fs::read_to_string(&output_path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(run_id = %request.run_id, error = %e, "Output document unparsable, recovering from logs");
                extract_output_from_logs(&raw_logs)
            }),
            Err(_) => {
                warn!(run_id = %request.run_id, "Output document missing, recovering from logs");
                extract_output_from_logs(&raw_logs)
            }
        };

        Ok(SandboxRun {
            success: exit_code == 0,
            output,
            logs,
            exit_code,
            execution_time: 0.0, // filled in by run()
        })
    }

    /// Non-blocking interval poll until the container exits or the deadline
    /// elapses. On deadline the container is force-stopped and a Timeout is
    /// reported, distinct from an agent-logic failure.
    async fn wait_for_exit(
        &self,
        request: &ExecutionRequest,
        container_id: &str,
    ) -> Result<i64, SandboxError> {
        let deadline = Instant::now() + self.config.timeout;
        loop {
            match self.docker.container_state(container_id).await {
                Ok(ContainerState::Exited { exit_code }) => return Ok(exit_code),
                Ok(_) => {}
                Err(crate::error::DockerError::ContainerNotFound { .. }) => {
                    // Removed out from under us, e.g. by stop()
                    return Err(SandboxError::Execution(
                        "container was removed during execution".to_string(),
                    ));
                }
                Err(e) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                warn!(run_id = %request.run_id, "Sandbox deadline elapsed, stopping container");
                if let Err(e) = self.docker.stop_container(container_id).await {
                    debug!(run_id = %request.run_id, error = %e, "Failed to stop timed-out container");
                }
                return Err(SandboxError::Timeout {
                    seconds: self.config.timeout.as_secs(),
                });
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Posts the run's credentials to the proxy. Non-fatal on failure.
    async fn register_credentials(&self, request: &ExecutionRequest) {
        let Some(base) = &self.config.proxy_register_url else {
            return;
        };
        let url = format!("{}/register_run", base.trim_end_matches('/'));
        let body = serde_json::json!({
            "run_id": request.run_id,
            "inference_url": request.inference_url,
            "api_key": request.api_key,
        });

        match self
            .http
            .post(&url)
            .json(&body)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                debug!(run_id = %request.run_id, "Registered run credentials with proxy");
            }
            Ok(resp) => {
                warn!(
                    run_id = %request.run_id,
                    status = %resp.status(),
                    "Proxy rejected credential registration, continuing with process defaults"
                );
            }
            Err(e) => {
                warn!(
                    run_id = %request.run_id,
                    error = %e,
                    "Failed to register run with proxy, continuing with process defaults"
                );
            }
        }
    }

    /// Unconditional teardown. Each step is independent; a failure in one
    /// never prevents the others.
    async fn teardown(&self, run_id: &str, workspace: TempDir) {
        if let Some(container_id) = self.containers.write().await.remove(run_id) {
            if let Err(e) = self.docker.remove_container(&container_id).await {
                debug!(run_id = %run_id, error = %e, "Failed to remove sandbox container");
            }
        }

        if let Some(base) = &self.config.proxy_register_url {
            let url = format!("{}/unregister_run/{}", base.trim_end_matches('/'), run_id);
            if let Err(e) = self
                .http
                .delete(&url)
                .timeout(Duration::from_secs(5))
                .send()
                .await
            {
                debug!(run_id = %run_id, error = %e, "Failed to unregister run from proxy");
            }
        }

        if let Err(e) = workspace.close() {
            debug!(run_id = %run_id, error = %e, "Failed to delete workspace");
        }
        debug!(run_id = %run_id, "Sandbox teardown complete");
    }

    /// Forcibly stops and removes a tracked run's container. No-op when the
    /// run is untracked.
    pub async fn stop(&self, run_id: &str) {
        let container_id = self.containers.write().await.remove(run_id);
        let Some(container_id) = container_id else {
            debug!(run_id = %run_id, "Stop requested for untracked run");
            return;
        };

        if let Err(e) = self.docker.stop_container(&container_id).await {
            debug!(run_id = %run_id, error = %e, "Failed to stop container");
        }
        if let Err(e) = self.docker.remove_container(&container_id).await {
            debug!(run_id = %run_id, error = %e, "Failed to remove container");
        }
        info!(run_id = %run_id, "Sandbox stopped");
    }

    /// Stops every currently tracked run. Used at process shutdown.
    pub async fn cleanup_all(&self) {
        let run_ids: Vec<String> = self.containers.read().await.keys().cloned().collect();
        for run_id in run_ids {
            self.stop(&run_id).await;
        }
    }

    /// Number of currently tracked runs.
    pub async fn tracked_runs(&self) -> usize {
        self.containers.read().await.len()
    }
}

/// Materializes the isolated per-run workspace on the host: the agent
/// artifact, the optional file-context subtree (relative paths preserved),
/// the generated bootstrap script, and the dependency manifest.
fn materialize_workspace(
    config: &RunnerConfig,
    request: &ExecutionRequest,
    agent_source: &str,
) -> Result<TempDir, SandboxError> {
    let workspace = tempfile::Builder::new()
        .prefix(&format!("agent-run-{}-", request.run_id))
        .tempdir()
        .map_err(|e| SandboxError::Workspace(format!("failed to create temp dir: {e}")))?;

    fs::write(workspace.path().join("agent.py"), agent_source)?;

    if let Some(files) = &request.files {
        let files_dir = workspace.path().join("files");
        fs::create_dir_all(&files_dir)?;
        for (rel_path, content) in files {
            let dest = files_dir.join(rel_path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dest, content)?;
        }
    }

    let has_files = request.files.as_ref().is_some_and(|f| !f.is_empty());
    let script = render_bootstrap(
        &request.problem_statement,
        &request.run_id,
        &config.proxy_internal_url,
        has_files,
    );
    fs::write(workspace.path().join("runner.py"), script)?;
    fs::write(workspace.path().join("requirements.txt"), REQUIREMENTS)?;

    if tracing::enabled!(tracing::Level::DEBUG) {
        for entry in walkdir::WalkDir::new(workspace.path())
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            debug!(
                run_id = %request.run_id,
                file = %entry.path().strip_prefix(workspace.path()).unwrap_or(entry.path()).display(),
                "Workspace file"
            );
        }
    }

    Ok(workspace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn request_with_files(files: Option<BTreeMap<String, Vec<u8>>>) -> ExecutionRequest {
        ExecutionRequest {
            run_id: "test-run".to_string(),
            agent_path: PathBuf::from("/nonexistent/agent.py"),
            problem_statement: "fix the bug".to_string(),
            inference_url: "https://api.example.com/v1/chat/completions".to_string(),
            api_key: "sk-test".to_string(),
            files,
        }
    }

    #[test]
    fn test_workspace_layout_without_files() {
        let config = RunnerConfig::default();
        let request = request_with_files(None);
        let workspace =
            materialize_workspace(&config, &request, "def agent_main(i):\n    pass\n").unwrap();

        assert!(workspace.path().join("agent.py").exists());
        assert!(workspace.path().join("runner.py").exists());
        assert!(workspace.path().join("requirements.txt").exists());
        assert!(!workspace.path().join("files").exists());

        let script = fs::read_to_string(workspace.path().join("runner.py")).unwrap();
        assert!(script.contains("has_files = False"));
    }

    #[test]
    fn test_workspace_preserves_relative_file_paths() {
        let config = RunnerConfig::default();
        let mut files = BTreeMap::new();
        files.insert("src/lib.rs".to_string(), b"pub fn f() {}".to_vec());
        files.insert("deep/nested/dir/x.txt".to_string(), b"x".to_vec());
        let request = request_with_files(Some(files));

        let workspace = materialize_workspace(&config, &request, "def agent_main(i): pass").unwrap();

        assert!(workspace.path().join("files/src/lib.rs").exists());
        assert!(workspace.path().join("files/deep/nested/dir/x.txt").exists());

        let script = fs::read_to_string(workspace.path().join("runner.py")).unwrap();
        assert!(script.contains("has_files = True"));
    }

    #[tokio::test]
    async fn test_stop_untracked_run_is_noop() {
        let runner = SandboxRunner::new(
            DockerClient::new().unwrap(),
            RunnerConfig::default().with_proxy_register_url(None),
        );
        // The untracked branch returns before any daemon call is made
        runner.stop("unknown").await;
        runner.stop("unknown").await;
        assert_eq!(runner.tracked_runs().await, 0);
    }

    #[test]
    fn test_workspace_never_contains_inference_endpoint() {
        let config = RunnerConfig::default();
        let request = request_with_files(None);
        let workspace = materialize_workspace(&config, &request, "def agent_main(i): pass").unwrap();

        let script = fs::read_to_string(workspace.path().join("runner.py")).unwrap();
        assert!(!script.contains("api.example.com"));
        assert!(script.contains(&config.proxy_internal_url));
    }
}
