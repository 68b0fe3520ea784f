//! Agent catalog client: fetches agent metadata and downloads agent
//! artifacts, with a TTL-bounded metadata cache and an on-disk artifact
//! cache keyed by version id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::CatalogError;
use crate::registry::AgentInfo;

/// Metadata cache lifetime.
const CACHE_TTL: Duration = Duration::from_secs(300);

/// Upstream catalog operations, behind a trait so the API layer can be
/// tested without the network.
#[async_trait]
pub trait AgentCatalog: Send + Sync {
    /// Fetches the top `num_agents` agents, served from cache within the TTL.
    async fn fetch_top_agents(&self, num_agents: usize) -> Result<Vec<AgentInfo>, CatalogError>;

    /// Downloads an agent artifact, returning the cached file path.
    async fn download_agent(&self, version_id: &str) -> Result<PathBuf, CatalogError>;

    /// Looks up metadata for one agent version.
    async fn get_agent_info(&self, version_id: &str) -> Result<AgentInfo, CatalogError>;
}

struct MetadataCache {
    agents: HashMap<String, AgentInfo>,
    last_fetch: Option<Instant>,
}

/// HTTP catalog client with metadata and artifact caching.
pub struct CatalogClient {
    base_url: String,
    cache_dir: PathBuf,
    http: reqwest::Client,
    cache: RwLock<MetadataCache>,
}

impl CatalogClient {
    pub fn new(
        base_url: impl Into<String>,
        cache_dir: impl Into<PathBuf>,
    ) -> Result<Self, CatalogError> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            base_url: base_url.into(),
            cache_dir,
            http: reqwest::Client::new(),
            cache: RwLock::new(MetadataCache {
                agents: HashMap::new(),
                last_fetch: None,
            }),
        })
    }

    fn artifact_path(&self, version_id: &str) -> PathBuf {
        self.cache_dir.join(format!("{version_id}.py"))
    }

    async fn fetch_uncached(&self, num_agents: usize) -> Result<Vec<AgentInfo>, CatalogError> {
        let url = format!(
            "{}/retrieval/top-agents?num_agents={num_agents}",
            self.base_url.trim_end_matches('/')
        );
        debug!(url = %url, "Fetching top agents");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CatalogError::Fetch(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CatalogError::Fetch(format!(
                "catalog returned {}",
                response.status()
            )));
        }

        let agents: Vec<AgentInfo> = response
            .json()
            .await
            .map_err(|e| CatalogError::Fetch(format!("invalid catalog response: {e}")))?;

        let mut cache = self.cache.write().await;
        cache.agents = agents
            .iter()
            .map(|a| (a.version_id.clone(), a.clone()))
            .collect();
        cache.last_fetch = Some(Instant::now());
        info!(count = agents.len(), "Refreshed agent metadata cache");
        Ok(agents)
    }

    /// Drops the in-memory metadata cache.
    pub async fn clear_cache(&self) {
        let mut cache = self.cache.write().await;
        cache.agents.clear();
        cache.last_fetch = None;
    }

    /// Removes all cached agent artifacts from disk.
    pub fn clear_agent_files(&self) -> Result<(), CatalogError> {
        for entry in std::fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            if entry.path().extension().is_some_and(|e| e == "py") {
                std::fs::remove_file(entry.path())?;
            }
        }
        info!(cache_dir = %self.cache_dir.display(), "Cleared cached agent artifacts");
        Ok(())
    }

    /// Pre-downloads the top `num_agents` artifacts.
    pub async fn prefetch_agents(&self, num_agents: usize) -> Result<(), CatalogError> {
        let agents = self.fetch_top_agents(num_agents).await?;
        for agent in agents {
            if let Err(e) = self.download_agent(&agent.version_id).await {
                warn!(version_id = %agent.version_id, error = %e, "Prefetch failed for agent");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AgentCatalog for CatalogClient {
    async fn fetch_top_agents(&self, num_agents: usize) -> Result<Vec<AgentInfo>, CatalogError> {
        {
            let cache = self.cache.read().await;
            let fresh = cache
                .last_fetch
                .is_some_and(|t| t.elapsed() < CACHE_TTL);
            if fresh && !cache.agents.is_empty() {
                let mut agents: Vec<AgentInfo> = cache.agents.values().cloned().collect();
                agents.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
                agents.truncate(num_agents);
                return Ok(agents);
            }
        }
        self.fetch_uncached(num_agents).await
    }

    async fn download_agent(&self, version_id: &str) -> Result<PathBuf, CatalogError> {
        let path = self.artifact_path(version_id);
        if path.exists() {
            debug!(version_id = %version_id, path = %path.display(), "Agent artifact already cached");
            return Ok(path);
        }

        let url = format!(
            "{}/retrieval/agent-version-file?version_id={version_id}&return_as_text=true",
            self.base_url.trim_end_matches('/')
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CatalogError::DownloadFailed {
                version_id: version_id.to_string(),
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(CatalogError::DownloadFailed {
                version_id: version_id.to_string(),
                reason: format!("catalog returned {}", response.status()),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| CatalogError::DownloadFailed {
                version_id: version_id.to_string(),
                reason: e.to_string(),
            })?;

        std::fs::write(&path, parse_artifact_body(&body))?;
        info!(version_id = %version_id, path = %path.display(), "Downloaded agent artifact");
        Ok(path)
    }

    async fn get_agent_info(&self, version_id: &str) -> Result<AgentInfo, CatalogError> {
        if let Some(agent) = self.cache.read().await.agents.get(version_id) {
            return Ok(agent.clone());
        }
        let agents = self.fetch_top_agents(15).await?;
        agents
            .into_iter()
            .find(|a| a.version_id == version_id)
            .ok_or_else(|| CatalogError::AgentNotFound(version_id.to_string()))
    }
}

/// Artifact bodies arrive either as a JSON-quoted string or as raw source.
fn parse_artifact_body(body: &str) -> String {
    match serde_json::from_str::<String>(body) {
        Ok(source) => source,
        Err(_) => body.to_string(),
    }
}

/// Checks whether an artifact for `version_id` already exists under `dir`.
pub fn cached_artifact(dir: &Path, version_id: &str) -> Option<PathBuf> {
    let path = dir.join(format!("{version_id}.py"));
    path.exists().then_some(path)
}
