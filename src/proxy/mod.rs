//! Inference proxy: per-run credential isolation for sandboxed agents.
//!
//! Sandboxes never receive the external inference endpoint. Instead they
//! call this proxy with their run id; the proxy resolves the credentials
//! registered for that run (falling back to process-level defaults),
//! forwards the request upstream with a normalized bearer token, and shapes
//! the response into a chat-completion document.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::ProxyError;

/// Upstream request deadline.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(120);

/// Credentials registered for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCredentials {
    pub run_id: String,
    pub inference_url: String,
    pub api_key: String,
}

/// Inference request body accepted from sandboxes.
#[derive(Debug, Deserialize)]
pub struct InferenceRequest {
    pub messages: Vec<Value>,
    pub model: String,
    #[serde(default)]
    pub temperature: f64,
    pub run_id: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_tokens() -> u32 {
    4096
}

/// Shared proxy state: the credential map plus process-level defaults.
#[derive(Clone)]
pub struct ProxyState {
    runs: Arc<RwLock<HashMap<String, RunCredentials>>>,
    default_url: Option<String>,
    default_key: Option<String>,
    http: reqwest::Client,
}

impl ProxyState {
    pub fn new(default_url: Option<String>, default_key: Option<String>) -> Self {
        Self {
            runs: Arc::new(RwLock::new(HashMap::new())),
            default_url,
            default_key,
            http: reqwest::Client::new(),
        }
    }

    /// Resolves credentials for a run: per-run registration first, then
    /// process defaults.
    pub async fn resolve(&self, run_id: &str) -> Option<(String, String)> {
        if let Some(creds) = self.runs.read().await.get(run_id) {
            return Some((creds.inference_url.clone(), creds.api_key.clone()));
        }
        match (&self.default_url, &self.default_key) {
            (Some(url), Some(key)) => Some((url.clone(), key.clone())),
            _ => None,
        }
    }

    pub async fn registered_runs(&self) -> usize {
        self.runs.read().await.len()
    }
}

/// Normalizes a stored key into an `Authorization` header value. Keys are
/// accepted with or without the `Bearer ` prefix.
pub fn normalize_bearer(api_key: &str) -> String {
    if api_key.starts_with("Bearer ") {
        api_key.to_string()
    } else {
        format!("Bearer {api_key}")
    }
}

/// Shapes an upstream response into a chat-completion document.
///
/// A response that already carries `choices` is relayed as-is; otherwise a
/// single assistant choice is synthesized from its `text` field. Bodies
/// with neither are stringified whole so the caller sees what the provider
/// actually returned.
pub fn shape_response(upstream: Value) -> Value {
    if upstream.get("choices").is_some() {
        return upstream;
    }
    let content = match upstream.get("text").and_then(Value::as_str) {
        Some(text) => text.to_string(),
        None => upstream.to_string(),
    };
    json!({
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop",
        }]
    })
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ProxyError::NoCredentials => (
                StatusCode::UNAUTHORIZED,
                json!({"error": self.to_string()}),
            ),
            ProxyError::UpstreamTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                json!({"error": self.to_string()}),
            ),
            ProxyError::UpstreamUnreachable(_) => (
                StatusCode::BAD_GATEWAY,
                json!({"error": self.to_string()}),
            ),
            ProxyError::UpstreamStatus { status, ref body } => (
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                serde_json::from_str(body).unwrap_or_else(|_| json!({"error": body})),
            ),
        };
        (status, Json(body)).into_response()
    }
}

/// Builds the proxy router.
pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/register_run", post(register_run))
        .route("/agents/inference", post(inference))
        .route("/unregister_run/:run_id", delete(unregister_run))
        .route("/health", get(health))
        .with_state(state)
}

async fn register_run(
    State(state): State<ProxyState>,
    Json(creds): Json<RunCredentials>,
) -> impl IntoResponse {
    info!(run_id = %creds.run_id, "Registered run credentials");
    state.runs.write().await.insert(creds.run_id.clone(), creds);
    Json(json!({"status": "registered"}))
}

async fn unregister_run(
    State(state): State<ProxyState>,
    Path(run_id): Path<String>,
) -> impl IntoResponse {
    let removed = state.runs.write().await.remove(&run_id).is_some();
    debug!(run_id = %run_id, removed = removed, "Unregistered run");
    Json(json!({"status": "unregistered", "removed": removed}))
}

async fn health(State(state): State<ProxyState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "registered_runs": state.registered_runs().await,
    }))
}

async fn inference(
    State(state): State<ProxyState>,
    Json(request): Json<InferenceRequest>,
) -> Result<Json<Value>, ProxyError> {
    let (url, api_key) = state
        .resolve(&request.run_id)
        .await
        .ok_or(ProxyError::NoCredentials)?;

    debug!(run_id = %request.run_id, model = %request.model, "Forwarding inference request");

    let body = json!({
        "model": request.model,
        "messages": request.messages,
        "temperature": request.temperature,
        "max_tokens": request.max_tokens,
    });

    let response = state
        .http
        .post(&url)
        .header("Authorization", normalize_bearer(&api_key))
        .json(&body)
        .timeout(UPSTREAM_TIMEOUT)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                ProxyError::UpstreamTimeout
            } else {
                ProxyError::UpstreamUnreachable(e.to_string())
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        warn!(run_id = %request.run_id, status = %status, "Upstream rejected inference request");
        return Err(ProxyError::UpstreamStatus {
            status: status.as_u16(),
            body,
        });
    }

    let upstream: Value = response
        .json()
        .await
        .map_err(|e| ProxyError::UpstreamUnreachable(format!("invalid upstream body: {e}")))?;

    Ok(Json(shape_response(upstream)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn creds(run_id: &str) -> RunCredentials {
        RunCredentials {
            run_id: run_id.to_string(),
            inference_url: "https://api.example.com/v1/chat/completions".to_string(),
            api_key: "sk-run".to_string(),
        }
    }

    #[test]
    fn test_normalize_bearer() {
        assert_eq!(normalize_bearer("sk-abc"), "Bearer sk-abc");
        assert_eq!(normalize_bearer("Bearer sk-abc"), "Bearer sk-abc");
    }

    #[test]
    fn test_shape_response_relays_choices() {
        let upstream = json!({"choices": [{"message": {"content": "hi"}}], "usage": {}});
        assert_eq!(shape_response(upstream.clone()), upstream);
    }

    #[test]
    fn test_shape_response_synthesizes_choice_from_text() {
        let shaped = shape_response(json!({"text": "hello"}));
        assert_eq!(shaped["choices"][0]["message"]["content"], json!("hello"));
        assert_eq!(shaped["choices"][0]["message"]["role"], json!("assistant"));
    }

    #[test]
    fn test_shape_response_stringifies_unrecognized_body() {
        let shaped = shape_response(json!({"detail": "quota exceeded"}));
        let content = shaped["choices"][0]["message"]["content"].as_str().unwrap();
        assert!(content.contains("quota exceeded"));
    }

    #[tokio::test]
    async fn test_resolve_prefers_per_run_over_defaults() {
        let state = ProxyState::new(Some("https://default".to_string()), Some("sk-def".to_string()));
        state
            .runs
            .write()
            .await
            .insert("r1".to_string(), creds("r1"));

        let (url, key) = state.resolve("r1").await.unwrap();
        assert_eq!(url, "https://api.example.com/v1/chat/completions");
        assert_eq!(key, "sk-run");

        let (url, key) = state.resolve("unknown").await.unwrap();
        assert_eq!(url, "https://default");
        assert_eq!(key, "sk-def");
    }

    #[tokio::test]
    async fn test_resolve_without_defaults() {
        let state = ProxyState::new(None, None);
        assert!(state.resolve("r1").await.is_none());
    }

    #[tokio::test]
    async fn test_register_health_unregister() {
        let state = ProxyState::new(None, None);
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/register_run")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&creds("r1")).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.registered_runs().await, 1);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/unregister_run/r1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.registered_runs().await, 0);
    }

    #[tokio::test]
    async fn test_inference_without_credentials_is_unauthorized() {
        let app = router(ProxyState::new(None, None));
        let body = json!({
            "messages": [{"role": "user", "content": "hi"}],
            "model": "gpt-4",
            "run_id": "unknown",
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/agents/inference")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
