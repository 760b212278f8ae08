//! HTTP façade over the memory runtime (feature `http-api`).
//!
//! Thin layer only: request/response shaping and error mapping. All
//! behavior lives in the services this module delegates to.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::agent::{AgentQuery, AgentService};
use crate::knowledge::{KnowledgeStats, KnowledgeStore};
use crate::retrieval::{RetrievalOptions, RetrievalService};
use crate::types::{ErrorKind, MemoryError};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    pub agent: Arc<AgentService>,
    pub retrieval: Arc<RetrievalService>,
    pub knowledge: Arc<dyn KnowledgeStore>,
}

/// Build the router with all query endpoints and health probes.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/agent/query", post(agent_query))
        .route("/memory/search", post(memory_search))
        .route("/memory/stats", get(memory_stats))
        .route("/memory/recent", get(memory_recent))
        .route("/health", get(health))
        .route("/health/ready", get(health_ready))
        .route("/health/live", get(health_live))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until the process stops.
pub async fn serve(state: ApiState, host: &str, port: u16) -> Result<(), MemoryError> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| MemoryError::Internal(format!("bind {addr}: {e}")))?;
    tracing::info!(addr = %addr, "HTTP API listening");
    axum::serve(listener, router(state))
        .await
        .map_err(|e| MemoryError::Internal(format!("server error: {e}")))
}

struct ApiError(MemoryError);

impl From<MemoryError> for ApiError {
    fn from(err: MemoryError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::Validation | ErrorKind::Duplicate => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Upstream | ErrorKind::Timeout | ErrorKind::Transient => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::Unsupported | ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": {
                "kind": format!("{kind:?}"),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentQueryRequest {
    query: String,
    user_id: Option<String>,
    #[serde(default = "default_true")]
    include_memory_context: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentQueryResponse {
    response: String,
    duration_ms: u64,
    steps: Vec<crate::agent::AgentStep>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools_used: Vec<String>,
    success: bool,
}

async fn agent_query(
    State(state): State<ApiState>,
    Json(request): Json<AgentQueryRequest>,
) -> Result<Json<AgentQueryResponse>, ApiError> {
    let answer = state
        .agent
        .query(AgentQuery {
            query: request.query,
            history: Vec::new(),
            user_id: request.user_id,
            include_memory_context: request.include_memory_context,
        })
        .await?;

    Ok(Json(AgentQueryResponse {
        response: answer.response,
        duration_ms: answer.duration.as_millis() as u64,
        steps: answer.steps,
        tools_used: answer.tools_used,
        success: answer.success,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemorySearchRequest {
    query: String,
    limit: Option<usize>,
    min_similarity: Option<f32>,
    source_types: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MemorySearchResponse {
    results: Vec<Value>,
    total: usize,
    duration_ms: u64,
}

async fn memory_search(
    State(state): State<ApiState>,
    Json(request): Json<MemorySearchRequest>,
) -> Result<Json<MemorySearchResponse>, ApiError> {
    let started = std::time::Instant::now();
    let result = state
        .retrieval
        .search(
            &request.query,
            &RetrievalOptions {
                top_k: request.limit,
                min_similarity: request.min_similarity,
                source_types: request.source_types,
                tiers: None,
            },
        )
        .await
        .map_err(MemoryError::Retrieval)?;

    let results = result
        .chunks
        .iter()
        .map(|scored| {
            json!({
                "id": scored.chunk.id.to_string(),
                "content": scored.chunk.content,
                "similarity": scored.similarity,
                "sourceType": scored.chunk.source_type,
                "metadata": scored.chunk.metadata,
                "createdAt": scored.chunk.created_at.to_rfc3339(),
            })
        })
        .collect();

    Ok(Json(MemorySearchResponse {
        results,
        total: result.total_results,
        duration_ms: started.elapsed().as_millis() as u64,
    }))
}

async fn memory_stats(
    State(state): State<ApiState>,
) -> Result<Json<KnowledgeStats>, ApiError> {
    let stats = state
        .knowledge
        .stats()
        .await
        .map_err(MemoryError::Knowledge)?;
    Ok(Json(stats))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecentQuery {
    source_type: Option<String>,
    limit: Option<usize>,
}

async fn memory_recent(
    State(state): State<ApiState>,
    Query(params): Query<RecentQuery>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let chunks = state
        .retrieval
        .get_recent(params.source_type.as_deref(), params.limit.unwrap_or(20))
        .await
        .map_err(MemoryError::Retrieval)?;

    let body = chunks
        .iter()
        .map(|chunk| {
            json!({
                "id": chunk.id.to_string(),
                "content": chunk.content,
                "sourceType": chunk.source_type,
                "metadata": chunk.metadata,
                "createdAt": chunk.created_at.to_rfc3339(),
            })
        })
        .collect();
    Ok(Json(body))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Ready when the knowledge store answers; the database is the one
/// dependency every request path needs.
async fn health_ready(State(state): State<ApiState>) -> Response {
    match state.knowledge.stats().await {
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "ready" }))).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not ready", "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn health_live() -> Json<Value> {
    Json(json!({ "status": "alive" }))
}
