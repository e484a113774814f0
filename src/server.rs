//! HTTP surface: run trigger, priority list and health check.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::coordinator::ExecutionCoordinator;
use crate::error::EngineError;
use crate::priority::{PriorityConsolidator, PriorityFilter};
use crate::risk::TimeRange;

const DEFAULT_PRIORITY_LIMIT: usize = 50;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ExecutionCoordinator>,
    pub priorities: Arc<PriorityConsolidator>,
}

impl AppState {
    pub fn new(coordinator: ExecutionCoordinator, priorities: PriorityConsolidator) -> Self {
        Self {
            coordinator: Arc::new(coordinator),
            priorities: Arc::new(priorities),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/warnings/execute", get(execute_get).post(execute_post))
        .route("/api/priority", get(priority_list))
        .route("/health", get(health_check))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct Envelope<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn success<T: Serialize>(data: T) -> Response {
    Json(Envelope {
        success: true,
        data: Some(data),
        error: None,
    })
    .into_response()
}

fn failure(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(Envelope::<()> {
            success: false,
            data: None,
            error: Some(message),
        }),
    )
        .into_response()
}

fn engine_failure(err: EngineError) -> Response {
    let status = match err {
        EngineError::Configuration(_) => StatusCode::BAD_REQUEST,
        EngineError::DataAccess(_) | EngineError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %err, "request failed");
    }
    failure(status, err.to_string())
}

#[derive(Debug, Default, Deserialize)]
struct ExecuteParams {
    trigger: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExecuteRequest {
    action: Option<String>,
    trigger: Option<String>,
}

/// GET /api/warnings/execute
async fn execute_get(State(state): State<AppState>, Query(params): Query<ExecuteParams>) -> Response {
    run(&state, params.trigger.as_deref().or(Some("http"))).await
}

/// POST /api/warnings/execute
///
/// An empty body means `execute_all`. A body must be a JSON object.
async fn execute_post(State(state): State<AppState>, body: Bytes) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        ExecuteRequest::default()
    } else {
        match serde_json::from_slice::<ExecuteRequest>(&body) {
            Ok(request) => request,
            Err(err) => return failure(StatusCode::BAD_REQUEST, format!("invalid request body: {err}")),
        }
    };

    match request.action.as_deref().unwrap_or("execute_all") {
        "execute_all" => run(&state, request.trigger.as_deref().or(Some("http"))).await,
        other => {
            warn!(action = other, "rejected unknown action");
            failure(StatusCode::BAD_REQUEST, format!("unknown action '{other}'"))
        }
    }
}

async fn run(state: &AppState, trigger: Option<&str>) -> Response {
    match state.coordinator.execute_all(trigger).await {
        Ok(report) => success(report),
        Err(err) => engine_failure(err),
    }
}

#[derive(Debug, Default, Deserialize)]
struct PriorityParams {
    limit: Option<usize>,
    class: Option<String>,
    exam: Option<String>,
    range: Option<String>,
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// GET /api/priority
async fn priority_list(State(state): State<AppState>, Query(params): Query<PriorityParams>) -> Response {
    let time_range = match params.range.as_deref() {
        Some(raw) => match raw.parse::<TimeRange>() {
            Ok(range) => range,
            Err(err) => return engine_failure(err),
        },
        None => TimeRange::default(),
    };
    let filter = PriorityFilter {
        class_names: split_list(params.class.as_deref()),
        assessment_titles: split_list(params.exam.as_deref()),
        time_range,
    };

    match state
        .priorities
        .priority_list(params.limit.unwrap_or(DEFAULT_PRIORITY_LIMIT), &filter)
        .await
    {
        Ok(entries) => success(entries),
        Err(err) => engine_failure(err),
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// GET /health
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::seed::sample_dataset;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::{header, Request};
    use serde_json::Value;
    use tower::ServiceExt;

    fn app(store: Arc<MemoryStore>) -> Router {
        let config = EngineConfig::default();
        let state = AppState::new(
            ExecutionCoordinator::new(store.clone(), &config),
            PriorityConsolidator::new(store, config.heuristics.clone()),
        );
        build_router(state)
    }

    fn sample_store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::with_dataset(sample_dataset().unwrap()).unwrap())
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(app(sample_store()), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn get_execute_returns_camel_case_report() {
        let request = Request::builder()
            .uri("/api/warnings/execute?trigger=cron")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(sample_store()), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["summary"]["totalRules"], 7);
        assert_eq!(body["data"]["results"].as_array().unwrap().len(), 7);
        assert!(body["data"]["executionId"].is_string());
        assert!(body["data"]["results"][0]["matchedEntities"].is_array());
    }

    #[tokio::test]
    async fn post_execute_all_runs_the_engine() {
        let request = post_json("/api/warnings/execute", serde_json::json!({"action": "execute_all"}));
        let (status, body) = send(app(sample_store()), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn bodyless_post_defaults_to_execute_all() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/warnings/execute")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(sample_store()), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["summary"]["totalRules"], 7);
    }

    #[tokio::test]
    async fn malformed_post_body_is_rejected() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/warnings/execute")
            .body(Body::from("{\"action\": "))
            .unwrap();
        let (status, body) = send(app(sample_store()), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().starts_with("invalid request body"));
    }

    #[tokio::test]
    async fn unknown_action_is_rejected() {
        let request = post_json("/api/warnings/execute", serde_json::json!({"action": "drop_all"}));
        let (status, body) = send(app(sample_store()), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("drop_all"));
    }

    #[tokio::test]
    async fn fatal_run_error_is_a_server_error() {
        let store = sample_store();
        store.set_catalog_unavailable(true);
        let request = Request::builder()
            .uri("/api/warnings/execute")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(store), request).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert!(body.get("data").is_none());
    }

    #[tokio::test]
    async fn priority_list_honours_limit_and_range() {
        let request = Request::builder()
            .uri("/api/priority?limit=2&class=Grade%207A,Grade%207B&range=all")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(sample_store()), request).await;
        assert_eq!(status, StatusCode::OK);
        let entries = body["data"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["provenance"], "manual");

        let bad = Request::builder()
            .uri("/api/priority?range=decade")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app(sample_store()), bad).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn list_params_are_split_and_trimmed() {
        assert_eq!(
            split_list(Some("7A, 7B,,")),
            vec!["7A".to_string(), "7B".to_string()]
        );
        assert!(split_list(None).is_empty());
    }
}
