//! HTTP API for a presentation layer.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::download::{CancelOutcome, TaskRequest, TaskSnapshot};
use crate::service::{AssetService, ServiceError};

pub type AppState = Arc<AssetService>;

#[derive(Debug, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "lowercase")]
enum ApiResponse {
    Failure(String),
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "Request failed");
        let body = Json(ApiResponse::Failure(self.to_string()));
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct TaskList {
    pending: Vec<TaskSnapshot>,
    active: Vec<TaskSnapshot>,
}

async fn list_tasks_handler(State(service): State<AppState>) -> impl IntoResponse {
    Json(TaskList {
        pending: service.list_pending(),
        active: service.list_active(),
    })
}

async fn task_stats_handler(State(service): State<AppState>) -> impl IntoResponse {
    Json(service.stats())
}

async fn submit_task_handler(
    State(service): State<AppState>,
    Json(request): Json<TaskRequest>,
) -> impl IntoResponse {
    let snapshot = service.submit(request);
    (StatusCode::CREATED, Json(snapshot))
}

async fn cancel_task_handler(
    State(service): State<AppState>,
    Path(filename): Path<String>,
) -> impl IntoResponse {
    let outcome = service.cancel(&filename);
    let status = match outcome {
        CancelOutcome::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::OK,
    };
    (status, Json(outcome))
}

#[derive(Debug, Deserialize, Default)]
struct ProcessParams {
    #[serde(default)]
    wait: bool,
}

/// Start processing the queue. Returns immediately unless `?wait=true`, in
/// which case the batch summary is returned once it finishes.
async fn process_handler(
    State(service): State<AppState>,
    Query(params): Query<ProcessParams>,
) -> Result<Response, ServiceError> {
    if params.wait {
        let report = service.process().await?;
        return Ok(Json(report.summary()).into_response());
    }

    let queued = service.stats().pending;
    tokio::spawn(async move {
        match service.process().await {
            Ok(report) => tracing::info!(
                completed = report.completed,
                failed = report.failed,
                "Background batch finished"
            ),
            Err(e) => tracing::error!(error = %e, "Background batch failed"),
        }
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "queued": queued })),
    )
        .into_response())
}

async fn usage_handler(State(service): State<AppState>) -> Result<Response, ServiceError> {
    Ok(Json(service.usage().await?).into_response())
}

pub fn tasks_api() -> Router<AppState> {
    Router::new()
        .route("/", get(list_tasks_handler).post(submit_task_handler))
        .route("/stats", get(task_stats_handler))
        .route("/{filename}/cancel", post(cancel_task_handler))
}

pub fn create_router(service: AppState) -> Router {
    let api = Router::new()
        .nest("/tasks", tasks_api())
        .route("/process", post(process_handler))
        .route("/storage/usage", get(usage_handler));

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::{AssetType, Downloader, DownloaderConfig};
    use crate::progress::ProgressReporter;
    use crate::storage::StorageManager;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    fn app(root: &std::path::Path) -> (Router, AppState) {
        let reporter = ProgressReporter::new();
        let engine = Downloader::new(DownloaderConfig::default(), reporter.clone());
        let service =
            Arc::new(AssetService::new(engine, &reporter, StorageManager::new(root)).unwrap());
        (create_router(service.clone()), service)
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_list_and_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let (router, service) = app(dir.path());

        let response = router
            .clone()
            .oneshot(post_json(
                "/api/tasks",
                serde_json::json!({
                    "url": "https://example.com/models/detail.safetensors",
                    "asset_type": "lora",
                    "priority": 3
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = json(response).await;
        assert_eq!(created["filename"], "detail.safetensors");
        assert_eq!(created["status"], "pending");
        assert_eq!(created["asset_type"], "lora");

        let listed = router
            .clone()
            .oneshot(Request::get("/api/tasks").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(listed.status(), StatusCode::OK);
        assert_eq!(json(listed).await["pending"].as_array().unwrap().len(), 1);

        let stats = router
            .clone()
            .oneshot(Request::get("/api/tasks/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json(stats).await["pending"], 1);

        let cancel = router
            .clone()
            .oneshot(
                Request::post("/api/tasks/detail.safetensors/cancel")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(cancel.status(), StatusCode::OK);
        assert_eq!(json(cancel).await, serde_json::json!("removed"));
        assert_eq!(service.stats().pending, 0);

        let missing = router
            .oneshot(
                Request::post("/api/tasks/detail.safetensors/cancel")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_request_body_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (router, service) = app(dir.path());
        let response = router
            .oneshot(post_json(
                "/api/tasks",
                serde_json::json!({ "url": "https://example.com/x", "asset_type": "tokenizer" }),
            ))
            .await
            .unwrap();
        assert!(response.status().is_client_error());
        assert_eq!(service.stats().pending, 0);
    }

    #[tokio::test]
    async fn test_process_and_usage() {
        let dir = tempfile::tempdir().unwrap();
        let (router, service) = app(dir.path());

        let data = b"tiny model".to_vec();
        let (addr, _) = crate::test_support::serve(data.clone()).await;
        service.enqueue(
            crate::download::Task::new(
                format!("http://{addr}/files/tiny.safetensors"),
                service.storage().layout().downloads_dir(),
                AssetType::Vae,
            ),
        );

        let response = router
            .clone()
            .oneshot(Request::post("/api/process?wait=true").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let summary = json(response).await;
        assert_eq!(summary["total"], 1);
        assert_eq!(summary["completed"], 1);
        assert_eq!(summary["tasks"][0]["status"], "completed");

        let usage = router
            .oneshot(Request::get("/api/storage/usage").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(usage.status(), StatusCode::OK);
        let usage = json(usage).await;
        assert_eq!(usage["categories"]["models"]["subcategories"]["vae"]["files"], 1);
        assert_eq!(usage["categories"]["models"]["subcategories"]["vae"]["bytes"], data.len());
    }

    #[tokio::test]
    async fn test_background_process_returns_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let (router, _service) = app(dir.path());
        let response = router
            .oneshot(Request::post("/api/process").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(json(response).await["queued"], 0);
    }
}
