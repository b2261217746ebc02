use crate::rate_limit::{admission_middleware, AdmissionControl};
use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Build the host router. Each route class sits behind the admission
/// middleware under its policy; everything downstream of the middleware is
/// placeholder glue standing in for the real application.
pub fn create_router(admission: Arc<AdmissionControl>) -> Router {
    // Configure CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health endpoint, deliberately unthrottled
        .route("/health/live", get(liveness))
        .nest("/v1", v1_routes(&admission))
        // Add middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn liveness() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

fn v1_routes(admission: &Arc<AdmissionControl>) -> Router {
    Router::new()
        .merge(guarded(
            Router::new().route("/auth/login", post(|| async { "Auth login endpoint" })),
            admission,
            "auth",
        ))
        .merge(guarded(
            Router::new().route("/upload", post(|| async { "Upload endpoint" })),
            admission,
            "upload",
        ))
        .merge(guarded(
            Router::new().route("/search", get(|| async { "Search endpoint" })),
            admission,
            "search",
        ))
        .merge(guarded(
            Router::new().route("/comments", post(|| async { "Create comment endpoint" })),
            admission,
            "comments",
        ))
        .merge(guarded(
            Router::new().route("/videos/:id", get(|| async { "Get video endpoint" })),
            admission,
            "video",
        ))
        .merge(guarded(
            Router::new().route("/pages/:slug", get(|| async { "Page endpoint" })),
            admission,
            "default",
        ))
}

fn guarded(router: Router, admission: &Arc<AdmissionControl>, policy_name: &'static str) -> Router {
    let admission = admission.clone();
    router.layer(middleware::from_fn(move |request, next| {
        admission_middleware(admission.clone(), policy_name, request, next)
    }))
}
