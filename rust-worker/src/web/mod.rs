//! HTTP producer and admin API.
//!
//! Every route except `/health` sits behind the optional `X-Admin-Token` check.

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use auth::{require_admin_token, ADMIN_TOKEN_HEADER};
pub use handlers::{ApiError, AppState, HealthResponse};

/// Build the full router.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/emails", post(handlers::enqueue_email))
        .route("/emails/bulk", post(handlers::enqueue_bulk_emails))
        .route("/campaigns", post(handlers::enqueue_campaign))
        .route("/queues/stats", get(handlers::queue_stats))
        .route(
            "/queues/:kind/jobs/:id",
            get(handlers::get_job).delete(handlers::remove_job),
        )
        .route("/queues/:kind/jobs/:id/retry", post(handlers::retry_job))
        .route("/queues/:kind/failed", get(handlers::failed_jobs))
        .route("/queues/:kind/failed/retry", post(handlers::retry_all_failed))
        .route("/queues/:kind/pause", post(handlers::pause_queue))
        .route("/queues/:kind/resume", post(handlers::resume_queue))
        .route("/queues/:kind/clean", post(handlers::clean_queue))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_token,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
