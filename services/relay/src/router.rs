use crate::handlers::{health, messages, pauses, stream};
use crate::state::AppState;
use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue},
    routing::{get, post},
    Router,
};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

pub fn create_router(state: AppState, max_concurrent_requests: usize) -> Router {
    Router::new()
        .route("/messages", post(messages::post_message))
        .route("/pauses", post(pauses::post_pause))
        .route(
            "/pauses/{id}",
            get(pauses::get_pause)
                .patch(pauses::patch_pause)
                .delete(pauses::delete_pause),
        )
        .route("/stream", get(stream::stream))
        .route("/health", get(health::health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(GlobalConcurrencyLimitLayer::new(max_concurrent_requests.max(1)))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
