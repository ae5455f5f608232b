// src/routes.rs
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use http::{header::CONTENT_TYPE, HeaderName, HeaderValue, Method};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

use crate::{handlers, state::AppState};

pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .nest(
            "/api",
            Router::new()
                .route("/polls", get(handlers::list_polls).post(handlers::create_poll))
                .route("/polls/mine", get(handlers::my_polls))
                .route(
                    "/polls/{poll_id}",
                    get(handlers::get_poll).delete(handlers::delete_poll),
                )
                .route("/polls/{poll_id}/votes", post(handlers::vote))
                .route("/polls/{poll_id}/votes/me", get(handlers::has_voted))
                .route("/polls/{poll_id}/results", get(handlers::get_results))
                .route(
                    "/polls/{poll_id}/results/stream",
                    get(handlers::stream_results),
                ),
        )
        .with_state(state)
}

/// Router with request tracing and CORS applied.
pub fn create_app(state: AppState, allowed_origin: Option<&str>, identity_header: &str) -> Router {
    create_routes(state)
        .layer(cors_layer(allowed_origin, identity_header))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(allowed_origin: Option<&str>, identity_header: &str) -> CorsLayer {
    let mut headers = vec![CONTENT_TYPE];
    match HeaderName::from_bytes(identity_header.as_bytes()) {
        Ok(name) => headers.push(name),
        Err(e) => warn!("Identity header {identity_header:?} is not a valid header name: {e}"),
    }

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(headers)
        .max_age(Duration::from_secs(60 * 60));

    match allowed_origin.map(HeaderValue::from_str) {
        Some(Ok(origin)) => cors.allow_origin(origin),
        Some(Err(e)) => {
            warn!("Ignoring invalid CORS_ALLOWED_ORIGIN: {e}");
            cors
        }
        None => cors.allow_origin(tower_http::cors::Any),
    }
}
