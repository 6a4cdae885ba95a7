mod bilibili;
mod config;
mod error;
mod handlers;

use std::collections::HashSet;

use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header::CONTENT_DISPOSITION},
    routing::{get, post},
};
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{Span, debug, info, info_span};

use crate::{
    bilibili::BilibiliClient,
    config::{AppConfig, normalize_origin},
    error::ApiError,
    handlers::AppState,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "bili_proxy=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = AppConfig::from_env()?;

    let bilibili = BilibiliClient::new(config.api_base.clone())
        .map_err(|error| ApiError::internal(error.to_string()))?;
    info!("Using Bilibili API at {}", config.api_base);

    let state = AppState { bilibili };
    let app = build_router(state).layer(build_cors_layer(&config.allowed_origins));

    let listener = TcpListener::bind(&config.bind_addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {}: {error}", config.bind_addr))
    })?;

    info!("bili-proxy listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/parse", post(handlers::parse_video))
        .route("/api/download", get(handlers::download))
        .with_state(state)
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
}

// Never record the query string: `/api/download` carries the session token.
fn request_span(request: &Request<Body>) -> Span {
    info_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path()
    )
}

fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allowed_origins = allowed_origins.iter().cloned().collect::<HashSet<_>>();
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        allowed_origins.len(),
        allowed_origins
    );

    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let normalized = origin.to_str().ok().and_then(normalize_origin);
        let allowed = normalized
            .as_ref()
            .is_some_and(|value| allowed_origins.contains(value));
        debug!(
            "CORS origin check raw={:?} normalized={:?} allowed={}",
            origin, normalized, allowed
        );
        allowed
    });

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([CONTENT_DISPOSITION])
}

pub(crate) fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
