//! HTTP surface of the `server` action: health endpoint, request ids,
//! tracing and the expired-record cleanup worker.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    routing::get,
    Extension, Router,
};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer};
use tracing::{info, info_span, Span};
use ulid::Ulid;

use crate::auth::AuthService;
use crate::store::postgres::PostgresStore;

pub mod cleanup;
pub(crate) mod handlers;

const REQUEST_ID: &str = "x-request-id";

/// Routes with the request-id and trace layers applied.
#[must_use]
pub fn router(store: PostgresStore) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health).options(handlers::health::health))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static(REQUEST_ID),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(REQUEST_ID)))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(store)),
        )
}

/// Serve until ctrl-c, running the cleanup worker alongside.
///
/// # Errors
/// Returns an error if the listener cannot bind or the server fails.
pub async fn serve(
    port: u16,
    store: PostgresStore,
    auth: Arc<AuthService>,
    cleanup_interval: Duration,
) -> Result<()> {
    let cleanup = cleanup::spawn(auth, cleanup_interval);

    let app = router(store);
    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {err}");
            }
            info!("Gracefully shutdown");
        })
        .await?;

    cleanup.abort();
    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get(REQUEST_ID)
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
