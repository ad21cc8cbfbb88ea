//! Defines the gateway routes.
//!
//! ## Structure
//! - `PUT /`                        — upload a file, returns `{"key": ...}`
//! - `GET /{key}`                   — 307 redirect to a signed download URL
//! - `GET /storage/{bucket}/{key}`  — store-side endpoint signed URLs point at
//! - `GET /healthz`, `GET /readyz`  — liveness and readiness
//!
//! Keys are a single path segment; a key containing `/` travels as `%2F`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{download_file, get_signed_object, upload_file},
    },
    services::gateway::GatewayService,
};
use axum::{
    Router,
    routing::{get, put},
};
use tower_http::trace::TraceLayer;

/// Build the router. Shared state is the `GatewayService`.
pub fn routes() -> Router<GatewayService> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/", put(upload_file))
        .route("/{key}", get(download_file))
        .route("/storage/{bucket}/{key}", get(get_signed_object))
        .layer(TraceLayer::new_for_http())
}

/// Router with state attached, ready to serve.
pub fn app(gateway: GatewayService) -> Router {
    routes().with_state(gateway)
}
