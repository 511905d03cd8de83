//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: backend wiring (lock coordinator, ledger, engine, ingester)
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router over already-wired services.
pub fn build_app(services: Arc<services::AppServices>) -> Router {
    // Merchant-scoped routes: require the merchant header.
    let protected = routes::router()
        .layer(Extension(services))
        .layer(axum::middleware::from_fn(middleware::merchant_middleware));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
        .layer(ServiceBuilder::new())
}

/// Router over in-memory backends (dev/test).
pub fn build_in_memory_app() -> Router {
    build_app(Arc::new(services::AppServices::in_memory()))
}
