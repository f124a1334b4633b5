//! Router construction.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::api::endpoints;
use crate::api::types::ApiContext;
use crate::pipeline::ClinicalPipeline;

/// Build the API router around a shared pipeline.
pub fn api_router(pipeline: Arc<ClinicalPipeline>) -> Router {
    build_router(ApiContext::new(pipeline))
}

fn build_router(ctx: ApiContext) -> Router {
    Router::new()
        .route("/health", get(endpoints::health::check))
        .route("/analyze", post(endpoints::analyze::run))
        .route("/extract", post(endpoints::extract::run))
        .route("/filter", post(endpoints::filter::run))
        .route("/research", post(endpoints::research::run))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}
