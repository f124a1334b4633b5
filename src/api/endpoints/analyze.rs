//! `POST /analyze`: Extractor → Candidate Generator → Evidence Validator.

use axum::extract::State;
use axum::Json;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::types::{AnalyzeResponse, ApiContext, TextRequest};

pub async fn run(
    State(ctx): State<ApiContext>,
    Json(request): Json<TextRequest>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    request.validate()?;

    let request_id = Uuid::new_v4();
    tracing::info!(%request_id, chars = request.text.chars().count(), "Analyze request");

    let pipeline = ctx.pipeline.clone();
    let report =
        tokio::task::spawn_blocking(move || pipeline.analyze(request_id, &request.text)).await?;

    Ok(Json(report.into()))
}
