//! `POST /extract`: patient text to structured record only.

use axum::extract::State;
use axum::Json;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, StageResponse, TextRequest};
use crate::pipeline::types::PatientRecord;

pub async fn run(
    State(ctx): State<ApiContext>,
    Json(request): Json<TextRequest>,
) -> Result<Json<StageResponse<PatientRecord>>, ApiError> {
    request.validate()?;

    let request_id = Uuid::new_v4();
    let pipeline = ctx.pipeline.clone();
    let outcome =
        tokio::task::spawn_blocking(move || pipeline.extract(request_id, &request.text)).await?;

    Ok(Json(StageResponse {
        request_id,
        outcome,
    }))
}
