//! `POST /research`: literature digest for a diagnosis.

use axum::extract::State;
use axum::Json;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, ResearchRequest, StageResponse};
use crate::pipeline::types::ResearchDigest;

pub async fn run(
    State(ctx): State<ApiContext>,
    Json(request): Json<ResearchRequest>,
) -> Result<Json<StageResponse<ResearchDigest>>, ApiError> {
    if request.diagnosis.trim().is_empty() {
        return Err(ApiError::BadRequest("diagnosis is required".into()));
    }

    let request_id = Uuid::new_v4();
    let pipeline = ctx.pipeline.clone();
    let outcome =
        tokio::task::spawn_blocking(move || pipeline.research(request_id, &request.diagnosis))
            .await?;

    Ok(Json(StageResponse {
        request_id,
        outcome,
    }))
}
