//! `POST /filter`: closed-world medication filter.

use axum::extract::State;
use axum::Json;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, FilterRequest, StageResponse};
use crate::pipeline::types::FilterVerdict;

pub async fn run(
    State(ctx): State<ApiContext>,
    Json(request): Json<FilterRequest>,
) -> Result<Json<StageResponse<FilterVerdict>>, ApiError> {
    let request_id = Uuid::new_v4();
    tracing::info!(
        %request_id,
        meds = request.patient_json.suggested_meds.len(),
        "Filter request"
    );

    let pipeline = ctx.pipeline.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        pipeline.filter(request_id, &request.patient_json)
    })
    .await??;

    Ok(Json(StageResponse {
        request_id,
        outcome,
    }))
}
