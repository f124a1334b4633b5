//! Shared types for the HTTP layer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::outcome::StageStatus;
use crate::pipeline::sanitize::MAX_PATIENT_TEXT_CHARS;
use crate::pipeline::types::{CandidateSet, EvidenceVerdict, PatientContext, PatientRecord};
use crate::pipeline::{AnalysisReport, ClinicalPipeline, StageOutcome};

use super::error::ApiError;

/// Shared context for all routes.
#[derive(Clone)]
pub struct ApiContext {
    pub pipeline: Arc<ClinicalPipeline>,
}

impl ApiContext {
    pub fn new(pipeline: Arc<ClinicalPipeline>) -> Self {
        Self { pipeline }
    }
}

// ═══════════════════════════════════════════════════════════
// Requests
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct TextRequest {
    pub text: String,
}

impl TextRequest {
    /// Reject text the pipeline would have to truncate.
    pub fn validate(&self) -> Result<(), ApiError> {
        let chars = self.text.chars().count();
        if chars > MAX_PATIENT_TEXT_CHARS {
            return Err(ApiError::BadRequest(format!(
                "text is {chars} characters, the limit is {MAX_PATIENT_TEXT_CHARS}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct FilterRequest {
    pub patient_json: PatientContext,
}

#[derive(Debug, Deserialize)]
pub struct ResearchRequest {
    pub diagnosis: String,
}

// ═══════════════════════════════════════════════════════════
// Responses
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
pub struct StageReport {
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl<T> From<&StageOutcome<T>> for StageReport {
    fn from(outcome: &StageOutcome<T>) -> Self {
        Self {
            status: outcome.status,
            detail: outcome.detail.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StageReports {
    pub extractor: StageReport,
    pub candidates: StageReport,
    pub evidence: StageReport,
}

/// `/analyze` body. Keeps the `agentN_output` keys existing clients read.
#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    pub request_id: Uuid,
    pub agent0_output: PatientRecord,
    pub agent1_output: CandidateSet,
    pub agent2_output: EvidenceVerdict,
    pub stages: StageReports,
}

impl From<AnalysisReport> for AnalyzeResponse {
    fn from(report: AnalysisReport) -> Self {
        Self {
            request_id: report.request_id,
            stages: StageReports {
                extractor: (&report.record).into(),
                candidates: (&report.candidates).into(),
                evidence: (&report.evidence).into(),
            },
            agent0_output: report.record.value,
            agent1_output: report.candidates.value,
            agent2_output: report.evidence.value,
        }
    }
}

/// Single-stage endpoints: the stage value plus how it was obtained.
#[derive(Debug, Serialize)]
pub struct StageResponse<T> {
    pub request_id: Uuid,
    #[serde(flatten)]
    pub outcome: StageOutcome<T>,
}
