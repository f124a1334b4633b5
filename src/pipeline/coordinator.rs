//! Pipeline coordinator.
//!
//! Owns one instance of every stage, built once from `AppConfig` and shared
//! by all requests. The main path is strictly linear:
//! Extractor → Candidate Generator → Evidence Validator. The filter and the
//! research summarizer are separate entry points.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::config::{AppConfig, ConfigError, LlmBackend};

use super::candidates::CandidateGenerator;
use super::evidence::{EvidencePolicy, EvidenceValidator, OutdatedMedications};
use super::extractor::Extractor;
use super::filter::{ClosedWorldFilter, FilterError};
use super::llm::{AnthropicClient, LlmClient, OllamaClient};
use super::outcome::StageOutcome;
use super::research::{LiteratureSearch, PubMedClient, ResearchSummarizer};
use super::types::{CandidateSet, EvidenceVerdict, FilterVerdict, PatientContext, PatientRecord, ResearchDigest};

/// Everything the main path produced, stage by stage.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub request_id: Uuid,
    pub record: StageOutcome<PatientRecord>,
    pub candidates: StageOutcome<CandidateSet>,
    pub evidence: StageOutcome<EvidenceVerdict>,
}

pub struct ClinicalPipeline {
    llm: Arc<dyn LlmClient>,
    extractor: Extractor,
    candidates: CandidateGenerator,
    evidence: EvidenceValidator,
    filter: ClosedWorldFilter,
    research: ResearchSummarizer,
}

impl ClinicalPipeline {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        literature: Arc<dyn LiteratureSearch>,
        policy: EvidencePolicy,
        overrides: OutdatedMedications,
        filter_max_attempts: u32,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            extractor: Extractor::new(llm.clone()),
            candidates: CandidateGenerator::new(llm.clone()),
            evidence: EvidenceValidator::new(llm.clone(), policy, overrides)?,
            filter: ClosedWorldFilter::new(llm.clone(), filter_max_attempts),
            research: ResearchSummarizer::new(llm.clone(), literature),
            llm,
        })
    }

    /// Build the model client, literature client, policy and override table
    /// described by `config`.
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        let llm: Arc<dyn LlmClient> = match config.backend {
            LlmBackend::Anthropic => {
                let key = config
                    .api_key
                    .as_deref()
                    .ok_or(ConfigError::Missing("ARYA_API_KEY"))?;
                Arc::new(
                    AnthropicClient::new(&config.anthropic_url, key, &config.model, config.llm_timeout_secs)
                        .map_err(|e| ConfigError::Client {
                            what: "model",
                            reason: e.to_string(),
                        })?,
                )
            }
            LlmBackend::Ollama => Arc::new(
                OllamaClient::new(&config.ollama_url, &config.model, config.llm_timeout_secs).map_err(
                    |e| ConfigError::Client {
                        what: "model",
                        reason: e.to_string(),
                    },
                )?,
            ),
        };

        let literature = PubMedClient::new(&config.pubmed_url, config.literature_timeout_secs)
            .map_err(|e| ConfigError::Client {
                what: "literature",
                reason: e.to_string(),
            })?;

        let policy = match &config.evidence_policy_path {
            Some(path) => EvidencePolicy::load(path)?,
            None => EvidencePolicy::default(),
        };
        let overrides = OutdatedMedications::load(&config.outdated_meds_path)?;

        tracing::info!(
            backend = ?config.backend,
            model = %config.model,
            policy = %policy.version,
            override_diagnoses = overrides.len(),
            "Clinical pipeline ready"
        );

        Self::new(llm, Arc::new(literature), policy, overrides, config.filter_max_attempts)
    }

    pub fn model(&self) -> &str {
        self.llm.model()
    }

    pub fn extract(&self, request_id: Uuid, text: &str) -> StageOutcome<PatientRecord> {
        let span = tracing::info_span!("extract", %request_id);
        let _enter = span.enter();
        let outcome = self.extractor.extract(text);
        log_stage("extractor", &outcome);
        outcome
    }

    /// Extractor → Candidate Generator → Evidence Validator.
    pub fn analyze(&self, request_id: Uuid, text: &str) -> AnalysisReport {
        let span = tracing::info_span!("analyze", %request_id);
        let _enter = span.enter();

        let record = self.extractor.extract(text);
        log_stage("extractor", &record);

        let candidates = self.candidates.generate(&record.value);
        log_stage("candidates", &candidates);

        let evidence = self.evidence.validate(
            &candidates.value.diagnosis,
            &candidates.value.candidate_treatments,
        );
        log_stage("evidence", &evidence);

        AnalysisReport {
            request_id,
            record,
            candidates,
            evidence,
        }
    }

    pub fn filter(
        &self,
        request_id: Uuid,
        context: &PatientContext,
    ) -> Result<StageOutcome<FilterVerdict>, FilterError> {
        let span = tracing::info_span!("filter", %request_id);
        let _enter = span.enter();
        let outcome = self.filter.filter(context)?;
        log_stage("filter", &outcome);
        Ok(outcome)
    }

    pub fn research(&self, request_id: Uuid, diagnosis: &str) -> StageOutcome<ResearchDigest> {
        let span = tracing::info_span!("research", %request_id);
        let _enter = span.enter();
        let outcome = self.research.summarize(diagnosis);
        log_stage("research", &outcome);
        outcome
    }
}

fn log_stage<T>(stage: &'static str, outcome: &StageOutcome<T>) {
    if outcome.is_degraded() {
        tracing::warn!(stage, detail = outcome.detail.as_deref().unwrap_or(""), "Stage degraded to fallback");
    } else {
        tracing::info!(stage, status = ?outcome.status, "Stage complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::llm::ScriptedLlmClient;
    use crate::pipeline::outcome::StageStatus;
    use crate::pipeline::research::StaticLiterature;

    const RECORD: &str = r#"{"name": "Sam Lee", "dob": "", "age": 41, "sex": "male", "pregnant": false,
        "allergies": ["Penicillin"], "conditions": [], "diagnosis": "Acute Bacterial Sinusitis"}"#;
    const CANDIDATES: &str = r#"{"diagnosis": "acute bacterial sinusitis",
        "candidate_treatments": ["amoxicillin", "azithromycin", "doxycycline"]}"#;
    const VERDICT: &str = r#"{"valid_drugs": ["amoxicillin", "azithromycin", "doxycycline"], "invalid_drugs": [],
        "Links": {"IDSA": "https://www.idsociety.org/practice-guidelines/rhinosinusitis-in-adults/"}}"#;

    fn pipeline(llm: Arc<ScriptedLlmClient>) -> ClinicalPipeline {
        let overrides =
            OutdatedMedications::from_entries([("acute bacterial sinusitis", vec!["azithromycin"])]);
        ClinicalPipeline::new(
            llm,
            Arc::new(StaticLiterature::numbered(3)),
            EvidencePolicy::default(),
            overrides,
            3,
        )
        .unwrap()
    }

    #[test]
    fn analyze_chains_three_stages() {
        let llm = Arc::new(ScriptedLlmClient::replies(&[RECORD, CANDIDATES, VERDICT]));
        let report = pipeline(llm.clone()).analyze(Uuid::new_v4(), "Sam Lee, 41M, sinusitis, PCN allergy");

        assert_eq!(report.record.status, StageStatus::Clean);
        assert_eq!(report.record.value.allergies, vec!["penicillin"]);
        assert_eq!(report.candidates.value.diagnosis, "acute bacterial sinusitis");
        assert_eq!(report.evidence.value.valid_drugs, vec!["amoxicillin", "doxycycline"]);
        assert_eq!(report.evidence.value.invalid_drugs, vec!["azithromycin"]);
        assert_eq!(report.evidence.value.links.len(), 1);
        assert_eq!(llm.call_count(), 3);
    }

    #[test]
    fn analyze_without_diagnosis_stops_after_extraction() {
        let llm = Arc::new(ScriptedLlmClient::always(r#"{"name": "Sam Lee"}"#));
        let report = pipeline(llm.clone()).analyze(Uuid::new_v4(), "Sam Lee came in today.");

        assert_eq!(report.candidates.status, StageStatus::Skipped);
        assert_eq!(report.evidence.status, StageStatus::Skipped);
        assert_eq!(llm.call_count(), 1);
    }

    #[test]
    fn report_serializes_stage_status() {
        let llm = Arc::new(ScriptedLlmClient::replies(&[RECORD, CANDIDATES, VERDICT]));
        let report = pipeline(llm).analyze(Uuid::nil(), "text");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["record"]["status"], "clean");
        assert_eq!(json["evidence"]["value"]["diagnosis"], "acute bacterial sinusitis");
    }

    #[test]
    fn filter_runs_on_extracted_context() {
        let llm = Arc::new(ScriptedLlmClient::always(
            r#"{"acceptable_meds": ["doxycycline"], "unacceptable_meds": [{"med": "amoxicillin", "reasons": ["penicillin"]}]}"#,
        ));
        let record = PatientRecord {
            allergies: vec!["penicillin".into()],
            ..Default::default()
        };
        let context = PatientContext::from_record(&record, vec!["amoxicillin".into(), "doxycycline".into()]);
        let outcome = pipeline(llm).filter(Uuid::new_v4(), &context).unwrap();
        assert_eq!(outcome.status, StageStatus::Clean);
    }

    #[test]
    fn research_uses_literature_pool() {
        let llm = Arc::new(ScriptedLlmClient::always("not json"));
        let outcome = pipeline(llm).research(Uuid::new_v4(), "sinusitis");
        assert_eq!(outcome.value.research.len(), 3);
    }

    #[test]
    fn model_name_is_exposed() {
        let llm = Arc::new(ScriptedLlmClient::always("{}"));
        assert_eq!(pipeline(llm).model(), "scripted");
    }

    #[test]
    fn from_config_builds_ollama_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            backend: LlmBackend::Ollama,
            api_key: None,
            model: "llama3.1".into(),
            anthropic_url: crate::config::DEFAULT_ANTHROPIC_URL.into(),
            ollama_url: "http://localhost:11434".into(),
            llm_timeout_secs: 5,
            outdated_meds_path: dir.path().join("missing.json"),
            evidence_policy_path: None,
            pubmed_url: crate::config::DEFAULT_PUBMED_URL.into(),
            literature_timeout_secs: 1,
            filter_max_attempts: 2,
        };
        let pipeline = ClinicalPipeline::from_config(&config).unwrap();
        assert_eq!(pipeline.model(), "llama3.1");
    }

    #[test]
    fn from_config_rejects_malformed_override_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outdated.json");
        std::fs::write(&path, "not json").unwrap();
        let config = AppConfig {
            outdated_meds_path: path,
            ..AppConfig::from_lookup(|k| (k == "ARYA_LLM_BACKEND").then(|| "ollama".to_string())).unwrap()
        };
        assert!(matches!(
            ClinicalPipeline::from_config(&config),
            Err(ConfigError::Malformed { .. })
        ));
    }
}
