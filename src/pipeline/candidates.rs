// Candidate generation: diagnosis → short list of generic drug names.
// Breadth over precision; the evidence validator decides what survives.

use std::sync::Arc;

use super::llm::{CompletionRequest, LlmClient};
use super::outcome::StageOutcome;
use super::repair::{
    complete_with_repair, parse_json_object, require_array, ContractError, GateResult, RepairPlan,
};
use super::types::{CandidateSet, PatientRecord};

const CANDIDATES_MAX_TOKENS: u32 = 1000;
pub const MIN_CANDIDATES: usize = 3;
pub const MAX_CANDIDATES: usize = 10;

pub const CANDIDATES_PROMPT: &str = r#"
Given the structured patient data below, list reasonable medication
candidates for the patient's diagnosis.

Output STRICT JSON ONLY:

{
  "diagnosis": "<diagnosis>",
  "candidate_treatments": ["drug1", "drug2", ...]
}

RULES FOR candidate_treatments:
1. 3 to 10 items.
2. Generic drug names only, never brand names.
3. Lowercase strings only.
4. Actual medications only: no supportive care, no lifestyle advice.
5. Drugs that might be considered for the diagnosis are allowed, but do not
   add medications that are clearly irrelevant or incorrect.
"#;

fn build_candidates_prompt(record: &PatientRecord) -> String {
    let patient_json = serde_json::to_string_pretty(record).unwrap_or_else(|_| "{}".to_string());
    format!(
        "{CANDIDATES_PROMPT}\n<patient_data>\n{patient_json}\n</patient_data>\n\n\
         Now output ONLY the JSON described above."
    )
}

fn build_candidates_repair_prompt(diagnosis: &str, broken: &str) -> String {
    let schema = serde_json::json!({
        "diagnosis": diagnosis,
        "candidate_treatments": ["drug1", "drug2"],
    });
    format!(
        "Fix this into valid JSON ONLY:\n\n{broken}\n\nCorrect schema:\n\n{}\n",
        serde_json::to_string_pretty(&schema).unwrap_or_default()
    )
}

pub struct CandidateGenerator {
    llm: Arc<dyn LlmClient>,
}

impl CandidateGenerator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub fn generate(&self, record: &PatientRecord) -> StageOutcome<CandidateSet> {
        let diagnosis = record.diagnosis.trim().to_lowercase();
        if diagnosis.is_empty() {
            return StageOutcome::skipped(CandidateSet::empty(""), "no diagnosis");
        }

        let prompt = build_candidates_prompt(record);
        let request = CompletionRequest::new(&prompt, CANDIDATES_MAX_TOKENS);
        let plan = RepairPlan {
            system: None,
            max_tokens: CANDIDATES_MAX_TOKENS,
            prompt: |broken: &str| build_candidates_repair_prompt(&diagnosis, broken),
        };

        let gate = complete_with_repair(self.llm.as_ref(), "candidates", &request, plan, |raw| {
            decode_candidates(raw)
        });

        let (treatments, repaired) = match gate {
            GateResult::Clean(list) => (list, false),
            GateResult::Repaired(list) => (list, true),
            GateResult::Failed(reason) => {
                return StageOutcome::degraded(CandidateSet::empty(diagnosis), reason);
            }
        };

        if treatments.len() < MIN_CANDIDATES {
            tracing::warn!(
                count = treatments.len(),
                min = MIN_CANDIDATES,
                "Fewer candidates than requested"
            );
        }

        let set = CandidateSet {
            diagnosis,
            candidate_treatments: treatments,
        };
        if repaired {
            StageOutcome::repaired(set, "schema repair applied")
        } else {
            StageOutcome::clean(set)
        }
    }
}

/// Lowercased, deduplicated candidate names, at most `MAX_CANDIDATES`.
pub fn decode_candidates(raw: &str) -> Result<Vec<String>, ContractError> {
    let object = parse_json_object(raw)?;
    let items = require_array(&object, "candidate_treatments")?;

    let mut names: Vec<String> = Vec::new();
    for name in items
        .iter()
        .filter_map(|v| v.as_str())
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
    {
        if !names.contains(&name) {
            names.push(name);
        }
        if names.len() == MAX_CANDIDATES {
            break;
        }
    }
    Ok(names)
}
