//! Evidence validation: (diagnosis, candidates) → valid/invalid partition plus
//! diagnosis-level guideline links.
//!
//! The model classifies under the rules of an [`EvidencePolicy`]; its answer
//! is then reconciled deterministically against the candidate list, the
//! static override table and the link allow-list.

pub mod overrides;
pub mod policy;

pub use overrides::OutdatedMedications;
pub use policy::{DiagnosisRule, EvidencePolicy, LinkPattern, LinkValidator};

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::{Map, Value};

use crate::config::ConfigError;

use super::llm::{CompletionRequest, LlmClient};
use super::outcome::StageOutcome;
use super::repair::{
    complete_with_repair, parse_json_object, require_array, string_items, ContractError,
    GateResult, RepairPlan,
};
use super::types::EvidenceVerdict;

const EVIDENCE_MAX_TOKENS: u32 = 3000;

/// Letters/digits joined by single spaces, hyphens or slashes.
static DRUG_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(?:[ /-][a-z0-9]+)*$").unwrap());

const VERDICT_SCHEMA: &str = r#"{
  "valid_drugs": [],
  "invalid_drugs": [],
  "Links": {
    "<title>": "<URL>"
  }
}"#;

/// Syntactic drug-name screen: lowercased, trimmed, deduplicated.
pub fn screen_candidates(candidates: &[String]) -> Vec<String> {
    let mut screened: Vec<String> = Vec::new();
    for name in candidates.iter().map(|c| c.trim().to_lowercase()) {
        let looks_like_drug =
            DRUG_NAME.is_match(&name) && name.chars().any(|c| c.is_ascii_alphabetic());
        if !looks_like_drug {
            tracing::debug!(len = name.len(), "Candidate failed drug-name screen");
            continue;
        }
        if !screened.contains(&name) {
            screened.push(name);
        }
    }
    screened
}

fn numbered(items: &[String]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(i, rule)| format!("{}. {rule}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build_evidence_prompt(policy: &EvidencePolicy, diagnosis: &str, drugs: &[String]) -> String {
    let drug_json = serde_json::to_string(drugs).unwrap_or_else(|_| "[]".into());

    let mut prompt = format!(
        "You are a medical research assistant.\n\n\
         Your ONLY job is to evaluate MEDICATIONS for the diagnosis: \"{diagnosis}\"\n\
         using CURRENT ({window}) high-quality evidence ONLY.\n\n\
         Allowed sources:\n{sources}\n\n\
         STRICT RULES:\n\
         - Drugs ONLY. No supportive care.\n\
         - Do not add medications that are not in the list.\n\
         - No dosages. No speculation.\n\n\
         Drugs to evaluate:\n{drug_json}\n\n\
         For each drug, decide whether current evidence SUPPORTS its use for the diagnosis:\n\
         supported → \"valid_drugs\", not supported → \"invalid_drugs\".\n\n\
         Also provide links to guideline or review documents about the management of\n\
         the diagnosis as a whole (title → URL). Links must NOT be drug-specific.\n\n\
         GLOBAL CLINICAL SAFETY RULES:\n{safety}\n\n\
         If guidelines conflict, follow this hierarchy: {general}.\n",
        window = policy.evidence_window,
        sources = policy
            .allowed_sources
            .iter()
            .map(|s| format!("- {s}"))
            .collect::<Vec<_>>()
            .join("\n"),
        safety = numbered(&policy.safety_rules),
        general = policy.general_hierarchy.join(" → "),
    );

    if !policy.diagnosis_rules.is_empty() {
        prompt.push_str("\nABSOLUTE DIAGNOSIS-SPECIFIC RULES (CANNOT BE OVERRIDDEN):\n");
        for rule in &policy.diagnosis_rules {
            prompt.push_str(&format!("\n{}:\n{}\n", rule.diagnosis, numbered(&rule.rules)));
        }
        prompt.push_str(&format!(
            "\nFor conflicting diagnosis-specific guidance, follow: {}.\n",
            policy.diagnosis_hierarchy.join(" > ")
        ));
    }

    prompt.push_str(
        "\nLINK RULES:\n\
         - Use ONLY these URL patterns, each pointing to one specific document:\n",
    );
    for pattern in &policy.link_patterns {
        prompt.push_str(&format!("  - {}: {}\n", pattern.source, pattern.template));
    }
    prompt.push_str(
        "- NEVER output directory pages (e.g. /practice-guidelines/, /guidance/, /publications/).\n\
         - If you are unsure of the exact URL, output no link rather than guessing.\n\n",
    );
    prompt.push_str(&format!("Output STRICT JSON ONLY:\n\n{VERDICT_SCHEMA}\n"));
    prompt
}

fn build_evidence_repair_prompt(broken: &str) -> String {
    format!(
        "Fix this into VALID JSON ONLY using this schema:\n\n{VERDICT_SCHEMA}\n\n\
         No explanation. No extra text. Only JSON.\n\nBroken:\n{broken}\n"
    )
}

/// Model classification before reconciliation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawVerdict {
    pub valid: Vec<String>,
    pub invalid: Vec<String>,
    pub links: Vec<(String, String)>,
}

pub fn decode_verdict(raw: &str) -> Result<RawVerdict, ContractError> {
    let object = parse_json_object(raw)?;
    let valid = string_items(require_array(&object, "valid_drugs")?);
    let invalid = string_items(require_array(&object, "invalid_drugs")?);
    Ok(RawVerdict {
        valid,
        invalid,
        links: decode_links(&object),
    })
}

fn decode_links(object: &Map<String, Value>) -> Vec<(String, String)> {
    let links = object.get("Links").or_else(|| object.get("links"));
    match links {
        Some(Value::Object(map)) => map
            .iter()
            .filter_map(|(title, url)| {
                url.as_str()
                    .map(|u| (title.trim().to_string(), u.trim().to_string()))
            })
            .filter(|(title, url)| !title.is_empty() && !url.is_empty())
            .collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(_) => {
            tracing::warn!("Evidence links are not an object, ignoring");
            Vec::new()
        }
    }
}

pub struct EvidenceValidator {
    llm: Arc<dyn LlmClient>,
    policy: EvidencePolicy,
    links: LinkValidator,
    overrides: OutdatedMedications,
}

impl EvidenceValidator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        policy: EvidencePolicy,
        overrides: OutdatedMedications,
    ) -> Result<Self, ConfigError> {
        let links = policy.link_validator()?;
        Ok(Self {
            llm,
            policy,
            links,
            overrides,
        })
    }

    pub fn validate(&self, diagnosis: &str, candidates: &[String]) -> StageOutcome<EvidenceVerdict> {
        let diagnosis = diagnosis.trim().to_lowercase();
        let screened = screen_candidates(candidates);

        if diagnosis.is_empty() && screened.is_empty() {
            return StageOutcome::skipped(
                EvidenceVerdict::default(),
                "no diagnosis and no candidates",
            );
        }

        tracing::debug!(
            candidates = candidates.len(),
            screened = screened.len(),
            policy = %self.policy.version,
            "Validating candidates against evidence"
        );

        let prompt = build_evidence_prompt(&self.policy, &diagnosis, &screened);
        let request = CompletionRequest::new(&prompt, EVIDENCE_MAX_TOKENS);
        let plan = RepairPlan {
            system: None,
            max_tokens: EVIDENCE_MAX_TOKENS,
            prompt: build_evidence_repair_prompt,
        };

        let gate = complete_with_repair(self.llm.as_ref(), "evidence", &request, plan, decode_verdict);
        let outdated = self.overrides.for_diagnosis(&diagnosis);

        match gate {
            GateResult::Clean(raw) => StageOutcome::clean(self.reconcile(
                diagnosis,
                &screened,
                Some(raw),
                outdated,
            )),
            GateResult::Repaired(raw) => StageOutcome::repaired(
                self.reconcile(diagnosis, &screened, Some(raw), outdated),
                "schema repair applied",
            ),
            GateResult::Failed(reason) => StageOutcome::degraded(
                self.reconcile(diagnosis, &screened, None, outdated),
                reason,
            ),
        }
    }

    /// Deterministic post-processing of the model's classification.
    /// `raw` is `None` when the model gave no usable verdict.
    fn reconcile(
        &self,
        diagnosis: String,
        screened: &[String],
        raw: Option<RawVerdict>,
        outdated: &[String],
    ) -> EvidenceVerdict {
        let mut valid: Vec<String> = Vec::new();
        let mut invalid: Vec<String> = Vec::new();
        let mut links = BTreeMap::new();

        if let Some(raw) = raw {
            let mut foreign = 0usize;
            let mut keep = |name: &str, into: &mut Vec<String>| {
                let name = name.trim().to_lowercase();
                if !screened.contains(&name) {
                    foreign += 1;
                } else if !into.contains(&name) {
                    into.push(name);
                }
            };
            for name in &raw.invalid {
                keep(name, &mut invalid);
            }
            for name in &raw.valid {
                keep(name, &mut valid);
            }
            if foreign > 0 {
                tracing::warn!(dropped = foreign, "Model classified drugs outside the candidate list");
            }

            valid.retain(|d| !invalid.contains(d));

            for drug in screened {
                if !valid.contains(drug) && !invalid.contains(drug) {
                    tracing::debug!("Unclassified candidate marked invalid");
                    invalid.push(drug.clone());
                }
            }

            let mut rejected = 0usize;
            for (title, url) in raw.links {
                if self.links.source_for(&url).is_some() {
                    links.insert(title, url);
                } else {
                    rejected += 1;
                }
            }
            if rejected > 0 {
                tracing::warn!(dropped = rejected, "Links outside the allow-list removed");
            }
        }

        for drug in screened.iter().filter(|d| outdated.contains(*d)) {
            valid.retain(|d| d != drug);
            if !invalid.contains(drug) {
                invalid.push(drug.clone());
            }
        }

        EvidenceVerdict {
            diagnosis,
            valid_drugs: valid,
            invalid_drugs: invalid,
            links,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::llm::{LlmError, ScriptedLlmClient};
    use crate::pipeline::outcome::StageStatus;

    const SINUSITIS: &str = "acute bacterial sinusitis";

    fn meds(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn validator(llm: &Arc<ScriptedLlmClient>) -> EvidenceValidator {
        let overrides = OutdatedMedications::from_entries([(
            SINUSITIS,
            vec!["azithromycin", "clarithromycin", "erythromycin"],
        )]);
        EvidenceValidator::new(llm.clone(), EvidencePolicy::default(), overrides).unwrap()
    }

    fn assert_partition(verdict: &EvidenceVerdict, candidates: &[String]) {
        for drug in &verdict.valid_drugs {
            assert!(!verdict.invalid_drugs.contains(drug), "{drug} in both sets");
        }
        for drug in verdict.valid_drugs.iter().chain(&verdict.invalid_drugs) {
            assert!(candidates.contains(drug), "{drug} not a candidate");
        }
    }

    #[test]
    fn screen_accepts_compound_names_and_rejects_prose() {
        let screened = screen_candidates(&meds(&[
            "Amoxicillin-Clavulanate",
            "trimethoprim/sulfamethoxazole",
            "vitamin b12",
            "rest & fluids",
            "123",
            "",
            "amoxicillin-clavulanate",
            "  doxycycline ",
        ]));
        assert_eq!(
            screened,
            meds(&[
                "amoxicillin-clavulanate",
                "trimethoprim/sulfamethoxazole",
                "vitamin b12",
                "doxycycline"
            ])
        );
    }

    #[test]
    fn override_wins_over_model() {
        let llm = Arc::new(ScriptedLlmClient::always(
            r#"{"valid_drugs": ["amoxicillin", "azithromycin"], "invalid_drugs": [], "Links": {}}"#,
        ));
        let candidates = meds(&["amoxicillin", "azithromycin"]);
        let outcome = validator(&llm).validate(SINUSITIS, &candidates);

        assert_eq!(outcome.status, StageStatus::Clean);
        assert_eq!(outcome.value.valid_drugs, meds(&["amoxicillin"]));
        assert_eq!(outcome.value.invalid_drugs, meds(&["azithromycin"]));
        assert_partition(&outcome.value, &candidates);
    }

    #[test]
    fn override_applies_on_degraded_verdict() {
        let llm = Arc::new(ScriptedLlmClient::always("I cannot answer that"));
        let candidates = meds(&["amoxicillin", "azithromycin"]);
        let outcome = validator(&llm).validate(SINUSITIS, &candidates);

        assert!(outcome.is_degraded());
        assert!(outcome.value.valid_drugs.is_empty());
        assert_eq!(outcome.value.invalid_drugs, meds(&["azithromycin"]));
        assert!(outcome.value.links.is_empty());
        assert_eq!(llm.call_count(), 2);
    }

    #[test]
    fn drug_in_both_lists_is_invalid() {
        let llm = Arc::new(ScriptedLlmClient::always(
            r#"{"valid_drugs": ["doxycycline", "cefdinir"], "invalid_drugs": ["Doxycycline"]}"#,
        ));
        let candidates = meds(&["doxycycline", "cefdinir"]);
        let outcome = validator(&llm).validate("otitis media", &candidates);

        assert_eq!(outcome.value.valid_drugs, meds(&["cefdinir"]));
        assert_eq!(outcome.value.invalid_drugs, meds(&["doxycycline"]));
        assert_partition(&outcome.value, &candidates);
    }

    #[test]
    fn invented_drugs_are_dropped_and_unclassified_are_invalid() {
        let llm = Arc::new(ScriptedLlmClient::always(
            r#"{"valid_drugs": ["amoxicillin", "cefpodoxime"], "invalid_drugs": []}"#,
        ));
        let candidates = meds(&["amoxicillin", "prednisone"]);
        let outcome = validator(&llm).validate("otitis media", &candidates);

        assert_eq!(outcome.value.valid_drugs, meds(&["amoxicillin"]));
        assert_eq!(outcome.value.invalid_drugs, meds(&["prednisone"]));
        assert_partition(&outcome.value, &candidates);
    }

    #[test]
    fn links_are_filtered_by_allow_list() {
        let llm = Arc::new(ScriptedLlmClient::always(
            r#"{"valid_drugs": [], "invalid_drugs": [], "links": {
                "IDSA Rhinosinusitis Guideline": "https://www.idsociety.org/practice-guidelines/rhinosinusitis-in-adults/",
                "NICE index": "https://www.nice.org.uk/guidance/",
                "Blog": "https://example.com/sinus"
            }}"#,
        ));
        let outcome = validator(&llm).validate(SINUSITIS, &meds(&["amoxicillin"]));

        assert_eq!(outcome.value.links.len(), 1);
        assert!(outcome.value.links.contains_key("IDSA Rhinosinusitis Guideline"));
    }

    #[test]
    fn capitalized_links_key_is_accepted() {
        let raw = decode_verdict(
            r#"{"valid_drugs": [], "invalid_drugs": [], "Links": {"NICE": "https://www.nice.org.uk/guidance/ng79"}}"#,
        )
        .unwrap();
        assert_eq!(raw.links.len(), 1);
    }

    #[test]
    fn missing_lists_trigger_repair() {
        let llm = Arc::new(ScriptedLlmClient::replies(&[
            r#"{"valid": ["amoxicillin"]}"#,
            r#"{"valid_drugs": ["amoxicillin"], "invalid_drugs": []}"#,
        ]));
        let outcome = validator(&llm).validate(SINUSITIS, &meds(&["amoxicillin"]));

        assert_eq!(outcome.status, StageStatus::Repaired);
        assert_eq!(outcome.value.valid_drugs, meds(&["amoxicillin"]));
        let calls = llm.calls();
        assert!(calls[1].prompt.contains("\"invalid_drugs\": []"));
        assert!(calls[1].prompt.contains("{\"valid\": [\"amoxicillin\"]}"));
    }

    #[test]
    fn blank_diagnosis_without_candidates_is_skipped() {
        let llm = Arc::new(ScriptedLlmClient::always("{}"));
        let outcome = validator(&llm).validate("  ", &meds(&["rest & fluids"]));
        assert_eq!(outcome.status, StageStatus::Skipped);
        assert_eq!(outcome.value, EvidenceVerdict::default());
        assert_eq!(llm.call_count(), 0);
    }

    #[test]
    fn prompt_renders_policy() {
        let llm = Arc::new(ScriptedLlmClient::always(
            r#"{"valid_drugs": [], "invalid_drugs": []}"#,
        ));
        validator(&llm).validate("Acute Bacterial Sinusitis", &meds(&["Amoxicillin", "rest"]));

        let calls = llm.calls();
        let prompt = &calls[0].prompt;
        assert!(prompt.contains("\"acute bacterial sinusitis\""));
        assert!(prompt.contains("[\"amoxicillin\",\"rest\"]"));
        assert!(prompt.contains("CDC → IDSA → NICE → WHO → Cochrane → AAFP → AAP → meta-analyses"));
        assert!(prompt.contains("IDSA > NICE > CDC > Cochrane"));
        assert!(prompt.contains("https://www.nice.org.uk/guidance/<code>"));
        assert!(prompt.contains("2022-2025"));
        assert_eq!(calls[0].max_tokens, 3000);
    }

    #[test]
    fn model_error_is_degraded_with_overrides() {
        let llm = Arc::new(ScriptedLlmClient::failing(LlmError::EmptyCompletion));
        let candidates = meds(&["clarithromycin", "amoxicillin"]);
        let outcome = validator(&llm).validate(SINUSITIS, &candidates);

        assert!(outcome.is_degraded());
        assert_eq!(outcome.value.invalid_drugs, meds(&["clarithromycin"]));
        assert_eq!(llm.call_count(), 1);
    }

    #[test]
    fn every_candidate_is_classified_on_clean_verdict() {
        let llm = Arc::new(ScriptedLlmClient::always(
            r#"{"valid_drugs": ["amoxicillin"], "invalid_drugs": ["azithromycin"]}"#,
        ));
        let candidates = meds(&["amoxicillin", "azithromycin", "doxycycline", "cefuroxime"]);
        let verdict = validator(&llm).validate(SINUSITIS, &candidates).value;

        let mut all: Vec<String> = verdict
            .valid_drugs
            .iter()
            .chain(&verdict.invalid_drugs)
            .cloned()
            .collect();
        all.sort();
        let mut expected = candidates.clone();
        expected.sort();
        assert_eq!(all, expected);
        assert_partition(&verdict, &candidates);
    }
}
