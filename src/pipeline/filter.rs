//! Closed-world medication filter.
//!
//! The model partitions `suggested_meds` into acceptable and unacceptable
//! using only literal matches against the patient context. A response is
//! accepted only when the partition reproduces the input set exactly; anything
//! else is discarded and the request re-issued, up to `max_attempts` times.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use super::llm::{CompletionRequest, LlmClient};
use super::outcome::StageOutcome;
use super::repair::{parse_json_object, repair_response, require_array, ContractError, GateResult, RepairPlan};
use super::types::{FilterVerdict, PatientContext, UnacceptableMed};

const FILTER_MAX_TOKENS: u32 = 2000;
const FILTER_REPAIR_MAX_TOKENS: u32 = 1000;
pub const DEFAULT_FILTER_MAX_ATTEMPTS: u32 = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("Model did not return an exact partition of the medication list after {attempts} attempts: {last}")]
    AttemptsExhausted { attempts: u32, last: String },
}

pub const FILTER_SYSTEM_PROMPT: &str = r#"
You DO NOT have medical knowledge.
You MUST NOT generate new content.
You MUST NOT invent or modify any medication names.

You operate under the following NON-NEGOTIABLE LAWS:

1. CLOSED-WORLD RULE:
   All medication names MUST come exclusively from patient_json["suggested_meds"].
   Do not add, remove, merge, split, paraphrase, or change capitalization.

2. EXACT-SET RULE:
   The union of acceptable_meds and unacceptable_meds[*].med MUST match EXACTLY
   the input set of suggested_meds, no more and no less.

3. IMMUTABILITY RULE:
   Medication names must appear as EXACT string copies of the input.
   No punctuation changes, no normalization.

4. DETERMINISM RULE:
   The same input must always produce the same output.

5. JSON-ONLY RULE:
   Output MUST be valid JSON, no text outside JSON.
"#;

const FILTER_REPAIR_SYSTEM: &str = "Return ONLY valid JSON.";

pub const FILTER_PROMPT: &str = r#"
Classify each medication from "suggested_meds" using ONLY these fields of the
patient JSON: allergies, conditions, pregnant, age, diagnosis.

Rules:
1. DO NOT add, remove, or rename any medications.
2. Only use exact, literal string matches against the fields above.
   No inference. No synonyms. No medical reasoning.
3. Every medication must appear EXACTLY ONCE in the output.
4. If no conflict exists in the JSON, classify the medication as acceptable.
5. Reasons for unacceptable medications must quote the matching field value.
"#;

const FILTER_SCHEMA: &str = r#"{
  "acceptable_meds": ["med1"],
  "unacceptable_meds": [
    {"med": "medX", "reasons": ["reason1"]}
  ]
}"#;

fn build_filter_prompt(context: &PatientContext) -> String {
    let patient_json = serde_json::to_string_pretty(context).unwrap_or_else(|_| "{}".into());
    format!(
        "{FILTER_PROMPT}\nPatient JSON:\n{patient_json}\n\nOutput JSON must be:\n\n{FILTER_SCHEMA}\n\nReturn ONLY JSON."
    )
}

fn build_filter_repair_prompt(broken: &str) -> String {
    format!("Output valid JSON only, matching this schema:\n\n{FILTER_SCHEMA}\n\nFix this:\n\n{broken}\n")
}

pub struct ClosedWorldFilter {
    llm: Arc<dyn LlmClient>,
    max_attempts: u32,
}

impl ClosedWorldFilter {
    pub fn new(llm: Arc<dyn LlmClient>, max_attempts: u32) -> Self {
        Self {
            llm,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Partition `context.suggested_meds`. Returns an error only when every
    /// attempt produced something other than an exact partition.
    pub fn filter(&self, context: &PatientContext) -> Result<StageOutcome<FilterVerdict>, FilterError> {
        if context.suggested_meds.is_empty() {
            return Ok(StageOutcome::skipped(FilterVerdict::default(), "no medications to filter"));
        }

        let prompt = build_filter_prompt(context);
        let request = CompletionRequest::new(&prompt, FILTER_MAX_TOKENS).with_system(FILTER_SYSTEM_PROMPT);
        let mut last = String::from("no attempt made");

        for attempt in 1..=self.max_attempts {
            let raw = match self.llm.complete(&request) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Filter model call failed");
                    last = format!("model call failed: {e}");
                    continue;
                }
            };

            let plan = RepairPlan {
                system: Some(FILTER_REPAIR_SYSTEM),
                max_tokens: FILTER_REPAIR_MAX_TOKENS,
                prompt: build_filter_repair_prompt,
            };
            let (verdict, repaired) =
                match repair_response(self.llm.as_ref(), "filter", &raw, plan, decode_filter_verdict) {
                    GateResult::Clean(v) => (v, false),
                    GateResult::Repaired(v) => (v, true),
                    GateResult::Failed(reason) => {
                        last = reason;
                        continue;
                    }
                };

            if let Err(reason) = check_partition(&verdict, &context.suggested_meds) {
                tracing::warn!(attempt, reason = %reason, "Filter output violates the closed-world set");
                last = reason;
                continue;
            }

            tracing::info!(
                attempt,
                acceptable = verdict.acceptable_meds.len(),
                unacceptable = verdict.unacceptable_meds.len(),
                "Filter verdict accepted"
            );
            return Ok(if attempt == 1 && !repaired {
                StageOutcome::clean(verdict)
            } else {
                StageOutcome::repaired(verdict, format!("accepted on attempt {attempt}"))
            });
        }

        tracing::error!(attempts = self.max_attempts, "Filter attempts exhausted");
        Err(FilterError::AttemptsExhausted {
            attempts: self.max_attempts,
            last,
        })
    }
}

/// Decode a filter response. Medication names are kept byte-for-byte;
/// duplicates within a list are collapsed and reasons stringified.
pub fn decode_filter_verdict(raw: &str) -> Result<FilterVerdict, ContractError> {
    let object = parse_json_object(raw)?;

    let mut acceptable: Vec<String> = Vec::new();
    for med in require_array(&object, "acceptable_meds")?.iter().filter_map(Value::as_str) {
        if !acceptable.iter().any(|m| m == med) {
            acceptable.push(med.to_string());
        }
    }

    let mut unacceptable: Vec<UnacceptableMed> = Vec::new();
    for item in require_array(&object, "unacceptable_meds")? {
        let Some(med) = item.get("med").and_then(Value::as_str) else {
            continue;
        };
        let reasons = item.get("reasons").map(stringify_reasons).unwrap_or_default();

        match unacceptable.iter_mut().find(|u| u.med == med) {
            Some(existing) => {
                for reason in reasons {
                    if !existing.reasons.contains(&reason) {
                        existing.reasons.push(reason);
                    }
                }
            }
            None => unacceptable.push(UnacceptableMed {
                med: med.to_string(),
                reasons,
            }),
        }
    }

    Ok(FilterVerdict {
        acceptable_meds: acceptable,
        unacceptable_meds: unacceptable,
    })
}

fn stringify_reasons(value: &Value) -> Vec<String> {
    let items: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        Value::Null => Vec::new(),
        other => vec![other],
    };
    items
        .into_iter()
        .map(|v| match v {
            Value::String(s) => s.trim().to_string(),
            other => other.to_string().trim().to_string(),
        })
        .filter(|s| !s.is_empty())
        .collect()
}

/// Exact set equality between the verdict and `input`, with no med in both lists.
pub fn check_partition(verdict: &FilterVerdict, input: &[String]) -> Result<(), String> {
    let acceptable: BTreeSet<&str> = verdict.acceptable_meds.iter().map(String::as_str).collect();
    let unacceptable: BTreeSet<&str> = verdict.unacceptable_meds.iter().map(|u| u.med.as_str()).collect();

    let overlap = acceptable.intersection(&unacceptable).count();
    if overlap > 0 {
        return Err(format!("{overlap} medication(s) classified both ways"));
    }

    let output: BTreeSet<&str> = acceptable.union(&unacceptable).copied().collect();
    let expected: BTreeSet<&str> = input.iter().map(String::as_str).collect();
    if output != expected {
        let missing = expected.difference(&output).count();
        let extra = output.difference(&expected).count();
        return Err(format!("{missing} medication(s) missing, {extra} not in the input"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::llm::{LlmError, ScriptedLlmClient};
    use crate::pipeline::outcome::StageStatus;

    fn context(meds: &[&str]) -> PatientContext {
        PatientContext {
            allergies: vec!["penicillin".into()],
            conditions: vec!["asthma".into()],
            pregnant: false,
            age: Some(34),
            diagnosis: "acute bacterial sinusitis".into(),
            suggested_meds: meds.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn filter(llm: &Arc<ScriptedLlmClient>, attempts: u32) -> ClosedWorldFilter {
        ClosedWorldFilter::new(llm.clone(), attempts)
    }

    fn assert_exact_partition(verdict: &FilterVerdict, input: &[String]) {
        let mut out: Vec<&String> = verdict
            .acceptable_meds
            .iter()
            .chain(verdict.unacceptable_meds.iter().map(|u| &u.med))
            .collect();
        out.sort();
        out.dedup();
        let mut expected: Vec<&String> = input.iter().collect();
        expected.sort();
        expected.dedup();
        assert_eq!(out, expected);
    }

    const EXACT: &str = r#"{
      "acceptable_meds": ["doxycycline"],
      "unacceptable_meds": [{"med": "Amoxicillin-Clavulanate", "reasons": [" allergy: penicillin ", 3]}]
    }"#;

    #[test]
    fn exact_partition_is_accepted_first_time() {
        let llm = Arc::new(ScriptedLlmClient::always(EXACT));
        let ctx = context(&["Amoxicillin-Clavulanate", "doxycycline"]);
        let outcome = filter(&llm, 5).filter(&ctx).unwrap();

        assert_eq!(outcome.status, StageStatus::Clean);
        assert_eq!(outcome.value.acceptable_meds, vec!["doxycycline"]);
        assert_eq!(
            outcome.value.unacceptable_meds[0].reasons,
            vec!["allergy: penicillin", "3"]
        );
        assert_exact_partition(&outcome.value, &ctx.suggested_meds);
        assert_eq!(llm.call_count(), 1);
    }

    #[test]
    fn request_uses_closed_world_system_prompt() {
        let llm = Arc::new(ScriptedLlmClient::always(EXACT));
        filter(&llm, 5)
            .filter(&context(&["Amoxicillin-Clavulanate", "doxycycline"]))
            .unwrap();

        let calls = llm.calls();
        assert!(calls[0].system.as_deref().unwrap().contains("CLOSED-WORLD RULE"));
        assert!(calls[0].prompt.contains("\"suggested_meds\""));
        assert!(calls[0].prompt.contains("Amoxicillin-Clavulanate"));
        assert_eq!(calls[0].max_tokens, 2000);
    }

    #[test]
    fn renamed_med_is_rejected_and_retried() {
        let llm = Arc::new(ScriptedLlmClient::replies(&[
            r#"{"acceptable_meds": ["amoxicillin-clavulanate", "doxycycline"], "unacceptable_meds": []}"#,
            EXACT,
        ]));
        let ctx = context(&["Amoxicillin-Clavulanate", "doxycycline"]);
        let outcome = filter(&llm, 5).filter(&ctx).unwrap();

        assert_eq!(outcome.status, StageStatus::Repaired);
        assert_eq!(outcome.detail.as_deref(), Some("accepted on attempt 2"));
        assert_exact_partition(&outcome.value, &ctx.suggested_meds);
        assert_eq!(llm.call_count(), 2);
    }

    #[test]
    fn dropped_med_is_rejected() {
        let verdict = decode_filter_verdict(r#"{"acceptable_meds": ["a"], "unacceptable_meds": []}"#).unwrap();
        let input = vec!["a".to_string(), "b".to_string()];
        assert!(check_partition(&verdict, &input).is_err());
    }

    #[test]
    fn med_in_both_lists_is_rejected() {
        let verdict = decode_filter_verdict(
            r#"{"acceptable_meds": ["a", "b"], "unacceptable_meds": [{"med": "b", "reasons": []}]}"#,
        )
        .unwrap();
        let input = vec!["a".to_string(), "b".to_string()];
        let err = check_partition(&verdict, &input).unwrap_err();
        assert!(err.contains("both ways"));
    }

    #[test]
    fn duplicates_within_a_list_are_collapsed() {
        let verdict = decode_filter_verdict(
            r#"{"acceptable_meds": ["a", "a"],
                "unacceptable_meds": [{"med": "b", "reasons": ["x"]}, {"med": "b", "reasons": ["y", "x"]}]}"#,
        )
        .unwrap();
        assert_eq!(verdict.acceptable_meds, vec!["a"]);
        assert_eq!(verdict.unacceptable_meds.len(), 1);
        assert_eq!(verdict.unacceptable_meds[0].reasons, vec!["x", "y"]);
    }

    #[test]
    fn names_are_not_trimmed() {
        let verdict =
            decode_filter_verdict(r#"{"acceptable_meds": [" a"], "unacceptable_meds": []}"#).unwrap();
        assert!(check_partition(&verdict, &["a".to_string()]).is_err());
    }

    #[test]
    fn malformed_response_is_repaired_within_attempt() {
        let llm = Arc::new(ScriptedLlmClient::replies(&["acceptable: doxycycline", EXACT]));
        let ctx = context(&["Amoxicillin-Clavulanate", "doxycycline"]);
        let outcome = filter(&llm, 5).filter(&ctx).unwrap();

        assert_eq!(outcome.status, StageStatus::Repaired);
        assert_eq!(outcome.detail.as_deref(), Some("accepted on attempt 1"));
        let calls = llm.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].system.as_deref(), Some("Return ONLY valid JSON."));
        assert_eq!(calls[1].max_tokens, 1000);
    }

    #[test]
    fn noncompliant_model_exhausts_attempts() {
        let llm = Arc::new(ScriptedLlmClient::always(
            r#"{"acceptable_meds": ["ibuprofen"], "unacceptable_meds": []}"#,
        ));
        let result = filter(&llm, 3).filter(&context(&["doxycycline"]));

        match result {
            Err(FilterError::AttemptsExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(llm.call_count(), 3);
    }

    #[test]
    fn unparseable_output_uses_one_repair_per_attempt() {
        let llm = Arc::new(ScriptedLlmClient::always("not json"));
        let result = filter(&llm, 2).filter(&context(&["doxycycline"]));
        assert!(matches!(result, Err(FilterError::AttemptsExhausted { attempts: 2, .. })));
        assert_eq!(llm.call_count(), 4);
    }

    #[test]
    fn model_errors_consume_attempts() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            Err(LlmError::Timeout(120)),
            Ok(r#"{"acceptable_meds": ["doxycycline"], "unacceptable_meds": []}"#.to_string()),
        ]));
        let outcome = filter(&llm, 5).filter(&context(&["doxycycline"])).unwrap();
        assert_eq!(outcome.detail.as_deref(), Some("accepted on attempt 2"));
    }

    #[test]
    fn empty_med_list_is_skipped() {
        let llm = Arc::new(ScriptedLlmClient::always(EXACT));
        let outcome = filter(&llm, 5).filter(&context(&[])).unwrap();
        assert_eq!(outcome.status, StageStatus::Skipped);
        assert_eq!(outcome.value, FilterVerdict::default());
        assert_eq!(llm.call_count(), 0);
    }

    #[test]
    fn zero_attempts_is_raised_to_one() {
        let llm = Arc::new(ScriptedLlmClient::always(EXACT));
        assert_eq!(filter(&llm, 0).max_attempts(), 1);
    }

    #[test]
    fn accepted_verdicts_always_partition_input() {
        let fixtures: &[(&[&str], &str)] = &[
            (&["a"], r#"{"acceptable_meds": ["a"], "unacceptable_meds": []}"#),
            (&["a", "b"], r#"{"acceptable_meds": [], "unacceptable_meds": [{"med": "a"}, {"med": "b", "reasons": "pregnant"}]}"#),
            (&["a", "a", "B"], r#"{"acceptable_meds": ["B", "a"], "unacceptable_meds": []}"#),
        ];
        for (meds, response) in fixtures {
            let llm = Arc::new(ScriptedLlmClient::always(response));
            let ctx = context(meds);
            let outcome = filter(&llm, 1).filter(&ctx).unwrap();
            assert_exact_partition(&outcome.value, &ctx.suggested_meds);
        }
    }
}
