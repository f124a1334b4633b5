//! Free text → structured patient record.

use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use serde_json::{Map, Value};

use super::llm::{CompletionRequest, LlmClient};
use super::outcome::StageOutcome;
use super::repair::{complete_with_repair, parse_json_object, ContractError, GateResult, RepairPlan};
use super::sanitize::sanitize_patient_text;
use super::types::{PatientRecord, Sex};

const EXTRACTION_MAX_TOKENS: u32 = 1000;
const MAX_PLAUSIBLE_AGE: u64 = 150;

const RECORD_SCHEMA: &str = r#"{
  "name": "",
  "dob": "",
  "age": null,
  "sex": "",
  "pregnant": false,
  "allergies": [],
  "conditions": [],
  "diagnosis": ""
}"#;

pub const EXTRACTION_PROMPT: &str = r#"
You convert unstructured clinical text about ONE patient into STRICT JSON
with EXACTLY these keys:

{schema}

RULES:
1. Extract ONLY information explicitly stated in the text. Never guess.
2. sex is one of "male", "female", "other", or "" when not stated.
3. allergies: lowercase strings, no duplicates.
4. diagnosis: a short, clean clinical phrase, or "" when none is stated.
5. dob only when a date of birth is written in the text, formatted YYYY-MM-DD.
6. If dob is missing but an age is stated, fill age and leave dob "".
7. If both dob and age are missing, age is null.
8. pregnant is true only when the text says the patient is pregnant.
9. Output the JSON object ONLY. No comments, no explanations.
"#;

pub fn build_extraction_prompt(patient_text: &str) -> String {
    format!(
        "{}\n<patient_text>\n{patient_text}\n</patient_text>\n\nOutput JSON:",
        EXTRACTION_PROMPT.replace("{schema}", RECORD_SCHEMA)
    )
}

fn build_extraction_repair_prompt(broken: &str) -> String {
    format!(
        "Fix the following into valid JSON ONLY, matching EXACTLY this schema:\n\n\
         {RECORD_SCHEMA}\n\nNo explanation. JSON only.\n\nBroken JSON:\n{broken}\n"
    )
}

/// Turns patient text into a `PatientRecord`. Never fails: on unusable model
/// output the all-empty record is returned with a degraded status.
pub struct Extractor {
    llm: Arc<dyn LlmClient>,
}

impl Extractor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub fn extract(&self, text: &str) -> StageOutcome<PatientRecord> {
        self.extract_on(text, chrono::Local::now().date_naive())
    }

    /// Extract with an explicit "today", used for age derivation.
    pub fn extract_on(&self, text: &str, today: NaiveDate) -> StageOutcome<PatientRecord> {
        let sanitized = sanitize_patient_text(text);
        if sanitized.text.trim().is_empty() {
            return StageOutcome::skipped(PatientRecord::default(), "no patient text");
        }

        tracing::debug!(chars = sanitized.text.chars().count(), "Extracting patient record");

        let prompt = build_extraction_prompt(&sanitized.text);
        let request = CompletionRequest::new(&prompt, EXTRACTION_MAX_TOKENS);
        let plan = RepairPlan {
            system: None,
            max_tokens: EXTRACTION_MAX_TOKENS,
            prompt: build_extraction_repair_prompt,
        };

        match complete_with_repair(self.llm.as_ref(), "extractor", &request, plan, |raw| {
            decode_patient_record(raw, today)
        }) {
            GateResult::Clean(record) => StageOutcome::clean(record),
            GateResult::Repaired(record) => StageOutcome::repaired(record, "schema repair applied"),
            GateResult::Failed(reason) => StageOutcome::degraded(PatientRecord::default(), reason),
        }
    }
}

/// Decode and normalize a model response into a `PatientRecord`.
///
/// Any JSON object is accepted; each field is normalized on its own and
/// unusable values collapse to the empty sentinel.
pub fn decode_patient_record(raw: &str, today: NaiveDate) -> Result<PatientRecord, ContractError> {
    let object = parse_json_object(raw)?;
    Ok(normalize_record(&object, today))
}

fn normalize_record(object: &Map<String, Value>, today: NaiveDate) -> PatientRecord {
    let dob = object
        .get("dob")
        .and_then(Value::as_str)
        .and_then(|s| parse_iso_date(s, today));

    let age = match dob {
        Some(date) => years_between(date, today),
        None => object.get("age").and_then(parse_age),
    };

    PatientRecord {
        name: text_field(object, "name"),
        dob: dob.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default(),
        age,
        sex: object
            .get("sex")
            .and_then(Value::as_str)
            .map(Sex::from_free_text)
            .unwrap_or_default(),
        pregnant: object.get("pregnant").map(parse_flag).unwrap_or(false),
        allergies: dedupe(list_field(object, "allergies").into_iter().map(|a| a.to_lowercase())),
        conditions: dedupe(list_field(object, "conditions")),
        diagnosis: text_field(object, "diagnosis"),
    }
}

fn text_field(object: &Map<String, Value>, key: &str) -> String {
    object
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Arrays of strings, or a single comma-separated string.
fn list_field(object: &Map<String, Value>, key: &str) -> Vec<String> {
    match object.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn dedupe(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// Strict `YYYY-MM-DD`, not in the future.
fn parse_iso_date(raw: &str, today: NaiveDate) -> Option<NaiveDate> {
    let raw = raw.trim();
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    if date.format("%Y-%m-%d").to_string() != raw || date > today {
        return None;
    }
    Some(date)
}

fn years_between(dob: NaiveDate, today: NaiveDate) -> Option<u32> {
    let mut years = today.year() - dob.year();
    if (today.month(), today.day()) < (dob.month(), dob.day()) {
        years -= 1;
    }
    u32::try_from(years).ok()
}

fn parse_age(value: &Value) -> Option<u32> {
    let age = match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }?;
    if age > MAX_PLAUSIBLE_AGE {
        return None;
    }
    u32::try_from(age).ok()
}

fn parse_flag(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "yes" | "y"),
        _ => false,
    }
}
