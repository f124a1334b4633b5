use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Canonical sex token. `Unknown` serializes as the empty string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Male,
    Female,
    Other,
    #[default]
    #[serde(rename = "")]
    Unknown,
}

impl Sex {
    /// Map free-form model output onto the canonical tokens.
    pub fn from_free_text(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "male" | "m" | "man" | "boy" => Sex::Male,
            "female" | "f" | "woman" | "girl" => Sex::Female,
            "other" | "non-binary" | "nonbinary" | "intersex" | "x" => Sex::Other,
            _ => Sex::Unknown,
        }
    }
}

/// Structured patient record produced by the extractor.
///
/// Always serializes to exactly eight keys; `age` is `null` when unknown.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PatientRecord {
    pub name: String,
    /// `YYYY-MM-DD` or empty.
    pub dob: String,
    pub age: Option<u32>,
    pub sex: Sex,
    pub pregnant: bool,
    /// Lowercase, deduplicated.
    pub allergies: Vec<String>,
    pub conditions: Vec<String>,
    pub diagnosis: String,
}

/// Diagnosis plus candidate generic drug names.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CandidateSet {
    pub diagnosis: String,
    pub candidate_treatments: Vec<String>,
}

impl CandidateSet {
    pub fn empty(diagnosis: impl Into<String>) -> Self {
        Self {
            diagnosis: diagnosis.into(),
            candidate_treatments: Vec::new(),
        }
    }
}

/// Evidence verdict over a candidate set. `links` maps citation title to URL
/// and is diagnosis-level only.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EvidenceVerdict {
    pub diagnosis: String,
    pub valid_drugs: Vec<String>,
    pub invalid_drugs: Vec<String>,
    pub links: BTreeMap<String, String>,
}

/// The only fields the closed-world filter may look at.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PatientContext {
    #[serde(default)]
    pub allergies: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default)]
    pub pregnant: bool,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub diagnosis: String,
    #[serde(default)]
    pub suggested_meds: Vec<String>,
}

impl PatientContext {
    /// Carry the medication list over verbatim; it is never regenerated.
    pub fn from_record(record: &PatientRecord, suggested_meds: Vec<String>) -> Self {
        Self {
            allergies: record.allergies.clone(),
            conditions: record.conditions.clone(),
            pregnant: record.pregnant,
            age: record.age,
            diagnosis: record.diagnosis.clone(),
            suggested_meds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnacceptableMed {
    pub med: String,
    pub reasons: Vec<String>,
}

/// Exact partition of the input `suggested_meds`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FilterVerdict {
    pub acceptable_meds: Vec<String>,
    pub unacceptable_meds: Vec<UnacceptableMed>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchItem {
    pub title: String,
    pub url: String,
}

/// Literature entries drawn only from the fetched pool.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResearchDigest {
    pub diagnosis: String,
    pub research: Vec<ResearchItem>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_record_has_eight_keys() {
        let json = serde_json::to_value(PatientRecord::default()).unwrap();
        let object = json.as_object().unwrap();
        assert_eq!(object.len(), 8);
        assert_eq!(json["age"], serde_json::Value::Null);
        assert_eq!(json["sex"], "");
        assert_eq!(json["pregnant"], false);
    }

    #[test]
    fn sex_tokens_round_trip() {
        assert_eq!(serde_json::to_string(&Sex::Female).unwrap(), "\"female\"");
        let parsed: Sex = serde_json::from_str("\"\"").unwrap();
        assert_eq!(parsed, Sex::Unknown);
    }

    #[test]
    fn sex_from_free_text() {
        assert_eq!(Sex::from_free_text(" Woman "), Sex::Female);
        assert_eq!(Sex::from_free_text("M"), Sex::Male);
        assert_eq!(Sex::from_free_text("non-binary"), Sex::Other);
        assert_eq!(Sex::from_free_text("unknown"), Sex::Unknown);
    }

    #[test]
    fn context_carries_meds_verbatim() {
        let record = PatientRecord {
            allergies: vec!["penicillin".into()],
            diagnosis: "acute bacterial sinusitis".into(),
            age: Some(34),
            ..Default::default()
        };
        let meds = vec!["Amoxicillin ".to_string(), "doxycycline".to_string()];
        let ctx = PatientContext::from_record(&record, meds.clone());
        assert_eq!(ctx.suggested_meds, meds);
        assert_eq!(ctx.allergies, vec!["penicillin"]);
        assert_eq!(ctx.age, Some(34));
    }

    #[test]
    fn context_deserializes_with_missing_fields() {
        let ctx: PatientContext =
            serde_json::from_str(r#"{"suggested_meds": ["ibuprofen"]}"#).unwrap();
        assert_eq!(ctx.suggested_meds, vec!["ibuprofen"]);
        assert!(!ctx.pregnant);
        assert!(ctx.age.is_none());
    }
}
