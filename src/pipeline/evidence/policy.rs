//! Evidence policy: the versioned rule document rendered into the evidence
//! prompt, plus the link allow-list used to screen citations afterwards.
//!
//! The built-in default ships identically as `static/evidence_policy.json`;
//! deployments can point `ARYA_EVIDENCE_POLICY` at an edited copy.

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Classification rules that apply to one diagnosis only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosisRule {
    pub diagnosis: String,
    pub rules: Vec<String>,
}

/// An accepted citation URL shape for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPattern {
    pub source: String,
    /// Human-readable template shown to the model.
    pub template: String,
    /// Anchored regex the returned URL must match.
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidencePolicy {
    pub version: String,
    pub evidence_window: String,
    pub allowed_sources: Vec<String>,
    /// Tie-break order when guidelines conflict, most authoritative first.
    pub general_hierarchy: Vec<String>,
    /// Tie-break order for diagnosis-specific classification rules.
    pub diagnosis_hierarchy: Vec<String>,
    pub safety_rules: Vec<String>,
    pub diagnosis_rules: Vec<DiagnosisRule>,
    pub link_patterns: Vec<LinkPattern>,
}

impl EvidencePolicy {
    /// Read a policy document from disk and check that its link patterns compile.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let policy: EvidencePolicy =
            serde_json::from_str(&raw).map_err(|e| ConfigError::Malformed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        if policy.version.trim().is_empty() {
            return Err(ConfigError::Malformed {
                path: path.to_path_buf(),
                reason: "policy version is empty".into(),
            });
        }
        policy.link_validator()?;

        tracing::info!(
            version = %policy.version,
            link_patterns = policy.link_patterns.len(),
            "Evidence policy loaded"
        );
        Ok(policy)
    }

    pub fn link_validator(&self) -> Result<LinkValidator, ConfigError> {
        let patterns = self
            .link_patterns
            .iter()
            .map(|p| {
                Regex::new(&p.pattern)
                    .map(|regex| (p.source.clone(), regex))
                    .map_err(|e| ConfigError::LinkPattern {
                        name: p.source.clone(),
                        reason: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(LinkValidator { patterns })
    }
}

impl Default for EvidencePolicy {
    fn default() -> Self {
        fn strings(items: &[&str]) -> Vec<String> {
            items.iter().map(|s| s.to_string()).collect()
        }

        Self {
            version: "2025.1".into(),
            evidence_window: "2022-2025".into(),
            allowed_sources: strings(&[
                "CDC",
                "WHO",
                "NICE",
                "IDSA",
                "Cochrane Reviews",
                "AAFP",
                "AAP",
                "Specialty societies",
                "Large RCTs and meta-analyses",
            ]),
            general_hierarchy: strings(&[
                "CDC",
                "IDSA",
                "NICE",
                "WHO",
                "Cochrane",
                "AAFP",
                "AAP",
                "meta-analyses",
            ]),
            diagnosis_hierarchy: strings(&["IDSA", "NICE", "CDC", "Cochrane"]),
            safety_rules: strings(&[
                "Antibiotics are only valid for BACTERIAL conditions. If the diagnosis is viral or non-bacterial, ALL antibiotics are invalid.",
                "Steroids (e.g. prednisone) require strong guideline evidence or a severe inflammatory condition; never for routine sinusitis, bronchitis, pharyngitis or viral illness.",
                "Controlled substances (opioids, benzodiazepines) are invalid unless explicitly supported by high-level guidelines.",
                "Herbal, alternative or non-FDA-regulated compounds are always invalid.",
                "Supportive care (rest, fluids, OTC remedies) is never a valid drug.",
                "Every valid classification must be backed by at least one verifiable URL; without one the drug is invalid.",
                "Any drug contradicted by guidelines is invalid.",
                "If evidence is uncertain or mixed, classify the drug as invalid.",
                "A drug is invalid if its mechanism is not relevant to the diagnosis, it appears in no reputable guideline, its evidence is outdated or low quality, it has major recent resistance concerns, or it is recommended only for complicated, severe, inpatient or second-line scenarios not described here.",
            ]),
            diagnosis_rules: vec![DiagnosisRule {
                diagnosis: "acute bacterial sinusitis".into(),
                rules: strings(&[
                    "First-line valid: amoxicillin, amoxicillin-clavulanate.",
                    "Alternative valid: doxycycline, cefdinir, cefuroxime.",
                    "Always invalid: macrolides (azithromycin, clarithromycin, erythromycin) due to high pneumococcal resistance.",
                    "Steroids are invalid unless explicitly indicated by guideline-level evidence.",
                ]),
            }],
            link_patterns: vec![
                LinkPattern {
                    source: "IDSA".into(),
                    template: "https://www.idsociety.org/practice-guidelines/<slug>/".into(),
                    pattern: r"^https://www\.idsociety\.org/practice-guidelines/[a-z0-9]+(?:-[a-z0-9]+)*/?$".into(),
                },
                LinkPattern {
                    source: "CDC".into(),
                    template: "https://www.cdc.gov/<topic>/<page>.html".into(),
                    pattern: r"^https://www\.cdc\.gov/[a-z0-9-]+(?:/[a-z0-9-]+)*/[a-z0-9-]+\.html$".into(),
                },
                LinkPattern {
                    source: "NICE".into(),
                    template: "https://www.nice.org.uk/guidance/<code>".into(),
                    pattern: r"^https://www\.nice\.org\.uk/guidance/(?i:[a-z]{2,3}\d+)/?$".into(),
                },
                LinkPattern {
                    source: "Cochrane".into(),
                    template: "https://doi.org/<DOI>".into(),
                    pattern: r"^https://doi\.org/10\.\d{4,9}/\S+$".into(),
                },
                LinkPattern {
                    source: "WHO".into(),
                    template: "https://www.who.int/publications/<id>/<slug>".into(),
                    pattern: r"^https://www\.who\.int/publications/[^\s?#/]+(?:/[^\s?#/]+)+/?$".into(),
                },
                LinkPattern {
                    source: "AAFP".into(),
                    template: "https://www.aafp.org/pubs/afp/issues/<year>/<month><day>/<slug>.html".into(),
                    pattern: r"^https://www\.aafp\.org/pubs/afp/issues/\d{4}/\d{4}/[a-z0-9-]+\.html$".into(),
                },
            ],
        }
    }
}

/// Compiled link allow-list.
#[derive(Debug, Clone)]
pub struct LinkValidator {
    patterns: Vec<(String, Regex)>,
}

impl LinkValidator {
    /// The source whose pattern `url` matches, if any.
    pub fn source_for(&self, url: &str) -> Option<&str> {
        let url = url.trim();
        self.patterns
            .iter()
            .find(|(_, regex)| regex.is_match(url))
            .map(|(source, _)| source.as_str())
    }
}
