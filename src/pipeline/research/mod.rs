//! Research side pipeline: diagnosis → literature pool → model-ranked digest.
//!
//! The model only selects from the fetched pool. Entries are matched back to
//! the pool by URL and the pool's own title/URL are returned, so nothing the
//! model writes ends up in the digest verbatim.

pub mod mock;
pub mod pubmed;

pub use mock::StaticLiterature;
pub use pubmed::PubMedClient;

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use super::llm::{CompletionRequest, LlmClient};
use super::outcome::StageOutcome;
use super::repair::{parse_json_object, require_array, ContractError};
use super::types::{ResearchDigest, ResearchItem};

const RESEARCH_MAX_TOKENS: u32 = 700;
pub const LITERATURE_POOL_SIZE: usize = 10;
pub const MAX_RESEARCH_ITEMS: usize = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LiteratureError {
    #[error("Literature index is not reachable at {0}")]
    Connection(String),

    #[error("Literature request timed out after {0}s")]
    Timeout(u64),

    #[error("Literature index returned status {status}")]
    Api { status: u16 },

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Literature response parsing error: {0}")]
    ResponseParsing(String),
}

/// One search result before it becomes a `ResearchItem`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteratureHit {
    pub id: String,
    pub title: String,
}

pub trait LiteratureSearch: Send + Sync {
    /// Up to `limit` hits for a free-text query, in relevance order.
    fn search(&self, query: &str, limit: usize) -> Result<Vec<LiteratureHit>, LiteratureError>;

    /// Stable public URL for a hit id.
    fn permalink(&self, id: &str) -> String;
}

pub fn pubmed_permalink(id: &str) -> String {
    format!("https://pubmed.ncbi.nlm.nih.gov/{id}/")
}

fn build_ranking_prompt(diagnosis: &str, pool: &[ResearchItem]) -> String {
    let papers = serde_json::to_string_pretty(pool).unwrap_or_else(|_| "[]".into());
    let schema = serde_json::json!({
        "diagnosis": diagnosis,
        "research": [{"title": "", "url": ""}],
    });
    format!(
        "You ONLY choose from the papers provided below.\n\
         You MUST NOT invent titles or URLs.\n\n\
         Diagnosis: {diagnosis}\n\n\
         Papers:\n{papers}\n\n\
         Pick the 3-5 MOST relevant items.\n\n\
         Return STRICT JSON ONLY:\n\n{}\n",
        serde_json::to_string_pretty(&schema).unwrap_or_default()
    )
}

/// Map the model's selection back onto the pool, by URL.
pub fn decode_ranking(raw: &str, pool: &[ResearchItem]) -> Result<Vec<ResearchItem>, ContractError> {
    let object = parse_json_object(raw)?;
    let entries = require_array(&object, "research")?;

    let mut selected: Vec<ResearchItem> = Vec::new();
    let mut foreign = 0usize;
    for url in entries
        .iter()
        .filter_map(|entry| entry.get("url").and_then(Value::as_str))
        .map(str::trim)
    {
        match pool.iter().find(|item| item.url == url) {
            Some(item) if !selected.contains(item) => selected.push(item.clone()),
            Some(_) => {}
            None => foreign += 1,
        }
        if selected.len() == MAX_RESEARCH_ITEMS {
            break;
        }
    }

    if foreign > 0 {
        tracing::warn!(dropped = foreign, "Ranked entries outside the literature pool removed");
    }
    if selected.is_empty() {
        return Err(ContractError::Schema("ranking selected no pool entries".into()));
    }
    Ok(selected)
}

pub struct ResearchSummarizer {
    llm: Arc<dyn LlmClient>,
    literature: Arc<dyn LiteratureSearch>,
}

impl ResearchSummarizer {
    pub fn new(llm: Arc<dyn LlmClient>, literature: Arc<dyn LiteratureSearch>) -> Self {
        Self { llm, literature }
    }

    pub fn summarize(&self, diagnosis: &str) -> StageOutcome<ResearchDigest> {
        let diagnosis = diagnosis.trim().to_string();
        let empty = |diagnosis: String| ResearchDigest {
            diagnosis,
            research: Vec::new(),
        };

        if diagnosis.is_empty() {
            return StageOutcome::skipped(empty(diagnosis), "no diagnosis");
        }

        let pool: Vec<ResearchItem> = match self.literature.search(&diagnosis, LITERATURE_POOL_SIZE) {
            Ok(hits) => hits
                .into_iter()
                .map(|hit| ResearchItem {
                    url: self.literature.permalink(&hit.id),
                    title: hit.title,
                })
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Literature search failed");
                return StageOutcome::degraded(empty(diagnosis), format!("literature search failed: {e}"));
            }
        };

        if pool.is_empty() {
            return StageOutcome::skipped(empty(diagnosis), "no literature found");
        }

        let fallback = |diagnosis: String, pool: &[ResearchItem]| ResearchDigest {
            diagnosis,
            research: pool.iter().take(MAX_RESEARCH_ITEMS).cloned().collect(),
        };

        let prompt = build_ranking_prompt(&diagnosis, &pool);
        let raw = match self.llm.complete(&CompletionRequest::new(&prompt, RESEARCH_MAX_TOKENS)) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(stage = "research", error = %e, "Ranking call failed, returning pool order");
                return StageOutcome::degraded(fallback(diagnosis, &pool), format!("model call failed: {e}"));
            }
        };

        match decode_ranking(&raw, &pool) {
            Ok(research) => {
                tracing::debug!(pool = pool.len(), selected = research.len(), "Literature ranked");
                StageOutcome::clean(ResearchDigest { diagnosis, research })
            }
            Err(e) => {
                tracing::warn!(stage = "research", error = %e, "Ranking rejected, returning pool order");
                StageOutcome::degraded(fallback(diagnosis, &pool), e.to_string())
            }
        }
    }
}
