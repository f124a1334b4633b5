use serde::Deserialize;
use serde_json::Value;

use super::{pubmed_permalink, LiteratureError, LiteratureHit, LiteratureSearch};

/// NCBI E-utilities client: `esearch` for ids, then `esummary` for titles.
pub struct PubMedClient {
    base_url: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl PubMedClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, LiteratureError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| LiteratureError::HttpClient(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            timeout_secs,
        })
    }

    fn get(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<String, LiteratureError> {
        let url = format!("{}/{endpoint}", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(params)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    LiteratureError::Timeout(self.timeout_secs)
                } else if e.is_connect() {
                    LiteratureError::Connection(self.base_url.clone())
                } else {
                    LiteratureError::HttpClient(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(LiteratureError::Api {
                status: status.as_u16(),
            });
        }
        response
            .text()
            .map_err(|e| LiteratureError::ResponseParsing(e.to_string()))
    }
}

#[derive(Deserialize)]
struct SearchEnvelope {
    esearchresult: SearchResult,
}

#[derive(Deserialize)]
struct SearchResult {
    #[serde(default)]
    idlist: Vec<String>,
}

/// Ids from an `esearch` JSON body, in rank order.
pub(crate) fn parse_search_ids(body: &str) -> Result<Vec<String>, LiteratureError> {
    let envelope: SearchEnvelope =
        serde_json::from_str(body).map_err(|e| LiteratureError::ResponseParsing(e.to_string()))?;
    Ok(envelope.esearchresult.idlist)
}

/// Titles from an `esummary` JSON body, kept in `ids` order.
/// Ids without a summary entry are skipped.
pub(crate) fn parse_summaries(body: &str, ids: &[String]) -> Result<Vec<LiteratureHit>, LiteratureError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| LiteratureError::ResponseParsing(e.to_string()))?;
    let result = value
        .get("result")
        .ok_or_else(|| LiteratureError::ResponseParsing("missing `result`".into()))?;

    Ok(ids
        .iter()
        .filter_map(|id| {
            let summary = result.get(id.as_str())?;
            let title = summary.get("title").and_then(Value::as_str).unwrap_or_default();
            Some(LiteratureHit {
                id: id.clone(),
                title: title.trim().to_string(),
            })
        })
        .collect())
}

impl LiteratureSearch for PubMedClient {
    fn search(&self, query: &str, limit: usize) -> Result<Vec<LiteratureHit>, LiteratureError> {
        let retmax = limit.to_string();
        let body = self.get(
            "esearch.fcgi",
            &[("db", "pubmed"), ("term", query), ("retmode", "json"), ("retmax", retmax.as_str())],
        )?;
        let ids = parse_search_ids(&body)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let joined = ids.join(",");
        let body = self.get(
            "esummary.fcgi",
            &[("db", "pubmed"), ("id", joined.as_str()), ("retmode", "json")],
        )?;
        let hits = parse_summaries(&body, &ids)?;
        tracing::debug!(ids = ids.len(), hits = hits.len(), "PubMed search complete");
        Ok(hits)
    }

    fn permalink(&self, id: &str) -> String {
        pubmed_permalink(id)
    }
}
