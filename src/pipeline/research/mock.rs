//! Canned literature index for tests and offline runs.

use std::sync::Mutex;

use super::{pubmed_permalink, LiteratureError, LiteratureHit, LiteratureSearch};

pub struct StaticLiterature {
    result: Result<Vec<LiteratureHit>, LiteratureError>,
    queries: Mutex<Vec<String>>,
}

impl StaticLiterature {
    pub fn new(hits: Vec<LiteratureHit>) -> Self {
        Self {
            result: Ok(hits),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// `count` numbered hits with ids "1".."count".
    pub fn numbered(count: usize) -> Self {
        Self::new(
            (1..=count)
                .map(|i| LiteratureHit {
                    id: i.to_string(),
                    title: format!("Paper {i}"),
                })
                .collect(),
        )
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn failing(error: LiteratureError) -> Self {
        Self {
            result: Err(error),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().map(|q| q.clone()).unwrap_or_default()
    }
}

impl LiteratureSearch for StaticLiterature {
    fn search(&self, query: &str, limit: usize) -> Result<Vec<LiteratureHit>, LiteratureError> {
        if let Ok(mut queries) = self.queries.lock() {
            queries.push(query.to_string());
        }
        self.result
            .clone()
            .map(|hits| hits.into_iter().take(limit).collect())
    }

    fn permalink(&self, id: &str) -> String {
        pubmed_permalink(id)
    }
}
