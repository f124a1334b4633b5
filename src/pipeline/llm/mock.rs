//! Scripted model double.
//!
//! Replays a queue of canned completions (or errors) in order and records
//! every request it receives. Once the queue is drained the last entry keeps
//! being returned, so "always answer X" is a one-element script.

use std::collections::VecDeque;
use std::sync::Mutex;

use super::{CompletionRequest, LlmClient, LlmError};

/// A request as seen by the double.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
}

pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    last: Mutex<Option<Result<String, LlmError>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedLlmClient {
    pub fn new<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = Result<String, LlmError>>,
    {
        Self {
            script: Mutex::new(responses.into_iter().collect()),
            last: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answer every request with the same text.
    pub fn always(response: &str) -> Self {
        Self::new([Ok(response.to_string())])
    }

    /// Answer the given texts in order.
    pub fn replies(responses: &[&str]) -> Self {
        Self::new(responses.iter().map(|r| Ok(r.to_string())))
    }

    /// Fail every request.
    pub fn failing(error: LlmError) -> Self {
        Self::new([Err(error)])
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl LlmClient for ScriptedLlmClient {
    fn complete(&self, request: &CompletionRequest<'_>) -> Result<String, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                system: request.system.map(str::to_string),
                prompt: request.prompt.to_string(),
                max_tokens: request.max_tokens,
            });
        }

        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        let mut last = self
            .last
            .lock()
            .map_err(|_| LlmError::HttpClient("scripted client lock poisoned".into()))?;
        match next {
            Some(entry) => {
                *last = Some(entry.clone());
                entry
            }
            None => last.clone().unwrap_or(Err(LlmError::EmptyCompletion)),
        }
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_in_order_then_repeats_last() {
        let client = ScriptedLlmClient::replies(&["one", "two"]);
        let req = CompletionRequest::new("p", 10);
        assert_eq!(client.complete(&req).unwrap(), "one");
        assert_eq!(client.complete(&req).unwrap(), "two");
        assert_eq!(client.complete(&req).unwrap(), "two");
        assert_eq!(client.call_count(), 3);
    }

    #[test]
    fn records_requests() {
        let client = ScriptedLlmClient::always("{}");
        client
            .complete(&CompletionRequest::new("hello", 42).with_system("sys"))
            .unwrap();
        let calls = client.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].prompt, "hello");
        assert_eq!(calls[0].system.as_deref(), Some("sys"));
        assert_eq!(calls[0].max_tokens, 42);
    }

    #[test]
    fn failing_client_always_errors() {
        let client = ScriptedLlmClient::failing(LlmError::Timeout(5));
        let req = CompletionRequest::new("p", 10);
        assert_eq!(client.complete(&req), Err(LlmError::Timeout(5)));
        assert_eq!(client.complete(&req), Err(LlmError::Timeout(5)));
    }

    #[test]
    fn empty_script_reports_empty_completion() {
        let client = ScriptedLlmClient::new(Vec::new());
        let result = client.complete(&CompletionRequest::new("p", 10));
        assert_eq!(result, Err(LlmError::EmptyCompletion));
    }
}
