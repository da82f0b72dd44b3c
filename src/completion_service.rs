//! The `CompletionService` boundary (spec §6). The Driver and Sandbox never
//! depend on a concrete backend — only on this trait — so a caller can wire
//! in any chat-completions-shaped provider.

use crate::error::Result;
use crate::types::{Message, Usage};
use async_trait::async_trait;

/// A one-shot chat completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Per-call model override (used by sub-LLM calls with an explicit
    /// `modelOverride`); `None` means "use the service's configured model".
    pub model_override: Option<String>,
}

/// The assistant message and usage returned by a completion call.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub usage: Usage,
    pub finish_reason: String,
}

/// Required of any backend (spec §6). Errors propagate to the caller for
/// root calls; sub-calls made from inside the sandbox catch them instead
/// and surface a descriptive error string to the program (spec §7 kind 2).
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Scripted [`CompletionService`] that plays back canned responses in
    /// order, one per call, recording every request it received. Used by
    /// `driver` and `sandbox` integration tests to avoid any network I/O.
    pub struct MockCompletionService {
        responses: Mutex<std::collections::VecDeque<String>>,
        pub received: Mutex<Vec<CompletionRequest>>,
    }

    impl MockCompletionService {
        pub fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(String::from).collect()),
                received: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CompletionService for MockCompletionService {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
            self.received.lock().unwrap().push(request);
            let content = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "FINAL(no more scripted responses)".to_string());
            Ok(CompletionResponse {
                content,
                usage: Usage::new(10, 10),
                finish_reason: "stop".to_string(),
            })
        }
    }
}
