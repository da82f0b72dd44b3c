//! Anthropic [`CompletionService`] adapter, grounded on the teacher's
//! `call_anthropic` (`rlm.rs`).

use anthropic_sdk::{Anthropic, ContentBlock, MessageCreateBuilder};
use async_trait::async_trait;

use crate::completion_service::{CompletionRequest, CompletionResponse, CompletionService};
use crate::error::{Result, RlmError};
use crate::types::{Role, Usage};

/// A [`CompletionService`] backed by `anthropic-sdk-rust`.
pub struct AnthropicCompletionService {
    client: Anthropic,
    model: String,
    max_tokens: u32,
}

impl AnthropicCompletionService {
    pub fn new(model: impl Into<String>, api_key: Option<&str>) -> Result<Self> {
        let client = match api_key {
            Some(key) => Anthropic::new(key).map_err(|e| RlmError::Config(e.to_string()))?,
            None => Anthropic::from_env().map_err(|e| RlmError::Config(e.to_string()))?,
        };
        Ok(Self { client, model: model.into(), max_tokens: 4096 })
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl CompletionService for AnthropicCompletionService {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let system_content =
            request.messages.iter().find(|m| m.role == Role::System).map(|m| m.content.clone());

        let model = request.model_override.as_deref().unwrap_or(&self.model);
        let max_tokens = request.max_tokens.unwrap_or(self.max_tokens);
        let mut builder = MessageCreateBuilder::new(model, max_tokens);

        if let Some(system) = system_content {
            builder = builder.system(system);
        }
        if request.temperature > 0.0 {
            builder = builder.temperature(request.temperature);
        }
        for msg in request.messages.iter().filter(|m| m.role != Role::System) {
            builder = match msg.role {
                Role::User => builder.user(msg.content.clone()),
                Role::Assistant => builder.assistant(msg.content.clone()),
                Role::System => builder,
            };
        }

        let params = builder.build();
        let response = self
            .client
            .messages()
            .create(params)
            .await
            .map_err(|e| RlmError::Transport(e.to_string()))?;

        let content = response
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        let usage =
            Usage::new(response.usage.input_tokens as u64, response.usage.output_tokens as u64);

        Ok(CompletionResponse { content, usage, finish_reason: "stop".to_string() })
    }
}
