//! OpenAI-compatible [`CompletionService`] adapter, grounded on the
//! teacher's `call_openai` (`rlm.rs`). Works against any backend exposing
//! the widespread chat-completions wire format, including Ollama's
//! OpenAI-compatible endpoint (hence the `base_url` + "ollama"
//! placeholder-key convenience below).

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;

use crate::completion_service::{CompletionRequest, CompletionResponse, CompletionService};
use crate::error::{Result, RlmError};
use crate::types::{Role, Usage};

/// A [`CompletionService`] backed by `async-openai`.
pub struct OpenAiCompletionService {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiCompletionService {
    pub fn new(model: impl Into<String>, base_url: Option<&str>, api_key: Option<&str>) -> Self {
        let mut config = OpenAIConfig::new();
        if let Some(url) = base_url {
            config = config.with_api_base(url);
        }
        if let Some(key) = api_key {
            config = config.with_api_key(key);
        } else if base_url.is_some() {
            // Local/self-hosted endpoints (e.g. Ollama) accept any key.
            config = config.with_api_key("ollama");
        }
        Self { client: Client::with_config(config), model: model.into() }
    }
}

#[async_trait]
impl CompletionService for OpenAiCompletionService {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let messages: std::result::Result<Vec<ChatCompletionRequestMessage>, _> = request
            .messages
            .iter()
            .map(|m| -> std::result::Result<ChatCompletionRequestMessage, async_openai::error::OpenAIError> {
                Ok(match m.role {
                    Role::System => ChatCompletionRequestMessage::System(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(m.content.clone())
                            .build()?,
                    ),
                    Role::User => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(m.content.clone())
                            .build()?,
                    ),
                    Role::Assistant => ChatCompletionRequestMessage::Assistant(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(m.content.clone())
                            .build()?,
                    ),
                })
            })
            .collect();
        let messages = messages.map_err(|e| RlmError::Transport(e.to_string()))?;

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(request.model_override.as_deref().unwrap_or(&self.model))
            .messages(messages)
            .temperature(request.temperature);
        if let Some(max_tokens) = request.max_tokens {
            builder.max_tokens(max_tokens);
        }
        let built = builder.build().map_err(|e| RlmError::Transport(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(built)
            .await
            .map_err(|e| RlmError::Transport(e.to_string()))?;

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        let finish_reason = response
            .choices
            .first()
            .and_then(|c| c.finish_reason)
            .map(|r| format!("{r:?}").to_lowercase())
            .unwrap_or_else(|| "stop".to_string());
        let usage = response
            .usage
            .map(|u| Usage::new(u.prompt_tokens as u64, u.completion_tokens as u64))
            .unwrap_or_default();

        Ok(CompletionResponse { content, usage, finish_reason })
    }
}
