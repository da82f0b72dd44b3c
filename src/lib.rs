//! # rlm - Recursive Language Models
//!
//! A driver that lets a root LLM answer questions over arbitrarily large
//! contexts by writing small `repl`-tagged programs. Each program runs in a
//! sandboxed [`rhai`] interpreter that can inspect the supplied `context`,
//! call sub-LLMs via `llm_query`/`llm_query_batched`, and submit an answer
//! via `give_final_answer` — without ever touching the filesystem, network,
//! or process APIs directly.
//!
//! ```ignore
//! use rlm::{CompletionOptions, Rlm, RlmConfig};
//!
//! # async fn run(service: std::sync::Arc<dyn rlm::CompletionService>) -> rlm::Result<()> {
//! let rlm = Rlm::new(service, RlmConfig::new("gpt-4o"));
//! let result = rlm
//!     .completion("What was Q3 revenue?", CompletionOptions::new("...huge report..."))
//!     .await?;
//! println!("{}", result.answer.message);
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod completion_service;
pub mod context;
pub mod driver;
pub mod error;
pub mod parsing;
pub mod prompts;
pub mod sandbox;
pub mod trace;
pub mod types;

use std::sync::Arc;

pub use completion_service::{CompletionRequest, CompletionResponse, CompletionService};
pub use context::{ContextDescriptor, ContextTypeTag, ContextValue};
pub use driver::{CompletionOptions, Driver};
pub use error::{Result, RlmError};
pub use trace::{TraceEvent, TraceEventPayload, TraceEventType};
pub use types::{
    CodeBlock, ExecutionReport, FinalAnswer, Message, Role, RlmConfig, RlmResult, SubLlmCallRecord,
    Usage, UsageSummary,
};

#[cfg(feature = "openai")]
pub use backends::openai::OpenAiCompletionService;

#[cfg(feature = "anthropic")]
pub use backends::anthropic::AnthropicCompletionService;

/// Entry point: owns a [`CompletionService`] and an [`RlmConfig`], and runs
/// completions through the [`Driver`]'s recursive loop.
pub struct Rlm {
    driver: Driver,
    service: Arc<dyn CompletionService>,
}

impl Rlm {
    pub fn new(service: Arc<dyn CompletionService>, config: RlmConfig) -> Self {
        Self { driver: Driver::new(Arc::clone(&service), config), service }
    }

    #[cfg(feature = "openai")]
    pub fn openai(config: RlmConfig) -> Self {
        let service = OpenAiCompletionService::new(
            config.model.clone(),
            config.base_url.as_deref(),
            config.api_key.as_deref(),
        );
        Self::new(Arc::new(service), config)
    }

    #[cfg(feature = "anthropic")]
    pub fn anthropic(config: RlmConfig) -> Result<Self> {
        let service = AnthropicCompletionService::new(config.model.clone(), config.api_key.as_deref())?;
        Ok(Self::new(Arc::new(service), config))
    }

    /// Run the recursive loop: the root LLM writes and executes `repl`
    /// programs against `options.context` until it calls `give_final_answer`
    /// or `max_iterations` is exhausted (spec §4.4).
    pub async fn completion(&self, prompt: &str, options: CompletionOptions) -> Result<RlmResult> {
        self.driver.completion(prompt, options).await
    }

    /// A plain chat turn against the configured backend, bypassing the
    /// sandbox and the recursive loop entirely.
    pub async fn chat(&self, messages: Vec<Message>) -> Result<String> {
        let response = self
            .service
            .complete(CompletionRequest { messages, temperature: 0.0, max_tokens: None, model_override: None })
            .await?;
        Ok(response.content)
    }
}
