use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Token usage for a single completion call, or an aggregate of several.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Accumulate usage from another instance, component-wise.
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Message role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in the history sent to the root LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// One sub-LLM call made from inside an executing program, via `llm_query`
/// or `llm_query_batched`. Appended in call-initiation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubLlmCallRecord {
    pub prompt: String,
    pub response: String,
    pub usage: Usage,
    pub duration: Duration,
    pub model_override: Option<String>,
}

/// One extracted `repl` code block payload, trimmed and non-empty.
pub type CodeBlock = String;

/// The Sandbox's structured output for one executed [`CodeBlock`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutionReport {
    pub stdout: String,
    pub stderr: String,
    /// Top-level bindings assigned during execution, excluding injected
    /// bindings, interpreter builtins, and names starting with `_`.
    pub locals: BTreeMap<String, String>,
    pub execution_time: Duration,
    pub sub_calls: Vec<SubLlmCallRecord>,
    /// Set if the program raised an unhandled fault or exceeded its
    /// wall-clock budget. Absent on success.
    pub error: Option<String>,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// The sandbox-set completion result. Shape: `message` is required and must
/// be a string; `data` is an optional structured payload. Set at most once
/// per completion — an attempt to set it with a non-string `message` is
/// silently rejected and leaves the prior state untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalAnswer {
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl FinalAnswer {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), data: None }
    }

    pub fn with_data(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self { message: message.into(), data: Some(data) }
    }
}

/// Aggregate usage and call-count accounting returned alongside the answer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageSummary {
    pub total_calls: u32,
    pub root_calls: u32,
    pub sub_calls: u32,
    pub token_usage: Usage,
    pub execution_time: Duration,
}

/// The public return value of [`crate::Rlm::completion`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlmResult {
    pub answer: FinalAnswer,
    pub usage: UsageSummary,
    pub iterations: u32,
    pub trace: Vec<crate::trace::TraceEvent>,
}

/// Configuration for [`crate::Rlm`].
#[derive(Debug, Clone)]
pub struct RlmConfig {
    pub model: String,
    pub max_iterations: u32,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub verbose: bool,
    /// Base URL for the backend API (optional, for custom/self-hosted endpoints).
    pub base_url: Option<String>,
    /// API key (optional; backends fall back to their usual env var).
    pub api_key: Option<String>,
    /// Wall-clock budget for a single sandbox `execute` call.
    pub sandbox_timeout: Duration,
    /// Character budget for a formatted execution report before truncation.
    pub report_char_budget: usize,
    /// System prompt override; `None` uses the built-in default.
    pub system_prompt: Option<String>,
}

impl Default for RlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            max_iterations: 30,
            temperature: 0.0,
            max_tokens: None,
            verbose: false,
            base_url: None,
            api_key: None,
            sandbox_timeout: Duration::from_secs(300),
            report_char_budget: 20_000,
            system_prompt: None,
        }
    }
}

impl RlmConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn with_max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = Some(n);
        self
    }

    pub fn with_verbose(mut self, v: bool) -> Self {
        self.verbose = v;
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_sandbox_timeout(mut self, timeout: Duration) -> Self {
        self.sandbox_timeout = timeout;
        self
    }

    pub fn with_report_char_budget(mut self, budget: usize) -> Self {
        self.report_char_budget = budget;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}
