//! Driver / recursive loop (spec §4.4): drives the root LLM turn by turn,
//! running every `repl` block it writes against one [`Sandbox`] per
//! completion and feeding the execution report back as the next user turn.
//!
//! Two behaviors here diverge from a naive reading of the system prompt
//! and are worth calling out explicitly:
//! - it executed only the first extracted code block per response and
//!   silently discarded the rest; here every block is executed, in order.
//! - faults were recovered via a nested retry loop inside one block's
//!   handling (`execute_with_retry`); here a fault is just another execution
//!   report fed to the next ordinary loop iteration, so the root LLM decides
//!   how to react to it rather than the driver deciding for it.

use std::sync::Arc;

use crate::completion_service::{CompletionRequest, CompletionService};
use crate::context::ContextValue;
use crate::error::{Result, RlmError};
use crate::parsing::{extract_code_blocks, legacy};
use crate::prompts::{
    build_final_request_prompt, build_iteration_prompt, build_metadata_turn, build_system_prompt,
    format_execution_report,
};
use crate::sandbox::Sandbox;
use crate::trace::{TraceClock, TraceEvent, TraceEventPayload, TraceEventType, UsageAccumulator};
use crate::types::{FinalAnswer, Message, RlmConfig, RlmResult, UsageSummary};

/// Options for one [`Driver::completion`] call.
pub struct CompletionOptions {
    pub context: ContextValue,
    pub context_schema: Option<String>,
    pub on_event: Option<Box<dyn Fn(&TraceEvent) + Send + Sync>>,
}

impl CompletionOptions {
    pub fn new(context: impl Into<ContextValue>) -> Self {
        Self { context: context.into(), context_schema: None, on_event: None }
    }

    pub fn with_context_schema(mut self, schema: impl Into<String>) -> Self {
        self.context_schema = Some(schema.into());
        self
    }

    pub fn with_on_event(mut self, f: impl Fn(&TraceEvent) + Send + Sync + 'static) -> Self {
        self.on_event = Some(Box::new(f));
        self
    }
}

pub struct Driver {
    service: Arc<dyn CompletionService>,
    config: RlmConfig,
}

impl Driver {
    pub fn new(service: Arc<dyn CompletionService>, config: RlmConfig) -> Self {
        Self { service, config }
    }

    pub async fn completion(&self, prompt: &str, options: CompletionOptions) -> Result<RlmResult> {
        if self.config.max_iterations == 0 {
            return Err(RlmError::MaxIterationsReached(0));
        }

        let clock = TraceClock::start();
        let mut usage = UsageAccumulator::default();
        let mut trace: Vec<TraceEvent> = Vec::new();

        let emit = |trace: &mut Vec<TraceEvent>, event: TraceEvent| {
            if let Some(cb) = &options.on_event {
                let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(&event)));
            }
            trace.push(event);
        };

        let system_prompt =
            self.config.system_prompt.clone().unwrap_or_else(build_system_prompt);
        let descriptor = options.context.describe();
        let metadata_turn = build_metadata_turn(&descriptor, options.context_schema.as_deref());

        let mut history = vec![Message::system(system_prompt.clone()), Message::assistant(metadata_turn)];

        let mut sandbox = Sandbox::new(
            Arc::clone(&self.service),
            Some(system_prompt),
            options.context,
            self.config.sandbox_timeout,
        )?;

        for iteration in 0..self.config.max_iterations {
            tracing::debug!(iteration, "starting RLM iteration");
            emit(&mut trace, clock.event(TraceEventType::IterationStart, Some(iteration), TraceEventPayload::None));

            history.push(Message::user(build_iteration_prompt(prompt, iteration)));

            let response_text = self.query_root(&history, &clock, &mut trace, &mut usage, Some(iteration), &emit).await?;
            history.push(Message::assistant(response_text.clone()));

            if let Some(answer) = self
                .run_blocks(&response_text, &mut sandbox, &clock, &mut trace, &mut usage, iteration, &emit, &mut history)
                .await?
            {
                tracing::info!(iteration, "final answer reached");
                return Ok(self.finish(answer, iteration + 1, usage, clock, trace));
            }
        }

        tracing::warn!(max_iterations = self.config.max_iterations, "iteration limit exhausted, requesting best-effort answer");

        // Best-effort final attempt (spec §4.4 step 3): exhausting
        // `max_iterations` asks once more for an answer instead of erroring.
        history.push(Message::user(build_final_request_prompt()));
        let response_text = self
            .query_root(&history, &clock, &mut trace, &mut usage, None, &emit)
            .await?;
        history.push(Message::assistant(response_text.clone()));

        let answer = self
            .run_blocks(&response_text, &mut sandbox, &clock, &mut trace, &mut usage, self.config.max_iterations, &emit, &mut history)
            .await?
            .or_else(|| legacy::extract_final_answer(&response_text).map(FinalAnswer::new))
            .unwrap_or_else(|| FinalAnswer::new(response_text));

        Ok(self.finish(answer, self.config.max_iterations + 1, usage, clock, trace))
    }

    async fn query_root(
        &self,
        history: &[Message],
        clock: &TraceClock,
        trace: &mut Vec<TraceEvent>,
        usage: &mut UsageAccumulator,
        iteration: Option<u32>,
        emit: &impl Fn(&mut Vec<TraceEvent>, TraceEvent),
    ) -> Result<String> {
        emit(
            trace,
            clock.event(
                TraceEventType::LlmQueryStart,
                iteration,
                TraceEventPayload::Prompt {
                    prompt: history.last().map(|m| m.content.clone()).unwrap_or_default(),
                },
            ),
        );

        let request = CompletionRequest {
            messages: history.to_vec(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            model_override: None,
        };

        let result = self.service.complete(request).await;

        let payload = match &result {
            Ok(response) => TraceEventPayload::Response { response: response.content.clone(), error: None },
            Err(e) => TraceEventPayload::Response { response: String::new(), error: Some(e.to_string()) },
        };
        emit(trace, clock.event(TraceEventType::LlmQueryEnd, iteration, payload));

        if let Err(e) = &result {
            tracing::error!(error = %e, "root completion call failed");
        }
        let response = result?;
        usage.record_root_call(response.usage);
        Ok(response.content)
    }

    /// Execute every extracted `repl` block from `response_text`, in order,
    /// against `sandbox`. Returns the final answer if one was set by the
    /// time the last block finishes; otherwise pushes the combined,
    /// budget-truncated execution report onto `history` as the next user
    /// turn and returns `None`.
    #[allow(clippy::too_many_arguments)]
    async fn run_blocks(
        &self,
        response_text: &str,
        sandbox: &mut Sandbox,
        clock: &TraceClock,
        trace: &mut Vec<TraceEvent>,
        usage: &mut UsageAccumulator,
        iteration: u32,
        emit: &impl Fn(&mut Vec<TraceEvent>, TraceEvent),
        history: &mut Vec<Message>,
    ) -> Result<Option<FinalAnswer>> {
        let blocks = extract_code_blocks(response_text);
        if blocks.is_empty() {
            history.push(Message::user(
                "No ```repl code block was found in your last response. Write exactly one \
                 to make progress, or call `give_final_answer` from inside it."
                    .to_string(),
            ));
            return Ok(None);
        }

        let mut combined_report = String::new();
        for code in &blocks {
            emit(trace, clock.event(TraceEventType::CodeExecutionStart, Some(iteration), TraceEventPayload::Code { code: code.clone() }));

            let report = sandbox.execute(code).await?;
            usage.record_sub_calls(sandbox.get_sub_calls());

            let formatted = format_execution_report(&report, self.config.report_char_budget);
            emit(
                trace,
                clock.event(
                    TraceEventType::CodeExecutionEnd,
                    Some(iteration),
                    TraceEventPayload::ExecutionResult { formatted_report: formatted.clone(), error: report.error.clone() },
                ),
            );

            if !combined_report.is_empty() {
                combined_report.push_str("\n---\n");
            }
            combined_report.push_str(&formatted);

            // Check right after each execution: if this block set the final
            // answer, later blocks in the same response are skipped (spec
            // §4.4 tie-break).
            if let Some(answer) = sandbox.get_final_answer() {
                emit(
                    trace,
                    clock.event(TraceEventType::FinalAnswer, Some(iteration), TraceEventPayload::Answer { message: answer.message.clone() }),
                );
                return Ok(Some(answer));
            }
        }

        history.push(Message::user(combined_report));
        Ok(None)
    }

    fn finish(
        &self,
        answer: FinalAnswer,
        iterations: u32,
        usage: UsageAccumulator,
        clock: TraceClock,
        trace: Vec<TraceEvent>,
    ) -> RlmResult {
        RlmResult {
            answer,
            usage: UsageSummary {
                total_calls: usage.total_calls(),
                root_calls: usage.root_calls(),
                sub_calls: usage.sub_calls(),
                token_usage: usage.token_usage(),
                execution_time: clock.elapsed(),
            },
            iterations,
            trace,
        }
    }
}
