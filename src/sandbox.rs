//! Executes one `repl` program per [`Sandbox::execute`] call against a
//! `rhai` engine. `rhai` ships no filesystem/network/process/OS bindings by
//! default, so "no filesystem, network, process, dynamic code loading, or
//! OS bindings" holds without a bespoke sandboxing layer.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rhai::{Dynamic, Engine, EvalAltResult, NativeCallContext, Scope};

use crate::completion_service::{CompletionRequest, CompletionService};
use crate::context::ContextValue;
use crate::error::{Result, RlmError};
use crate::types::{ExecutionReport, FinalAnswer, SubLlmCallRecord, Usage};

/// Per-`execute` call state: fresh at the start of every call so an
/// [`ExecutionReport`] reflects only that invocation (spec §4.3
/// "Fresh-frame policy").
#[derive(Default, Clone)]
struct Frame {
    stdout: String,
    stderr: String,
    sub_calls: Vec<SubLlmCallRecord>,
}

/// Hosts LLM-authored `repl` programs. One instance per `completion` call.
/// `context`, `locals` (via the persisted [`Scope`]), and the [`FinalAnswer`]
/// survive across `execute` calls on the same instance; stdout, stderr, and
/// the sub-call log do not (spec §4.3).
pub struct Sandbox {
    engine: Engine,
    scope: Scope<'static>,
    final_answer: Arc<Mutex<Option<FinalAnswer>>>,
    working_frame: Arc<Mutex<Frame>>,
    last_frame: Frame,
    deadline: Arc<Mutex<Instant>>,
    timeout: Duration,
}

impl Sandbox {
    pub fn new(
        service: Arc<dyn CompletionService>,
        system_prompt: Option<String>,
        context: ContextValue,
        timeout: Duration,
    ) -> Result<Self> {
        let rt_handle = tokio::runtime::Handle::current();
        let final_answer: Arc<Mutex<Option<FinalAnswer>>> = Arc::new(Mutex::new(None));
        let working_frame: Arc<Mutex<Frame>> = Arc::new(Mutex::new(Frame::default()));
        let deadline = Arc::new(Mutex::new(Instant::now() + timeout));

        let mut engine = Engine::new();
        engine.set_max_expr_depths(64, 64);
        engine.set_max_operations(5_000_000);
        engine.set_max_string_size(50_000_000);
        engine.set_max_array_size(1_000_000);

        {
            let deadline = Arc::clone(&deadline);
            engine.on_progress(move |_ops| {
                if Instant::now() >= *deadline.lock().unwrap() {
                    Some(Dynamic::from("sandbox execution timed out".to_string()))
                } else {
                    None
                }
            });
        }

        {
            let frame = Arc::clone(&working_frame);
            engine.on_print(move |s| {
                let mut frame = frame.lock().unwrap();
                if !frame.stdout.is_empty() {
                    frame.stdout.push('\n');
                }
                frame.stdout.push_str(s);
            });
        }
        {
            let frame = Arc::clone(&working_frame);
            engine.on_debug(move |s, _src, _pos| {
                let mut frame = frame.lock().unwrap();
                if !frame.stderr.is_empty() {
                    frame.stderr.push('\n');
                }
                frame.stderr.push_str(s);
            });
        }

        register_llm_query(&mut engine, Arc::clone(&service), rt_handle.clone(), system_prompt.clone(), Arc::clone(&working_frame));
        register_llm_query_batched(&mut engine, Arc::clone(&service), rt_handle.clone(), system_prompt, Arc::clone(&working_frame));
        register_sleep(&mut engine, rt_handle);
        register_final_answer_bindings(&mut engine, Arc::clone(&final_answer));
        register_value_builtins(&mut engine);

        let mut scope = Scope::new();
        scope.set_or_push("context", context_to_dynamic(&context));

        Ok(Self {
            engine,
            scope,
            final_answer,
            working_frame,
            last_frame: Frame::default(),
            deadline,
            timeout,
        })
    }

    /// Rebind `context`, leaving locals and the final answer untouched.
    pub fn load_context(&mut self, context: &ContextValue) {
        self.scope.set_or_push("context", context_to_dynamic(context));
    }

    /// Run `code` as a standalone top-level program. Captured locals and
    /// the final answer persist across calls on `self`; stdout/stderr/the
    /// sub-call log do not.
    pub async fn execute(&mut self, code: &str) -> Result<ExecutionReport> {
        *self.working_frame.lock().unwrap() = Frame::default();
        *self.deadline.lock().unwrap() = Instant::now() + self.timeout;

        let start = Instant::now();
        let engine = self.engine.clone();
        let code = code.to_string();
        let mut scope = std::mem::replace(&mut self.scope, Scope::new());

        let (eval_result, scope) = tokio::task::spawn_blocking(move || {
            let result = engine.eval_with_scope::<Dynamic>(&mut scope, &code);
            (result, scope)
        })
        .await
        .map_err(|e| RlmError::Sandbox(format!("sandbox task panicked: {e}")))?;

        self.scope = scope;
        let execution_time = start.elapsed();

        let frame = self.working_frame.lock().unwrap().clone();
        self.last_frame = frame.clone();

        let error = eval_result.err().map(|err| format_fault(&err, self.timeout));
        if let Some(error) = &error {
            tracing::warn!(error = %error, ?execution_time, "repl program faulted");
        } else {
            tracing::debug!(?execution_time, sub_calls = frame.sub_calls.len(), "repl program executed");
        }

        Ok(ExecutionReport {
            stdout: frame.stdout,
            stderr: frame.stderr,
            locals: self.capture_locals(),
            execution_time,
            sub_calls: frame.sub_calls,
            error,
        })
    }

    /// Scan top-level bindings excluding injected bindings and names
    /// starting with `_`; values that can't be stringified are skipped.
    fn capture_locals(&self) -> BTreeMap<String, String> {
        let mut locals = BTreeMap::new();
        for (name, _is_constant, value) in self.scope.iter() {
            if name == "context" || name.starts_with('_') {
                continue;
            }
            let rendered = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| value.to_string()));
            if let Ok(rendered) = rendered {
                locals.insert(name.to_string(), rendered);
            }
        }
        locals
    }

    pub fn get_final_answer(&self) -> Option<FinalAnswer> {
        self.final_answer.lock().unwrap().clone()
    }

    pub fn get_local(&self, name: &str) -> Option<String> {
        self.scope.get(name).map(|v| v.to_string())
    }

    pub fn get_locals(&self) -> BTreeMap<String, String> {
        self.capture_locals()
    }

    /// Sub-LLM calls made during the most recent [`Sandbox::execute`] call.
    pub fn get_sub_calls(&self) -> &[SubLlmCallRecord] {
        &self.last_frame.sub_calls
    }

    pub fn get_aggregate_sub_usage(&self) -> Usage {
        let mut usage = Usage::default();
        for call in &self.last_frame.sub_calls {
            usage.add(&call.usage);
        }
        usage
    }

    /// Clear captured locals and the final answer; the `CompletionService`
    /// binding is unaffected.
    pub fn reset(&mut self) {
        let context = self.scope.get("context").cloned();
        self.scope = Scope::new();
        if let Some(context) = context {
            self.scope.set_or_push("context", context);
        }
        *self.final_answer.lock().unwrap() = None;
        *self.working_frame.lock().unwrap() = Frame::default();
        self.last_frame = Frame::default();
    }
}

fn context_to_dynamic(context: &ContextValue) -> Dynamic {
    let json = serde_json::to_value(context).unwrap_or(serde_json::Value::Null);
    rhai::serde::to_dynamic(&json).unwrap_or(Dynamic::UNIT)
}

fn format_fault(err: &EvalAltResult, timeout: Duration) -> String {
    if matches!(err, EvalAltResult::ErrorTerminated(..)) {
        return RlmError::SandboxTimeout(timeout).to_string();
    }
    format!(
        "{err}\n(Fix the mistake above and try again in your next ```repl block. \
         Check for typos in variable names, mismatched types, or an out-of-range index.)"
    )
}

async fn run_completion(
    service: &Arc<dyn CompletionService>,
    system_prompt: &Option<String>,
    prompt: &str,
    model_override: Option<String>,
) -> (String, Usage) {
    let mut messages = Vec::new();
    if let Some(system) = system_prompt {
        messages.push(crate::types::Message::system(system.clone()));
    }
    messages.push(crate::types::Message::user(prompt.to_string()));

    let request = CompletionRequest {
        messages,
        temperature: 0.0,
        max_tokens: None,
        model_override,
    };

    match service.complete(request).await {
        Ok(response) => (response.content, response.usage),
        Err(e) => (format!("[llm_query error: {e}]"), Usage::default()),
    }
}

fn register_llm_query(
    engine: &mut Engine,
    service: Arc<dyn CompletionService>,
    rt_handle: tokio::runtime::Handle,
    system_prompt: Option<String>,
    frame: Arc<Mutex<Frame>>,
) {
    let make_call = move |prompt: &str, model_override: Option<String>| -> String {
        let start = Instant::now();
        let (response, usage) =
            rt_handle.block_on(run_completion(&service, &system_prompt, prompt, model_override.clone()));
        let duration = start.elapsed();
        frame.lock().unwrap().sub_calls.push(SubLlmCallRecord {
            prompt: prompt.to_string(),
            response: response.clone(),
            usage,
            duration,
            model_override,
        });
        response
    };

    let call = make_call.clone();
    engine.register_fn("llm_query", move |prompt: &str| -> String { call(prompt, None) });
    engine.register_fn("llm_query", move |prompt: &str, model: &str| -> String {
        make_call(prompt, Some(model.to_string()))
    });
}

fn register_llm_query_batched(
    engine: &mut Engine,
    service: Arc<dyn CompletionService>,
    rt_handle: tokio::runtime::Handle,
    system_prompt: Option<String>,
    frame: Arc<Mutex<Frame>>,
) {
    let run_batch = move |prompts: rhai::Array, model_override: Option<String>| -> rhai::Array {
        let prompts: Vec<String> =
            prompts.into_iter().map(|d| d.to_string()).collect();

        let results: Vec<(String, Usage, Duration)> = rt_handle.block_on(async {
            let futures = prompts.iter().map(|prompt| {
                let service = &service;
                let system_prompt = &system_prompt;
                let model_override = model_override.clone();
                async move {
                    let start = Instant::now();
                    let (response, usage) =
                        run_completion(service, system_prompt, prompt, model_override).await;
                    (response, usage, start.elapsed())
                }
            });
            futures::future::join_all(futures).await
        });

        let mut frame = frame.lock().unwrap();
        let mut out = rhai::Array::new();
        for (prompt, (response, usage, duration)) in prompts.iter().zip(results.into_iter()) {
            frame.sub_calls.push(SubLlmCallRecord {
                prompt: prompt.clone(),
                response: response.clone(),
                usage,
                duration,
                model_override: model_override.clone(),
            });
            out.push(Dynamic::from(response));
        }
        out
    };

    let batch = run_batch.clone();
    engine.register_fn("llm_query_batched", move |prompts: rhai::Array| -> rhai::Array {
        batch(prompts, None)
    });
    engine.register_fn(
        "llm_query_batched",
        move |prompts: rhai::Array, model: &str| -> rhai::Array {
            run_batch(prompts, Some(model.to_string()))
        },
    );
}

fn register_sleep(engine: &mut Engine, rt_handle: tokio::runtime::Handle) {
    engine.register_fn("sleep_ms", move |ms: i64| {
        rt_handle.block_on(tokio::time::sleep(Duration::from_millis(ms.max(0) as u64)));
    });
    engine.register_fn("now_unix_ms", || -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    });
}

fn register_final_answer_bindings(engine: &mut Engine, final_answer: Arc<Mutex<Option<FinalAnswer>>>) {
    {
        let final_answer = Arc::clone(&final_answer);
        engine.register_fn("give_final_answer", move |map: rhai::Map| {
            let message = map.get("message").and_then(|d| d.clone().into_string().ok());
            let Some(message) = message else {
                // Invalid shape (missing/non-string `message`): silently ignored.
                return;
            };
            let data = map
                .get("data")
                .and_then(|d| rhai::serde::from_dynamic::<serde_json::Value>(d).ok());

            let mut guard = final_answer.lock().unwrap();
            if guard.is_none() {
                *guard = Some(FinalAnswer { message, data });
            }
        });
    }
    {
        let final_answer = Arc::clone(&final_answer);
        engine.register_fn("FINAL", move |value: Dynamic| {
            let mut guard = final_answer.lock().unwrap();
            if guard.is_none() {
                *guard = Some(FinalAnswer::new(value.to_string()));
            }
        });
    }
    {
        engine.register_fn("FINAL_VAR", move |ctx: NativeCallContext, name: &str| {
            let Some(value) = ctx.scope().get(name) else { return };
            let message = value.to_string();
            let mut guard = final_answer.lock().unwrap();
            if guard.is_none() {
                *guard = Some(FinalAnswer::new(message));
            }
        });
    }
}

fn register_value_builtins(engine: &mut Engine) {
    // JSON
    engine.register_fn("json_parse", |s: &str| -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        let value: serde_json::Value = serde_json::from_str(s)
            .map_err(|e| format!("json_parse: {e}"))?;
        rhai::serde::to_dynamic(&value).map_err(|e| format!("json_parse: {e}").into())
    });
    engine.register_fn("json_stringify", |value: Dynamic| -> std::result::Result<String, Box<EvalAltResult>> {
        let json: serde_json::Value =
            rhai::serde::from_dynamic(&value).map_err(|e| format!("json_stringify: {e}"))?;
        serde_json::to_string(&json).map_err(|e| format!("json_stringify: {e}").into())
    });

    // Base64
    use base64::Engine as _;
    engine.register_fn("base64_encode", |s: &str| -> String {
        base64::engine::general_purpose::STANDARD.encode(s.as_bytes())
    });
    engine.register_fn("base64_decode", |s: &str| -> std::result::Result<String, Box<EvalAltResult>> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|e| format!("base64_decode: {e}"))?;
        String::from_utf8(bytes).map_err(|e| format!("base64_decode: {e}").into())
    });

    // Regex
    engine.register_fn("regex_is_match", |text: &str, pattern: &str| -> std::result::Result<bool, Box<EvalAltResult>> {
        let re = regex::Regex::new(pattern).map_err(|e| format!("regex_is_match: {e}"))?;
        Ok(re.is_match(text))
    });
    engine.register_fn(
        "regex_find_all",
        |text: &str, pattern: &str| -> std::result::Result<rhai::Array, Box<EvalAltResult>> {
            let re = regex::Regex::new(pattern).map_err(|e| format!("regex_find_all: {e}"))?;
            Ok(re.find_iter(text).map(|m| Dynamic::from(m.as_str().to_string())).collect())
        },
    );
}
