//! Builds the system prompt, metadata turn, per-iteration user turns, and
//! execution-report formatting the root LLM sees.

use crate::context::ContextDescriptor;
use crate::types::ExecutionReport;

/// Default system prompt. The sandbox is a `rhai` script environment
/// exposing `llm_query`, `llm_query_batched`, `print`, and
/// `give_final_answer`.
pub fn build_system_prompt() -> String {
    r#"You are the root reasoning process of a Recursive Language Model (RLM).

You never see the raw `context` value directly in this prompt — you only see
its size and shape. To inspect or use it, write a program.

HOW THIS WORKS
- Write exactly one ```repl code block per response.
- Code runs in a sandboxed interpreter with these bindings:
    context                         -> the data you were asked about
    print(value, ...)                -> write to stdout, visible next turn
    llm_query(prompt) -> string      -> ask a sub-LLM (it CANNOT see `context`;
                                         pass it whatever text it needs)
    llm_query_batched([p1, p2, ...]) -> array of strings, run concurrently,
                                         results in the same order as the input
    give_final_answer(#{message: "...", data: #{...}})
                                      -> submit your answer and stop iterating
- Code executes immediately; you see stdout/stderr/variable names on your
  next turn, not in this one.
- Store anything you'll need later in a variable — top-level variables
  persist across iterations within one run.
- Call `give_final_answer` only once you are done; earlier calls in the same
  response take priority over later ones.

STRATEGY
1. Explore: print a sample of `context` (its length is in the metadata turn
   above) to see its shape before committing to an approach.
2. For large contexts, slice into chunks and use `llm_query_batched` to
   summarize or search them concurrently rather than one at a time.
3. Combine sub-answers yourself, then call `give_final_answer`.

Begin by examining `context`."#
        .to_string()
}

/// Build the metadata turn (spec §4.2.2): an `assistant`-role message stating
/// the context's type, total length, and per-chunk lengths — never its raw
/// content — plus an optional schema description.
pub fn build_metadata_turn(descriptor: &ContextDescriptor, schema: Option<&str>) -> String {
    let mut out = descriptor.render();
    if let Some(schema) = schema {
        out.push_str("\n\nContext schema:\n");
        out.push_str(schema);
    }
    out
}

/// Build the per-iteration user turn (spec §4.2.3). Embeds the caller's
/// root prompt verbatim, in quotes.
pub fn build_iteration_prompt(root_prompt: &str, iteration: u32) -> String {
    let lead_in = if iteration == 0 {
        "You have not yet interacted with `context`. Start by writing a \
         ```repl block that inspects it before you try to answer anything."
            .to_string()
    } else {
        "Continuing from the interaction history above.".to_string()
    };

    format!(
        "{lead_in}\n\nYour task: \"{root_prompt}\"\n\n\
        Write one ```repl code block that makes progress on this task. \
        Call `give_final_answer` when — and only when — you have the \
        complete answer."
    )
}

/// Build the final-request turn issued once `max_iterations` is exhausted
/// (spec §4.4 step 3).
pub fn build_final_request_prompt() -> String {
    "You are out of iterations. Write one more ```repl block that calls \
     `give_final_answer` with your best answer given everything you've \
     learned so far."
        .to_string()
}

/// Format an [`ExecutionReport`] for the next user turn (spec §4.2,
/// "Execution-report formatting"). Concatenates stdout, stderr, a
/// `REPL variables: [...]` line (names not starting with `_`), and an
/// error hint if present; truncates to `char_budget` with an elision
/// marker. An entirely empty report renders as `No output`.
pub fn format_execution_report(report: &ExecutionReport, char_budget: usize) -> String {
    let mut parts: Vec<String> = Vec::new();

    if !report.stdout.is_empty() {
        parts.push(report.stdout.clone());
    }
    if !report.stderr.is_empty() {
        parts.push(report.stderr.clone());
    }

    let visible_names: Vec<&str> = report
        .locals
        .keys()
        .map(String::as_str)
        .filter(|name| !name.starts_with('_'))
        .collect();
    if !visible_names.is_empty() {
        parts.push(format!("REPL variables: [{}]", visible_names.join(", ")));
    }

    if let Some(error) = &report.error {
        parts.push(format!(
            "{error}\n(This is an error in your code. Read the message, fix the \
             mistake, and try again in your next ```repl block.)"
        ));
    }

    let rendered = parts.join("\n");
    if rendered.is_empty() {
        return "No output".to_string();
    }

    if rendered.chars().count() > char_budget {
        let truncated: String = rendered.chars().take(char_budget).collect();
        let elided = rendered.chars().count() - char_budget;
        format!("{truncated}\n[...{elided} characters truncated...]")
    } else {
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextTypeTag;
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[test]
    fn metadata_turn_includes_schema_when_present() {
        let descriptor = ContextDescriptor {
            type_tag: ContextTypeTag::Str,
            total_chars: 10,
            chunk_lengths: vec![10],
        };
        let turn = build_metadata_turn(&descriptor, Some("{ quarters: array }"));
        assert!(turn.contains("Context type: string"));
        assert!(turn.contains("quarters: array"));
    }

    #[test]
    fn iteration_prompt_embeds_root_prompt_verbatim() {
        let prompt = build_iteration_prompt("What is the password?", 0);
        assert!(prompt.contains("\"What is the password?\""));
        assert!(prompt.contains("not yet interacted"));
    }

    #[test]
    fn later_iteration_prompt_refers_to_history() {
        let prompt = build_iteration_prompt("continue", 3);
        assert!(prompt.contains("Continuing from the interaction history"));
    }

    #[test]
    fn empty_report_renders_as_no_output() {
        let report = ExecutionReport::default();
        assert_eq!(format_execution_report(&report, 20_000), "No output");
    }

    #[test]
    fn report_lists_non_underscore_locals_only() {
        let mut locals = BTreeMap::new();
        locals.insert("visible".to_string(), "1".to_string());
        locals.insert("_hidden".to_string(), "2".to_string());
        let report = ExecutionReport { locals, ..Default::default() };
        let rendered = format_execution_report(&report, 20_000);
        assert!(rendered.contains("REPL variables: [visible]"));
        assert!(!rendered.contains("_hidden"));
    }

    #[test]
    fn error_report_includes_remediation_hint() {
        let report =
            ExecutionReport { error: Some("NameError: x".to_string()), ..Default::default() };
        let rendered = format_execution_report(&report, 20_000);
        assert!(rendered.contains("NameError: x"));
        assert!(rendered.contains("fix the"));
    }

    #[test]
    fn truncates_past_char_budget_with_elision_marker() {
        let report = ExecutionReport { stdout: "x".repeat(100), ..Default::default() };
        let rendered = format_execution_report(&report, 10);
        assert!(rendered.contains("truncated"));
        assert!(rendered.starts_with(&"x".repeat(10)));
    }

    #[test]
    fn execution_time_field_documented_but_unused_in_formatting() {
        let report =
            ExecutionReport { execution_time: Duration::from_millis(5), ..Default::default() };
        assert_eq!(report.execution_time, Duration::from_millis(5));
    }
}
