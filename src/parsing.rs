//! Extracts `repl`-tagged code blocks from the root LLM's message. The
//! legacy `FINAL(...)`/`FINAL_VAR(...)` text-pattern fallback lives in
//! [`legacy`] for backwards compatibility with older prompting conventions;
//! it is never the primary path — the final answer comes exclusively from
//! the Sandbox's `give_final_answer` binding.

use regex::Regex;
use std::sync::LazyLock;

static CODE_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```repl\n([\s\S]*?)```").expect("invalid regex"));

/// Extract `repl`-tagged fenced code blocks, trimmed, discarding empty
/// payloads. Tolerates arbitrary text between and after blocks; does not
/// validate payload syntax.
pub fn extract_code_blocks(text: &str) -> Vec<String> {
    CODE_BLOCK_RE
        .captures_iter(text)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().trim().to_string()))
        .filter(|s| !s.is_empty())
        .collect()
}

pub mod legacy {
    //! A `FINAL(...)`/`FINAL_VAR(...)` text-pattern scanner, kept as an
    //! opt-in fallback extraction path for prompts that predate the
    //! `give_final_answer` sandbox binding.

    use std::collections::BTreeMap;

    /// Check for a `FINAL(answer)` pattern, without variable resolution.
    pub fn extract_final_answer(text: &str) -> Option<String> {
        extract_final_answer_raw(text, &BTreeMap::new())
    }

    /// Check for `FINAL(answer)` / `FINAL_VAR(name)`, resolving `FINAL_VAR`
    /// against `locals`. Strict about what constitutes a valid call: must
    /// sit at the start of a line, or be preceded by whitespace or a colon;
    /// content that reads as descriptive English prose is rejected in favor
    /// of a later match.
    pub fn extract_final_answer_raw(text: &str, locals: &BTreeMap<String, String>) -> Option<String> {
        let start_marker = "FINAL(";

        let mut search_start = 0;
        while let Some(pos) = text[search_start..].find(start_marker) {
            let start_pos = search_start + pos;

            let valid_position = start_pos == 0 || {
                let prev_char = text[..start_pos].chars().last().unwrap();
                prev_char == '\n' || prev_char.is_whitespace() || prev_char == ':'
            };

            if !valid_position {
                search_start = start_pos + 1;
                continue;
            }

            let content_start = start_pos + start_marker.len();
            let remaining = &text[content_start..];

            let end_pos =
                find_matching_close(remaining, true).or_else(|| find_matching_close(remaining, false));

            if let Some(end) = end_pos {
                let content = text[content_start..content_start + end].trim().to_string();

                if looks_like_prose(&content) {
                    search_start = content_start + end + 1;
                    continue;
                }

                if is_identifier(&content) {
                    if let Some(value) = locals.get(&content) {
                        return Some(value.clone());
                    }
                }

                let content = unescape_string_literal(&content);
                return Some(content);
            }

            search_start = start_pos + 1;
        }

        None
    }

    /// Scan `remaining` for the `)` that balances the implicit opening `(`,
    /// skipping parens inside quoted strings. When `skip_emoticons` is set,
    /// a `)` immediately after a smiley-like character (`:`, `;`, `=`, ...)
    /// does not count as a close.
    fn find_matching_close(remaining: &str, skip_emoticons: bool) -> Option<usize> {
        let mut depth = 1;
        let mut in_string: Option<char> = None;

        for (i, ch) in remaining.char_indices() {
            if let Some(quote) = in_string {
                if ch == quote {
                    let is_escaped = i > 0 && remaining[..i].ends_with('\\');
                    if !is_escaped {
                        in_string = None;
                    }
                }
                continue;
            }

            if ch == '"' || ch == '\'' {
                in_string = Some(ch);
                continue;
            }

            match ch {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        let is_emoticon = skip_emoticons
                            && i > 0
                            && matches!(
                                remaining[..i].chars().last().unwrap(),
                                ':' | ';' | '=' | '8' | 'X' | 'x' | 'D' | 'P' | 'p'
                            );
                        if is_emoticon {
                            depth = 1;
                        } else {
                            return Some(i);
                        }
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn looks_like_prose(text: &str) -> bool {
        let lower = text.to_lowercase();

        if has_code_patterns(text) {
            return false;
        }

        let prose_prefixes = [
            "output from",
            "result of",
            "this is the",
            "this is a",
            "the result",
            "here is",
        ];
        if prose_prefixes.iter().any(|p| lower.starts_with(p)) {
            return true;
        }

        let strong_prose_indicators =
            ["executing code", "execution of", "demonstration of", "example of how"];
        strong_prose_indicators.iter().any(|i| lower.contains(i))
    }

    fn has_code_patterns(text: &str) -> bool {
        let mut in_identifier = false;
        for c in text.chars() {
            if c.is_alphabetic() || c == '_' {
                in_identifier = true;
            } else if c == '(' && in_identifier {
                return true;
            } else if !c.is_alphanumeric() && c != '_' {
                in_identifier = false;
            }
        }
        text.contains('+') || text.contains('*') || text.contains('/') || text.contains('[')
    }

    fn is_identifier(s: &str) -> bool {
        if s.is_empty() {
            return false;
        }
        let mut chars = s.chars();
        let first = chars.next().unwrap();
        if !first.is_alphabetic() && first != '_' {
            return false;
        }
        chars.all(|c| c.is_alphanumeric() || c == '_')
    }

    fn unescape_string_literal(s: &str) -> String {
        let t = s.trim();
        let inner = if (t.starts_with('"') && t.ends_with('"'))
            || (t.starts_with('\'') && t.ends_with('\''))
        {
            &t[1..t.len() - 1]
        } else {
            return s.to_string();
        };
        inner.replace("\\n", "\n").replace("\\t", "\t")
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn simple() {
            assert_eq!(extract_final_answer("The answer is FINAL(42)"), Some("42".to_string()));
        }

        #[test]
        fn nested_parens() {
            let text = "FINAL(The answer is foo(x) + bar(y, z))";
            assert_eq!(
                extract_final_answer(text),
                Some("The answer is foo(x) + bar(y, z)".to_string())
            );
        }

        #[test]
        fn resolves_variable_from_locals() {
            let text = "The result is FINAL(result)";
            let mut locals = BTreeMap::new();
            locals.insert("result".to_string(), "computed_value".to_string());
            assert_eq!(extract_final_answer_raw(text, &locals), Some("computed_value".to_string()));
        }

        #[test]
        fn unresolved_identifier_returns_name_as_is() {
            let text = "FINAL(missing)";
            assert_eq!(
                extract_final_answer_raw(text, &BTreeMap::new()),
                Some("missing".to_string())
            );
        }

        #[test]
        fn literal_string_strips_quotes_and_unescapes() {
            let text = r#"FINAL("line1\nline2")"#;
            assert_eq!(extract_final_answer(text), Some("line1\nline2".to_string()));
        }

        #[test]
        fn rejects_prose_then_finds_valid() {
            let text = "FINAL(Output from executing code)\nFINAL(42)";
            assert_eq!(extract_final_answer(text), Some("42".to_string()));
        }

        #[test]
        fn skips_emoticon_close() {
            let text = "FINAL(answer :) here)";
            assert_eq!(extract_final_answer(text), Some("answer :) here".to_string()));
        }

        #[test]
        fn no_match_returns_none() {
            assert_eq!(extract_final_answer("nothing here"), None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_single_repl_block() {
        let text = "Here's code:\n```repl\nx = 1 + 1\nprint(x)\n```\nmore text";
        let blocks = extract_code_blocks(text);
        assert_eq!(blocks, vec!["x = 1 + 1\nprint(x)".to_string()]);
    }

    #[test]
    fn extracts_multiple_blocks_in_order() {
        let text = "```repl\na = 1\n```\nbetween\n```repl\nb = 2\n```";
        let blocks = extract_code_blocks(text);
        assert_eq!(blocks, vec!["a = 1".to_string(), "b = 2".to_string()]);
    }

    #[test]
    fn ignores_other_languages() {
        let text = "```python\nprint(1)\n```";
        assert!(extract_code_blocks(text).is_empty());
    }

    #[test]
    fn discards_empty_payloads() {
        let text = "```repl\n\n```\n```repl\nx = 1\n```";
        let blocks = extract_code_blocks(text);
        assert_eq!(blocks, vec!["x = 1".to_string()]);
    }

    #[test]
    fn tolerates_no_blocks() {
        assert!(extract_code_blocks("just prose, no code").is_empty());
    }

    #[test]
    fn round_trip_whitespace_insensitive() {
        let payload = "compute()";
        let wrapped = format!("```repl\n  {payload}  \n```");
        let blocks = extract_code_blocks(&wrapped);
        assert_eq!(blocks, vec![payload.to_string()]);
    }
}
