//! The polymorphic `context` value bound into the sandbox and never placed
//! in the root LLM's own prompt — only its [`ContextDescriptor`] is.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Caller-supplied value bound as `context` inside the sandbox. Opaque to
/// the [`crate::driver::Driver`]; never mutated once a completion starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Str(String),
    Array(Vec<ContextValue>),
    Object(IndexMap<String, ContextValue>),
}

impl From<String> for ContextValue {
    fn from(s: String) -> Self {
        ContextValue::Str(s)
    }
}

impl From<&str> for ContextValue {
    fn from(s: &str) -> Self {
        ContextValue::Str(s.to_string())
    }
}

impl From<serde_json::Value> for ContextValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => ContextValue::Str(s),
            serde_json::Value::Array(items) => {
                ContextValue::Array(items.into_iter().map(ContextValue::from).collect())
            }
            serde_json::Value::Object(map) => ContextValue::Object(
                map.into_iter().map(|(k, v)| (k, ContextValue::from(v))).collect(),
            ),
            // Scalars with no direct ContextValue variant render as their
            // JSON text, matching the "rendered as text" contract in §3.
            other => ContextValue::Str(other.to_string()),
        }
    }
}

/// The three context type tags the metadata turn reports. Implementations
/// MAY extend this set (spec §9) but none currently do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextTypeTag {
    Str,
    Array,
    Object,
}

/// Metadata computed once per completion and reported to the root LLM via
/// the metadata turn. Never contains raw context content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextDescriptor {
    pub type_tag: ContextTypeTag,
    pub total_chars: usize,
    pub chunk_lengths: Vec<usize>,
}

const MAX_REPORTED_CHUNKS: usize = 100;

impl ContextValue {
    /// Render the context as flat text, the representation whose length
    /// backs `total_chars` and the sandbox's `context.to_string()` behavior.
    pub fn render_text(&self) -> String {
        match self {
            ContextValue::Str(s) => s.clone(),
            ContextValue::Array(items) => {
                items.iter().map(ContextValue::render_text).collect::<Vec<_>>().join("")
            }
            ContextValue::Object(_) => {
                serde_json::to_string(self).unwrap_or_default()
            }
        }
    }

    /// Compute the [`ContextDescriptor`] per spec §9's Open Question
    /// resolution: a bare string reports a single `[totalLength]` chunk; an
    /// array of strings reports one length per element; anything else
    /// (including a keyed mapping, or an array of non-strings) is
    /// serialized and reported as a single chunk. The reported total always
    /// equals `render_text().len()`.
    pub fn describe(&self) -> ContextDescriptor {
        let total_chars = self.render_text().chars().count();

        let (type_tag, chunk_lengths) = match self {
            ContextValue::Str(s) => (ContextTypeTag::Str, vec![s.chars().count()]),
            ContextValue::Array(items) => {
                let all_strings = items.iter().all(|v| matches!(v, ContextValue::Str(_)));
                if all_strings {
                    let lengths = items
                        .iter()
                        .map(|v| v.render_text().chars().count())
                        .collect();
                    (ContextTypeTag::Array, lengths)
                } else {
                    (ContextTypeTag::Array, vec![total_chars])
                }
            }
            ContextValue::Object(_) => (ContextTypeTag::Object, vec![total_chars]),
        };

        ContextDescriptor { type_tag, total_chars, chunk_lengths }
    }
}

impl ContextDescriptor {
    /// Human-readable rendering for the metadata turn, truncating the chunk
    /// list past [`MAX_REPORTED_CHUNKS`] entries with a "+ N more" suffix.
    pub fn render(&self) -> String {
        let type_name = match self.type_tag {
            ContextTypeTag::Str => "string",
            ContextTypeTag::Array => "array",
            ContextTypeTag::Object => "object",
        };

        let mut out = format!(
            "Context type: {type_name}\nTotal length: {total} characters\nChunks ({count}): ",
            type_name = type_name,
            total = self.total_chars,
            count = self.chunk_lengths.len(),
        );

        if self.chunk_lengths.len() > MAX_REPORTED_CHUNKS {
            let shown = &self.chunk_lengths[..MAX_REPORTED_CHUNKS];
            let rest = self.chunk_lengths.len() - MAX_REPORTED_CHUNKS;
            out.push_str(&format!(
                "{} (+ {} more)",
                shown.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(", "),
                rest
            ));
        } else {
            out.push_str(
                &self.chunk_lengths.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(", "),
            );
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_context_has_zero_length_single_chunk() {
        let ctx = ContextValue::from("");
        let descriptor = ctx.describe();
        assert_eq!(descriptor.type_tag, ContextTypeTag::Str);
        assert_eq!(descriptor.total_chars, 0);
        assert_eq!(descriptor.chunk_lengths, vec![0]);
    }

    #[test]
    fn string_array_reports_per_element_lengths() {
        let ctx = ContextValue::Array(vec!["abc".into(), "de".into()]);
        let descriptor = ctx.describe();
        assert_eq!(descriptor.type_tag, ContextTypeTag::Array);
        assert_eq!(descriptor.total_chars, 5);
        assert_eq!(descriptor.chunk_lengths, vec![3, 2]);
    }

    #[test]
    fn object_context_reports_single_serialized_chunk() {
        let json = serde_json::json!({"quarters": [{"q": "Q1", "revenue": 10}]});
        let ctx = ContextValue::from(json);
        let descriptor = ctx.describe();
        assert_eq!(descriptor.type_tag, ContextTypeTag::Object);
        assert_eq!(descriptor.chunk_lengths.len(), 1);
        assert_eq!(descriptor.chunk_lengths[0], descriptor.total_chars);
    }

    #[test]
    fn chunk_list_truncates_past_max_with_suffix() {
        let items: Vec<ContextValue> = (0..150).map(|_| ContextValue::from("x")).collect();
        let ctx = ContextValue::Array(items);
        let rendered = ctx.describe().render();
        assert!(rendered.contains("+ 50 more"));
    }

    #[test]
    fn reported_total_equals_rendered_text_length() {
        let ctx = ContextValue::Array(vec!["hello ".into(), "world".into()]);
        let descriptor = ctx.describe();
        assert_eq!(descriptor.total_chars, ctx.render_text().chars().count());
    }
}
