//! Accounting/Trace (spec §4.5, §6): a typed event stream plus the usage
//! bookkeeping the Driver aggregates across root and sub calls. New module —
//! the teacher tracked only a flat `Vec<RlmIteration>` with no event stream.

use crate::types::{SubLlmCallRecord, Usage};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceEventType {
    IterationStart,
    LlmQueryStart,
    LlmQueryEnd,
    CodeExecutionStart,
    CodeExecutionEnd,
    FinalAnswer,
}

/// Event-specific data. Prompts/responses/code/errors are carried here;
/// raw context content never is (spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TraceEventPayload {
    Prompt { prompt: String },
    Response { response: String, error: Option<String> },
    Code { code: String },
    ExecutionResult { formatted_report: String, error: Option<String> },
    Answer { message: String },
    None,
}

/// `{ type, timestamp, iteration?, payload }` (spec §3). `timestamp` is
/// stored as an offset from the completion's start so the struct stays
/// serializable without pinning to wall-clock time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub event_type: TraceEventType,
    #[serde(with = "duration_millis")]
    pub timestamp: Duration,
    pub iteration: Option<u32>,
    pub payload: TraceEventPayload,
}

/// Monotonic anchor a completion uses to stamp every [`TraceEvent`] it
/// emits; guarantees non-decreasing timestamps by construction (each call
/// reads `Instant::now()` strictly after the previous event was built).
pub struct TraceClock {
    start: Instant,
}

impl TraceClock {
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn event(
        &self,
        event_type: TraceEventType,
        iteration: Option<u32>,
        payload: TraceEventPayload,
    ) -> TraceEvent {
        TraceEvent { event_type, timestamp: self.elapsed(), iteration, payload }
    }
}

/// Tracks root-call count, sub-call count, and token usage in one place so
/// the `totalCalls == rootCalls + subCalls` invariant (spec §3/§8) can't
/// drift between call sites.
#[derive(Debug, Default)]
pub struct UsageAccumulator {
    root_calls: u32,
    sub_calls: u32,
    token_usage: Usage,
}

impl UsageAccumulator {
    pub fn record_root_call(&mut self, usage: Usage) {
        self.root_calls += 1;
        self.token_usage.add(&usage);
    }

    pub fn record_sub_calls(&mut self, records: &[SubLlmCallRecord]) {
        self.sub_calls += records.len() as u32;
        for record in records {
            self.token_usage.add(&record.usage);
        }
    }

    pub fn total_calls(&self) -> u32 {
        self.root_calls + self.sub_calls
    }

    pub fn root_calls(&self) -> u32 {
        self.root_calls
    }

    pub fn sub_calls(&self) -> u32 {
        self.sub_calls
    }

    pub fn token_usage(&self) -> Usage {
        self.token_usage
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u128(duration.as_millis())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_calls_equals_root_plus_sub() {
        let mut acc = UsageAccumulator::default();
        acc.record_root_call(Usage::new(10, 5));
        acc.record_sub_calls(&[
            SubLlmCallRecord {
                prompt: "a".into(),
                response: "b".into(),
                usage: Usage::new(1, 1),
                duration: Duration::from_millis(1),
                model_override: None,
            },
            SubLlmCallRecord {
                prompt: "c".into(),
                response: "d".into(),
                usage: Usage::new(2, 2),
                duration: Duration::from_millis(1),
                model_override: None,
            },
        ]);
        assert_eq!(acc.total_calls(), acc.root_calls() + acc.sub_calls());
        assert_eq!(acc.root_calls(), 1);
        assert_eq!(acc.sub_calls(), 2);
        assert_eq!(acc.token_usage().total_tokens, 15 + 2 + 4);
    }

    #[test]
    fn clock_events_are_monotonic_non_decreasing() {
        let clock = TraceClock::start();
        let e1 = clock.event(TraceEventType::IterationStart, Some(0), TraceEventPayload::None);
        let e2 = clock.event(TraceEventType::LlmQueryStart, Some(0), TraceEventPayload::None);
        assert!(e2.timestamp >= e1.timestamp);
    }

    #[test]
    fn trace_event_serializes_without_raw_context() {
        let clock = TraceClock::start();
        let event = clock.event(
            TraceEventType::FinalAnswer,
            None,
            TraceEventPayload::Answer { message: "42".to_string() },
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("42"));
        assert!(json.contains("final_answer"));
    }
}
