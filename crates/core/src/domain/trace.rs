use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::tool::ToolName;

/// Structured failure recorded in place of a tool output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub code: String,
    pub error: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Output(Value),
    Error(ToolFailure),
}

/// One completed tool invocation. Entries are immutable once recorded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub sequence: u32,
    pub tool_name: ToolName,
    pub input: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolFailure>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ToolCall {
    pub fn new(
        sequence: u32,
        tool_name: ToolName,
        input: Map<String, Value>,
        outcome: ToolOutcome,
        started_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Self {
        let (output, error) = match outcome {
            ToolOutcome::Output(value) => (Some(value), None),
            ToolOutcome::Error(failure) => (None, Some(failure)),
        };
        Self { sequence, tool_name, input, output, error, started_at, duration_ms }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Turn-level outcome that did not come from a tool, such as a login step
/// refusal or a guardrail denial.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceDiagnostic {
    pub stage: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Ordered record of the tool calls a single turn performed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnTrace {
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<TraceDiagnostic>,
}

impl TurnTrace {
    pub fn note(&mut self, stage: &str, code: &str, detail: Option<String>) {
        self.diagnostics.push(TraceDiagnostic {
            stage: stage.to_string(),
            code: code.to_string(),
            detail,
        });
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.diagnostics.iter().any(|diagnostic| diagnostic.code == code)
            || self.failures().any(|call| call.error.as_ref().is_some_and(|failure| failure.code == code))
    }

    pub fn record(&mut self, call: ToolCall) {
        self.tool_calls.push(call);
    }

    pub fn next_sequence(&self) -> u32 {
        u32::try_from(self.tool_calls.len()).unwrap_or(u32::MAX).saturating_add(1)
    }

    pub fn last_output(&self, tool_name: ToolName) -> Option<&Value> {
        self.tool_calls
            .iter()
            .rev()
            .find(|call| call.tool_name == tool_name)
            .and_then(|call| call.output.as_ref())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ToolCall> {
        self.tool_calls.iter().filter(|call| !call.succeeded())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::{json, Map};

    use super::{ToolCall, ToolFailure, ToolOutcome, TurnTrace};
    use crate::domain::tool::ToolName;

    #[test]
    fn serialises_with_camel_case_and_exclusive_output_or_error() {
        let call = ToolCall::new(
            1,
            ToolName::VectorSearch,
            Map::new(),
            ToolOutcome::Error(ToolFailure {
                code: "tool_execution_error".to_string(),
                error: "index offline".to_string(),
            }),
            Utc::now(),
            12,
        );

        let value = serde_json::to_value(&call).unwrap_or_default();
        assert_eq!(value["toolName"], "vector_search");
        assert_eq!(value["durationMs"], 12);
        assert_eq!(value["error"]["error"], "index offline");
        assert!(value.get("output").is_none());
    }

    #[test]
    fn last_output_prefers_latest_successful_call() {
        let mut trace = TurnTrace::default();
        trace.record(ToolCall::new(
            trace.next_sequence(),
            ToolName::DataAccess,
            Map::new(),
            ToolOutcome::Output(json!({"product_id": "p-1"})),
            Utc::now(),
            1,
        ));
        trace.record(ToolCall::new(
            trace.next_sequence(),
            ToolName::AnalyticsData,
            Map::new(),
            ToolOutcome::Output(json!({"avg": 10})),
            Utc::now(),
            1,
        ));

        assert_eq!(trace.tool_calls[1].sequence, 2);
        assert_eq!(trace.last_output(ToolName::DataAccess), Some(&json!({"product_id": "p-1"})));
        assert_eq!(trace.failures().count(), 0);
        assert!(serde_json::to_value(&trace).unwrap_or_default().get("diagnostics").is_none());
    }

    #[test]
    fn diagnostics_serialise_alongside_tool_calls() {
        let mut trace = TurnTrace::default();
        trace.note("guardrail", "supplier_only_intent", Some("login_prompt".to_string()));

        assert!(trace.has_code("supplier_only_intent"));
        assert!(!trace.has_code("validation_error"));
        let value = serde_json::to_value(&trace).unwrap_or_default();
        assert_eq!(value["toolCalls"], json!([]));
        assert_eq!(value["diagnostics"][0]["stage"], "guardrail");
        assert_eq!(value["diagnostics"][0]["detail"], "login_prompt");
    }
}
