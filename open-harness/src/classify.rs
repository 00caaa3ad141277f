//! Failure classification for LM turns and tool outcomes.
//!
//! Every failing turn receives exactly one [`FailureClass`]. The classifier
//! is rule-based and total: the rules are evaluated top-down and the first
//! match wins. The class drives the compensation pipeline's repair choice.

use serde::{Deserialize, Serialize};

use crate::llm::LmError;
use crate::message::ToolResult;
use crate::parser::ParseOutcome;

/// Closed set of failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// A candidate call site was found but JSON repair failed.
    MalformedJson,
    /// Valid JSON naming a tool that is not registered (no fuzzy hit).
    WrongToolName,
    /// Known tool called without its required arguments.
    MissingArgs,
    /// No assistant text and no tool calls.
    EmptyResponse,
    /// A recognizable call buried in prose that the structured extractors missed.
    ProseWrapped,
    /// A tool ran and returned non-ok.
    ToolExecution,
    /// The policy engine rejected the call.
    PolicyViolation,
    /// Connection failure, 5xx, or malformed response envelope.
    Transport,
    /// The request exceeded its deadline.
    Timeout,
    /// HTTP 429 or a rate-limit lexicon match.
    RateLimited,
}

impl FailureClass {
    /// Stable string form, used in events and summaries.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedJson => "malformed_json",
            Self::WrongToolName => "wrong_tool_name",
            Self::MissingArgs => "missing_args",
            Self::EmptyResponse => "empty_response",
            Self::ProseWrapped => "prose_wrapped",
            Self::ToolExecution => "tool_execution",
            Self::PolicyViolation => "policy_violation",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure: the class plus free-form detail for prompts and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// The failure class.
    pub class: FailureClass,
    /// Human-readable detail (decoder error, offending name, HTTP status...).
    pub detail: String,
}

impl Failure {
    /// Create a new failure.
    #[must_use]
    pub fn new(class: FailureClass, detail: impl Into<String>) -> Self {
        Self {
            class,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class, self.detail)
    }
}

/// Classify the outcome of parsing an assistant response.
///
/// Returns `None` when the response is usable: either it carries at least
/// one well-formed call, or it is a plain text answer.
#[must_use]
pub fn classify_response(assistant_text: &str, outcome: &ParseOutcome) -> Option<Failure> {
    if assistant_text.trim().is_empty() && outcome.calls.is_empty() && outcome.fuzzy.is_empty() {
        return Some(Failure::new(FailureClass::EmptyResponse, "no text and no tool calls"));
    }
    if !outcome.calls.is_empty() || !outcome.fuzzy.is_empty() {
        return None;
    }
    if let Some(err) = &outcome.repair_error {
        return Some(Failure::new(FailureClass::MalformedJson, err.clone()));
    }
    if let Some(name) = outcome.unknown_names.first() {
        return Some(Failure::new(
            FailureClass::WrongToolName,
            format!("unknown tool '{name}'"),
        ));
    }
    if let Some((tool, missing)) = outcome.missing_args.first() {
        return Some(Failure::new(
            FailureClass::MissingArgs,
            format!("tool '{tool}' missing required argument(s): {}", missing.join(", ")),
        ));
    }
    if outcome.prose_suspect {
        return Some(Failure::new(
            FailureClass::ProseWrapped,
            "a tool name appears in prose but no structured call was extracted",
        ));
    }
    // Plain text answer: not a failure.
    None
}

/// Classify an LM transport-level error.
#[must_use]
pub fn classify_lm_error(err: &LmError) -> Failure {
    match err {
        LmError::Timeout { .. } => Failure::new(FailureClass::Timeout, err.to_string()),
        LmError::RateLimited { .. } => Failure::new(FailureClass::RateLimited, err.to_string()),
        LmError::Transport { .. } | LmError::Protocol { .. } => {
            Failure::new(FailureClass::Transport, err.to_string())
        }
    }
}

/// Classify a completed tool result. `None` when the tool succeeded.
#[must_use]
pub fn classify_tool_result(result: &ToolResult) -> Option<Failure> {
    if result.ok {
        return None;
    }
    if result.payload.starts_with("policy:") {
        return Some(Failure::new(FailureClass::PolicyViolation, result.payload.clone()));
    }
    Some(Failure::new(FailureClass::ToolExecution, result.payload.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ParseOutcome;

    fn empty_outcome() -> ParseOutcome {
        ParseOutcome::default()
    }

    #[test]
    fn test_empty_response() {
        let failure = classify_response("  ", &empty_outcome()).unwrap();
        assert_eq!(failure.class, FailureClass::EmptyResponse);
    }

    #[test]
    fn test_plain_answer_is_not_a_failure() {
        assert!(classify_response("the tests now pass", &empty_outcome()).is_none());
    }

    #[test]
    fn test_malformed_beats_unknown() {
        let mut outcome = empty_outcome();
        outcome.repair_error = Some("unexpected token".into());
        outcome.unknown_names.push("read_fiel".into());
        let failure = classify_response("x", &outcome).unwrap();
        assert_eq!(failure.class, FailureClass::MalformedJson);
    }

    #[test]
    fn test_policy_payload_classifies_as_violation() {
        let result = ToolResult {
            call_id: "c1".into(),
            ok: false,
            payload: "policy: shell budget exceeded".into(),
            elapsed_ms: 0,
            truncation_note: None,
        };
        let failure = classify_tool_result(&result).unwrap();
        assert_eq!(failure.class, FailureClass::PolicyViolation);
    }

    #[test]
    fn test_every_failing_shape_gets_one_class() {
        // Classifier totality over the parse-level shapes.
        let shapes: Vec<(String, ParseOutcome)> = vec![
            (String::new(), empty_outcome()),
            ("x".into(), {
                let mut o = empty_outcome();
                o.repair_error = Some("bad".into());
                o
            }),
            ("x".into(), {
                let mut o = empty_outcome();
                o.unknown_names.push("frobnicate".into());
                o
            }),
            ("x".into(), {
                let mut o = empty_outcome();
                o.missing_args.push(("read_file".into(), vec!["path".into()]));
                o
            }),
            ("call read_file on a.py please".into(), {
                let mut o = empty_outcome();
                o.prose_suspect = true;
                o
            }),
        ];
        for (text, outcome) in &shapes {
            let failure = classify_response(text, outcome);
            assert!(failure.is_some(), "shape must classify: {text:?}");
        }
    }
}
