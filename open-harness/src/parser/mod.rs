//! Extraction of structured tool calls from noisy assistant output.
//!
//! The parser is schema-first: the registered tool names are compiled into
//! an alternation used to locate candidate call sites. Accepted shapes, in
//! priority order:
//!
//! 1. the native `tool_calls` field returned by the transport,
//! 2. a fenced JSON block carrying `{"tool": name, "arguments": {...}}` (or
//!    a list of such objects),
//! 3. a call line `name({...})` / `name args={...}` surrounded by prose,
//! 4. a `<tool_call>...</tool_call>` span.
//!
//! Argument text always goes through the [`repair_json`] pass. Unknown
//! names are fuzzy-matched (edit distance ≤ 2, case-insensitive) against the
//! registry and surfaced as candidates; the loop accepts a candidate only
//! when its arguments validate against the matched tool's schema.

mod repair;

pub use repair::{repair_json, repair_object};

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::llm::LmResponse;
use crate::message::ToolCall;

/// Maximum edit distance accepted by the fuzzy matcher.
const FUZZY_MAX_DISTANCE: usize = 2;

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("fenced-block regex is valid")
});

static TAGGED_SPAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<tool_call>(.*?)</tool_call>").expect("tagged-span regex is valid")
});

/// Generic snake_case identifier, so misspelled names still reach the
/// fuzzy matcher. The compiled site regexes prepend the registered-name
/// alternation, which also covers underscore-free names like `shell`.
const GENERIC_NAME: &str = r"[a-z][a-z0-9]*(?:_[a-z0-9]+)+";

/// A call whose name was corrected by fuzzy matching, pending validation.
#[derive(Debug, Clone)]
pub struct FuzzyCandidate {
    /// The call with the suggested (registered) name substituted in.
    pub call: ToolCall,
    /// The name the model actually emitted.
    pub original: String,
}

/// Everything the parser learned from one assistant response.
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    /// Well-formed calls naming registered tools.
    pub calls: Vec<ToolCall>,
    /// Misspelled calls with a close registered match.
    pub fuzzy: Vec<FuzzyCandidate>,
    /// Assistant text with extracted call sites removed.
    pub narrative: String,
    /// First JSON repair failure, when a candidate site would not parse.
    pub repair_error: Option<String>,
    /// Names with no registered or fuzzy match.
    pub unknown_names: Vec<String>,
    /// Known tools called without required arguments. Populated by the
    /// executor's validation step, not by the parser itself.
    pub missing_args: Vec<(String, Vec<String>)>,
    /// A registered tool name appears in prose but no structured call was
    /// extracted.
    pub prose_suspect: bool,
}

impl ParseOutcome {
    /// Whether the response yielded anything executable (directly or via
    /// a fuzzy candidate).
    #[must_use]
    pub fn has_candidates(&self) -> bool {
        !self.calls.is_empty() || !self.fuzzy.is_empty()
    }
}

/// Schema-first response parser bound to a set of registered tool names.
#[derive(Debug, Clone)]
pub struct ResponseParser {
    names: Vec<String>,
    /// Whole-word alternation over the registered names, for prose detection.
    mention: Option<Regex>,
    /// `name({...})` call sites: registered alternation or generic identifier.
    call_line: Regex,
    /// `name args={...}` call sites.
    args_assign: Regex,
}

impl ResponseParser {
    /// Build a parser over the registered tool names. The names are
    /// compiled into the alternation used to locate candidate call sites.
    #[must_use]
    pub fn new(names: Vec<String>) -> Self {
        let mention = if names.is_empty() {
            None
        } else {
            let alternation: Vec<String> = names.iter().map(|n| regex::escape(n)).collect();
            Regex::new(&format!(r"\b(?:{})\b", alternation.join("|"))).ok()
        };
        let name_pattern = if names.is_empty() {
            GENERIC_NAME.to_string()
        } else {
            let alternation: Vec<String> = names.iter().map(|n| regex::escape(n)).collect();
            format!("(?:{})|{GENERIC_NAME}", alternation.join("|"))
        };
        let call_line = Regex::new(&format!(r"\b({name_pattern})\s*\("))
            .expect("call-line regex is valid");
        let args_assign = Regex::new(&format!(r"\b({name_pattern})\s+args\s*=\s*"))
            .expect("args-assign regex is valid");
        Self {
            names,
            mention,
            call_line,
            args_assign,
        }
    }

    /// Parse one assembled response into calls plus residual narrative.
    #[must_use]
    pub fn parse(&self, response: &LmResponse) -> ParseOutcome {
        let mut outcome = ParseOutcome {
            narrative: response.assistant_text.clone(),
            ..ParseOutcome::default()
        };

        // Shape 1: the transport's structured field is trusted when present.
        if !response.tool_calls.is_empty() {
            for raw in &response.tool_calls {
                let args_text = if raw.arguments.trim().is_empty() {
                    "{}"
                } else {
                    raw.arguments.as_str()
                };
                match repair_object(args_text) {
                    Ok(map) => {
                        let id = if raw.id.is_empty() { next_call_id() } else { raw.id.clone() };
                        self.admit(&mut outcome, id, &raw.name, map);
                    }
                    Err(e) => {
                        debug!(tool = %raw.name, error = %e, "native call arguments failed repair");
                        outcome.repair_error.get_or_insert(e);
                    }
                }
            }
            return outcome;
        }

        let text = response.assistant_text.clone();
        if text.trim().is_empty() {
            return outcome;
        }

        // Shapes 2-4, first producing shape wins.
        let extracted = self
            .extract_fenced(&text, &mut outcome)
            .or_else(|| self.extract_call_lines(&text, &mut outcome))
            .or_else(|| self.extract_tagged(&text, &mut outcome));

        if let Some(spans) = extracted {
            for span in spans {
                outcome.narrative = outcome.narrative.replace(&span, "");
            }
            outcome.narrative = outcome.narrative.trim().to_string();
        } else if let Some(mention) = &self.mention {
            outcome.prose_suspect = mention.is_match(&text);
        }

        outcome
    }

    /// Route a parsed (name, args) pair into calls / fuzzy / unknown.
    fn admit(&self, outcome: &mut ParseOutcome, id: String, name: &str, args: Map<String, Value>) {
        if self.names.iter().any(|n| n == name) {
            outcome.calls.push(ToolCall::new(id, name, args));
        } else if let Some(suggestion) = self.fuzzy_match(name) {
            debug!(original = name, suggestion, "fuzzy tool-name candidate");
            outcome.fuzzy.push(FuzzyCandidate {
                call: ToolCall::new(id, suggestion, args),
                original: name.to_string(),
            });
        } else {
            outcome.unknown_names.push(name.to_string());
        }
    }

    /// Shape 2: fenced JSON blocks. Returns the matched spans when at least
    /// one block held a call-shaped payload.
    fn extract_fenced(&self, text: &str, outcome: &mut ParseOutcome) -> Option<Vec<String>> {
        let mut spans = Vec::new();
        for caps in FENCED_BLOCK.captures_iter(text) {
            let body = caps.get(1)?.as_str();
            if !Self::looks_like_call(body) {
                continue;
            }
            match repair_json(body) {
                Ok(value) => {
                    if self.admit_call_values(outcome, &value) {
                        spans.push(caps.get(0)?.as_str().to_string());
                    }
                }
                Err(e) => {
                    outcome.repair_error.get_or_insert(e);
                    spans.push(caps.get(0)?.as_str().to_string());
                }
            }
        }
        (!spans.is_empty()).then_some(spans)
    }

    /// Shape 3: `name({...})` or `name args={...}` call lines.
    fn extract_call_lines(&self, text: &str, outcome: &mut ParseOutcome) -> Option<Vec<String>> {
        let mut spans = Vec::new();

        for caps in self.call_line.captures_iter(text) {
            let name = caps.get(1)?.as_str();
            if !self.names.iter().any(|n| n == name) && self.fuzzy_match(name).is_none() {
                continue;
            }
            let open = caps.get(0)?.end() - 1;
            let Some(end) = balanced_span(text, open, '(', ')') else {
                continue;
            };
            let inner = &text[open + 1..end - 1];
            match repair_object(if inner.trim().is_empty() { "{}" } else { inner }) {
                Ok(map) => {
                    self.admit(outcome, next_call_id(), name, map);
                    spans.push(text[caps.get(0)?.start()..end].to_string());
                }
                Err(e) => {
                    outcome.repair_error.get_or_insert(e);
                    spans.push(text[caps.get(0)?.start()..end].to_string());
                }
            }
        }

        for caps in self.args_assign.captures_iter(text) {
            let name = caps.get(1)?.as_str();
            if !self.names.iter().any(|n| n == name) && self.fuzzy_match(name).is_none() {
                continue;
            }
            let brace = caps.get(0)?.end();
            if text[brace..].starts_with('{') {
                let Some(end) = balanced_span(text, brace, '{', '}') else {
                    continue;
                };
                match repair_object(&text[brace..end]) {
                    Ok(map) => {
                        self.admit(outcome, next_call_id(), name, map);
                        spans.push(text[caps.get(0)?.start()..end].to_string());
                    }
                    Err(e) => {
                        outcome.repair_error.get_or_insert(e);
                        spans.push(text[caps.get(0)?.start()..end].to_string());
                    }
                }
            }
        }

        (!spans.is_empty()).then_some(spans)
    }

    /// Shape 4: `<tool_call>` spans.
    fn extract_tagged(&self, text: &str, outcome: &mut ParseOutcome) -> Option<Vec<String>> {
        let mut spans = Vec::new();
        for caps in TAGGED_SPAN.captures_iter(text) {
            let body = caps.get(1)?.as_str();
            match repair_json(body) {
                Ok(value) => {
                    if self.admit_call_values(outcome, &value) {
                        spans.push(caps.get(0)?.as_str().to_string());
                    }
                }
                Err(e) => {
                    outcome.repair_error.get_or_insert(e);
                    spans.push(caps.get(0)?.as_str().to_string());
                }
            }
        }
        (!spans.is_empty()).then_some(spans)
    }

    /// Admit a call object or a list of call objects. Returns whether the
    /// value was call-shaped at all.
    fn admit_call_values(&self, outcome: &mut ParseOutcome, value: &Value) -> bool {
        match value {
            Value::Array(items) => {
                let mut any = false;
                for item in items {
                    any |= self.admit_call_values(outcome, item);
                }
                any
            }
            Value::Object(map) => {
                // `tool` is unambiguous; a bare `name` key only counts as a
                // call when an argument key sits beside it.
                let name = map.get("tool").and_then(Value::as_str).or_else(|| {
                    (map.contains_key("arguments") || map.contains_key("args"))
                        .then(|| map.get("name").and_then(Value::as_str))
                        .flatten()
                });
                let Some(name) = name else { return false };
                let args = match map.get("arguments").or_else(|| map.get("args")) {
                    Some(Value::Object(args)) => args.clone(),
                    Some(Value::String(s)) => repair_object(s).unwrap_or_default(),
                    _ => Map::new(),
                };
                self.admit(outcome, next_call_id(), name, args);
                true
            }
            _ => false,
        }
    }

    /// Quick check that a fenced body is a call payload, not plain data.
    fn looks_like_call(body: &str) -> bool {
        body.contains("\"tool\"")
            || body.contains("\"name\"")
            || body.contains("'tool'")
            || body.contains("tool:")
            || body.contains("name:")
    }

    /// Closest registered name within the fuzzy distance, case-insensitive.
    #[must_use]
    pub fn fuzzy_match(&self, name: &str) -> Option<&str> {
        let lowered = name.to_ascii_lowercase();
        let mut best: Option<(usize, &str)> = None;
        for registered in &self.names {
            let distance = levenshtein(&lowered, &registered.to_ascii_lowercase());
            if distance <= FUZZY_MAX_DISTANCE
                && best.is_none_or(|(best_distance, _)| distance < best_distance)
            {
                best = Some((distance, registered));
            }
        }
        best.map(|(_, name)| name)
    }
}

/// Find the end (exclusive) of a balanced `open`..`close` span starting at
/// `open_idx`. String-aware for both quote styles.
fn balanced_span(text: &str, open_idx: usize, open: char, close: char) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.get(open_idx) != Some(&(open as u8)) {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string: Option<u8> = None;
    let mut i = open_idx;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(quote) = in_string {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == quote {
                in_string = None;
            }
        } else if b == b'"' || b == b'\'' {
            in_string = Some(b);
        } else if b == open as u8 {
            depth += 1;
        } else if b == close as u8 {
            depth -= 1;
            if depth == 0 {
                return Some(i + 1);
            }
        }
        i += 1;
    }
    None
}

fn next_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// Classic two-row Levenshtein distance.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}
