//! Tolerant JSON repair for weak-model output.
//!
//! Local models routinely emit almost-JSON: single quotes, Python literals,
//! unquoted keys, `key=value` kwargs, trailing commas, unbalanced braces.
//! The repair pass normalizes those shapes and then hands the result to
//! serde. It never invents structure: a text that cannot be coerced into a
//! value comes back as an error carrying the decoder message.

use serde_json::Value;

/// Parse `input` as JSON, applying the repair pass when strict parsing fails.
pub fn repair_json(input: &str) -> Result<Value, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty JSON text".to_string());
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    let mut text = normalize(trimmed);
    text = strip_trailing_commas(&text);
    text = balance_brackets(&text);

    serde_json::from_str::<Value>(&text).map_err(|e| format!("after repair: {e}"))
}

/// Repair `input` and require a JSON object (the shape of an argument map).
pub fn repair_object(input: &str) -> Result<serde_json::Map<String, Value>, String> {
    match repair_json(input)? {
        Value::Object(map) => Ok(map),
        other => Err(format!("expected a JSON object, got {}", kind_of(&other))),
    }
}

const fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Character-level normalization: single quotes → double quotes, Python
/// literals → JSON literals, unquoted keys and `key=` kwargs → quoted keys,
/// bare-word values → quoted strings. Adds outer braces when the text looks
/// like a brace-less kwargs list.
fn normalize(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 16);
    let mut i = 0;
    let mut expecting_value = false;

    // A kwargs list without braces ("path='a', find='b'") gets wrapped.
    let needs_wrap = !matches!(chars.first(), Some('{' | '['));
    if needs_wrap {
        out.push('{');
        // Top level of a wrapped kwargs list starts at key position.
    }

    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' => {
                let (string, next) = consume_string(&chars, i, '"');
                out.push_str(&string);
                i = next;
                expecting_value = false;
            }
            '\'' => {
                let (string, next) = consume_string(&chars, i, '\'');
                out.push_str(&string);
                i = next;
                expecting_value = false;
            }
            ':' => {
                out.push(':');
                expecting_value = true;
                i += 1;
            }
            '{' | '[' | ',' => {
                out.push(c);
                expecting_value = c == '[';
                i += 1;
            }
            '}' | ']' => {
                out.push(c);
                expecting_value = false;
                i += 1;
            }
            c if c.is_whitespace() => {
                out.push(c);
                i += 1;
            }
            c if c.is_alphabetic() || c == '_' => {
                let (token, next) = consume_bare_token(&chars, i);
                let after = skip_ws(&chars, next);
                let follower = chars.get(after).copied();
                if matches!(follower, Some(':')) {
                    // Unquoted key.
                    out.push('"');
                    out.push_str(&token);
                    out.push('"');
                    i = next;
                } else if matches!(follower, Some('=')) && chars.get(after + 1) != Some(&'=') {
                    // Python kwargs: key=value.
                    out.push('"');
                    out.push_str(&token);
                    out.push_str("\":");
                    i = after + 1;
                    expecting_value = true;
                } else {
                    // A bare value token.
                    match token.as_str() {
                        "true" | "false" | "null" => out.push_str(&token),
                        "True" => out.push_str("true"),
                        "False" => out.push_str("false"),
                        "None" => out.push_str("null"),
                        _ if expecting_value => {
                            out.push('"');
                            out.push_str(&token);
                            out.push('"');
                        }
                        _ => out.push_str(&token),
                    }
                    i = next;
                    expecting_value = false;
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    if needs_wrap {
        out.push('}');
    }
    out
}

/// Consume a quoted string starting at `start`, returning its double-quoted
/// JSON form and the index after the closing quote.
fn consume_string(chars: &[char], start: usize, quote: char) -> (String, usize) {
    let mut out = String::from('"');
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' && i + 1 < chars.len() {
            let next = chars[i + 1];
            // Keep valid escapes; a single-quote escape is unnecessary in JSON.
            if quote == '\'' && next == '\'' {
                out.push('\'');
            } else {
                out.push('\\');
                out.push(next);
            }
            i += 2;
            continue;
        }
        if c == quote {
            i += 1;
            break;
        }
        if c == '"' && quote == '\'' {
            out.push_str("\\\"");
        } else {
            out.push(c);
        }
        i += 1;
    }
    out.push('"');
    (out, i)
}

fn consume_bare_token(chars: &[char], start: usize) -> (String, usize) {
    let mut out = String::new();
    let mut i = start;
    while i < chars.len() {
        let c = chars[i];
        if c.is_alphanumeric() || matches!(c, '_' | '.' | '/' | '-') {
            out.push(c);
            i += 1;
        } else {
            break;
        }
    }
    (out, i)
}

fn skip_ws(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    i
}

/// Remove commas that directly precede a closing brace or bracket.
fn strip_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if c == '\\' && i + 1 < chars.len() {
                out.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            ',' => {
                let next = skip_ws(&chars, i + 1);
                if matches!(chars.get(next), Some('}' | ']')) {
                    i += 1; // drop the comma
                } else {
                    out.push(c);
                    i += 1;
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Fix mismatched outer braces by bracket counting: append missing closers
/// in LIFO order, drop unmatched closers.
fn balance_brackets(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if c == '\\' {
                if let Some(&next) = chars.peek() {
                    out.push(next);
                    chars.next();
                }
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                stack.push('}');
                out.push(c);
            }
            '[' => {
                stack.push(']');
                out.push(c);
            }
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                    out.push(c);
                }
                // An unmatched closer is dropped.
            }
            _ => out.push(c),
        }
    }

    if in_string {
        out.push('"');
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}
