//! Tolerant JSON extraction from generation backend responses.
//!
//! Backends wrap JSON in prose, markdown fences, or reasoning preambles.
//! Extraction tries layered strategies in order:
//!
//! 1. Direct parse of the trimmed content
//! 2. Fenced ```json blocks, then generic ``` blocks
//! 3. Brace/bracket matching anywhere in the content
//!
//! The result is always a tagged variant: callers must handle
//! [`ParseOutcome::Unparseable`] explicitly and can never mistake a
//! failed parse for an empty success.

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Tagged outcome of a JSON extraction attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// Valid JSON was found.
    Parsed(Value),
    /// No valid JSON anywhere; carries the raw text for diagnostics.
    Unparseable(String),
}

impl ParseOutcome {
    /// Whether extraction succeeded.
    pub fn is_parsed(&self) -> bool {
        matches!(self, ParseOutcome::Parsed(_))
    }

    /// The parsed value, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            ParseOutcome::Parsed(v) => Some(v),
            ParseOutcome::Unparseable(_) => None,
        }
    }

    /// Deserializes the parsed value into a concrete type. Type
    /// mismatches degrade to `Unparseable` carrying the JSON text.
    pub fn deserialize<T: DeserializeOwned>(self) -> Result<T, String> {
        match self {
            ParseOutcome::Parsed(value) => {
                let raw = value.to_string();
                serde_json::from_value(value).map_err(|e| format!("{e}: {raw}"))
            }
            ParseOutcome::Unparseable(raw) => Err(format!("no JSON found in response: {raw}")),
        }
    }
}

/// Extracts JSON from a backend response using layered fallbacks.
pub fn extract_json(content: &str) -> ParseOutcome {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return ParseOutcome::Unparseable(String::new());
    }

    // Strategy 1: the whole response is JSON.
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return ParseOutcome::Parsed(value);
    }

    // Strategy 2: fenced code blocks, json-tagged fences first.
    for fence in ["```json", "```"] {
        if let Some(candidate) = extract_fenced_block(trimmed, fence) {
            if let Ok(value) = serde_json::from_str::<Value>(candidate.trim()) {
                return ParseOutcome::Parsed(value);
            }
        }
    }

    // Strategy 3: first balanced object or array anywhere in the text.
    if let Some(candidate) = extract_balanced(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
            return ParseOutcome::Parsed(value);
        }
    }

    ParseOutcome::Unparseable(content.to_string())
}

/// Returns the body of the first code block opened by `fence`.
fn extract_fenced_block<'a>(content: &'a str, fence: &str) -> Option<&'a str> {
    let start = content.find(fence)? + fence.len();
    let rest = &content[start..];
    // Skip the remainder of the fence line (e.g., a language tag).
    let body_start = rest.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &rest[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

/// Finds the first balanced `{...}` or `[...]` span, respecting string
/// literals and escapes.
fn extract_balanced(content: &str) -> Option<String> {
    let start = content.find(['{', '['])?;
    let open = content.as_bytes()[start] as char;
    let close = if open == '{' { '}' } else { ']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in content[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(content[start..start + i + c.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }

    None
}
