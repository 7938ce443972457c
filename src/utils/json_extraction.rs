//! Extraction of structured content from LLM responses.
//!
//! Collaborator output is untrusted text. This module turns it into typed
//! values through [`Parsed`], which forces every caller to say what it does
//! with a strict parse, a salvaged parse, and a failed parse.
//!
//! # Salvage strategies
//!
//! For JSON payloads, after a strict parse of the whole response fails:
//! 1. JSON inside ```` ```json ```` fenced blocks
//! 2. JSON inside generic fenced blocks
//! 3. Every balanced `{...}` object in the text, largest first, later
//!    occurrences winning ties (reasoning models put the answer last)
//!
//! For program text, a response without fences is taken verbatim; otherwise
//! the largest fenced block is salvaged.
//!
//! # Example
//!
//! ```
//! use autodev::utils::json_extraction::{parse_structured, Parsed};
//! use serde_json::Value;
//!
//! let noisy = "Sure! Here you go: {\"problem\": \"churn\"} Good luck.";
//! let parsed: Parsed<Value> = parse_structured(noisy, |_| true);
//! assert!(parsed.is_fallback());
//! ```

use std::sync::OnceLock;

use regex::Regex;
use serde::de::DeserializeOwned;

/// Outcome of parsing collaborator output into a `T`.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed<T> {
    /// The response was exactly the expected structure.
    Ok(T),
    /// The structure was salvaged from surrounding noise.
    Fallback(T),
    /// Nothing usable was found; carries the raw response.
    Failed(String),
}

impl<T> Parsed<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Parsed::Ok(_))
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Parsed::Fallback(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Parsed::Failed(_))
    }

    /// The parsed value for both the strict and the salvaged case.
    pub fn value(self) -> Option<T> {
        match self {
            Parsed::Ok(v) | Parsed::Fallback(v) => Some(v),
            Parsed::Failed(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Parsed<U> {
        match self {
            Parsed::Ok(v) => Parsed::Ok(f(v)),
            Parsed::Fallback(v) => Parsed::Fallback(f(v)),
            Parsed::Failed(raw) => Parsed::Failed(raw),
        }
    }
}

fn json_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```json\s*\n?([\s\S]*?)\n?```").expect("valid regex"))
}

fn fenced_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"```[A-Za-z0-9_+.\-]*[ \t]*\r?\n([\s\S]*?)```").expect("valid regex")
    })
}

/// Parses `raw` as a `T`, accepting a candidate only if `accept` agrees.
///
/// A strict parse of the trimmed response yields [`Parsed::Ok`]; anything
/// found by the salvage strategies yields [`Parsed::Fallback`].
pub fn parse_structured<T, F>(raw: &str, accept: F) -> Parsed<T>
where
    T: DeserializeOwned,
    F: Fn(&T) -> bool,
{
    let trimmed = raw.trim();

    if let Ok(value) = serde_json::from_str::<T>(trimmed) {
        if accept(&value) {
            return Parsed::Ok(value);
        }
    }

    for candidate in json_candidates(trimmed) {
        if let Ok(value) = serde_json::from_str::<T>(&candidate) {
            if accept(&value) {
                tracing::debug!(chars = candidate.len(), "Salvaged JSON from noisy response");
                return Parsed::Fallback(value);
            }
        }
    }

    Parsed::Failed(raw.to_string())
}

/// Returns every syntactically valid JSON object in `content`, in the order
/// salvage should try them.
pub fn json_candidates(content: &str) -> Vec<String> {
    let mut candidates = Vec::new();

    for caps in json_block_re().captures_iter(content) {
        if let Some(m) = caps.get(1) {
            push_if_valid(&mut candidates, m.as_str().trim());
        }
    }

    for caps in fenced_block_re().captures_iter(content) {
        if let Some(m) = caps.get(1) {
            let block = m.as_str().trim();
            if let Some(start) = block.find('{') {
                if let Some(end) = find_matching_brace(&block[start..]) {
                    push_if_valid(&mut candidates, &block[start..=start + end]);
                }
            }
        }
    }

    let mut objects: Vec<(usize, &str)> = content
        .char_indices()
        .filter(|&(_, c)| c == '{')
        .filter_map(|(start, _)| {
            let end = find_matching_brace(&content[start..])?;
            Some((start, &content[start..=start + end]))
        })
        .filter(|(_, candidate)| serde_json::from_str::<serde_json::Value>(candidate).is_ok())
        .collect();

    // Largest first; among equal sizes the later occurrence wins.
    objects.sort_by(|(pos_a, a), (pos_b, b)| b.len().cmp(&a.len()).then(pos_b.cmp(pos_a)));

    for (_, candidate) in objects {
        if !candidates.iter().any(|c| c == candidate) {
            candidates.push(candidate.to_string());
        }
    }

    candidates
}

fn push_if_valid(candidates: &mut Vec<String>, candidate: &str) {
    if serde_json::from_str::<serde_json::Value>(candidate).is_ok()
        && !candidates.iter().any(|c| c == candidate)
    {
        candidates.push(candidate.to_string());
    }
}

/// Finds the index of the `}` closing the object that starts at `s[0]`.
///
/// String literals and escape sequences are skipped, so braces inside
/// strings do not count.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

/// Parses a program out of a code-generation response.
///
/// - no fences: the trimmed response is the program ([`Parsed::Ok`])
/// - fenced blocks: the largest non-empty block ([`Parsed::Fallback`])
/// - an opening fence the model never closed: everything after it
///   ([`Parsed::Fallback`])
/// - empty or whitespace-only: [`Parsed::Failed`]
pub fn parse_program(raw: &str) -> Parsed<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Parsed::Failed(raw.to_string());
    }

    if !trimmed.contains("```") {
        return Parsed::Ok(trimmed.to_string());
    }

    let largest = fenced_block_re()
        .captures_iter(trimmed)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim()))
        .filter(|block| !block.is_empty())
        .max_by_key(|block| block.len());

    if let Some(block) = largest {
        return Parsed::Fallback(block.to_string());
    }

    // Truncated output: an opening fence with no closing one.
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let body = match after.find('\n') {
            Some(newline) => &after[newline + 1..],
            None => "",
        };
        let body = body.trim_end_matches('`').trim();
        if !body.is_empty() {
            return Parsed::Fallback(body.to_string());
        }
    }

    Parsed::Failed(raw.to_string())
}

/// Returns at most `max_chars` characters from the start of `s`.
pub fn preview(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
