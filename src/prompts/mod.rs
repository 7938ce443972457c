//! Prompt templates and the context they are rendered with.
//!
//! Templates are plain `&'static str` constants with `{placeholder}` slots.
//! A [`PromptContext`] is built per call by the stage that owns the
//! template, so nothing about prompting lives in shared mutable state.
//!
//! ```
//! use autodev::prompts::{render_prompt, PromptContext};
//!
//! let mut ctx = PromptContext::new();
//! ctx.insert("user_prompt", "train a classifier");
//! assert_eq!(render_prompt("Request: {user_prompt}", &ctx), "Request: train a classifier");
//! ```

pub mod templates;

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::Value;

pub use templates::{
    DISCOVERY_SYSTEM, DISCOVERY_USER, PLANNING_SYSTEM, PLANNING_USER, REPAIR_SYSTEM, REPAIR_USER,
    SUMMARIZATION_SYSTEM, SUMMARIZATION_USER, SYNTHESIS_SYSTEM, SYNTHESIS_USER,
};

/// Named values a template is rendered with.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PromptContext {
    values: BTreeMap<String, Value>,
}

impl PromptContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `value` under `key`. Values that fail to serialize are
    /// stored as `null`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Serialize) -> &mut Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.values.insert(key.into(), value);
        self
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A rendered system/user prompt pair.
#[derive(Debug, Clone, PartialEq)]
pub struct StagePrompt {
    pub system: String,
    pub user: String,
}

impl StagePrompt {
    /// Renders both templates against `ctx`.
    pub fn render(system: &str, user: &str, ctx: &PromptContext) -> Self {
        Self {
            system: render_prompt(system, ctx),
            user: render_prompt(user, ctx),
        }
    }
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([a-z][a-z0-9_]*)\}").expect("valid regex"))
}

/// Substitutes every `{key}` in `template` present in `ctx`.
///
/// Strings are inserted verbatim, everything else as pretty JSON.
/// Placeholders with no matching key are left untouched.
pub fn render_prompt(template: &str, ctx: &PromptContext) -> String {
    placeholder_re()
        .replace_all(template, |caps: &Captures<'_>| match ctx.get(&caps[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => {
                serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string())
            }
            None => caps[0].to_string(),
        })
        .into_owned()
}
