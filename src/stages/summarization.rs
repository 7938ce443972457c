//! Summarization: captured program output to a structured summary.
//!
//! The collaborator path is preferred. When it is unreachable or its answer
//! cannot be parsed, [`summarize_locally`] scans the output for
//! `METRIC_NAME: value` lines instead. That path cannot fail, so this stage
//! never aborts a run that has already produced a working program.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{check_cancelled, generate_text, GenerationSettings, Stage, StageKind};
use crate::error::StageError;
use crate::llm::LlmProvider;
use crate::pipeline::PipelineState;
use crate::prompts::{PromptContext, StagePrompt, SUMMARIZATION_SYSTEM, SUMMARIZATION_USER};
use crate::runner::tail_chars;
use crate::utils::lenient::{lenient_text, numeric_map};
use crate::utils::{parse_structured, Parsed};

/// Completion marker the synthesized programs print last.
pub const COMPLETION_MARKER: &str = "EXECUTION_COMPLETE";

/// Output beyond this many trailing characters is not sent to the collaborator.
const MAX_OUTPUT_CHARS: usize = 20_000;

/// Where a summary came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarySource {
    #[default]
    Collaborator,
    /// Collaborator JSON salvaged from surrounding text.
    Salvaged,
    /// Built by local metric extraction.
    Local,
}

/// Terminal output of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    #[serde(default, alias = "summary", deserialize_with = "lenient_text")]
    pub summary_text: String,
    #[serde(default, deserialize_with = "numeric_map")]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub insights: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub recommendations: String,
    #[serde(default)]
    pub source: SummarySource,
}

impl ResultSummary {
    fn is_usable(&self) -> bool {
        !self.summary_text.trim().is_empty() || !self.metrics.is_empty()
    }
}

/// Parses a collaborator summary. Metrics that are not numbers are dropped.
pub fn parse_summary(raw: &str) -> Parsed<ResultSummary> {
    parse_structured(raw, ResultSummary::is_usable)
}

fn metric_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?m)^\s*([A-Za-z][A-Za-z0-9 _\-]{0,39}?)\s*[:=]\s*(-?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?)\s*%?\s*$",
        )
        .expect("valid regex")
    })
}

fn named_metric_res() -> &'static [(&'static str, Regex)] {
    static RES: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            ("accuracy", r"(?i)\baccuracy[:=\s]*(\d+(?:\.\d+)?)"),
            ("f1", r"(?i)\bf1[_\s]*score[:=\s]*(\d+(?:\.\d+)?)"),
            ("precision", r"(?i)\bprecision[:=\s]*(\d+(?:\.\d+)?)"),
            ("recall", r"(?i)\brecall[:=\s]*(\d+(?:\.\d+)?)"),
            ("mae", r"(?i)\bmae[:=\s]*(\d+(?:\.\d+)?)"),
            ("rmse", r"(?i)\brmse[:=\s]*(\d+(?:\.\d+)?)"),
            ("r2", r"(?i)\br2[:=\s]*(-?\d+(?:\.\d+)?)"),
        ]
        .into_iter()
        .map(|(name, pattern)| (name, Regex::new(pattern).expect("valid regex")))
        .collect()
    })
}

/// `"F1 Score"` → `"f1"`, `"Val-Loss"` → `"val_loss"`.
fn normalize_metric_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let out = out.trim_matches('_').to_string();
    match out.as_str() {
        "f1_score" => "f1".to_string(),
        "r2_score" | "r_squared" => "r2".to_string(),
        _ => out,
    }
}

/// Extracts metrics from raw program output. Later lines win.
pub fn extract_metrics(output: &str) -> BTreeMap<String, f64> {
    let mut metrics = BTreeMap::new();

    for caps in metric_line_re().captures_iter(output) {
        let name = normalize_metric_name(&caps[1]);
        if name.is_empty() {
            continue;
        }
        if let Ok(value) = caps[2].parse::<f64>() {
            if value.is_finite() {
                metrics.insert(name, value);
            }
        }
    }

    for (name, re) in named_metric_res() {
        if metrics.contains_key(*name) {
            continue;
        }
        if let Some(value) = re
            .captures(output)
            .and_then(|caps| caps[1].parse::<f64>().ok())
            .filter(|v| v.is_finite())
        {
            metrics.insert((*name).to_string(), value);
        }
    }

    metrics
}

/// Deterministic local summary. Never fails, for any input.
pub fn summarize_locally(output: &str) -> ResultSummary {
    let metrics = extract_metrics(output);
    let completed = output.contains(COMPLETION_MARKER);

    let summary_text = if metrics.is_empty() {
        "No metrics found in program output".to_string()
    } else {
        let listed = metrics
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(", ");
        format!("Extracted {} metric(s): {}", metrics.len(), listed)
    };

    let insights = if completed {
        "Program ran to completion".to_string()
    } else {
        "Program did not print its completion marker".to_string()
    };

    ResultSummary {
        summary_text,
        metrics,
        insights,
        recommendations: "Review the detailed metrics and saved artifacts".to_string(),
        source: SummarySource::Local,
    }
}

pub struct SummarizationStage {
    llm: Arc<dyn LlmProvider>,
    settings: GenerationSettings,
}

impl std::fmt::Debug for SummarizationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummarizationStage")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SummarizationStage {
    pub fn new(llm: Arc<dyn LlmProvider>, settings: GenerationSettings) -> Self {
        Self { llm, settings }
    }

    /// Summarizes `output`, falling back to local extraction.
    pub async fn summarize(&self, output: &str) -> ResultSummary {
        let ctx = PromptContext::new().with("execution_output", tail_chars(output, MAX_OUTPUT_CHARS));
        let prompt = StagePrompt::render(SUMMARIZATION_SYSTEM, SUMMARIZATION_USER, &ctx);

        let raw = match generate_text(
            self.llm.as_ref(),
            &self.settings,
            prompt,
            StageKind::Summarization,
        )
        .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Summary collaborator failed, using local extraction");
                return summarize_locally(output);
            }
        };

        match parse_summary(&raw) {
            Parsed::Ok(summary) => summary,
            Parsed::Fallback(mut summary) => {
                warn!(stage = "summarization", "Summary salvaged from non-JSON response");
                summary.source = SummarySource::Salvaged;
                summary
            }
            Parsed::Failed(_) => {
                warn!(stage = "summarization", "Unparseable summary, using local extraction");
                summarize_locally(output)
            }
        }
    }
}

#[async_trait]
impl Stage for SummarizationStage {
    fn kind(&self) -> StageKind {
        StageKind::Summarization
    }

    async fn apply(
        &self,
        state: &mut PipelineState,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        check_cancelled(cancel)?;
        let output = state.execution_result()?.stdout.clone();
        let summary = self.summarize(&output).await;
        info!(metrics = summary.metrics.len(), source = ?summary.source, "Summary ready");
        state.summary = Some(summary);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::stages::testing::ScriptedLlm;

    const OUTPUT: &str = "=== Training ===\nfitting...\nACCURACY: 0.93\nF1 Score: 0.91\nprecision = 0.9\nEXECUTION_COMPLETE\n";

    #[test]
    fn test_extract_metrics_from_lines() {
        let metrics = extract_metrics(OUTPUT);
        assert_eq!(metrics["accuracy"], 0.93);
        assert_eq!(metrics["f1"], 0.91);
        assert_eq!(metrics["precision"], 0.9);
        assert_eq!(metrics.len(), 3);
    }

    #[test]
    fn test_extract_inline_named_metrics() {
        let metrics = extract_metrics("Validation done - rmse 12.5, r2 0.71 (holdout)");
        assert_eq!(metrics["rmse"], 12.5);
        assert_eq!(metrics["r2"], 0.71);
    }

    #[test]
    fn test_later_lines_win() {
        let metrics = extract_metrics("loss: 0.9\nloss: 0.2\n");
        assert_eq!(metrics["loss"], 0.2);
    }

    #[test]
    fn test_local_summary_never_fails() {
        for input in ["", "\u{0}\u{7f}garbage::::", "{{{{", "accuracy: NaN", "é: 1e999"] {
            let summary = summarize_locally(input);
            assert_eq!(summary.source, SummarySource::Local);
            assert!(!summary.summary_text.is_empty());
            assert!(summary.metrics.values().all(|v| v.is_finite()));
        }
        assert!(summarize_locally("").metrics.is_empty());
    }

    #[test]
    fn test_normalize_metric_name() {
        assert_eq!(normalize_metric_name("F1 Score"), "f1");
        assert_eq!(normalize_metric_name("Val-Loss "), "val_loss");
        assert_eq!(normalize_metric_name("R2_SCORE"), "r2");
    }

    #[test]
    fn test_parse_summary_tolerates_shapes() {
        let raw = r#"{"summary": "good", "metrics": {"accuracy": "0.9", "notes": "high"},
                      "insights": ["a", "b"], "recommendations": "more data"}"#;
        let summary = parse_summary(raw).value().unwrap();
        assert_eq!(summary.summary_text, "good");
        assert_eq!(summary.metrics.len(), 1);
        assert_eq!(summary.insights, "a\nb");
    }

    #[tokio::test]
    async fn test_collaborator_summary_is_used() {
        let llm = Arc::new(ScriptedLlm::new([
            r#"{"summary": "Strong baseline", "metrics": {"accuracy": 0.93}, "insights": "x", "recommendations": "y"}"#,
        ]));
        let stage = SummarizationStage::new(llm, GenerationSettings::default());
        let summary = stage.summarize(OUTPUT).await;
        assert_eq!(summary.source, SummarySource::Collaborator);
        assert_eq!(summary.summary_text, "Strong baseline");
    }

    #[tokio::test]
    async fn test_garbled_collaborator_falls_back() {
        let llm = Arc::new(ScriptedLlm::new(["I think it went well?"]));
        let stage = SummarizationStage::new(llm, GenerationSettings::default());
        let summary = stage.summarize(OUTPUT).await;
        assert_eq!(summary.source, SummarySource::Local);
        assert_eq!(summary.metrics["accuracy"], 0.93);
    }

    #[tokio::test]
    async fn test_collaborator_error_falls_back() {
        let llm = Arc::new(ScriptedLlm::failing(LlmError::EmptyResponse));
        let stage = SummarizationStage::new(llm, GenerationSettings::default());
        let summary = stage.summarize("").await;
        assert_eq!(summary.source, SummarySource::Local);
        assert!(summary.metrics.is_empty());
    }
}
