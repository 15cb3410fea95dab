//! The analytical-agent contract.
//!
//! Agents are external collaborators: the engine never looks inside them, it
//! only calls [`AnalysisAgent::analyze`] during the fan-out stage and
//! [`AnalysisAgent::debate_turn`] during the debate. Implementations usually
//! wrap an LLM client plus domain prompts, but anything that produces an
//! [`AgentReport`] works — tests use scripted mocks.
//!
//! Agent identity is normalized to a canonical lowercase key at the only two
//! places ids enter the engine (selection and invocation). Downstream state
//! is keyed by the canonical id, so duplicates differing only in case cannot
//! produce phantom reports.

use crate::consilium::classifier::Classification;
use crate::consilium::prefetch::PrefetchFact;
use crate::consilium::retrieval::Snippet;
use crate::consilium::state::Query;
use async_trait::async_trait;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

/// Result alias for agent-facing operations.
pub type AgentResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// Canonical form of an agent id: lowercase, punctuation collapsed to single
/// underscores.
///
/// # Example
///
/// ```rust
/// use consilium::consilium::agent::canonical_agent_id;
///
/// assert_eq!(canonical_agent_id("Macro-Economist"), "macro_economist");
/// assert_eq!(canonical_agent_id("  Labor  Analyst "), "labor_analyst");
/// assert_eq!(canonical_agent_id("ECONOMIST"), "economist");
/// ```
pub fn canonical_agent_id(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_separator = false;
    for c in raw.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_separator && !out.is_empty() {
                out.push('_');
            }
            pending_separator = false;
            out.push(c);
        } else {
            pending_separator = true;
        }
    }
    out
}

/// A quoted passage backing a claim.
#[derive(Debug, Clone, PartialEq)]
pub struct Citation {
    /// Quoted text from the source.
    pub quote: String,
    /// Stable connector or corpus id.
    pub source_id: String,
    /// Request id under which the source was fetched, when known.
    pub query_id: Option<String>,
}

/// One analytical finding inside a report.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub text: String,
    pub confidence: f32,
    pub warnings: Vec<String>,
}

/// The structured output of one agent's analysis.
#[derive(Debug, Clone)]
pub struct AgentReport {
    /// Canonical agent id (the engine normalizes on ingestion).
    pub agent_id: String,
    /// Narrative analysis text.
    pub narrative: String,
    /// Overall confidence in `[0, 1]`.
    pub confidence: f32,
    pub findings: Vec<Finding>,
    pub warnings: Vec<String>,
    pub citations: Vec<Citation>,
    /// Free-form structured values. Numeric entries under metric-named keys
    /// feed the debate's contradiction detector.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentReport {
    pub fn new(agent_id: impl Into<String>, narrative: impl Into<String>, confidence: f32) -> Self {
        Self {
            agent_id: canonical_agent_id(&agent_id.into()),
            narrative: narrative.into(),
            confidence,
            findings: Vec::new(),
            warnings: Vec::new(),
            citations: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// The placeholder report recorded when an agent times out or fails:
    /// "no result", zero confidence, one warning naming the cause.
    pub fn empty(agent_id: impl Into<String>, warning: impl Into<String>) -> Self {
        let mut report = Self::new(agent_id, "no result", 0.0);
        report.warnings.push(warning.into());
        report
    }

    pub fn with_finding(mut self, text: impl Into<String>, confidence: f32) -> Self {
        self.findings.push(Finding {
            text: text.into(),
            confidence,
            warnings: Vec::new(),
        });
        self
    }

    pub fn with_citation(mut self, quote: impl Into<String>, source_id: impl Into<String>) -> Self {
        self.citations.push(Citation {
            quote: quote.into(),
            source_id: source_id.into(),
            query_id: None,
        });
        self
    }

    pub fn with_metric(mut self, metric: impl Into<String>, value: f64) -> Self {
        self.metadata
            .insert(metric.into(), serde_json::json!(value));
        self
    }

    /// True for timeout/failure placeholders.
    pub fn is_empty_result(&self) -> bool {
        self.confidence == 0.0 && self.narrative == "no result"
    }

    /// Numeric metadata entries, interpreted as (metric name, value) claims.
    pub fn metric_values(&self) -> Vec<(String, f64)> {
        let mut values: Vec<(String, f64)> = self
            .metadata
            .iter()
            .filter_map(|(k, v)| v.as_f64().map(|n| (k.clone(), n)))
            .collect();
        values.sort_by(|a, b| a.0.cmp(&b.0));
        values
    }

    /// First citation's source id, used as provenance for metric claims.
    pub fn primary_source(&self) -> Option<&str> {
        self.citations.first().map(|c| c.source_id.as_str())
    }
}

/// Everything an agent may read while analysing. Shared snapshots only: the
/// engine retains exclusive ownership of the underlying state.
#[derive(Clone)]
pub struct AgentContext {
    pub query: Query,
    pub classification: Classification,
    pub facts: Arc<Vec<PrefetchFact>>,
    pub snippets: Arc<Vec<Snippet>>,
}

/// One entry of the debate transcript shown to an agent before its turn.
#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub speaker: String,
    pub text: String,
}

/// The moderator's ask for one debate turn.
#[derive(Debug, Clone)]
pub struct DebatePrompt {
    /// Debate phase tag, e.g. `"opening"`, `"cross_examination"`.
    pub phase: String,
    /// What the moderator wants from this turn.
    pub instruction: String,
    /// The original question, restated on every turn so agents cannot drift.
    pub question: String,
    /// Recent turns, oldest first.
    pub transcript_tail: Vec<TranscriptEntry>,
}

/// An analytical agent. External collaborator; may suspend on LLM or API
/// calls inside either method.
#[async_trait]
pub trait AnalysisAgent: Send + Sync {
    /// Raw identity as registered. The engine canonicalizes before use.
    fn id(&self) -> &str;

    /// Human-readable display name.
    fn name(&self) -> &str;

    /// Produce the agent's full analysis of the query.
    async fn analyze(&self, ctx: &AgentContext) -> AgentResult<AgentReport>;

    /// Produce one debate utterance for the given prompt.
    async fn debate_turn(&self, prompt: &DebatePrompt) -> AgentResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_id_lowercases_and_collapses_punctuation() {
        assert_eq!(canonical_agent_id("Economist"), "economist");
        assert_eq!(canonical_agent_id("macro economist"), "macro_economist");
        assert_eq!(canonical_agent_id("Fiscal--Policy  Expert"), "fiscal_policy_expert");
        assert_eq!(canonical_agent_id("_leading_"), "leading");
        assert_eq!(canonical_agent_id(""), "");
    }

    #[test]
    fn empty_report_shape() {
        let report = AgentReport::empty("Economist", "timed out after 120s");
        assert_eq!(report.agent_id, "economist");
        assert_eq!(report.narrative, "no result");
        assert_eq!(report.confidence, 0.0);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.is_empty_result());
    }

    #[test]
    fn metric_values_are_sorted_and_numeric_only() {
        let mut report = AgentReport::new("a", "text", 0.8)
            .with_metric("unemployment_rate", 3.2)
            .with_metric("gdp_growth", 2.4);
        report
            .metadata
            .insert("note".into(), serde_json::json!("not a number"));

        let values = report.metric_values();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].0, "gdp_growth");
        assert_eq!(values[1].0, "unemployment_rate");
    }
}
