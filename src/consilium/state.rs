//! Request entry and the per-request analysis state.
//!
//! [`AnalysisState`] is the single record threaded through the pipeline. It
//! is monotonically augmented: each stage reads prior fields and records its
//! own output exactly once; nothing is deleted or rewritten. The workflow
//! driver owns the state exclusively for the lifetime of a request and logs
//! the key set at every stage boundary so a degraded run can be reconstructed
//! from the logs alone.

use crate::consilium::agent::AgentReport;
use crate::consilium::classifier::Classification;
use crate::consilium::critique::CritiqueResults;
use crate::consilium::debate::DebateResults;
use crate::consilium::prefetch::PrefetchOutcome;
use crate::consilium::retrieval::RetrievalContext;
use crate::consilium::synthesizer::Synthesis;
use crate::consilium::verifier::VerificationReport;
use chrono::{DateTime, Utc};
use std::error::Error;
use std::fmt;
use uuid::Uuid;

/// Transport-agnostic request entry.
///
/// # Example
///
/// ```rust
/// use consilium::AnalysisRequest;
///
/// let request = AnalysisRequest::new("What is Qatar's unemployment rate?");
/// assert!(request.validate().is_ok());
/// assert!(AnalysisRequest::new("   ").validate().is_err());
/// ```
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    /// The question to deliberate on. Must be non-empty.
    pub question: String,
    /// Optional provider hint forwarded to the agent layer untouched.
    pub provider: Option<String>,
    /// Optional model hint forwarded to the agent layer untouched.
    pub model: Option<String>,
}

impl AnalysisRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            provider: None,
            model: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Reject empty questions before any stream is opened.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.question.trim().is_empty() {
            return Err(ValidationError::EmptyQuestion);
        }
        Ok(())
    }
}

/// Rejected request input. Raised before the pipeline starts; no events are
/// streamed for a request that fails validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    EmptyQuestion,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::EmptyQuestion => write!(f, "question must be non-empty"),
        }
    }
}

impl Error for ValidationError {}

/// Immutable query record created once per request.
#[derive(Debug, Clone)]
pub struct Query {
    /// Unique request id.
    pub id: String,
    /// The question text, verbatim.
    pub question: String,
    /// Provider hint for the agent layer, if any.
    pub provider_hint: Option<String>,
    /// Model hint for the agent layer, if any.
    pub model_hint: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Query {
    /// Build the query record from a validated request.
    pub fn from_request(request: &AnalysisRequest, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            question: request.question.clone(),
            provider_hint: request.provider.clone(),
            model_hint: request.model.clone(),
            created_at,
        }
    }
}

/// A stage that recovered locally instead of failing the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegradedStage {
    /// Stage tag as it appears on the event stream.
    pub stage: String,
    /// Human-readable reason carried into the final briefing.
    pub reason: String,
}

/// Attempt to write a stage slot twice. Stage outputs are immutable once
/// recorded, so a second write indicates a driver bug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageAlreadyRecorded {
    pub key: &'static str,
}

impl fmt::Display for StageAlreadyRecorded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage output '{}' was already recorded", self.key)
    }
}

impl Error for StageAlreadyRecorded {}

/// The per-request accumulating record threaded through the pipeline.
///
/// Fields fill in pipeline order. A `None` slot after the owning stage ran
/// means the stage degraded; the slot stays `None` and the stage appears in
/// [`degraded`](AnalysisState::degraded).
#[derive(Debug)]
pub struct AnalysisState {
    pub query: Query,
    pub classification: Option<Classification>,
    pub prefetch: Option<PrefetchOutcome>,
    pub retrieval: Option<RetrievalContext>,
    /// Canonical ids of the agents chosen to run.
    pub selected_agents: Option<Vec<String>>,
    /// Reports ordered by canonical agent id.
    pub agent_reports: Option<Vec<AgentReport>>,
    pub debate: Option<DebateResults>,
    pub critique: Option<CritiqueResults>,
    pub verification: Option<VerificationReport>,
    pub synthesis: Option<Synthesis>,
    /// Ledger of stages that recovered locally.
    pub degraded: Vec<DegradedStage>,
}

macro_rules! record_once {
    ($name:ident, $field:ident, $ty:ty, $key:expr) => {
        /// Record this stage's output. Errors if the slot is already filled.
        pub fn $name(&mut self, value: $ty) -> Result<(), StageAlreadyRecorded> {
            if self.$field.is_some() {
                return Err(StageAlreadyRecorded { key: $key });
            }
            self.$field = Some(value);
            Ok(())
        }
    };
}

impl AnalysisState {
    pub fn new(query: Query) -> Self {
        Self {
            query,
            classification: None,
            prefetch: None,
            retrieval: None,
            selected_agents: None,
            agent_reports: None,
            debate: None,
            critique: None,
            verification: None,
            synthesis: None,
            degraded: Vec::new(),
        }
    }

    record_once!(record_classification, classification, Classification, "classification");
    record_once!(record_prefetch, prefetch, PrefetchOutcome, "prefetch");
    record_once!(record_retrieval, retrieval, RetrievalContext, "retrieval");
    record_once!(record_selected_agents, selected_agents, Vec<String>, "selected_agents");
    record_once!(record_agent_reports, agent_reports, Vec<AgentReport>, "agent_reports");
    record_once!(record_debate, debate, DebateResults, "debate");
    record_once!(record_critique, critique, CritiqueResults, "critique");
    record_once!(record_verification, verification, VerificationReport, "verification");
    record_once!(record_synthesis, synthesis, Synthesis, "synthesis");

    /// Mark a stage as degraded; the reason flows into the final briefing.
    pub fn mark_degraded(&mut self, stage: impl Into<String>, reason: impl Into<String>) {
        self.degraded.push(DegradedStage {
            stage: stage.into(),
            reason: reason.into(),
        });
    }

    /// Keys currently present, in pipeline order. Logged at stage boundaries.
    pub fn stage_keys(&self) -> Vec<&'static str> {
        let mut keys = vec!["query"];
        if self.classification.is_some() {
            keys.push("classification");
        }
        if self.prefetch.is_some() {
            keys.push("prefetch");
        }
        if self.retrieval.is_some() {
            keys.push("retrieval");
        }
        if self.selected_agents.is_some() {
            keys.push("selected_agents");
        }
        if self.agent_reports.is_some() {
            keys.push("agent_reports");
        }
        if self.debate.is_some() {
            keys.push("debate");
        }
        if self.critique.is_some() {
            keys.push("critique");
        }
        if self.verification.is_some() {
            keys.push("verification");
        }
        if self.synthesis.is_some() {
            keys.push("synthesis");
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn state() -> AnalysisState {
        let request = AnalysisRequest::new("test question");
        AnalysisState::new(Query::from_request(&request, Utc::now()))
    }

    #[test]
    fn empty_question_fails_validation() {
        assert_eq!(
            AnalysisRequest::new("").validate(),
            Err(ValidationError::EmptyQuestion)
        );
        assert_eq!(
            AnalysisRequest::new(" \t\n").validate(),
            Err(ValidationError::EmptyQuestion)
        );
    }

    #[test]
    fn stage_slots_are_write_once() {
        let mut state = state();
        state.record_selected_agents(vec!["economist".into()]).unwrap();
        let second = state.record_selected_agents(vec!["other".into()]);
        assert!(second.is_err());
        assert_eq!(
            state.selected_agents.as_deref(),
            Some(&["economist".to_string()][..])
        );
    }

    #[test]
    fn stage_keys_accumulate_in_pipeline_order() {
        let mut state = state();
        assert_eq!(state.stage_keys(), vec!["query"]);
        state.record_selected_agents(vec!["a".into()]).unwrap();
        assert_eq!(state.stage_keys(), vec!["query", "selected_agents"]);
    }
}
