//! The multi-phase debate orchestrator.
//!
//! Takes the merged agent reports and drives a structured six-phase debate:
//! opening statements, cross-examination, edge-case probing, risk analysis,
//! a consensus attempt, and a closing synthesis. The orchestrator is strictly
//! sequential — turns are ordered by design — and terminates purely by turn
//! counting and detectors; there is no wall-clock timeout inside it.
//!
//! Detectors evaluated as turns are recorded:
//!
//! - **Contradictions** between reports on the same metric (relative
//!   tolerance, severity by relative difference), resolved by source rank
//!   and confidence where possible.
//! - **Data quality**: recognized metrics with out-of-range values produce
//!   warnings that flow into the final synthesis.
//! - **Meta-debate**: a sliding window over recent turns counting a bounded
//!   vocabulary of meta phrases; a dense-enough spiral triggers exactly one
//!   moderator refocus restating the original question.
//! - **Substantive completion**: a sliding window counting agreement and
//!   repetition phrases; a hit ends the debate at the next phase boundary.
//! - **Convergence**: similarity of successive consensus statements above
//!   the complexity-keyed threshold for two consecutive turns jumps straight
//!   to synthesis.
//!
//! The synthesis always runs — at the turn cap, after detector exits, and
//! even when the orchestrator's own state went bad mid-debate.

use crate::consilium::agent::{AgentReport, AnalysisAgent, DebatePrompt, TranscriptEntry};
use crate::consilium::classifier::{Classification, EntityKind};
use crate::consilium::clock::Clock;
use crate::consilium::config::DebateProfile;
use crate::consilium::embedder::{jaccard_similarity, EmbedderService};
use crate::consilium::event::{
    DebatePhasePayload, DebateTurnPayload, EventPayload, EventSink, EventStatus, StageTag,
    TurnFailedPayload,
};
use crate::consilium::state::Query;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const TRANSCRIPT_TAIL: usize = 6;
const META_WINDOW: usize = 10;
const META_MIN_TOTAL_TURNS: usize = 30;
const META_PHRASES_IN_TURN: usize = 2;
const META_FLAGGED_IN_WINDOW: usize = 7;
const COMPLETION_WINDOW: usize = 8;
const PREVIEW_LEN: usize = 160;

/// The six debate phases, strictly ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebatePhase {
    Opening,
    CrossExamination,
    EdgeCases,
    RiskAnalysis,
    Consensus,
    Synthesis,
}

impl fmt::Display for DebatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            DebatePhase::Opening => "opening",
            DebatePhase::CrossExamination => "cross_examination",
            DebatePhase::EdgeCases => "edge_cases",
            DebatePhase::RiskAnalysis => "risk_analysis",
            DebatePhase::Consensus => "consensus",
            DebatePhase::Synthesis => "synthesis",
        };
        write!(f, "{}", tag)
    }
}

/// One recorded debate turn. Append-only.
#[derive(Debug, Clone)]
pub struct DebateTurn {
    /// 1-based, monotonically increasing.
    pub index: u32,
    pub phase: DebatePhase,
    /// Canonical agent id, or `"moderator"`.
    pub speaker: String,
    pub text: String,
    /// Indices of prior turns this one responds to.
    pub references: Vec<u32>,
    pub timestamp: DateTime<Utc>,
}

/// Contradiction severity, keyed to the relative difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        };
        write!(f, "{}", tag)
    }
}

/// One side of a contradiction.
#[derive(Debug, Clone)]
pub struct MetricPosition {
    pub agent_id: String,
    pub value: f64,
    pub citation: Option<String>,
    pub confidence: f32,
}

/// Two agents disagreeing on the same named metric beyond tolerance.
#[derive(Debug, Clone)]
pub struct Contradiction {
    pub metric: String,
    pub first: MetricPosition,
    pub second: MetricPosition,
    pub severity: Severity,
}

/// How a contradiction was adjudicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionKind {
    FirstCorrect,
    SecondCorrect,
    BothValid,
    NeitherValid,
}

/// What downstream consumers should do with the metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionAction {
    UseFirst,
    UseSecond,
    UseBoth,
    FlagForReview,
}

/// The moderator's proposed resolution for one contradiction.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub metric: String,
    pub kind: ResolutionKind,
    pub explanation: String,
    pub value: Option<f64>,
    pub citation: Option<String>,
    pub confidence: f32,
    pub action: ResolutionAction,
}

impl Resolution {
    pub fn is_unresolved(&self) -> bool {
        self.action == ResolutionAction::FlagForReview
    }
}

/// Out-of-range value on a recognized metric.
#[derive(Debug, Clone)]
pub struct DataQualityWarning {
    pub agent_id: String,
    pub metric: String,
    pub value: f64,
    pub message: String,
}

/// Why the debate ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    BudgetExhausted,
    Converged,
    SubstantivelyComplete,
    RefocusedAndConverged,
    Error,
}

impl fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            CompletionReason::BudgetExhausted => "budget-exhausted",
            CompletionReason::Converged => "converged",
            CompletionReason::SubstantivelyComplete => "substantively-complete",
            CompletionReason::RefocusedAndConverged => "refocused-and-converged",
            CompletionReason::Error => "error",
        };
        write!(f, "{}", tag)
    }
}

/// Everything the debate produced.
#[derive(Debug, Clone)]
pub struct DebateResults {
    pub contradictions: Vec<Contradiction>,
    pub resolutions: Vec<Resolution>,
    /// The consensus narrative: phase-5 statements distilled plus the
    /// moderator's closing synthesis.
    pub consensus: String,
    pub turns: Vec<DebateTurn>,
    pub completed_phases: Vec<DebatePhase>,
    pub completion: CompletionReason,
    pub data_quality: Vec<DataQualityWarning>,
    /// Set when the meta-debate detector injected a refocus.
    pub refocused: bool,
    /// Last convergence score observed in the consensus phase.
    pub convergence_score: Option<f32>,
}

impl DebateResults {
    /// Resolutions whose contradictions remain flagged for review.
    pub fn unresolved(&self) -> Vec<&Resolution> {
        self.resolutions.iter().filter(|r| r.is_unresolved()).collect()
    }
}

// ── Detectors ────────────────────────────────────────────────────────────

/// Sliding-window state machine for meta-debate detection. Counters update
/// incrementally per turn; nothing rescans the transcript.
struct MetaDebateDetector {
    vocabulary: Vec<String>,
    window: VecDeque<bool>,
    flagged_in_window: usize,
    fired: bool,
}

impl MetaDebateDetector {
    fn new(vocabulary: &[String]) -> Self {
        Self {
            vocabulary: vocabulary.iter().map(|p| p.to_lowercase()).collect(),
            window: VecDeque::with_capacity(META_WINDOW),
            flagged_in_window: 0,
            fired: false,
        }
    }

    /// Observe a recorded turn. True when the moderator should refocus.
    fn observe(&mut self, text: &str, total_turns: usize) -> bool {
        let lower = text.to_lowercase();
        let phrases_in_turn = self
            .vocabulary
            .iter()
            .filter(|p| lower.contains(p.as_str()))
            .count();
        let flagged = phrases_in_turn >= 1;

        if self.window.len() == META_WINDOW {
            if let Some(true) = self.window.pop_front() {
                self.flagged_in_window -= 1;
            }
        }
        self.window.push_back(flagged);
        if flagged {
            self.flagged_in_window += 1;
        }

        if self.fired {
            return false;
        }
        let should_fire = phrases_in_turn >= META_PHRASES_IN_TURN
            && self.flagged_in_window >= META_FLAGGED_IN_WINDOW
            && total_turns >= META_MIN_TOTAL_TURNS;
        if should_fire {
            self.fired = true;
        }
        should_fire
    }
}

/// Sliding-window counter of agreement and repetition phrases.
struct CompletionDetector {
    agreement: Vec<String>,
    repetition: Vec<String>,
    agreement_threshold: usize,
    repetition_threshold: usize,
    window: VecDeque<(usize, usize)>,
    agree_in_window: usize,
    repeat_in_window: usize,
}

impl CompletionDetector {
    fn new(
        agreement: &[String],
        repetition: &[String],
        agreement_threshold: usize,
        repetition_threshold: usize,
    ) -> Self {
        Self {
            agreement: agreement.iter().map(|p| p.to_lowercase()).collect(),
            repetition: repetition.iter().map(|p| p.to_lowercase()).collect(),
            agreement_threshold,
            repetition_threshold,
            window: VecDeque::with_capacity(COMPLETION_WINDOW),
            agree_in_window: 0,
            repeat_in_window: 0,
        }
    }

    /// Observe a recorded turn. True when the debate is substantively done
    /// and should end at the next phase boundary.
    fn observe(&mut self, text: &str) -> bool {
        let lower = text.to_lowercase();
        let agree = self
            .agreement
            .iter()
            .filter(|p| lower.contains(p.as_str()))
            .count();
        let repeat = self
            .repetition
            .iter()
            .filter(|p| lower.contains(p.as_str()))
            .count();

        if self.window.len() == COMPLETION_WINDOW {
            if let Some((a, r)) = self.window.pop_front() {
                self.agree_in_window -= a;
                self.repeat_in_window -= r;
            }
        }
        self.window.push_back((agree, repeat));
        self.agree_in_window += agree;
        self.repeat_in_window += repeat;

        self.agree_in_window >= self.agreement_threshold
            || self.repeat_in_window >= self.repetition_threshold
    }
}

// ── Static report analysis ───────────────────────────────────────────────

/// Pairwise contradiction scan over the reports' metric claims.
pub fn detect_contradictions(reports: &[AgentReport], tolerance: f64) -> Vec<Contradiction> {
    let mut by_metric: HashMap<String, Vec<MetricPosition>> = HashMap::new();
    for report in reports {
        for (metric, value) in report.metric_values() {
            by_metric.entry(metric).or_insert_with(Vec::new).push(MetricPosition {
                agent_id: report.agent_id.clone(),
                value,
                citation: report.primary_source().map(|s| s.to_string()),
                confidence: report.confidence,
            });
        }
    }

    let mut metrics: Vec<String> = by_metric.keys().cloned().collect();
    metrics.sort();

    let mut contradictions = Vec::new();
    for metric in metrics {
        let positions = &by_metric[&metric];
        for i in 0..positions.len() {
            for j in (i + 1)..positions.len() {
                let a = &positions[i];
                let b = &positions[j];
                let denominator = a.value.abs().max(b.value.abs());
                if denominator == 0.0 {
                    continue;
                }
                let relative = (a.value - b.value).abs() / denominator;
                if relative <= tolerance {
                    continue;
                }
                let severity = if relative >= 0.50 {
                    Severity::High
                } else if relative >= 0.20 {
                    Severity::Medium
                } else {
                    Severity::Low
                };
                contradictions.push(Contradiction {
                    metric: metric.clone(),
                    first: a.clone(),
                    second: b.clone(),
                    severity,
                });
            }
        }
    }
    contradictions
}

/// Propose a resolution from source rank and confidence.
///
/// A cited value beats an uncited one. Between two cited (or two uncited)
/// values, a confidence gap above 0.05 picks a winner; anything closer is
/// treated as both-valid when cited, flagged for review when not.
pub fn resolve_contradiction(contradiction: &Contradiction) -> Resolution {
    let a = &contradiction.first;
    let b = &contradiction.second;

    let pick = |winner: &MetricPosition, kind: ResolutionKind, action: ResolutionAction, why: String| Resolution {
        metric: contradiction.metric.clone(),
        kind,
        explanation: why,
        value: Some(winner.value),
        citation: winner.citation.clone(),
        confidence: winner.confidence,
        action,
    };

    match (a.citation.is_some(), b.citation.is_some()) {
        (true, false) => pick(
            a,
            ResolutionKind::FirstCorrect,
            ResolutionAction::UseFirst,
            format!("{} cites {}; {} offers no source", a.agent_id, a.citation.as_deref().unwrap_or(""), b.agent_id),
        ),
        (false, true) => pick(
            b,
            ResolutionKind::SecondCorrect,
            ResolutionAction::UseSecond,
            format!("{} cites {}; {} offers no source", b.agent_id, b.citation.as_deref().unwrap_or(""), a.agent_id),
        ),
        (true, true) => {
            if (a.confidence - b.confidence).abs() > 0.05 {
                if a.confidence > b.confidence {
                    pick(a, ResolutionKind::FirstCorrect, ResolutionAction::UseFirst,
                        format!("both cited; {} reports higher confidence", a.agent_id))
                } else {
                    pick(b, ResolutionKind::SecondCorrect, ResolutionAction::UseSecond,
                        format!("both cited; {} reports higher confidence", b.agent_id))
                }
            } else {
                Resolution {
                    metric: contradiction.metric.clone(),
                    kind: ResolutionKind::BothValid,
                    explanation: "both values cited with comparable confidence; likely different measurement bases".to_string(),
                    value: None,
                    citation: None,
                    confidence: a.confidence.min(b.confidence),
                    action: ResolutionAction::UseBoth,
                }
            }
        }
        (false, false) => Resolution {
            metric: contradiction.metric.clone(),
            kind: ResolutionKind::NeitherValid,
            explanation: "neither value carries a citation".to_string(),
            value: None,
            citation: None,
            confidence: 0.0,
            action: ResolutionAction::FlagForReview,
        },
    }
}

/// Valid ranges for recognized metrics; matched by substring on the metric
/// name so `unemployment_rate` and `youth unemployment` both hit the
/// unemployment row.
static METRIC_RANGES: &[(&str, f64, f64)] = &[
    ("unemployment", 0.0, 100.0),
    ("participation", 0.0, 100.0),
    ("gdp_growth", -50.0, 50.0),
    ("gdp growth", -50.0, 50.0),
    ("inflation", -25.0, 100.0),
    ("fdi", 0.0, 100.0),
    ("self_sufficiency", 0.0, 100.0),
];

/// Flag out-of-range values on recognized metrics. Runs once at the end of
/// the opening phase.
pub fn validate_data_quality(reports: &[AgentReport]) -> Vec<DataQualityWarning> {
    let mut warnings = Vec::new();
    for report in reports {
        for (metric, value) in report.metric_values() {
            let lower = metric.to_lowercase();
            for (needle, min, max) in METRIC_RANGES.iter() {
                if lower.contains(needle) && (value < *min || value > *max) {
                    warnings.push(DataQualityWarning {
                        agent_id: report.agent_id.clone(),
                        metric: metric.clone(),
                        value,
                        message: format!(
                            "{} = {} outside plausible range [{}, {}]",
                            metric, value, min, max
                        ),
                    });
                    break;
                }
            }
        }
    }
    warnings
}

// ── The orchestrator ─────────────────────────────────────────────────────

enum PhaseOutcome {
    Continue,
    BudgetExhausted,
    SubstantivelyComplete,
    Converged,
    Cancelled,
}

struct TurnLog {
    turns: Vec<DebateTurn>,
    meta: MetaDebateDetector,
    completion: CompletionDetector,
    refocused: bool,
    end_at_boundary: bool,
}

impl TurnLog {
    fn total(&self) -> usize {
        self.turns.len()
    }

    fn tail(&self) -> Vec<TranscriptEntry> {
        let skip = self.turns.len().saturating_sub(TRANSCRIPT_TAIL);
        self.turns[skip..]
            .iter()
            .map(|t| TranscriptEntry {
                speaker: t.speaker.clone(),
                text: t.text.clone(),
            })
            .collect()
    }
}

/// Drives the debate. Construct once per request with the complexity-keyed
/// profile already selected.
pub struct DebateOrchestrator {
    profile: DebateProfile,
    meta_vocabulary: Vec<String>,
    agreement_phrases: Vec<String>,
    repetition_phrases: Vec<String>,
    agreement_threshold: usize,
    repetition_threshold: usize,
    contradiction_tolerance: f64,
    clock: Arc<dyn Clock>,
    embedder: Arc<EmbedderService>,
}

impl DebateOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        profile: DebateProfile,
        meta_vocabulary: Vec<String>,
        agreement_phrases: Vec<String>,
        repetition_phrases: Vec<String>,
        agreement_threshold: usize,
        repetition_threshold: usize,
        contradiction_tolerance: f64,
        clock: Arc<dyn Clock>,
        embedder: Arc<EmbedderService>,
    ) -> Self {
        Self {
            profile,
            meta_vocabulary,
            agreement_phrases,
            repetition_phrases,
            agreement_threshold,
            repetition_threshold,
            contradiction_tolerance,
            clock,
            embedder,
        }
    }

    /// Run the whole debate. Never fails: internal trouble degrades to a
    /// synthesis over whatever turns were recorded, with
    /// `completion = Error`.
    pub async fn run(
        &self,
        agents: &[Arc<dyn AnalysisAgent>],
        reports: &[AgentReport],
        classification: &Classification,
        query: &Query,
        cancel: &CancellationToken,
        sink: &EventSink,
    ) -> DebateResults {
        let contradictions = detect_contradictions(reports, self.contradiction_tolerance);
        let resolutions: Vec<Resolution> =
            contradictions.iter().map(resolve_contradiction).collect();

        let mut log = TurnLog {
            turns: Vec::new(),
            meta: MetaDebateDetector::new(&self.meta_vocabulary),
            completion: CompletionDetector::new(
                &self.agreement_phrases,
                &self.repetition_phrases,
                self.agreement_threshold,
                self.repetition_threshold,
            ),
            refocused: false,
            end_at_boundary: false,
        };

        // Nothing to debate: every agent came back empty.
        if reports.iter().all(|r| r.is_empty_result()) {
            let consensus = "no agent produced a result".to_string();
            self.emit_final_synthesis(sink, &consensus);
            return DebateResults {
                contradictions,
                resolutions,
                consensus,
                turns: log.turns,
                completed_phases: vec![DebatePhase::Synthesis],
                completion: CompletionReason::SubstantivelyComplete,
                data_quality: validate_data_quality(reports),
                refocused: false,
                convergence_score: None,
            };
        }

        let mut completion: Option<CompletionReason> = None;
        let mut completed_phases: Vec<DebatePhase> = Vec::new();
        let mut convergence_score: Option<f32> = None;
        let mut data_quality: Vec<DataQualityWarning> = Vec::new();

        let phases = [
            DebatePhase::Opening,
            DebatePhase::CrossExamination,
            DebatePhase::EdgeCases,
            DebatePhase::RiskAnalysis,
            DebatePhase::Consensus,
        ];

        for phase in phases.iter() {
            sink.running(EventPayload::DebatePhase(DebatePhasePayload {
                phase: phase.to_string(),
                turns_so_far: log.total() as u32,
            }));

            let outcome = self
                .run_phase(*phase, agents, reports, classification, query, cancel, sink, &mut log, &mut convergence_score)
                .await;

            if *phase == DebatePhase::Opening {
                // Data-quality validation runs once, at the end of phase 1.
                data_quality = validate_data_quality(reports);
            }

            match outcome {
                PhaseOutcome::Continue => completed_phases.push(*phase),
                PhaseOutcome::BudgetExhausted => {
                    completion = Some(CompletionReason::BudgetExhausted);
                    break;
                }
                PhaseOutcome::SubstantivelyComplete => {
                    completed_phases.push(*phase);
                    completion = Some(CompletionReason::SubstantivelyComplete);
                    break;
                }
                PhaseOutcome::Converged => {
                    completed_phases.push(*phase);
                    completion = Some(if log.refocused {
                        CompletionReason::RefocusedAndConverged
                    } else {
                        CompletionReason::Converged
                    });
                    break;
                }
                PhaseOutcome::Cancelled => {
                    return DebateResults {
                        contradictions,
                        resolutions,
                        consensus: String::new(),
                        turns: log.turns,
                        completed_phases,
                        completion: CompletionReason::Error,
                        data_quality,
                        refocused: log.refocused,
                        convergence_score,
                    };
                }
            }
        }

        let completion = completion.unwrap_or(CompletionReason::SubstantivelyComplete);

        // Phase 6 always runs, even at the cap.
        sink.running(EventPayload::DebatePhase(DebatePhasePayload {
            phase: DebatePhase::Synthesis.to_string(),
            turns_so_far: log.total() as u32,
        }));
        let consensus = self.build_synthesis(
            query,
            reports,
            &log,
            &contradictions,
            &resolutions,
            &data_quality,
            completion,
        );
        if (log.total() as u32) < self.profile.max_total_turns {
            self.record_turn(&mut log, DebatePhase::Synthesis, "moderator", &consensus, Vec::new(), sink);
        }
        completed_phases.push(DebatePhase::Synthesis);
        self.emit_final_synthesis(sink, &consensus);

        DebateResults {
            contradictions,
            resolutions,
            consensus,
            turns: log.turns,
            completed_phases,
            completion,
            data_quality,
            refocused: log.refocused,
            convergence_score,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_phase(
        &self,
        phase: DebatePhase,
        agents: &[Arc<dyn AnalysisAgent>],
        reports: &[AgentReport],
        classification: &Classification,
        query: &Query,
        cancel: &CancellationToken,
        sink: &EventSink,
        log: &mut TurnLog,
        convergence_score: &mut Option<f32>,
    ) -> PhaseOutcome {
        let prompts = self.phase_prompts(phase, classification);
        let mut phase_turns: u32 = 0;
        let mut last_consensus: Option<String> = None;
        let mut consecutive_hits = 0;

        // Round-robin over agents; one pass per moderator prompt, bounded by
        // the per-phase cap.
        'outer: for (round, instruction) in prompts.iter().enumerate() {
            for agent in agents {
                if cancel.is_cancelled() {
                    return PhaseOutcome::Cancelled;
                }
                if log.total() as u32 >= self.profile.max_total_turns {
                    return PhaseOutcome::BudgetExhausted;
                }
                if phase_turns >= self.profile.per_phase_cap {
                    break 'outer;
                }

                let speaker = crate::consilium::agent::canonical_agent_id(agent.id());
                let own_report = reports.iter().find(|r| r.agent_id == speaker);
                let instruction = if phase == DebatePhase::Opening {
                    let narrative = own_report
                        .map(|r| head(&r.narrative, 400))
                        .unwrap_or_default();
                    format!("{} Your analysis so far: {}", instruction, narrative)
                } else {
                    instruction.clone()
                };

                let references: Vec<u32> = log
                    .turns
                    .iter()
                    .rev()
                    .take(3)
                    .map(|t| t.index)
                    .collect();

                let prompt = DebatePrompt {
                    phase: phase.to_string(),
                    instruction,
                    question: query.question.clone(),
                    transcript_tail: log.tail(),
                };

                let text = match agent.debate_turn(&prompt).await {
                    Ok(text) => text,
                    Err(e) => {
                        // Turn-failed: record nothing, move to the next speaker.
                        log::warn!("debate turn failed for '{}': {}", speaker, e);
                        sink.streaming(EventPayload::TurnFailed(TurnFailedPayload {
                            speaker: speaker.clone(),
                            error: e.to_string(),
                        }));
                        continue;
                    }
                };

                let refocus = self.record_turn(log, phase, &speaker, &text, references, sink);
                phase_turns += 1;

                if refocus && (log.total() as u32) < self.profile.max_total_turns {
                    let refocus_text = format!(
                        "Refocus: the question under deliberation is \"{}\". Set aside the shape of the argument and address the question directly.",
                        query.question
                    );
                    self.record_turn(log, phase, "moderator", &refocus_text, Vec::new(), sink);
                    phase_turns += 1;
                }

                if phase == DebatePhase::Consensus {
                    if let Some(previous) = &last_consensus {
                        let score = self.similarity(previous, &text).await;
                        *convergence_score = Some(score);
                        if score >= self.profile.convergence_threshold {
                            consecutive_hits += 1;
                            if consecutive_hits >= 2 {
                                return PhaseOutcome::Converged;
                            }
                        } else {
                            consecutive_hits = 0;
                        }
                    }
                    last_consensus = Some(text);
                }
            }

            // One full pass means every agent spoke this phase at least once;
            // phases with a single prompt stop here.
            if round + 1 == prompts.len() {
                break;
            }
        }

        if log.end_at_boundary {
            return PhaseOutcome::SubstantivelyComplete;
        }
        PhaseOutcome::Continue
    }

    /// Moderator prompts for one phase. Each prompt drives one round-robin
    /// pass over the agents.
    fn phase_prompts(&self, phase: DebatePhase, classification: &Classification) -> Vec<String> {
        match phase {
            DebatePhase::Opening => vec![
                "State your position on the question in a few sentences.".to_string(),
            ],
            DebatePhase::CrossExamination => vec![
                "Challenge or weigh in on the opening statements. Name the specific claim you dispute or support.".to_string(),
            ],
            DebatePhase::EdgeCases => {
                let mut prompts = Vec::new();
                for entity in classification
                    .entities_of(EntityKind::Metric)
                    .iter()
                    .chain(classification.entities_of(EntityKind::Sector).iter())
                    .take(3)
                {
                    prompts.push(format!(
                        "Edge case: how does your position hold if the assumptions behind '{}' break down?",
                        entity
                    ));
                }
                if prompts.is_empty() {
                    prompts.push(
                        "Edge case: how does your position hold under a severe external shock?"
                            .to_string(),
                    );
                }
                prompts
            }
            DebatePhase::RiskAnalysis => vec![
                "Assess the fiscal exposure of the positions on the table.".to_string(),
                "Assess implementation capacity and timeline risk.".to_string(),
                "Assess external dependencies and geopolitical risk.".to_string(),
            ],
            DebatePhase::Consensus => vec![
                "State where you agree with the other participants and where you still disagree."
                    .to_string(),
            ],
            DebatePhase::Synthesis => Vec::new(),
        }
    }

    /// Record a turn, emit its event, update the detectors. Returns true when
    /// the meta-debate detector asks for a refocus.
    fn record_turn(
        &self,
        log: &mut TurnLog,
        phase: DebatePhase,
        speaker: &str,
        text: &str,
        references: Vec<u32>,
        sink: &EventSink,
    ) -> bool {
        let index = (log.turns.len() + 1) as u32;
        log.turns.push(DebateTurn {
            index,
            phase,
            speaker: speaker.to_string(),
            text: text.to_string(),
            references,
            timestamp: self.clock.now(),
        });

        let payload = DebateTurnPayload {
            turn: index,
            phase: phase.to_string(),
            speaker: speaker.to_string(),
            preview: head(text, PREVIEW_LEN),
        };
        sink.emit_as(
            StageTag::DebateTurn(index),
            EventStatus::Streaming,
            EventPayload::DebateTurn(payload.clone()),
        );
        // Terminal event for the per-turn tag: a turn is complete the moment
        // it is recorded.
        sink.emit_as(
            StageTag::DebateTurn(index),
            EventStatus::Complete,
            EventPayload::DebateTurn(payload),
        );

        let total = log.turns.len();
        let refocus = speaker != "moderator" && log.meta.observe(text, total);
        if refocus {
            log.refocused = true;
        }
        if log.completion.observe(text) {
            log.end_at_boundary = true;
        }
        refocus
    }

    async fn similarity(&self, a: &str, b: &str) -> f32 {
        match self.embedder.similarity(a, b).await {
            Some(score) => score,
            None => jaccard_similarity(a, b),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_synthesis(
        &self,
        query: &Query,
        reports: &[AgentReport],
        log: &TurnLog,
        contradictions: &[Contradiction],
        resolutions: &[Resolution],
        data_quality: &[DataQualityWarning],
        completion: CompletionReason,
    ) -> String {
        let mut text = String::new();
        text.push_str(&format!("Debate synthesis for: {}\n", query.question));

        let speakers: Vec<&str> = reports
            .iter()
            .filter(|r| !r.is_empty_result())
            .map(|r| r.agent_id.as_str())
            .collect();
        text.push_str(&format!(
            "{} turns recorded across {} participants ({}).\n",
            log.total(),
            speakers.len(),
            speakers.join(", ")
        ));

        let consensus_statements: Vec<&DebateTurn> = log
            .turns
            .iter()
            .filter(|t| t.phase == DebatePhase::Consensus)
            .collect();
        if !consensus_statements.is_empty() {
            text.push_str("Closing positions:\n");
            for turn in consensus_statements {
                text.push_str(&format!("- {}: {}\n", turn.speaker, head(&turn.text, 240)));
            }
        }

        if contradictions.is_empty() {
            text.push_str("No numeric contradictions surfaced between the reports.\n");
        } else {
            text.push_str(&format!("{} contradiction(s) surfaced:\n", contradictions.len()));
            for (contradiction, resolution) in contradictions.iter().zip(resolutions.iter()) {
                text.push_str(&format!(
                    "- {} ({}): {}={} vs {}={} — {}\n",
                    contradiction.metric,
                    contradiction.severity,
                    contradiction.first.agent_id,
                    contradiction.first.value,
                    contradiction.second.agent_id,
                    contradiction.second.value,
                    resolution.explanation
                ));
            }
            let unresolved = resolutions.iter().filter(|r| r.is_unresolved()).count();
            if unresolved > 0 {
                text.push_str(&format!("{} contradiction(s) remain flagged for review.\n", unresolved));
            }
        }

        for warning in data_quality {
            text.push_str(&format!(
                "Data-quality warning against {}: {}\n",
                warning.agent_id, warning.message
            ));
        }

        text.push_str(&format!("Debate completed: {}.\n", completion));
        text
    }

    fn emit_final_synthesis(&self, sink: &EventSink, consensus: &str) {
        sink.emit_as(
            StageTag::DebateFinalSynthesis,
            EventStatus::Complete,
            EventPayload::DebateTurn(DebateTurnPayload {
                turn: 0,
                phase: DebatePhase::Synthesis.to_string(),
                speaker: "moderator".to_string(),
                preview: head(consensus, PREVIEW_LEN),
            }),
        );
    }
}

fn head(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(limit).collect();
        format!("{}…", truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consilium::agent::{AgentContext, AgentReport, AgentResult};
    use crate::consilium::classifier::Classifier;
    use crate::consilium::clock::SystemClock;
    use crate::consilium::config::{
        default_agreement_phrases, default_meta_vocabulary, default_repetition_phrases,
        DebateProfiles,
    };
    use crate::consilium::event::{EventBus, EventStream};
    use crate::consilium::state::AnalysisRequest;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn report(id: &str, metric: &str, value: f64, cited: bool, confidence: f32) -> AgentReport {
        let mut report = AgentReport::new(id, format!("{} is {}", metric, value), confidence)
            .with_metric(metric, value);
        if cited {
            report = report.with_citation(format!("{} = {}", metric, value), "labor_stats");
        }
        report
    }

    #[test]
    fn contradiction_severity_follows_relative_difference() {
        let reports = vec![
            report("a", "gdp_growth", 2.0, true, 0.9),
            report("b", "gdp_growth", 4.0, true, 0.8),
        ];
        let contradictions = detect_contradictions(&reports, 0.10);
        assert_eq!(contradictions.len(), 1);
        // |2-4| / 4 = 0.5 → high
        assert_eq!(contradictions[0].severity, Severity::High);

        let reports = vec![
            report("a", "gdp_growth", 4.0, true, 0.9),
            report("b", "gdp_growth", 4.2, true, 0.8),
        ];
        // |4-4.2| / 4.2 ≈ 0.048 → under tolerance, no contradiction
        assert!(detect_contradictions(&reports, 0.10).is_empty());
    }

    #[test]
    fn contradiction_requires_metric_in_two_reports() {
        let reports = vec![
            report("a", "inflation", 3.0, true, 0.9),
            report("b", "gdp_growth", 2.0, true, 0.9),
        ];
        assert!(detect_contradictions(&reports, 0.10).is_empty());
    }

    #[test]
    fn resolution_prefers_cited_value() {
        let reports = vec![
            report("a", "unemployment_rate", 0.13, true, 0.9),
            report("b", "unemployment_rate", 3.0, false, 0.9),
        ];
        let contradictions = detect_contradictions(&reports, 0.10);
        let resolution = resolve_contradiction(&contradictions[0]);
        assert_eq!(resolution.kind, ResolutionKind::FirstCorrect);
        assert_eq!(resolution.action, ResolutionAction::UseFirst);
        assert_eq!(resolution.value, Some(0.13));
    }

    #[test]
    fn uncited_contradiction_is_flagged_for_review() {
        let reports = vec![
            report("a", "fdi", 10.0, false, 0.9),
            report("b", "fdi", 30.0, false, 0.9),
        ];
        let contradictions = detect_contradictions(&reports, 0.10);
        let resolution = resolve_contradiction(&contradictions[0]);
        assert_eq!(resolution.kind, ResolutionKind::NeitherValid);
        assert!(resolution.is_unresolved());
    }

    #[test]
    fn data_quality_flags_impossible_unemployment() {
        let reports = vec![report("a", "unemployment_rate", 130.0, true, 0.9)];
        let warnings = validate_data_quality(&reports);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("outside plausible range"));

        let reports = vec![report("a", "unemployment_rate", 3.2, true, 0.9)];
        assert!(validate_data_quality(&reports).is_empty());
    }

    #[test]
    fn meta_detector_needs_density_and_late_turn() {
        let vocab = default_meta_vocabulary();
        let mut detector = MetaDebateDetector::new(&vocab);
        let meta_text = "The framework of this analytical approach is epistemically unsound";

        // Dense meta content, but before turn 30: never fires.
        for turn in 1..=10 {
            assert!(!detector.observe(meta_text, turn));
        }

        // Same density at turn 30+: fires exactly once.
        assert!(detector.observe(meta_text, 30));
        assert!(!detector.observe(meta_text, 31));
    }

    #[test]
    fn completion_detector_counts_agreement_in_window() {
        let mut detector = CompletionDetector::new(
            &default_agreement_phrases(),
            &default_repetition_phrases(),
            6,
            3,
        );
        // Each turn contains two agreement phrases; the third turn brings the
        // window total to six.
        let text = "I agree with the consensus forming here";
        assert!(!detector.observe(text));
        assert!(!detector.observe(text));
        assert!(detector.observe(text));
    }

    // ── Orchestrator-level tests with scripted agents ───────────────────

    struct EchoAgent {
        id: String,
        utterance: String,
        calls: AtomicUsize,
        fail_on: Option<usize>,
    }

    impl EchoAgent {
        fn new(id: &str, utterance: &str) -> Self {
            Self {
                id: id.to_string(),
                utterance: utterance.to_string(),
                calls: AtomicUsize::new(0),
                fail_on: None,
            }
        }
    }

    #[async_trait]
    impl crate::consilium::agent::AnalysisAgent for EchoAgent {
        fn id(&self) -> &str {
            &self.id
        }

        fn name(&self) -> &str {
            &self.id
        }

        async fn analyze(&self, _ctx: &AgentContext) -> AgentResult<AgentReport> {
            Ok(AgentReport::new(self.id.clone(), "n/a", 0.8))
        }

        async fn debate_turn(&self, _prompt: &DebatePrompt) -> AgentResult<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if Some(call) == self.fail_on {
                return Err("LLM refused".into());
            }
            Ok(self.utterance.clone())
        }
    }

    fn orchestrator(profile: DebateProfile) -> DebateOrchestrator {
        DebateOrchestrator::new(
            profile,
            default_meta_vocabulary(),
            default_agreement_phrases(),
            default_repetition_phrases(),
            6,
            3,
            0.10,
            Arc::new(SystemClock),
            Arc::new(crate::consilium::embedder::EmbedderService::disabled()),
        )
    }

    fn sink() -> (EventSink, EventStream) {
        let (bus, stream) = EventBus::channel(
            Arc::new(SystemClock),
            CancellationToken::new(),
            1_024,
        );
        (bus.sink(StageTag::Debate), stream)
    }

    fn query() -> Query {
        Query::from_request(&AnalysisRequest::new("Should we expand the program?"), Utc::now())
    }

    #[tokio::test]
    async fn debate_respects_total_turn_budget() {
        let agents: Vec<Arc<dyn crate::consilium::agent::AnalysisAgent>> = vec![
            Arc::new(EchoAgent::new("alpha", "Distinct position on expansion economics")),
            Arc::new(EchoAgent::new("beta", "Contrasting view on fiscal sustainability")),
        ];
        let reports = vec![
            AgentReport::new("alpha", "detailed analysis", 0.8),
            AgentReport::new("beta", "detailed analysis", 0.7),
        ];
        let classification = Classifier::default().classify("What is the unemployment rate?");
        let profile = DebateProfiles::default().simple;
        let (sink, _stream) = sink();

        let results = orchestrator(profile)
            .run(&agents, &reports, &classification, &query(), &CancellationToken::new(), &sink)
            .await;

        assert!(results.turns.len() as u32 <= profile.max_total_turns);
        assert!(!results.consensus.is_empty());
        // Indices are monotone from 1.
        for (i, turn) in results.turns.iter().enumerate() {
            assert_eq!(turn.index, (i + 1) as u32);
        }
    }

    #[tokio::test]
    async fn all_empty_reports_yield_single_phase_synthesis() {
        let agents: Vec<Arc<dyn crate::consilium::agent::AnalysisAgent>> =
            vec![Arc::new(EchoAgent::new("alpha", "anything"))];
        let reports = vec![AgentReport::empty("alpha", "timed out")];
        let classification = Classifier::default().classify("What is the unemployment rate?");
        let (sink, _stream) = sink();

        let results = orchestrator(DebateProfiles::default().simple)
            .run(&agents, &reports, &classification, &query(), &CancellationToken::new(), &sink)
            .await;

        assert!(results.turns.is_empty());
        assert_eq!(results.consensus, "no agent produced a result");
        assert_eq!(results.completed_phases, vec![DebatePhase::Synthesis]);
    }

    #[tokio::test]
    async fn failing_turn_skips_speaker_without_aborting_phase() {
        let mut flaky = EchoAgent::new("flaky", "A firm position");
        flaky.fail_on = Some(0);
        let agents: Vec<Arc<dyn crate::consilium::agent::AnalysisAgent>> = vec![
            Arc::new(flaky),
            Arc::new(EchoAgent::new("steady", "A steady position")),
        ];
        let reports = vec![
            AgentReport::new("flaky", "analysis", 0.8),
            AgentReport::new("steady", "analysis", 0.8),
        ];
        let classification = Classifier::default().classify("What is the unemployment rate?");
        let (sink, _stream) = sink();

        let results = orchestrator(DebateProfiles::default().simple)
            .run(&agents, &reports, &classification, &query(), &CancellationToken::new(), &sink)
            .await;

        // The flaky agent's first turn failed; the debate still recorded
        // turns from both speakers afterwards.
        assert!(results.turns.iter().any(|t| t.speaker == "steady"));
        assert!(!results.consensus.is_empty());
    }

    #[tokio::test]
    async fn identical_consensus_statements_converge_early() {
        // Both agents repeat the same consensus wording; jaccard similarity
        // is 1.0 and the debate should converge rather than exhaust turns.
        let agents: Vec<Arc<dyn crate::consilium::agent::AnalysisAgent>> = vec![
            Arc::new(EchoAgent::new("alpha", "The program should expand with fiscal guardrails in place")),
            Arc::new(EchoAgent::new("beta", "The program should expand with fiscal guardrails in place")),
            Arc::new(EchoAgent::new("gamma", "The program should expand with fiscal guardrails in place")),
        ];
        let reports = vec![
            AgentReport::new("alpha", "analysis", 0.8),
            AgentReport::new("beta", "analysis", 0.8),
            AgentReport::new("gamma", "analysis", 0.8),
        ];
        // Complex profile: budget is large, so early exit must come from
        // convergence, not the cap.
        let classification = Classifier::default()
            .classify("Should we pursue a national strategy for food security?");
        let profile = DebateProfiles::default().complex;
        let (sink, _stream) = sink();

        let results = orchestrator(profile)
            .run(&agents, &reports, &classification, &query(), &CancellationToken::new(), &sink)
            .await;

        assert!(
            results.completion == CompletionReason::Converged
                || results.completion == CompletionReason::SubstantivelyComplete,
            "expected early exit, got {:?}",
            results.completion
        );
        assert!((results.turns.len() as u32) < profile.max_total_turns);
    }
}
