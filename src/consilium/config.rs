//! Engine configuration.
//!
//! Provides [`EngineConfig`], the single knob surface for the deliberation
//! pipeline. Users construct it manually and override individual fields — no
//! TOML, YAML, or other config-file parsing dependencies are introduced.
//!
//! # Example
//!
//! ```rust
//! use consilium::EngineConfig;
//!
//! let mut config = EngineConfig::default();
//! config.max_prefetch_concurrency = 4;
//! config.heartbeat_interval_ms = 5_000;
//!
//! assert_eq!(config.debate_profiles.complex.max_total_turns, 125);
//! ```

use crate::consilium::classifier::{Complexity, Intent};
use std::collections::HashMap;

/// Adaptive debate budget for one complexity tier.
///
/// Selected by the debate orchestrator from
/// [`EngineConfig::debate_profiles`] using `Classification.complexity`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DebateProfile {
    /// Hard ceiling on recorded debate turns for the whole debate.
    pub max_total_turns: u32,
    /// Ceiling on turns recorded within any single phase.
    pub per_phase_cap: u32,
    /// Similarity threshold for consensus-phase convergence, in `[0, 1]`.
    pub convergence_threshold: f32,
}

/// The three-row budget table keyed by query complexity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DebateProfiles {
    pub simple: DebateProfile,
    pub standard: DebateProfile,
    pub complex: DebateProfile,
}

impl DebateProfiles {
    /// Look up the profile for a complexity tier.
    pub fn for_complexity(&self, complexity: Complexity) -> DebateProfile {
        match complexity {
            Complexity::Simple => self.simple,
            Complexity::Standard => self.standard,
            Complexity::Complex => self.complex,
        }
    }
}

impl Default for DebateProfiles {
    fn default() -> Self {
        Self {
            simple: DebateProfile {
                max_total_turns: 15,
                per_phase_cap: 4,
                convergence_threshold: 0.80,
            },
            standard: DebateProfile {
                max_total_turns: 40,
                per_phase_cap: 10,
                convergence_threshold: 0.75,
            },
            complex: DebateProfile {
                max_total_turns: 125,
                per_phase_cap: 30,
                convergence_threshold: 0.70,
            },
        }
    }
}

/// Configuration for a [`DeliberationEngine`](crate::DeliberationEngine).
///
/// Every recognized option has a single effect; see the field docs. All
/// defaults match the reference deployment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Cap on parallel external data fetches during prefetch.
    pub max_prefetch_concurrency: usize,
    /// Per-source deadline for one prefetch call, in milliseconds.
    pub prefetch_timeout_ms: u64,
    /// Per-agent deadline for one `analyze` invocation, in milliseconds.
    pub per_agent_timeout_ms: u64,
    /// Adaptive debate budgets keyed by complexity.
    pub debate_profiles: DebateProfiles,
    /// Phrases whose clustering in recent turns marks a meta-debate spiral.
    pub meta_debate_vocabulary: Vec<String>,
    /// Phrases counted as explicit agreement by the completion detector.
    pub agreement_phrases: Vec<String>,
    /// Phrases counted as self-declared repetition by the completion detector.
    pub repetition_phrases: Vec<String>,
    /// Agreement-phrase occurrences in the completion window that end the debate.
    pub agreement_hit_threshold: usize,
    /// Repetition-phrase occurrences in the completion window that end the debate.
    pub repetition_hit_threshold: usize,
    /// Relative numeric tolerance before two agents contradict on a metric.
    pub contradiction_tolerance: f64,
    /// Cosine threshold for recommendation clustering, in `[0, 1]`.
    pub clustering_threshold: f32,
    /// Jaccard threshold used when clustering falls back to lexical overlap.
    pub lexical_clustering_threshold: f32,
    /// Freshness horizon in months per intent, used by the verifier.
    pub verifier_freshness_horizons: HashMap<Intent, u32>,
    /// Interval between heartbeat events while no stage event flows, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Pre-warm the embedder when the engine run starts.
    pub embedder_warm_on_start: bool,
    /// Maximum snippets returned by retrieval.
    pub retrieval_limit: usize,
    /// Minimum similarity for a retrieved snippet.
    pub retrieval_floor: f32,
    /// Classifier confidence below which intent downgrades to generic.
    pub min_classifier_confidence: f32,
    /// Queue length at which the event bus logs a lagging-consumer warning.
    pub event_watermark: usize,
    /// Character window around a number inside which a citation must appear.
    pub citation_window: usize,
    /// Honor the classifier's deterministic-only routing with the short path.
    pub deterministic_routing: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut horizons = HashMap::new();
        horizons.insert(Intent::Policy, 24);
        horizons.insert(Intent::Comparison, 24);
        horizons.insert(Intent::Trend, 12);
        horizons.insert(Intent::Forecast, 24);
        horizons.insert(Intent::Diagnostic, 12);
        horizons.insert(Intent::Generic, 24);

        Self {
            max_prefetch_concurrency: 8,
            prefetch_timeout_ms: 10_000,
            per_agent_timeout_ms: 120_000,
            debate_profiles: DebateProfiles::default(),
            meta_debate_vocabulary: default_meta_vocabulary(),
            agreement_phrases: default_agreement_phrases(),
            repetition_phrases: default_repetition_phrases(),
            agreement_hit_threshold: 6,
            repetition_hit_threshold: 3,
            contradiction_tolerance: 0.10,
            clustering_threshold: 0.65,
            lexical_clustering_threshold: 0.40,
            verifier_freshness_horizons: horizons,
            heartbeat_interval_ms: 15_000,
            embedder_warm_on_start: true,
            retrieval_limit: 20,
            retrieval_floor: 0.35,
            min_classifier_confidence: 0.55,
            event_watermark: 1_024,
            citation_window: 40,
            deterministic_routing: true,
        }
    }
}

/// Canonical meta-debate vocabulary (21 phrases).
///
/// A turn containing two or more of these, inside a window already dense with
/// them, signals that the agents are debating the debate instead of the
/// question.
pub fn default_meta_vocabulary() -> Vec<String> {
    [
        "framework",
        "analytical approach",
        "epistemically",
        "epistemology",
        "performative contradiction",
        "methodological",
        "meta-level",
        "first principles",
        "ontological",
        "category error",
        "the framing of",
        "terms of the debate",
        "semantic distinction",
        "definitional",
        "paradigm",
        "axiomatic",
        "discourse itself",
        "nature of this discussion",
        "how we are arguing",
        "structure of the argument",
        "burden of proof",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Default agreement phrases for the substantive-completion detector.
pub fn default_agreement_phrases() -> Vec<String> {
    [
        "i agree",
        "we agree",
        "i concur",
        "as my colleague said",
        "aligns with my",
        "no objection",
        "consensus",
        "common ground",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Default repetition phrases for the substantive-completion detector.
pub fn default_repetition_phrases() -> Vec<String> {
    [
        "as i said",
        "as stated earlier",
        "to reiterate",
        "as previously mentioned",
        "again,",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
