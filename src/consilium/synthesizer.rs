//! Final briefing synthesis.
//!
//! Clusters the agents' recommendations by semantic similarity (greedy
//! single-pass over canonical-id order, cosine against each cluster's
//! representative) and assembles the briefing: the majority cluster's
//! consensus, minority dissents, unresolved contradictions, verifier
//! warnings, and low-confidence recommendations surfaced explicitly.
//!
//! When the embedder is unavailable the clustering falls back to lexical
//! overlap with a stricter threshold and the briefing carries a
//! degraded-clustering warning. The synthesizer runs for every request that
//! was not cancelled, whatever shape the accumulated state is in, and always
//! produces a non-empty briefing.

use crate::consilium::agent::AgentReport;
use crate::consilium::classifier::EntityKind;
use crate::consilium::debate::Severity;
use crate::consilium::embedder::{jaccard_similarity, normalized_cosine, EmbedderService};
use crate::consilium::state::AnalysisState;
use std::sync::Arc;

/// Confidence below which a recommendation is called out explicitly.
const LOW_CONFIDENCE: f32 = 0.60;

/// Confidence penalty per high-severity contradiction.
const CONTRADICTION_PENALTY: f32 = 0.05;

/// A group of agents whose recommendations landed together.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub id: usize,
    /// First agent assigned; its embedding is the centroid proxy.
    pub representative: String,
    /// Canonical agent ids, in assignment order (representative first).
    pub members: Vec<String>,
    /// Representative's embedding; empty under lexical fallback.
    pub centroid: Vec<f32>,
    /// Representative's recommendation text.
    pub statement: String,
}

/// The final briefing.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub briefing: String,
    pub confidence: f32,
    pub clusters: Vec<Cluster>,
    pub degraded_clustering: bool,
    pub warnings: Vec<String>,
}

/// The synthesis stage.
pub struct Synthesizer {
    embedder: Arc<EmbedderService>,
    clustering_threshold: f32,
    lexical_threshold: f32,
}

impl Synthesizer {
    pub fn new(
        embedder: Arc<EmbedderService>,
        clustering_threshold: f32,
        lexical_threshold: f32,
    ) -> Self {
        Self {
            embedder,
            clustering_threshold,
            lexical_threshold,
        }
    }

    /// Produce the briefing from whatever the pipeline accumulated. Never
    /// fails and never returns an empty briefing.
    pub async fn synthesize(&self, state: &AnalysisState) -> Synthesis {
        let mut warnings: Vec<String> = Vec::new();

        let reports: Vec<&AgentReport> = state
            .agent_reports
            .as_ref()
            .map(|reports| reports.iter().filter(|r| !r.is_empty_result()).collect())
            .unwrap_or_default();

        let (clusters, degraded_clustering) = if reports.is_empty() {
            (Vec::new(), false)
        } else {
            self.cluster_recommendations(&reports).await
        };
        if degraded_clustering {
            warnings.push(
                "degraded-clustering: embedder unavailable, lexical overlap used".to_string(),
            );
        }

        let confidence = self.score_confidence(&reports, &clusters, state);
        let briefing = self.compose(state, &reports, &clusters, confidence, &mut warnings);

        Synthesis {
            briefing,
            confidence,
            clusters,
            degraded_clustering,
            warnings,
        }
    }

    /// Greedy single-pass assignment in canonical-id order. Deterministic
    /// given the same embedder and inputs.
    async fn cluster_recommendations(&self, reports: &[&AgentReport]) -> (Vec<Cluster>, bool) {
        let recommendations: Vec<String> =
            reports.iter().map(|r| extract_recommendation(r)).collect();

        match self.embedder.embed(&recommendations).await {
            Ok(embeddings) if embeddings.len() == reports.len() => {
                let mut clusters: Vec<Cluster> = Vec::new();
                for (i, report) in reports.iter().enumerate() {
                    let mut best: Option<(usize, f32)> = None;
                    for cluster in &clusters {
                        let similarity = normalized_cosine(&embeddings[i], &cluster.centroid);
                        let better = match best {
                            Some((_, best_sim)) => similarity > best_sim,
                            None => true,
                        };
                        if better && similarity >= self.clustering_threshold {
                            best = Some((cluster.id, similarity));
                        }
                    }
                    match best {
                        Some((id, _)) => clusters[id].members.push(report.agent_id.clone()),
                        None => clusters.push(Cluster {
                            id: clusters.len(),
                            representative: report.agent_id.clone(),
                            members: vec![report.agent_id.clone()],
                            centroid: embeddings[i].clone(),
                            statement: recommendations[i].clone(),
                        }),
                    }
                }
                (clusters, false)
            }
            _ => (
                self.lexical_clusters(reports, &recommendations),
                true,
            ),
        }
    }

    /// Word-overlap fallback. Same greedy shape, stricter threshold.
    fn lexical_clusters(&self, reports: &[&AgentReport], recommendations: &[String]) -> Vec<Cluster> {
        let mut clusters: Vec<Cluster> = Vec::new();
        for (i, report) in reports.iter().enumerate() {
            let mut best: Option<(usize, f32)> = None;
            for cluster in &clusters {
                let similarity = jaccard_similarity(&recommendations[i], &cluster.statement);
                let better = match best {
                    Some((_, best_sim)) => similarity > best_sim,
                    None => true,
                };
                if better && similarity >= self.lexical_threshold {
                    best = Some((cluster.id, similarity));
                }
            }
            match best {
                Some((id, _)) => clusters[id].members.push(report.agent_id.clone()),
                None => clusters.push(Cluster {
                    id: clusters.len(),
                    representative: report.agent_id.clone(),
                    members: vec![report.agent_id.clone()],
                    centroid: Vec::new(),
                    statement: recommendations[i].clone(),
                }),
            }
        }
        clusters
    }

    /// Mean report confidence weighted by cluster size, minus a penalty per
    /// high-severity contradiction.
    fn score_confidence(
        &self,
        reports: &[&AgentReport],
        clusters: &[Cluster],
        state: &AnalysisState,
    ) -> f32 {
        if reports.is_empty() {
            return 0.0;
        }

        let cluster_size_of = |agent_id: &str| -> f32 {
            clusters
                .iter()
                .find(|c| c.members.iter().any(|m| m == agent_id))
                .map(|c| c.members.len() as f32)
                .unwrap_or(1.0)
        };

        let mut weighted = 0.0f32;
        let mut weights = 0.0f32;
        for report in reports {
            let weight = cluster_size_of(&report.agent_id);
            weighted += report.confidence * weight;
            weights += weight;
        }
        let mut confidence = if weights > 0.0 { weighted / weights } else { 0.0 };

        if let Some(debate) = &state.debate {
            let high = debate
                .contradictions
                .iter()
                .filter(|c| c.severity == Severity::High)
                .count();
            confidence -= CONTRADICTION_PENALTY * high as f32;
        }

        confidence.max(0.0).min(1.0)
    }

    fn compose(
        &self,
        state: &AnalysisState,
        reports: &[&AgentReport],
        clusters: &[Cluster],
        confidence: f32,
        warnings: &mut Vec<String>,
    ) -> String {
        let mut text = String::new();
        text.push_str(&format!("# Briefing: {}\n\n", state.query.question));

        if let Some(classification) = &state.classification {
            text.push_str(&format!(
                "Interpreted as a {} question ({} complexity, confidence {:.2}).\n",
                classification.intent, classification.complexity, classification.confidence
            ));
            let metrics = classification.entities_of(EntityKind::Metric);
            if !metrics.is_empty() {
                text.push_str(&format!("Metrics in scope: {}.\n", metrics.join(", ")));
            }
        }

        if let Some(prefetch) = &state.prefetch {
            if !prefetch.facts.is_empty() {
                text.push_str("\n## Data points\n");
                for fact in prefetch.facts.iter().take(8) {
                    text.push_str(&format!(
                        "- {} = {} (source: {}, confidence {:.2})\n",
                        fact.metric, fact.value, fact.source_id, fact.confidence
                    ));
                }
            }
            if !prefetch.failures.is_empty() {
                let failed = prefetch.failed_source_ids().join(", ");
                warnings.push(format!("data sources unavailable: {}", failed));
            }
        }

        if reports.is_empty() {
            text.push_str("\n## Assessment\n");
            text.push_str(
                "No agent analysis is available for this request; the briefing is limited to the classification and prefetched data above.\n",
            );
        } else if !clusters.is_empty() {
            // Largest cluster first; ties broken by lowest id.
            let mut order: Vec<usize> = (0..clusters.len()).collect();
            order.sort_by(|a, b| {
                clusters[*b]
                    .members
                    .len()
                    .cmp(&clusters[*a].members.len())
                    .then(clusters[*a].id.cmp(&clusters[*b].id))
            });

            let lead = &clusters[order[0]];
            text.push_str("\n## Consensus recommendation\n");
            text.push_str(&format!(
                "{} of {} agents ({}) converge on: {}\n",
                lead.members.len(),
                reports.len(),
                lead.members.join(", "),
                lead.statement
            ));

            for idx in order.iter().skip(1) {
                let cluster = &clusters[*idx];
                text.push_str(&format!(
                    "\n## Dissent ({})\n{}\n",
                    cluster.members.join(", "),
                    cluster.statement
                ));
            }
        }

        if let Some(debate) = &state.debate {
            let unresolved = debate.unresolved();
            if !unresolved.is_empty() {
                text.push_str("\n## Flagged for review\n");
                for resolution in unresolved {
                    text.push_str(&format!("- {}: {}\n", resolution.metric, resolution.explanation));
                }
            }
            for warning in &debate.data_quality {
                warnings.push(format!(
                    "data quality ({}): {}",
                    warning.agent_id, warning.message
                ));
            }
            text.push_str(&format!(
                "\nDebate: {} turns, completed as {}.\n",
                debate.turns.len(),
                debate.completion
            ));
        }

        if let Some(verification) = &state.verification {
            if !verification.is_clean() {
                text.push_str(&format!(
                    "\n## Verification warnings\n{} citation gap(s), {} unbacked number(s), {} stale claim(s).\n",
                    verification.citation_violations,
                    verification.fabricated_numbers,
                    verification.stale_claims
                ));
                for violation in verification.violations.iter().take(5) {
                    text.push_str(&format!(
                        "- [{}] {}: {}\n",
                        violation.kind, violation.agent_id, violation.detail
                    ));
                }
            }
        }

        let low_confidence: Vec<&&AgentReport> = reports
            .iter()
            .filter(|r| r.confidence < LOW_CONFIDENCE)
            .collect();
        if !low_confidence.is_empty() {
            text.push_str("\n## Low-confidence inputs\n");
            for report in low_confidence {
                text.push_str(&format!(
                    "- {} reported confidence {:.2}\n",
                    report.agent_id, report.confidence
                ));
            }
        }

        if let Some(critique) = &state.critique {
            if !critique.items.is_empty() {
                text.push_str(&format!("\nCritique: {}\n", critique.assessment));
            }
        }

        if !state.degraded.is_empty() {
            text.push_str("\n## Degraded stages\n");
            for stage in &state.degraded {
                text.push_str(&format!("- {}: {}\n", stage.stage, stage.reason));
            }
        }

        if !warnings.is_empty() {
            text.push_str("\n## Warnings\n");
            for warning in warnings.iter() {
                text.push_str(&format!("- {}\n", warning));
            }
        }

        text.push_str(&format!("\nOverall confidence: {:.2}\n", confidence));
        text
    }
}

/// The text that gets clustered for an agent: an explicit recommendation in
/// the metadata when present, else the first recommendation-bearing sentence
/// of the narrative, else the narrative head.
pub fn extract_recommendation(report: &AgentReport) -> String {
    if let Some(text) = report
        .metadata
        .get("recommendation")
        .and_then(|v| v.as_str())
    {
        return text.to_string();
    }

    for sentence in report.narrative.split('.') {
        let lower = sentence.to_lowercase();
        if lower.contains("recommend") || lower.contains("should") || lower.contains("propose") {
            let trimmed = sentence.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }

    let head: String = report.narrative.chars().take(240).collect();
    head
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consilium::agent::AgentReport;
    use crate::consilium::embedder::{Embedder, EmbedderError};
    use crate::consilium::state::{AnalysisRequest, Query};
    use async_trait::async_trait;
    use chrono::Utc;

    /// Embeds onto one of two fixed axes depending on a keyword, so
    /// clustering behavior is fully scripted.
    struct AxisEmbedder;

    #[async_trait]
    impl Embedder for AxisEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError> {
            Ok(texts
                .iter()
                .map(|t| {
                    if t.to_lowercase().contains("expand") {
                        vec![1.0, 0.0]
                    } else {
                        vec![0.0, 1.0]
                    }
                })
                .collect())
        }

        fn dimension(&self) -> usize {
            2
        }

        fn model_name(&self) -> &str {
            "axis"
        }
    }

    fn state_with_reports(reports: Vec<AgentReport>) -> AnalysisState {
        let mut state = AnalysisState::new(Query::from_request(
            &AnalysisRequest::new("Should the program expand?"),
            Utc::now(),
        ));
        state.record_agent_reports(reports).unwrap();
        state
    }

    fn synthesizer(embedder: Arc<EmbedderService>) -> Synthesizer {
        Synthesizer::new(embedder, 0.65, 0.40)
    }

    #[tokio::test]
    async fn majority_and_dissent_clusters_form() {
        let reports = vec![
            AgentReport::new("alpha", "We should expand the program carefully", 0.9),
            AgentReport::new("beta", "We should expand the program with guardrails", 0.8),
            AgentReport::new("gamma", "We should pause and reassess the budget", 0.7),
        ];
        let state = state_with_reports(reports);
        let service = Arc::new(EmbedderService::new(Arc::new(AxisEmbedder)));

        let synthesis = synthesizer(service).synthesize(&state).await;

        assert_eq!(synthesis.clusters.len(), 2);
        assert!(!synthesis.degraded_clustering);
        assert_eq!(synthesis.clusters[0].members, vec!["alpha", "beta"]);
        assert_eq!(synthesis.clusters[0].representative, "alpha");
        assert!(synthesis.briefing.contains("Consensus recommendation"));
        assert!(synthesis.briefing.contains("Dissent"));
        assert!(!synthesis.briefing.is_empty());
    }

    #[tokio::test]
    async fn clustering_is_deterministic() {
        let make_state = || {
            state_with_reports(vec![
                AgentReport::new("alpha", "We should expand the program", 0.9),
                AgentReport::new("beta", "We should expand it as well", 0.8),
            ])
        };
        let service = Arc::new(EmbedderService::new(Arc::new(AxisEmbedder)));
        let synthesizer = synthesizer(service);

        let first = synthesizer.synthesize(&make_state()).await;
        let second = synthesizer.synthesize(&make_state()).await;

        let shape =
            |s: &Synthesis| -> Vec<(usize, Vec<String>)> {
                s.clusters.iter().map(|c| (c.id, c.members.clone())).collect()
            };
        assert_eq!(shape(&first), shape(&second));
    }

    #[tokio::test]
    async fn missing_embedder_falls_back_to_lexical_with_warning() {
        let reports = vec![
            AgentReport::new("alpha", "We should expand the national training program", 0.9),
            AgentReport::new("beta", "We should expand the national training program", 0.8),
        ];
        let state = state_with_reports(reports);
        let service = Arc::new(EmbedderService::disabled());

        let synthesis = synthesizer(service).synthesize(&state).await;

        assert!(synthesis.degraded_clustering);
        assert_eq!(synthesis.clusters.len(), 1);
        assert!(synthesis
            .warnings
            .iter()
            .any(|w| w.contains("degraded-clustering")));
    }

    #[tokio::test]
    async fn empty_state_still_produces_a_briefing() {
        let state = AnalysisState::new(Query::from_request(
            &AnalysisRequest::new("Anything at all?"),
            Utc::now(),
        ));
        let service = Arc::new(EmbedderService::disabled());

        let synthesis = synthesizer(service).synthesize(&state).await;

        assert!(!synthesis.briefing.is_empty());
        assert_eq!(synthesis.confidence, 0.0);
        assert!(synthesis.briefing.contains("No agent analysis is available"));
    }

    #[tokio::test]
    async fn low_confidence_recommendations_are_surfaced() {
        let reports = vec![
            AgentReport::new("alpha", "We should expand the program", 0.9),
            AgentReport::new("beta", "We should pause everything", 0.3),
        ];
        let state = state_with_reports(reports);
        let service = Arc::new(EmbedderService::new(Arc::new(AxisEmbedder)));

        let synthesis = synthesizer(service).synthesize(&state).await;

        assert!(synthesis.briefing.contains("Low-confidence inputs"));
        assert!(synthesis.briefing.contains("beta"));
    }

    #[test]
    fn recommendation_extraction_prefers_metadata() {
        let mut report = AgentReport::new("a", "Long narrative. We should act now.", 0.9);
        report.metadata.insert(
            "recommendation".into(),
            serde_json::json!("Invest in phased tranches"),
        );
        assert_eq!(extract_recommendation(&report), "Invest in phased tranches");

        let report = AgentReport::new("a", "Context first. We should act now. More text.", 0.9);
        assert_eq!(extract_recommendation(&report), "We should act now");
    }
}
