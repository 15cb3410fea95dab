//! Devil's-advocate critique pass.
//!
//! A single pass over the merged reports plus the debate synthesis that asks
//! "where would a hostile reviewer push back?". The critique is heuristic and
//! local: low stated confidence, uncited quantitative claims, self-reported
//! warnings, and involvement in high-severity contradictions all lower an
//! agent's robustness score. Non-fatal by contract — a failure anywhere
//! degrades to an empty critique.

use crate::consilium::agent::AgentReport;
use crate::consilium::debate::{DebateResults, Severity};

/// One weakness the critique pass found in an agent's analysis.
#[derive(Debug, Clone)]
pub struct CritiqueItem {
    pub agent_id: String,
    pub weakness: String,
    pub counter_argument: String,
    pub severity: Severity,
    /// How well the analysis would survive the counter-argument, in `[0, 1]`.
    pub robustness: f32,
}

/// Output of the critique stage.
#[derive(Debug, Clone, Default)]
pub struct CritiqueResults {
    pub items: Vec<CritiqueItem>,
    pub assessment: String,
}

/// Confidence below which a report is challenged outright.
const LOW_CONFIDENCE: f32 = 0.60;

/// Run the critique pass. Reports are visited in their (canonical id) order
/// so the critique is deterministic.
pub fn run_critique(reports: &[AgentReport], debate: Option<&DebateResults>) -> CritiqueResults {
    let mut items = Vec::new();

    for report in reports {
        if report.is_empty_result() {
            continue;
        }

        let mut robustness: f32 = 0.9;

        if report.confidence < LOW_CONFIDENCE {
            robustness -= 0.2;
            items.push(CritiqueItem {
                agent_id: report.agent_id.clone(),
                weakness: format!("states only {:.0}% confidence", report.confidence * 100.0),
                counter_argument:
                    "a recommendation this tentative should not anchor the final briefing"
                        .to_string(),
                severity: Severity::Medium,
                robustness: robustness.max(0.0),
            });
        }

        if report.citations.is_empty() && !report.metric_values().is_empty() {
            robustness -= 0.3;
            items.push(CritiqueItem {
                agent_id: report.agent_id.clone(),
                weakness: "quantitative claims carry no citations".to_string(),
                counter_argument: "unsourced figures cannot be independently verified".to_string(),
                severity: Severity::High,
                robustness: robustness.max(0.0),
            });
        }

        if let Some(warning) = report.warnings.first() {
            robustness -= 0.1;
            items.push(CritiqueItem {
                agent_id: report.agent_id.clone(),
                weakness: format!("self-reported warning: {}", warning),
                counter_argument: "the analysis acknowledges a gap it did not close".to_string(),
                severity: Severity::Low,
                robustness: robustness.max(0.0),
            });
        }

        if let Some(debate) = debate {
            let disputed = debate.contradictions.iter().any(|c| {
                c.severity == Severity::High
                    && (c.first.agent_id == report.agent_id || c.second.agent_id == report.agent_id)
            });
            if disputed {
                robustness -= 0.25;
                items.push(CritiqueItem {
                    agent_id: report.agent_id.clone(),
                    weakness: "a headline figure is disputed by another participant".to_string(),
                    counter_argument:
                        "until the contradiction resolves, conclusions built on it are unsafe"
                            .to_string(),
                    severity: Severity::High,
                    robustness: robustness.max(0.0),
                });
            }
        }
    }

    let assessment = if items.is_empty() {
        "No material weaknesses found; the analyses are mutually consistent and sourced."
            .to_string()
    } else {
        let high = items.iter().filter(|i| i.severity == Severity::High).count();
        format!(
            "{} weakness(es) identified, {} high-severity; treat the affected conclusions with caution.",
            items.len(),
            high
        )
    };

    CritiqueResults { items, assessment }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_reports_produce_empty_critique() {
        let reports = vec![AgentReport::new("a", "solid analysis", 0.9)
            .with_citation("GDP grew 2.4%", "stats_api")
            .with_finding("growth is stable", 0.9)];
        let critique = run_critique(&reports, None);
        assert!(critique.items.is_empty());
        assert!(critique.assessment.contains("No material weaknesses"));
    }

    #[test]
    fn uncited_metrics_are_flagged_high() {
        let reports = vec![AgentReport::new("a", "gdp grew", 0.9).with_metric("gdp_growth", 2.4)];
        let critique = run_critique(&reports, None);
        assert_eq!(critique.items.len(), 1);
        assert_eq!(critique.items[0].severity, Severity::High);
        assert!(critique.items[0].weakness.contains("no citations"));
    }

    #[test]
    fn low_confidence_is_challenged() {
        let reports = vec![AgentReport::new("a", "maybe", 0.4)];
        let critique = run_critique(&reports, None);
        assert!(critique
            .items
            .iter()
            .any(|i| i.weakness.contains("confidence")));
    }

    #[test]
    fn empty_reports_are_skipped() {
        let reports = vec![AgentReport::empty("a", "timed out")];
        let critique = run_critique(&reports, None);
        assert!(critique.items.is_empty());
    }
}
