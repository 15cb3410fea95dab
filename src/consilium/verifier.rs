//! Structural verification of agent reports.
//!
//! Three checks, all heuristic and all non-fatal:
//!
//! 1. **Citation check** — every numeric token in a narrative must sit within
//!    a fixed character window of a citation reference (the cited source id
//!    or a fragment of the quoted text).
//! 2. **Numeric-fabrication check** — numeric claims are cross-referenced
//!    against prefetched facts and the report's own metadata; a number with
//!    neither a matching fact nor a nearby citation is flagged as fabricated.
//! 3. **Freshness check** — dated claims older than the intent's freshness
//!    horizon are flagged as stale.
//!
//! The verifier never fails the request; violations flow into the final
//! briefing as warnings.

use crate::consilium::agent::AgentReport;
use crate::consilium::classifier::Intent;
use crate::consilium::clock::Clock;
use crate::consilium::prefetch::PrefetchFact;
use chrono::Datelike;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

lazy_static! {
    static ref NUMBER_TOKEN: Regex = Regex::new(r"\d+(?:\.\d+)?\s?%?").unwrap();
    static ref DATE_REFERENCE: Regex = Regex::new(
        r"(?i)\b(?:(january|february|march|april|may|june|july|august|september|october|november|december)\s+)?((?:19|20)\d{2})\b"
    )
    .unwrap();
}

/// Kind of verification violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    MissingCitation,
    FabricatedNumber,
    StaleClaim,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ViolationKind::MissingCitation => "missing-citation",
            ViolationKind::FabricatedNumber => "fabricated-number",
            ViolationKind::StaleClaim => "stale-claim",
        };
        write!(f, "{}", tag)
    }
}

/// One flagged problem in one report.
#[derive(Debug, Clone)]
pub struct Violation {
    pub kind: ViolationKind,
    pub agent_id: String,
    pub detail: String,
}

/// Per-category counts plus the full violation list.
#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    pub citation_violations: usize,
    pub fabricated_numbers: usize,
    pub stale_claims: usize,
    pub violations: Vec<Violation>,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// The verification stage.
pub struct Verifier {
    /// Character window around a number inside which a citation must appear.
    citation_window: usize,
    /// Freshness horizon in months, per intent.
    horizons: HashMap<Intent, u32>,
    clock: Arc<dyn Clock>,
}

impl Verifier {
    pub fn new(citation_window: usize, horizons: HashMap<Intent, u32>, clock: Arc<dyn Clock>) -> Self {
        Self {
            citation_window,
            horizons,
            clock,
        }
    }

    /// Verify every report against the prefetched facts. Pure inspection; no
    /// report is modified.
    pub fn verify(
        &self,
        reports: &[AgentReport],
        facts: &[PrefetchFact],
        intent: Intent,
    ) -> VerificationReport {
        let mut out = VerificationReport::default();
        let horizon_months = *self.horizons.get(&intent).unwrap_or(&24);

        for report in reports {
            if report.is_empty_result() {
                continue;
            }
            self.check_numbers(report, facts, &mut out);
            self.check_freshness(report, horizon_months, &mut out);
        }

        out
    }

    fn check_numbers(
        &self,
        report: &AgentReport,
        facts: &[PrefetchFact],
        out: &mut VerificationReport,
    ) {
        let narrative = report.narrative.as_str();
        let metadata_numbers: Vec<f64> = report.metric_values().iter().map(|(_, v)| *v).collect();

        for token in NUMBER_TOKEN.find_iter(narrative) {
            let raw = token.as_str().trim();
            if looks_like_year(raw) {
                continue;
            }

            let window = window_around(narrative, token.start(), token.end(), self.citation_window);
            let cited = citation_in_window(report, window);

            if !cited {
                out.citation_violations += 1;
                out.violations.push(Violation {
                    kind: ViolationKind::MissingCitation,
                    agent_id: report.agent_id.clone(),
                    detail: format!("'{}' has no citation within {} characters", raw, self.citation_window),
                });
            }

            let value = raw.trim_end_matches('%').trim().parse::<f64>().ok();
            let backed = match value {
                Some(v) => {
                    facts
                        .iter()
                        .any(|f| f.value.as_number().map(|n| close(n, v)).unwrap_or(false))
                        || metadata_numbers.iter().any(|n| close(*n, v))
                }
                None => false,
            };

            if !backed && !cited {
                out.fabricated_numbers += 1;
                out.violations.push(Violation {
                    kind: ViolationKind::FabricatedNumber,
                    agent_id: report.agent_id.clone(),
                    detail: format!("'{}' matches no prefetched fact and carries no citation", raw),
                });
            }
        }
    }

    fn check_freshness(&self, report: &AgentReport, horizon_months: u32, out: &mut VerificationReport) {
        let now = self.clock.now();
        for caps in DATE_REFERENCE.captures_iter(&report.narrative) {
            let year: i32 = match caps[2].parse() {
                Ok(y) => y,
                Err(_) => continue,
            };
            // Without a month the claim is dated to December, the most
            // lenient reading.
            let month = caps
                .get(1)
                .map(|m| month_number(m.as_str()))
                .unwrap_or(12);

            let age_months = (now.year() - year) * 12 + now.month() as i32 - month as i32;
            if age_months > horizon_months as i32 {
                out.stale_claims += 1;
                out.violations.push(Violation {
                    kind: ViolationKind::StaleClaim,
                    agent_id: report.agent_id.clone(),
                    detail: format!(
                        "claim dated {} is {} months old; horizon is {} months",
                        caps[0].trim(),
                        age_months,
                        horizon_months
                    ),
                });
            }
        }
    }
}

/// A bare 4-digit 19xx/20xx token is a date, not a quantitative claim.
fn looks_like_year(raw: &str) -> bool {
    raw.len() == 4
        && (raw.starts_with("19") || raw.starts_with("20"))
        && raw.chars().all(|c| c.is_ascii_digit())
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-6 * a.abs().max(b.abs()).max(1.0)
}

/// Slice a character window around `[start, end)`, clamped to char
/// boundaries.
fn window_around(text: &str, start: usize, end: usize, window: usize) -> &str {
    let mut from = start.saturating_sub(window);
    while from > 0 && !text.is_char_boundary(from) {
        from -= 1;
    }
    let mut to = (end + window).min(text.len());
    while to < text.len() && !text.is_char_boundary(to) {
        to += 1;
    }
    &text[from..to]
}

fn citation_in_window(report: &AgentReport, window: &str) -> bool {
    report.citations.iter().any(|citation| {
        (!citation.source_id.is_empty() && window.contains(citation.source_id.as_str()))
            || quote_fragment(&citation.quote)
                .map(|fragment| window.contains(fragment))
                .unwrap_or(false)
    })
}

/// First 12 characters of the quote, enough to anchor it in the narrative.
fn quote_fragment(quote: &str) -> Option<&str> {
    if quote.is_empty() {
        return None;
    }
    let mut end = quote.len().min(12);
    while end < quote.len() && !quote.is_char_boundary(end) {
        end += 1;
    }
    Some(&quote[..end])
}

fn month_number(name: &str) -> u32 {
    match name.to_lowercase().as_str() {
        "january" => 1,
        "february" => 2,
        "march" => 3,
        "april" => 4,
        "may" => 5,
        "june" => 6,
        "july" => 7,
        "august" => 8,
        "september" => 9,
        "october" => 10,
        "november" => 11,
        "december" => 12,
        _ => 12,
    }
}
