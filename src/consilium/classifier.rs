//! Question classification.
//!
//! Turns a natural-language policy question into a [`Classification`]: an
//! intent tag, a complexity tier, extracted entities, and a routing decision.
//! The classifier is deterministic and fully local — a lexicon-driven scorer
//! over a small intent catalog plus entity lexicons and a time-horizon miner.
//! No LLM and no network call happens here, which is what makes the short
//! deterministic pipeline path possible.
//!
//! # Example
//!
//! ```rust
//! use consilium::{Classifier, Complexity, Intent};
//!
//! let classifier = Classifier::default();
//! let c = classifier.classify("Should Qatar invest $15B in food self-sufficiency by 2030?");
//!
//! assert_eq!(c.intent, Intent::Policy);
//! assert_eq!(c.complexity, Complexity::Complex); // strategic keyword override
//! ```

use chrono::{Datelike, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Intent tag assigned to a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Policy,
    Comparison,
    Trend,
    Forecast,
    Diagnostic,
    /// Fallback when no intent scores above the confidence floor.
    Generic,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Intent::Policy => "policy",
            Intent::Comparison => "comparison",
            Intent::Trend => "trend",
            Intent::Forecast => "forecast",
            Intent::Diagnostic => "diagnostic",
            Intent::Generic => "generic",
        };
        write!(f, "{}", tag)
    }
}

/// Complexity tier. Ordering matters: the final tier is the maximum of
/// several independent signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Standard,
    Complex,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Complexity::Simple => "simple",
            Complexity::Standard => "standard",
            Complexity::Complex => "complex",
        };
        write!(f, "{}", tag)
    }
}

/// Kinds of entities the classifier extracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Sector,
    Country,
    Metric,
    TimeWindow,
}

/// Suggested downstream routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Routing {
    /// Render the classification directly; skip agents and debate.
    DeterministicOnly,
    /// Run the full analytical path.
    LlmAgents,
}

/// Structured interpretation of a question.
#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub intent: Intent,
    pub complexity: Complexity,
    /// Scorer confidence in `[0, 1]`.
    pub confidence: f32,
    /// Normalized entity strings grouped by kind.
    pub entities: HashMap<EntityKind, Vec<String>>,
    pub routing: Routing,
}

impl Classification {
    /// Total number of extracted entities across all kinds.
    pub fn entity_count(&self) -> usize {
        self.entities.values().map(|v| v.len()).sum()
    }

    /// Entities of one kind, empty slice when none were found.
    pub fn entities_of(&self, kind: EntityKind) -> &[String] {
        self.entities.get(&kind).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

struct IntentEntry {
    intent: Intent,
    keywords: &'static [&'static str],
    floor: Complexity,
}

static INTENT_CATALOG: &[IntentEntry] = &[
    IntentEntry {
        intent: Intent::Policy,
        keywords: &[
            "should", "policy", "invest", "strategy", "recommend", "subsidy", "regulation",
            "reform", "intervention",
        ],
        floor: Complexity::Standard,
    },
    IntentEntry {
        intent: Intent::Comparison,
        keywords: &[
            "compare", "comparison", "versus", " vs ", "relative to", "benchmark",
            "difference between", "better than",
        ],
        floor: Complexity::Standard,
    },
    IntentEntry {
        intent: Intent::Forecast,
        keywords: &[
            "forecast", "projection", "outlook", "expected to", "predict", "will reach",
            "scenario",
        ],
        floor: Complexity::Standard,
    },
    IntentEntry {
        intent: Intent::Trend,
        keywords: &[
            "trend", "over time", "evolution", "historical", "trajectory", "has changed",
            "since 20",
        ],
        floor: Complexity::Simple,
    },
    IntentEntry {
        intent: Intent::Diagnostic,
        keywords: &[
            "what is", "what's", "current", "latest", "how many", "how much", "rate", "level of",
        ],
        floor: Complexity::Simple,
    },
];

static SECTOR_LEXICON: &[&str] = &[
    "oil and gas",
    "food security",
    "labor market",
    "real estate",
    "financial services",
    "energy",
    "finance",
    "banking",
    "tourism",
    "construction",
    "agriculture",
    "logistics",
    "manufacturing",
    "education",
    "healthcare",
    "technology",
    "hospitality",
];

static METRIC_LEXICON: &[&str] = &[
    "labor force participation",
    "foreign direct investment",
    "unemployment rate",
    "participation rate",
    "self-sufficiency",
    "gdp growth",
    "unemployment",
    "inflation",
    "productivity",
    "exports",
    "imports",
    "wages",
    "gdp",
    "fdi",
];

static COUNTRY_LEXICON: &[&str] = &[
    "united arab emirates",
    "saudi arabia",
    "united states",
    "south korea",
    "qatar",
    "kuwait",
    "bahrain",
    "oman",
    "gcc",
    "china",
    "india",
    "germany",
    "japan",
    "singapore",
    "norway",
];

static STRATEGIC_TERMS: &[&str] = &[
    "national strategy",
    "national vision",
    "vision 2030",
    "self-sufficiency",
    "sovereign wealth",
    "national security",
    "diversification",
];

lazy_static! {
    static ref INVESTMENT_AMOUNT: Regex =
        Regex::new(r"(?i)\$\s?\d+(?:\.\d+)?\s?(?:billion|million|bn|mn|[bm])\b").unwrap();
    static ref TARGET_YEAR: Regex = Regex::new(r"(?i)\bby\s+(20\d{2})\b").unwrap();
    static ref YEAR_SPAN: Regex = Regex::new(r"(?i)\b(\d{1,2})\s*-?\s*year").unwrap();
    static ref NEXT_YEARS: Regex = Regex::new(r"(?i)\bnext\s+(\d{1,2})\s+years?\b").unwrap();
    static ref SINCE_YEAR: Regex = Regex::new(r"(?i)\bsince\s+(20\d{2})\b").unwrap();
}

/// Deterministic, local question classifier.
///
/// `classify` is a pure function of the question text and the classifier's
/// construction-time state (lexicons, thresholds, reference year), so
/// repeated calls with the same input always produce the same
/// [`Classification`].
#[derive(Debug, Clone)]
pub struct Classifier {
    min_confidence: f32,
    /// Year used to turn "by 2030" into a horizon length. Captured once at
    /// construction so classification stays idempotent for the process
    /// lifetime.
    reference_year: i32,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(0.55)
    }
}

impl Classifier {
    /// Create a classifier with the given minimum confidence floor.
    pub fn new(min_confidence: f32) -> Self {
        Self {
            min_confidence,
            reference_year: Utc::now().year(),
        }
    }

    /// Pin the reference year used by the horizon miner (tests).
    pub fn with_reference_year(mut self, year: i32) -> Self {
        self.reference_year = year;
        self
    }

    /// Classify a question. Never fails: below-threshold scores downgrade to
    /// `Intent::Generic` / `Complexity::Standard` instead of erroring.
    pub fn classify(&self, question: &str) -> Classification {
        let text = question.to_lowercase();

        let (intent, matches, floor) = self.score_intent(&text);
        let confidence = if matches == 0 {
            0.30
        } else {
            (0.50 + 0.12 * matches as f32).min(0.95)
        };

        let entities = self.extract_entities(&text);
        let horizon_years = self.mine_horizon(&text);
        let strategic = self.is_strategic(&text);

        let (intent, floor, confidence) = if confidence < self.min_confidence {
            (Intent::Generic, Complexity::Standard, confidence)
        } else {
            (intent, floor, confidence)
        };

        let complexity = self.complexity_for(floor, &entities, horizon_years, strategic);

        let routing = if intent == Intent::Diagnostic
            && complexity == Complexity::Simple
            && confidence >= 0.90
        {
            Routing::DeterministicOnly
        } else {
            Routing::LlmAgents
        };

        Classification {
            intent,
            complexity,
            confidence,
            entities,
            routing,
        }
    }

    fn score_intent(&self, text: &str) -> (Intent, usize, Complexity) {
        let mut best: Option<(&IntentEntry, usize)> = None;
        for entry in INTENT_CATALOG {
            let matches = entry.keywords.iter().filter(|k| text.contains(*k)).count();
            match best {
                Some((_, best_matches)) if matches <= best_matches => {}
                _ if matches > 0 => best = Some((entry, matches)),
                _ => {}
            }
        }
        match best {
            Some((entry, matches)) => (entry.intent, matches, entry.floor),
            None => (Intent::Generic, 0, Complexity::Standard),
        }
    }

    fn extract_entities(&self, text: &str) -> HashMap<EntityKind, Vec<String>> {
        let mut entities: HashMap<EntityKind, Vec<String>> = HashMap::new();

        for (kind, lexicon) in [
            (EntityKind::Sector, SECTOR_LEXICON),
            (EntityKind::Metric, METRIC_LEXICON),
            (EntityKind::Country, COUNTRY_LEXICON),
        ]
        .iter()
        {
            // Lexicons are ordered longest-first so "unemployment rate" wins
            // over "unemployment" and the shorter term is suppressed.
            let mut found: Vec<String> = Vec::new();
            for term in lexicon.iter() {
                if text.contains(term) && !found.iter().any(|f| f.contains(term)) {
                    found.push((*term).to_string());
                }
            }
            if !found.is_empty() {
                entities.insert(*kind, found);
            }
        }

        let mut windows: Vec<String> = Vec::new();
        if let Some(caps) = TARGET_YEAR.captures(text) {
            windows.push(format!("by {}", &caps[1]));
        }
        if let Some(caps) = NEXT_YEARS.captures(text) {
            windows.push(format!("next {} years", &caps[1]));
        } else if let Some(caps) = YEAR_SPAN.captures(text) {
            windows.push(format!("{}-year", &caps[1]));
        }
        if let Some(caps) = SINCE_YEAR.captures(text) {
            windows.push(format!("since {}", &caps[1]));
        }
        if !windows.is_empty() {
            entities.insert(EntityKind::TimeWindow, windows);
        }

        entities
    }

    /// Longest horizon implied by the question, in years. Zero when no time
    /// window was found.
    fn mine_horizon(&self, text: &str) -> u32 {
        let mut horizon: u32 = 0;

        if let Some(caps) = TARGET_YEAR.captures(text) {
            if let Ok(year) = caps[1].parse::<i32>() {
                let delta = year - self.reference_year;
                if delta > 0 {
                    horizon = horizon.max(delta as u32);
                }
            }
        }
        for re in [&*NEXT_YEARS, &*YEAR_SPAN].iter() {
            if let Some(caps) = re.captures(text) {
                if let Ok(years) = caps[1].parse::<u32>() {
                    horizon = horizon.max(years);
                }
            }
        }

        horizon
    }

    fn is_strategic(&self, text: &str) -> bool {
        INVESTMENT_AMOUNT.is_match(text) || STRATEGIC_TERMS.iter().any(|t| text.contains(t))
    }

    fn complexity_for(
        &self,
        floor: Complexity,
        entities: &HashMap<EntityKind, Vec<String>>,
        horizon_years: u32,
        strategic: bool,
    ) -> Complexity {
        // Strategic keywords force complex regardless of everything else.
        if strategic {
            return Complexity::Complex;
        }

        let entity_count: usize = entities.values().map(|v| v.len()).sum();
        let multiplicity = if entity_count >= 5 {
            Complexity::Complex
        } else if entity_count >= 3 {
            Complexity::Standard
        } else {
            Complexity::Simple
        };

        let horizon = if horizon_years > 3 {
            Complexity::Complex
        } else if horizon_years >= 1 {
            Complexity::Standard
        } else {
            Complexity::Simple
        };

        floor.max(multiplicity).max(horizon)
    }
}
