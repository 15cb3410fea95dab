//! Prefetch fan-out over external data sources.
//!
//! Before any agent runs, the engine fires bounded-parallel requests at the
//! configured [`DataSource`]s and distils their payloads into typed
//! [`PrefetchFact`]s. Partial failure is expected and non-fatal: the stage
//! completes as long as at least one fact was extracted or the plan declared
//! no sources for the intent, and every failure is carried forward so the
//! final briefing can enumerate degraded inputs.
//!
//! Facts are ordered by (source id, extraction order) so a second run with
//! identical inputs produces an identical fact list.

use crate::consilium::classifier::{Classification, EntityKind, Intent};
use crate::consilium::state::Query;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Maximum stored length for textual fact values and snippets.
const MAX_TEXT_LEN: usize = 280;

/// Default confidence when a source payload does not report one.
const DEFAULT_FACT_CONFIDENCE: f32 = 0.75;

/// The typed value of a prefetched fact.
#[derive(Debug, Clone, PartialEq)]
pub enum FactValue {
    Number(f64),
    /// Bounded at 280 characters on extraction.
    Text(String),
    Flag(bool),
}

impl FactValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FactValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for FactValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactValue::Number(n) => write!(f, "{}", n),
            FactValue::Text(s) => write!(f, "{}", s),
            FactValue::Flag(b) => write!(f, "{}", b),
        }
    }
}

/// A typed, sourced factual datum retrieved before agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchFact {
    pub metric: String,
    pub value: FactValue,
    /// Stable connector id.
    pub source_id: String,
    pub confidence: f32,
    /// Raw snippet the value was extracted from.
    pub snippet: String,
}

/// A source that failed during the fan-out. Non-fatal.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchFailure {
    pub source_id: String,
    pub error: String,
}

/// Output of the prefetch stage.
#[derive(Debug, Clone, Default)]
pub struct PrefetchOutcome {
    /// Ordered by (source id, extraction order).
    pub facts: Vec<PrefetchFact>,
    pub failures: Vec<FetchFailure>,
}

impl PrefetchOutcome {
    /// Distinct source ids that contributed at least one fact.
    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for fact in &self.facts {
            if !ids.contains(&fact.source_id) {
                ids.push(fact.source_id.clone());
            }
        }
        ids
    }

    pub fn failed_source_ids(&self) -> Vec<String> {
        self.failures.iter().map(|f| f.source_id.clone()).collect()
    }
}

/// Error raised by a data source.
#[derive(Debug, Clone)]
pub enum SourceError {
    /// Transport or upstream failure.
    Upstream(String),
    /// The source answered but the payload was unusable.
    BadPayload(String),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Upstream(msg) => write!(f, "upstream failure: {}", msg),
            SourceError::BadPayload(msg) => write!(f, "bad payload: {}", msg),
        }
    }
}

impl Error for SourceError {}

/// What a source gets to see about the request.
#[derive(Debug, Clone)]
pub struct SourceRequest {
    pub question: String,
    pub intent: Intent,
    pub entities: HashMap<EntityKind, Vec<String>>,
}

/// An external data connector. Implementations own their connection pools;
/// the engine treats them as opaque.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Stable connector id used in fact provenance and the fetch plan.
    fn id(&self) -> &str;

    /// Fetch a JSON payload for the request.
    async fn fetch(&self, request: &SourceRequest) -> Result<Value, SourceError>;
}

/// One routing rule: which sources serve an intent, optionally only when an
/// entity of the given kind was extracted.
#[derive(Debug, Clone)]
pub struct PlanRule {
    pub intent: Intent,
    pub entity_kind: Option<EntityKind>,
    pub source_ids: Vec<String>,
}

/// The per-intent fetch plan. An empty plan (or an intent with no rules)
/// means the stage completes trivially with zero facts.
#[derive(Debug, Clone, Default)]
pub struct FetchPlan {
    rules: Vec<PlanRule>,
}

impl FetchPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route every intent to the same set of sources.
    pub fn broadcast(source_ids: Vec<String>) -> Self {
        let mut plan = Self::new();
        for intent in [
            Intent::Policy,
            Intent::Comparison,
            Intent::Trend,
            Intent::Forecast,
            Intent::Diagnostic,
            Intent::Generic,
        ]
        .iter()
        {
            plan.rules.push(PlanRule {
                intent: *intent,
                entity_kind: None,
                source_ids: source_ids.clone(),
            });
        }
        plan
    }

    pub fn with_rule(
        mut self,
        intent: Intent,
        entity_kind: Option<EntityKind>,
        source_ids: Vec<String>,
    ) -> Self {
        self.rules.push(PlanRule {
            intent,
            entity_kind,
            source_ids,
        });
        self
    }

    /// Source ids to query for this classification, deduplicated, in rule
    /// order.
    pub fn sources_for(&self, classification: &Classification) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for rule in &self.rules {
            if rule.intent != classification.intent {
                continue;
            }
            if let Some(kind) = rule.entity_kind {
                if classification.entities_of(kind).is_empty() {
                    continue;
                }
            }
            for id in &rule.source_ids {
                if !ids.contains(id) {
                    ids.push(id.clone());
                }
            }
        }
        ids
    }
}

/// The prefetch stage: plan resolution, bounded fan-out, fact extraction.
pub struct Prefetcher {
    sources: HashMap<String, Arc<dyn DataSource>>,
    plan: FetchPlan,
    concurrency: usize,
    per_source_timeout: Duration,
}

impl Prefetcher {
    pub fn new(
        sources: Vec<Arc<dyn DataSource>>,
        plan: FetchPlan,
        concurrency: usize,
        per_source_timeout: Duration,
    ) -> Self {
        let mut by_id = HashMap::new();
        for source in sources {
            by_id.insert(source.id().to_string(), source);
        }
        Self {
            sources: by_id,
            plan,
            concurrency: concurrency.max(1),
            per_source_timeout,
        }
    }

    /// Run the fan-out. Never fails; every per-source problem becomes a
    /// [`FetchFailure`].
    pub async fn run(
        &self,
        query: &Query,
        classification: &Classification,
        cancel: &CancellationToken,
    ) -> PrefetchOutcome {
        let planned = self.plan.sources_for(classification);
        if planned.is_empty() {
            log::debug!("prefetch plan declared no sources for intent {}", classification.intent);
            return PrefetchOutcome::default();
        }

        let request = Arc::new(SourceRequest {
            question: query.question.clone(),
            intent: classification.intent,
            entities: classification.entities.clone(),
        });

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = Vec::new();

        for source_id in planned {
            let source = match self.sources.get(&source_id) {
                Some(source) => Arc::clone(source),
                None => {
                    tasks.push(tokio::spawn(async move {
                        (source_id, Err("source not registered".to_string()))
                    }));
                    continue;
                }
            };
            let request = Arc::clone(&request);
            let semaphore = Arc::clone(&semaphore);
            let timeout = self.per_source_timeout;
            let cancel = cancel.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return (source_id, Err("semaphore closed".to_string())),
                };

                let fetched = tokio::select! {
                    _ = cancel.cancelled() => Err("cancelled".to_string()),
                    result = tokio::time::timeout(timeout, source.fetch(&request)) => match result {
                        Ok(Ok(payload)) => Ok(payload),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err(format!("timed out after {:?}", timeout)),
                    },
                };

                match fetched {
                    Ok(payload) => {
                        let facts = extract_facts(&source_id, &payload);
                        if facts.is_empty() {
                            (source_id, Err("no facts in payload".to_string()))
                        } else {
                            (source_id, Ok(facts))
                        }
                    }
                    Err(e) => (source_id, Err(e)),
                }
            }));
        }

        let mut per_source: Vec<(String, Vec<PrefetchFact>)> = Vec::new();
        let mut failures: Vec<FetchFailure> = Vec::new();

        for task in tasks {
            match task.await {
                Ok((source_id, Ok(facts))) => per_source.push((source_id, facts)),
                Ok((source_id, Err(error))) => {
                    if log::log_enabled!(log::Level::Warn) {
                        log::warn!("prefetch source '{}' failed: {}", source_id, error);
                    }
                    failures.push(FetchFailure { source_id, error });
                }
                Err(join_error) => {
                    failures.push(FetchFailure {
                        source_id: "unknown".to_string(),
                        error: format!("task join error: {}", join_error),
                    });
                }
            }
        }

        // Deterministic ordering: source id first, extraction order within.
        per_source.sort_by(|a, b| a.0.cmp(&b.0));
        failures.sort_by(|a, b| a.source_id.cmp(&b.source_id));

        let facts = per_source.into_iter().flat_map(|(_, facts)| facts).collect();

        PrefetchOutcome { facts, failures }
    }
}

/// Distil a source payload into facts.
///
/// Accepts the two payload shapes connectors commonly return: an object with
/// a `facts` / `observations` / `data` array of records, or a flat object
/// mapping metric names to scalar values.
pub fn extract_facts(source_id: &str, payload: &Value) -> Vec<PrefetchFact> {
    let mut facts = Vec::new();

    if let Some(object) = payload.as_object() {
        let records = ["facts", "observations", "data"]
            .iter()
            .find_map(|key| object.get(*key).and_then(|v| v.as_array()));

        if let Some(records) = records {
            for record in records {
                if let Some(fact) = fact_from_record(source_id, record) {
                    facts.push(fact);
                }
            }
            return facts;
        }

        for (key, value) in object {
            if let Some(fact_value) = scalar_value(value) {
                facts.push(PrefetchFact {
                    metric: key.clone(),
                    value: fact_value,
                    source_id: source_id.to_string(),
                    confidence: DEFAULT_FACT_CONFIDENCE,
                    snippet: truncate(&value.to_string()),
                });
            }
        }
    }

    facts
}

fn fact_from_record(source_id: &str, record: &Value) -> Option<PrefetchFact> {
    let object = record.as_object()?;
    let metric = ["metric", "name", "indicator"]
        .iter()
        .find_map(|key| object.get(*key).and_then(|v| v.as_str()))?;
    let value = scalar_value(object.get("value")?)?;
    let confidence = object
        .get("confidence")
        .and_then(|v| v.as_f64())
        .map(|c| c as f32)
        .unwrap_or(DEFAULT_FACT_CONFIDENCE);
    let snippet = object
        .get("snippet")
        .or_else(|| object.get("text"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| record.to_string());

    Some(PrefetchFact {
        metric: metric.to_string(),
        value,
        source_id: source_id.to_string(),
        confidence: confidence.max(0.0).min(1.0),
        snippet: truncate(&snippet),
    })
}

fn scalar_value(value: &Value) -> Option<FactValue> {
    match value {
        Value::Number(n) => n.as_f64().map(FactValue::Number),
        Value::Bool(b) => Some(FactValue::Flag(*b)),
        Value::String(s) => Some(FactValue::Text(truncate(s))),
        _ => None,
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_TEXT_LEN {
        text.to_string()
    } else {
        text.chars().take(MAX_TEXT_LEN).collect()
    }
}
