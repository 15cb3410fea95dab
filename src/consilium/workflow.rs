//! The deliberation engine and its staged workflow.
//!
//! [`DeliberationEngine`] executes the fixed pipeline for one request:
//! classify → prefetch → retrieval → agent selection → agent fan-out →
//! debate → critique → verify → synthesize, threading a single
//! [`AnalysisState`] through the stages and streaming progress events to the
//! request's subscriber. After classification the driver picks one of two
//! terminal paths: the full analytical path, or a short deterministic path
//! that renders the classification directly.
//!
//! Error discipline follows local recovery: only validation and cancellation
//! short-circuit. Everything else degrades — the failing stage records an
//! empty output, the stream carries a warning, and the synthesizer runs over
//! whatever accumulated, so the terminal `(done, complete)` event always
//! arrives for a non-cancelled request.
//!
//! # Example
//!
//! ```rust,no_run
//! use consilium::{AnalysisRequest, DeliberationEngine, EngineConfig};
//!
//! # async {
//! let mut engine = DeliberationEngine::new(EngineConfig::default());
//! // engine.add_agent(...); engine.add_source(...);
//!
//! let mut run = engine.run(AnalysisRequest::new("What is Qatar's unemployment rate?")).unwrap();
//! while let Some(event) = run.events.recv().await {
//!     println!("{}", event.to_wire());
//!     if event.stage == consilium::StageTag::Done {
//!         break;
//!     }
//! }
//! let state = run.finish().await.unwrap();
//! assert!(state.synthesis.is_some());
//! # };
//! ```

use crate::consilium::agent::{AgentContext, AnalysisAgent};
use crate::consilium::classifier::{Classifier, Routing};
use crate::consilium::clock::{Clock, SystemClock};
use crate::consilium::config::EngineConfig;
use crate::consilium::critique::run_critique;
use crate::consilium::debate::DebateOrchestrator;
use crate::consilium::embedder::{Embedder, EmbedderError, EmbedderService};
use crate::consilium::event::{
    AgentSelectionPayload, AgentsPayload, ClassificationPayload, CritiquePayload,
    DebateSummaryPayload, DonePayload, EventBus, EventPayload, EventStream, HeartbeatPayload,
    PrefetchPayload, RagPayload, StageErrorPayload, StageTag, SynthesisPayload,
    VerificationPayload, EventStatus,
};
use crate::consilium::invoker::AgentInvoker;
use crate::consilium::prefetch::{DataSource, FetchPlan, Prefetcher};
use crate::consilium::retrieval::{Retriever, VectorIndex};
use crate::consilium::selector::{AgentRoster, AgentSelector, SelectionRules};
use crate::consilium::state::{AnalysisRequest, AnalysisState, Query, ValidationError};
use crate::consilium::synthesizer::Synthesizer;
use crate::consilium::verifier::Verifier;
use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Result alias for engine-level operations.
pub type EngineResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// A running request: the event stream plus the eventual state.
pub struct DeliberationRun {
    pub request_id: String,
    /// Drain this until the `done` event; exactly one subscriber per request.
    pub events: EventStream,
    cancel: CancellationToken,
    outcome: JoinHandle<AnalysisState>,
}

impl DeliberationRun {
    /// Cancel the request scope. Every stage unwinds promptly and the stream
    /// terminates with `(done, error, reason=cancelled)`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Await the final state. Call after draining (or while ignoring) the
    /// event stream; the stream stays alive until the pipeline finishes.
    pub async fn finish(self) -> EngineResult<AnalysisState> {
        let DeliberationRun {
            events, outcome, ..
        } = self;
        let state = outcome
            .await
            .map_err(|e| Box::new(e) as Box<dyn Error + Send + Sync>)?;
        drop(events);
        Ok(state)
    }
}

/// The multi-agent deliberation engine.
///
/// Configure once with agents, data sources, a vector index, and an
/// embedder, then call [`run`](DeliberationEngine::run) per request.
/// Multiple requests may run concurrently; the engine itself holds only
/// shared immutable configuration.
pub struct DeliberationEngine {
    config: EngineConfig,
    classifier: Classifier,
    roster: AgentRoster,
    selector: AgentSelector,
    sources: Vec<Arc<dyn DataSource>>,
    plan: Option<FetchPlan>,
    index: Option<Arc<dyn VectorIndex>>,
    embedder: Arc<EmbedderService>,
    clock: Arc<dyn Clock>,
}

impl DeliberationEngine {
    pub fn new(config: EngineConfig) -> Self {
        let classifier = Classifier::new(config.min_classifier_confidence);
        Self {
            config,
            classifier,
            roster: AgentRoster::new(),
            selector: AgentSelector::default(),
            sources: Vec::new(),
            plan: None,
            index: None,
            embedder: Arc::new(EmbedderService::disabled()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Arc::new(EmbedderService::new(embedder));
        self
    }

    pub fn with_index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Override the default broadcast fetch plan.
    pub fn with_plan(mut self, plan: FetchPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_selection_rules(mut self, rules: SelectionRules) -> Self {
        self.selector = AgentSelector::new(rules);
        self
    }

    /// Deterministic clock injection for tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register an analytical agent. Returns `false` when its canonical id
    /// is already taken.
    pub fn add_agent(&mut self, agent: Arc<dyn AnalysisAgent>) -> bool {
        self.roster.register(agent)
    }

    /// Register an external data source.
    pub fn add_source(&mut self, source: Arc<dyn DataSource>) {
        self.sources.push(source);
    }

    /// Pre-warm the shared embedder. Idempotent; safe to call from several
    /// tasks at once.
    pub async fn warm(&self) -> Result<(), EmbedderError> {
        self.embedder.warm().await
    }

    /// Start one request. Validation errors are returned synchronously and
    /// no stream is opened; otherwise the pipeline runs in a background task
    /// and streams progress through [`DeliberationRun::events`].
    pub fn run(&self, request: AnalysisRequest) -> Result<DeliberationRun, ValidationError> {
        request.validate()?;

        let query = Query::from_request(&request, self.clock.now());
        let request_id = query.id.clone();
        let cancel = CancellationToken::new();
        let (bus, events) =
            EventBus::channel(Arc::clone(&self.clock), cancel.clone(), self.config.event_watermark);

        let driver = Driver {
            config: self.config.clone(),
            classifier: self.classifier.clone(),
            agents: self.roster.all(),
            selector: self.selector.clone(),
            sources: self.sources.clone(),
            plan: self
                .plan
                .clone()
                .unwrap_or_else(|| {
                    FetchPlan::broadcast(
                        self.sources.iter().map(|s| s.id().to_string()).collect(),
                    )
                }),
            index: self.index.clone(),
            embedder: Arc::clone(&self.embedder),
            clock: Arc::clone(&self.clock),
            bus,
            cancel: cancel.clone(),
        };

        let outcome = tokio::spawn(driver.drive(query));

        Ok(DeliberationRun {
            request_id,
            events,
            cancel,
            outcome,
        })
    }
}

/// Per-request pipeline executor. Owns the [`AnalysisState`] exclusively for
/// the lifetime of the request.
struct Driver {
    config: EngineConfig,
    classifier: Classifier,
    agents: Vec<Arc<dyn AnalysisAgent>>,
    selector: AgentSelector,
    sources: Vec<Arc<dyn DataSource>>,
    plan: FetchPlan,
    index: Option<Arc<dyn VectorIndex>>,
    embedder: Arc<EmbedderService>,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    cancel: CancellationToken,
}

impl Driver {
    async fn drive(self, query: Query) -> AnalysisState {
        let mut state = AnalysisState::new(query);

        if self.config.embedder_warm_on_start && self.embedder.is_available() {
            let embedder = Arc::clone(&self.embedder);
            tokio::spawn(async move {
                if let Err(e) = embedder.warm().await {
                    log::warn!("embedder warm-up failed: {}", e);
                }
            });
        }

        // Heartbeat at request entry, then on the interval while no stage
        // event flows.
        let current_stage = Arc::new(Mutex::new("classify".to_string()));
        self.bus.emit(
            StageTag::Heartbeat,
            EventStatus::Running,
            EventPayload::Heartbeat(HeartbeatPayload {
                waiting_on: "classify".to_string(),
            }),
            None,
        );
        let heartbeat_stop = CancellationToken::new();
        let heartbeat = self.spawn_heartbeat(Arc::clone(&current_stage), heartbeat_stop.clone());

        let cancelled = self
            .run_stages(&mut state, &current_stage)
            .await;

        // The heartbeat must be silent before the terminal event so `done`
        // is the last event on the stream.
        heartbeat_stop.cancel();
        let _ = heartbeat.await;

        let degraded_stages: Vec<String> =
            state.degraded.iter().map(|d| d.stage.clone()).collect();
        if cancelled {
            self.bus.emit(
                StageTag::Done,
                EventStatus::Error,
                EventPayload::Done(DonePayload {
                    request_id: state.query.id.clone(),
                    reason: Some("cancelled".to_string()),
                    error: None,
                    degraded_stages,
                }),
                None,
            );
        } else {
            self.bus.emit(
                StageTag::Done,
                EventStatus::Complete,
                EventPayload::Done(DonePayload {
                    request_id: state.query.id.clone(),
                    reason: None,
                    error: None,
                    degraded_stages,
                }),
                None,
            );
        }

        state
    }

    /// Execute the stage sequence. Returns true when the request was
    /// cancelled before the synthesizer could run.
    async fn run_stages(&self, state: &mut AnalysisState, current_stage: &Arc<Mutex<String>>) -> bool {
        // ── classify ─────────────────────────────────────────────────
        self.enter(current_stage, "classify");
        let sink = self.bus.sink(StageTag::Classify);
        sink.running(EventPayload::Empty {});
        let classification = self.classifier.classify(&state.query.question);
        sink.complete(EventPayload::Classification(ClassificationPayload {
            intent: classification.intent.to_string(),
            complexity: classification.complexity.to_string(),
            confidence: classification.confidence,
            entity_count: classification.entity_count(),
            routing: format!("{:?}", classification.routing),
        }));
        let deterministic_path = self.config.deterministic_routing
            && classification.routing == Routing::DeterministicOnly;
        let recorded = state_record(state, |s| s.record_classification(classification));
        self.record(state, StageTag::Classify, recorded);
        self.log_keys(state, "classify");
        if self.cancel.is_cancelled() {
            return true;
        }

        if !deterministic_path {
            // ── prefetch ─────────────────────────────────────────────
            self.enter(current_stage, "prefetch");
            let sink = self.bus.sink(StageTag::Prefetch);
            sink.running(EventPayload::Empty {});
            let classification = state.classification.clone().unwrap_or_else(|| {
                self.classifier.classify(&state.query.question)
            });
            let prefetcher = Prefetcher::new(
                self.sources.clone(),
                self.plan.clone(),
                self.config.max_prefetch_concurrency,
                Duration::from_millis(self.config.prefetch_timeout_ms),
            );
            let outcome = prefetcher
                .run(&state.query, &classification, &self.cancel)
                .await;
            if !outcome.failures.is_empty() {
                // Warning event naming the failed sources; the stage itself
                // carries on with whatever survived.
                sink.running(EventPayload::Prefetch(PrefetchPayload {
                    fact_count: outcome.facts.len(),
                    sources: outcome.source_ids(),
                    failed_sources: outcome.failed_source_ids(),
                }));
                state.mark_degraded(
                    "prefetch",
                    format!("sources failed: {}", outcome.failed_source_ids().join(", ")),
                );
            }
            sink.complete(EventPayload::Prefetch(PrefetchPayload {
                fact_count: outcome.facts.len(),
                sources: outcome.source_ids(),
                failed_sources: outcome.failed_source_ids(),
            }));
            let recorded = state_record(state, |s| s.record_prefetch(outcome));
            self.record(state, StageTag::Prefetch, recorded);
            self.log_keys(state, "prefetch");
            if self.cancel.is_cancelled() {
                return true;
            }

            // ── retrieval ────────────────────────────────────────────
            self.enter(current_stage, "rag");
            let sink = self.bus.sink(StageTag::Rag);
            sink.running(EventPayload::Empty {});
            let retriever = Retriever::new(
                self.index.clone(),
                Arc::clone(&self.embedder),
                self.config.retrieval_limit,
                self.config.retrieval_floor,
            );
            let (context, snippets) = retriever.retrieve(&state.query).await;
            if let Some(warning) = &context.warning {
                state.mark_degraded("rag", warning.clone());
            }
            sink.complete(EventPayload::Rag(RagPayload {
                snippet_count: context.snippet_count,
                source_ids: context.source_ids.iter().cloned().collect(),
                warning: context.warning.clone(),
            }));
            let recorded = state_record(state, |s| s.record_retrieval(context));
            self.record(state, StageTag::Rag, recorded);
            self.log_keys(state, "rag");
            if self.cancel.is_cancelled() {
                return true;
            }

            // ── agent selection ──────────────────────────────────────
            self.enter(current_stage, "agent_selection");
            let sink = self.bus.sink(StageTag::AgentSelection);
            sink.running(EventPayload::Empty {});
            let classification = state
                .classification
                .clone()
                .unwrap_or_else(|| self.classifier.classify(&state.query.question));
            let mut roster = AgentRoster::new();
            for agent in &self.agents {
                roster.register(Arc::clone(agent));
            }
            let selected = self.selector.select(&roster, &classification);
            let selected_ids: Vec<String> = selected
                .iter()
                .map(|a| crate::consilium::agent::canonical_agent_id(a.id()))
                .collect();
            sink.complete(EventPayload::AgentSelection(AgentSelectionPayload {
                selected: selected_ids.clone(),
                complexity: classification.complexity.to_string(),
            }));
            let recorded = state_record(state, |s| s.record_selected_agents(selected_ids));
            self.record(state, StageTag::AgentSelection, recorded);
            self.log_keys(state, "agent_selection");

            // ── agent fan-out ────────────────────────────────────────
            self.enter(current_stage, "agents");
            let sink = self.bus.sink(StageTag::Agents);
            sink.running(EventPayload::Empty {});
            let ctx = AgentContext {
                query: state.query.clone(),
                classification: classification.clone(),
                facts: Arc::new(
                    state
                        .prefetch
                        .as_ref()
                        .map(|p| p.facts.clone())
                        .unwrap_or_default(),
                ),
                snippets,
            };
            let invoker =
                AgentInvoker::new(Duration::from_millis(self.config.per_agent_timeout_ms));
            let reports = invoker.invoke(&selected, &ctx, &self.cancel, &sink).await;
            let empty_count = reports.iter().filter(|r| r.is_empty_result()).count();
            if empty_count > 0 && empty_count == reports.len() && !reports.is_empty() {
                state.mark_degraded("agents", "every agent returned an empty report".to_string());
            }
            sink.complete(EventPayload::Agents(AgentsPayload {
                report_count: reports.len(),
                empty_count,
            }));
            let recorded = state_record(state, |s| s.record_agent_reports(reports));
            self.record(state, StageTag::Agents, recorded);
            self.log_keys(state, "agents");
            if self.cancel.is_cancelled() {
                return true;
            }

            // ── debate ───────────────────────────────────────────────
            self.enter(current_stage, "debate");
            let sink = self.bus.sink(StageTag::Debate);
            let profile = self
                .config
                .debate_profiles
                .for_complexity(classification.complexity);
            let orchestrator = DebateOrchestrator::new(
                profile,
                self.config.meta_debate_vocabulary.clone(),
                self.config.agreement_phrases.clone(),
                self.config.repetition_phrases.clone(),
                self.config.agreement_hit_threshold,
                self.config.repetition_hit_threshold,
                self.config.contradiction_tolerance,
                Arc::clone(&self.clock),
                Arc::clone(&self.embedder),
            );
            let reports = state.agent_reports.clone().unwrap_or_default();
            let results = orchestrator
                .run(&selected, &reports, &classification, &state.query, &self.cancel, &sink)
                .await;
            sink.complete(EventPayload::DebateSummary(DebateSummaryPayload {
                completion: results.completion.to_string(),
                turn_count: results.turns.len() as u32,
                contradiction_count: results.contradictions.len(),
                resolution_count: results.resolutions.len(),
                refocused: results.refocused,
            }));
            let recorded = state_record(state, |s| s.record_debate(results));
            self.record(state, StageTag::Debate, recorded);
            self.log_keys(state, "debate");
            if self.cancel.is_cancelled() {
                return true;
            }

            // ── critique ─────────────────────────────────────────────
            self.enter(current_stage, "critique");
            let sink = self.bus.sink(StageTag::Critique);
            sink.running(EventPayload::Empty {});
            let critique = run_critique(
                state.agent_reports.as_deref().unwrap_or(&[]),
                state.debate.as_ref(),
            );
            sink.complete(EventPayload::Critique(CritiquePayload {
                item_count: critique.items.len(),
                assessment_preview: critique.assessment.chars().take(160).collect(),
            }));
            let recorded = state_record(state, |s| s.record_critique(critique));
            self.record(state, StageTag::Critique, recorded);
            self.log_keys(state, "critique");

            // ── verify ───────────────────────────────────────────────
            self.enter(current_stage, "verify");
            let sink = self.bus.sink(StageTag::Verify);
            sink.running(EventPayload::Empty {});
            let verifier = Verifier::new(
                self.config.citation_window,
                self.config.verifier_freshness_horizons.clone(),
                Arc::clone(&self.clock),
            );
            let verification = verifier.verify(
                state.agent_reports.as_deref().unwrap_or(&[]),
                state
                    .prefetch
                    .as_ref()
                    .map(|p| p.facts.as_slice())
                    .unwrap_or(&[]),
                classification.intent,
            );
            sink.complete(EventPayload::Verification(VerificationPayload {
                citation_violations: verification.citation_violations,
                fabricated_numbers: verification.fabricated_numbers,
                stale_claims: verification.stale_claims,
            }));
            let recorded = state_record(state, |s| s.record_verification(verification));
            self.record(state, StageTag::Verify, recorded);
            self.log_keys(state, "verify");
            if self.cancel.is_cancelled() {
                return true;
            }
        }

        // ── synthesize ───────────────────────────────────────────────
        // Runs for every non-cancelled request, whatever accumulated.
        self.enter(current_stage, "synthesize");
        let sink = self.bus.sink(StageTag::Synthesize);
        sink.running(EventPayload::Empty {});
        let synthesizer = Synthesizer::new(
            Arc::clone(&self.embedder),
            self.config.clustering_threshold,
            self.config.lexical_clustering_threshold,
        );
        let synthesis = synthesizer.synthesize(state).await;
        sink.complete(EventPayload::Synthesis(SynthesisPayload {
            cluster_count: synthesis.clusters.len(),
            confidence: synthesis.confidence,
            degraded_clustering: synthesis.degraded_clustering,
        }));
        let recorded = state_record(state, |s| s.record_synthesis(synthesis));
        self.record(state, StageTag::Synthesize, recorded);
        self.log_keys(state, "synthesize");

        false
    }

    fn spawn_heartbeat(
        &self,
        current_stage: Arc<Mutex<String>>,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let bus = self.bus.clone();
        let interval = Duration::from_millis(self.config.heartbeat_interval_ms.max(1));
        tokio::spawn(async move {
            let mut seen = bus.stage_event_count();
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let now = bus.stage_event_count();
                if now == seen {
                    let waiting_on = current_stage
                        .lock()
                        .map(|s| s.clone())
                        .unwrap_or_else(|_| "unknown".to_string());
                    bus.emit(
                        StageTag::Heartbeat,
                        EventStatus::Running,
                        EventPayload::Heartbeat(HeartbeatPayload { waiting_on }),
                        None,
                    );
                }
                seen = now;
            }
        })
    }

    fn enter(&self, current_stage: &Arc<Mutex<String>>, stage: &str) {
        if let Ok(mut current) = current_stage.lock() {
            *current = stage.to_string();
        }
    }

    /// A failed state write is a driver bug: log the keyset, emit a stage
    /// error, keep going with the slot absent.
    fn record(&self, state: &mut AnalysisState, tag: StageTag, result: Result<(), String>) {
        if let Err(message) = result {
            let stage = tag.to_string();
            log::error!(
                "stage '{}' could not record output (state keys: {:?}): {}",
                stage,
                state.stage_keys(),
                message
            );
            self.bus.emit(
                tag,
                EventStatus::Error,
                EventPayload::StageError(StageErrorPayload {
                    kind: "stage-internal-bug".to_string(),
                    message: message.clone(),
                }),
                None,
            );
            state.mark_degraded(stage, message);
        }
    }

    fn log_keys(&self, state: &AnalysisState, stage: &str) {
        if log::log_enabled!(log::Level::Debug) {
            log::debug!("after {}: state keys = {:?}", stage, state.stage_keys());
        }
    }
}

/// Adapter so stage record calls read naturally at the call site.
fn state_record<F>(state: &mut AnalysisState, f: F) -> Result<(), String>
where
    F: FnOnce(&mut AnalysisState) -> Result<(), crate::consilium::state::StageAlreadyRecorded>,
{
    f(state).map_err(|e| e.to_string())
}
