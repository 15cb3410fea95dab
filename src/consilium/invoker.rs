//! Parallel agent invocation.
//!
//! Runs the selected agents concurrently and collects their reports. A
//! single agent timing out or failing never fails the stage: the agent
//! contributes an empty report (narrative "no result", confidence 0, one
//! warning) and the pipeline moves on. Reports come back ordered by
//! canonical agent id so downstream consumption is deterministic.
//!
//! The per-invocation deadline adapts to query complexity — simple lookups
//! get a quarter of the configured budget, standard queries half, complex
//! queries the full budget.

use crate::consilium::agent::{canonical_agent_id, AgentContext, AnalysisAgent, AgentReport};
use crate::consilium::classifier::Complexity;
use crate::consilium::event::{AgentPayload, EventSink, EventStatus, EventPayload, StageErrorPayload, StageTag};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The agent fan-out stage.
pub struct AgentInvoker {
    base_timeout: Duration,
}

impl AgentInvoker {
    pub fn new(base_timeout: Duration) -> Self {
        Self { base_timeout }
    }

    /// Effective per-agent deadline for a complexity tier.
    pub fn timeout_for(&self, complexity: Complexity) -> Duration {
        match complexity {
            Complexity::Simple => self.base_timeout / 4,
            Complexity::Standard => self.base_timeout / 2,
            Complexity::Complex => self.base_timeout,
        }
    }

    /// Run every selected agent in parallel and merge the reports.
    ///
    /// Returned reports are keyed and ordered by canonical agent id. If two
    /// reports normalize to the same id (impossible when selection
    /// normalized correctly; kept as a safeguard) the later one wins and a
    /// warning is logged.
    pub async fn invoke(
        &self,
        agents: &[Arc<dyn AnalysisAgent>],
        ctx: &AgentContext,
        cancel: &CancellationToken,
        sink: &EventSink,
    ) -> Vec<AgentReport> {
        let timeout = self.timeout_for(ctx.classification.complexity);
        let mut tasks = Vec::new();

        for agent in agents {
            let agent = Arc::clone(agent);
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            let canonical = canonical_agent_id(agent.id());

            sink.emit_as(
                StageTag::Agent(canonical.clone()),
                EventStatus::Running,
                EventPayload::Empty {},
            );

            tasks.push(tokio::spawn(async move {
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => Err("cancelled".to_string()),
                    result = tokio::time::timeout(timeout, agent.analyze(&ctx)) => match result {
                        Ok(Ok(report)) => Ok(report),
                        Ok(Err(e)) => Err(format!("agent failed: {}", e)),
                        Err(_) => Err(format!("timed out after {:?}", timeout)),
                    },
                };
                (canonical, outcome)
            }));
        }

        let mut merged: BTreeMap<String, AgentReport> = BTreeMap::new();

        for task in tasks {
            let (canonical, outcome) = match task.await {
                Ok(pair) => pair,
                Err(join_error) => {
                    log::error!("agent task join error: {}", join_error);
                    continue;
                }
            };

            let report = match outcome {
                Ok(mut report) => {
                    // Reports are keyed case-insensitively no matter what id
                    // the agent layer wrote into them.
                    report.agent_id = canonical_agent_id(&report.agent_id);
                    if report.agent_id != canonical {
                        log::warn!(
                            "agent '{}' reported under id '{}'; reindexing",
                            canonical,
                            report.agent_id
                        );
                        report.agent_id = canonical.clone();
                    }
                    sink.emit_as(
                        StageTag::Agent(canonical.clone()),
                        EventStatus::Complete,
                        EventPayload::Agent(AgentPayload {
                            agent_id: canonical.clone(),
                            confidence: report.confidence,
                            finding_count: report.findings.len(),
                            warning_count: report.warnings.len(),
                        }),
                    );
                    report
                }
                Err(error) => {
                    log::warn!("agent '{}' produced no report: {}", canonical, error);
                    sink.emit_as(
                        StageTag::Agent(canonical.clone()),
                        EventStatus::Error,
                        EventPayload::StageError(StageErrorPayload {
                            kind: "agent_failure".to_string(),
                            message: error.clone(),
                        }),
                    );
                    AgentReport::empty(canonical.clone(), error)
                }
            };

            if merged.contains_key(&canonical) {
                log::warn!(
                    "duplicate report for canonical id '{}'; later report overwrites",
                    canonical
                );
            }
            merged.insert(canonical, report);
        }

        merged.into_iter().map(|(_, report)| report).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consilium::agent::{AgentResult, DebatePrompt};
    use crate::consilium::classifier::Classifier;
    use crate::consilium::clock::SystemClock;
    use crate::consilium::event::EventBus;
    use crate::consilium::state::{AnalysisRequest, Query};
    use async_trait::async_trait;
    use chrono::Utc;

    struct ScriptedAgent {
        id: String,
        report_id: String,
        delay_ms: u64,
        fail: bool,
    }

    #[async_trait]
    impl AnalysisAgent for ScriptedAgent {
        fn id(&self) -> &str {
            &self.id
        }

        fn name(&self) -> &str {
            &self.id
        }

        async fn analyze(&self, _ctx: &AgentContext) -> AgentResult<AgentReport> {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail {
                return Err("upstream LLM error".into());
            }
            let mut report = AgentReport::new(self.report_id.clone(), "analysis text", 0.8);
            report.agent_id = self.report_id.clone(); // bypass normalization on purpose
            Ok(report)
        }

        async fn debate_turn(&self, _prompt: &DebatePrompt) -> AgentResult<String> {
            Ok("turn".to_string())
        }
    }

    fn ctx() -> AgentContext {
        AgentContext {
            query: Query::from_request(&AnalysisRequest::new("q"), Utc::now()),
            classification: Classifier::default().classify("What is the unemployment rate?"),
            facts: Arc::new(Vec::new()),
            snippets: Arc::new(Vec::new()),
        }
    }

    fn sink() -> (EventSink, crate::consilium::event::EventStream) {
        let (bus, stream) = EventBus::channel(
            Arc::new(SystemClock),
            CancellationToken::new(),
            1_024,
        );
        (bus.sink(StageTag::Agents), stream)
    }

    #[tokio::test]
    async fn reports_come_back_sorted_by_canonical_id() {
        let agents: Vec<Arc<dyn AnalysisAgent>> = vec![
            Arc::new(ScriptedAgent {
                id: "Zeta".into(),
                report_id: "Zeta".into(),
                delay_ms: 0,
                fail: false,
            }),
            Arc::new(ScriptedAgent {
                id: "Alpha".into(),
                report_id: "Alpha".into(),
                delay_ms: 20,
                fail: false,
            }),
        ];
        let invoker = AgentInvoker::new(Duration::from_secs(5));
        let (sink, _stream) = sink();
        let reports = invoker
            .invoke(&agents, &ctx(), &CancellationToken::new(), &sink)
            .await;

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].agent_id, "alpha");
        assert_eq!(reports[1].agent_id, "zeta");
    }

    #[tokio::test]
    async fn failing_agent_yields_empty_report() {
        let agents: Vec<Arc<dyn AnalysisAgent>> = vec![Arc::new(ScriptedAgent {
            id: "flaky".into(),
            report_id: "flaky".into(),
            delay_ms: 0,
            fail: true,
        })];
        let invoker = AgentInvoker::new(Duration::from_secs(5));
        let (sink, _stream) = sink();
        let reports = invoker
            .invoke(&agents, &ctx(), &CancellationToken::new(), &sink)
            .await;

        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_empty_result());
        assert!(reports[0].warnings[0].contains("upstream LLM error"));
    }

    #[tokio::test]
    async fn slow_agent_times_out_into_empty_report() {
        let agents: Vec<Arc<dyn AnalysisAgent>> = vec![Arc::new(ScriptedAgent {
            id: "slow".into(),
            report_id: "slow".into(),
            delay_ms: 5_000,
            fail: false,
        })];
        // Simple complexity quarters the budget: 200ms / 4 = 50ms deadline.
        let invoker = AgentInvoker::new(Duration::from_millis(200));
        let (sink, _stream) = sink();
        let reports = invoker
            .invoke(&agents, &ctx(), &CancellationToken::new(), &sink)
            .await;

        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_empty_result());
        assert!(reports[0].warnings[0].contains("timed out"));
    }

    #[tokio::test]
    async fn case_variant_report_ids_collapse_to_one_entry() {
        let agents: Vec<Arc<dyn AnalysisAgent>> = vec![
            Arc::new(ScriptedAgent {
                id: "economist".into(),
                report_id: "economist".into(),
                delay_ms: 0,
                fail: false,
            }),
            Arc::new(ScriptedAgent {
                id: "Economist2".into(),
                report_id: "ECONOMIST".into(), // reports under a case variant
                delay_ms: 0,
                fail: false,
            }),
        ];
        let invoker = AgentInvoker::new(Duration::from_secs(5));
        let (sink, _stream) = sink();
        let reports = invoker
            .invoke(&agents, &ctx(), &CancellationToken::new(), &sink)
            .await;

        // economist2 keeps its own canonical key; the report body that named
        // "ECONOMIST" was reindexed under the invoking agent's id.
        let ids: Vec<&str> = reports.iter().map(|r| r.agent_id.as_str()).collect();
        assert_eq!(ids, vec!["economist", "economist2"]);
    }
}
