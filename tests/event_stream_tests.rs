use async_trait::async_trait;
use consilium::consilium::agent::{AgentContext, AgentResult, DebatePrompt};
use consilium::{
    AgentReport, AnalysisAgent, AnalysisRequest, DeliberationEngine, EngineConfig, EventStatus,
    StageTag,
};
use std::sync::Arc;
use std::time::Duration;

struct SlowAgent {
    id: String,
    analyze_delay_ms: u64,
    turn_delay_ms: u64,
}

#[async_trait]
impl AnalysisAgent for SlowAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.id
    }

    async fn analyze(&self, _ctx: &AgentContext) -> AgentResult<AgentReport> {
        tokio::time::sleep(Duration::from_millis(self.analyze_delay_ms)).await;
        Ok(AgentReport::new(
            self.id.clone(),
            "Measured position on the question.",
            0.8,
        ))
    }

    async fn debate_turn(&self, _prompt: &DebatePrompt) -> AgentResult<String> {
        tokio::time::sleep(Duration::from_millis(self.turn_delay_ms)).await;
        Ok(format!("{} restates its measured position", self.id))
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[tokio::test]
async fn heartbeats_flow_while_a_stage_stalls() {
    init_logging();
    let mut config = EngineConfig::default();
    config.heartbeat_interval_ms = 40;

    let mut engine = DeliberationEngine::new(config);
    engine.add_agent(Arc::new(SlowAgent {
        id: "ponderer".into(),
        analyze_delay_ms: 400,
        turn_delay_ms: 0,
    }));

    let mut run = engine
        .run(AnalysisRequest::new("What is the unemployment rate?"))
        .unwrap();

    let mut heartbeats = 0;
    let mut saw_entry_heartbeat = false;
    let mut first = true;
    while let Some(event) = run.events.recv().await {
        if event.stage == StageTag::Heartbeat {
            heartbeats += 1;
            if first {
                saw_entry_heartbeat = true;
            }
        }
        first = false;
        if event.stage == StageTag::Done {
            break;
        }
    }

    assert!(saw_entry_heartbeat, "heartbeat at request entry");
    assert!(
        heartbeats >= 2,
        "expected interval heartbeats while the agent stalled, got {}",
        heartbeats
    );
    run.finish().await.unwrap();
}

#[tokio::test]
async fn wire_envelope_carries_the_contract_fields() {
    let mut engine = DeliberationEngine::new(EngineConfig::default());
    engine.add_agent(Arc::new(SlowAgent {
        id: "quick".into(),
        analyze_delay_ms: 0,
        turn_delay_ms: 0,
    }));

    let mut run = engine
        .run(AnalysisRequest::new("What is the unemployment rate?"))
        .unwrap();
    let request_id = run.request_id.clone();

    let mut last = None;
    while let Some(event) = run.events.recv().await {
        let wire = event.to_wire();
        assert!(wire["stage"].is_string());
        assert!(
            ["running", "streaming", "complete", "error"]
                .contains(&wire["status"].as_str().unwrap()),
            "unexpected status {}",
            wire["status"]
        );
        assert!(wire["payload"].is_object());
        assert!(wire["timestamp"].as_str().unwrap().contains('T'));
        let done = event.stage == StageTag::Done;
        last = Some(event);
        if done {
            break;
        }
    }

    let done = last.unwrap();
    assert_eq!(done.status, EventStatus::Complete);
    assert_eq!(done.to_wire()["payload"]["request_id"], request_id.as_str());
    run.finish().await.unwrap();
}

#[tokio::test]
async fn cancellation_mid_debate_stops_turns_and_skips_synthesis() {
    let mut engine = DeliberationEngine::new(EngineConfig::default());
    for id in ["alpha", "beta", "gamma"].iter() {
        engine.add_agent(Arc::new(SlowAgent {
            id: id.to_string(),
            analyze_delay_ms: 0,
            turn_delay_ms: 50,
        }));
    }

    // Strategic phrasing selects the complex profile so the debate would run
    // long if not cancelled.
    let mut run = engine
        .run(AnalysisRequest::new(
            "Should the national strategy reallocate $20 billion toward industrial diversification?",
        ))
        .unwrap();

    let mut turn_events = 0;
    let mut terminal = None;
    while let Some(event) = run.events.recv().await {
        if let StageTag::DebateTurn(_) = event.stage {
            if event.status == EventStatus::Streaming {
                turn_events += 1;
                if turn_events == 3 {
                    run.cancel();
                }
            }
        }
        if event.stage == StageTag::Done {
            terminal = Some(event);
            break;
        }
    }

    let terminal = terminal.expect("terminal event must arrive after cancellation");
    assert_eq!(terminal.status, EventStatus::Error);
    assert_eq!(terminal.to_wire()["payload"]["reason"], "cancelled");

    let state = run.finish().await.unwrap();
    // No synthesis on cancellation, and the debate stopped near where the
    // cancel landed.
    assert!(state.synthesis.is_none());
    let debate_turns = state.debate.as_ref().map(|d| d.turns.len()).unwrap_or(0);
    assert!(
        debate_turns <= 6,
        "debate should stop promptly after cancel, recorded {} turns",
        debate_turns
    );
}

#[tokio::test]
async fn no_synthesize_event_after_cancellation() {
    let mut engine = DeliberationEngine::new(EngineConfig::default());
    engine.add_agent(Arc::new(SlowAgent {
        id: "alpha".into(),
        analyze_delay_ms: 0,
        turn_delay_ms: 50,
    }));

    let mut run = engine
        .run(AnalysisRequest::new("What is the unemployment rate?"))
        .unwrap();

    let mut saw_synthesize = false;
    while let Some(event) = run.events.recv().await {
        if let StageTag::DebateTurn(_) = event.stage {
            run.cancel();
        }
        if event.stage == StageTag::Synthesize {
            saw_synthesize = true;
        }
        if event.stage == StageTag::Done {
            break;
        }
    }

    assert!(!saw_synthesize, "synthesizer must not run on a cancelled request");
    run.finish().await.unwrap();
}
