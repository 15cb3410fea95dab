use async_trait::async_trait;
use consilium::consilium::agent::{AgentContext, AgentResult, DebatePrompt};
use consilium::{
    AgentReport, AnalysisAgent, AnalysisRequest, DeliberationEngine, EngineConfig, StageTag,
};
use std::sync::Arc;

/// Agent that answers debate prompts from a fixed script, cycling when the
/// script runs out.
struct ScriptedDebater {
    id: String,
    script: Vec<String>,
    position: std::sync::atomic::AtomicUsize,
}

impl ScriptedDebater {
    fn new(id: &str, script: Vec<&str>) -> Self {
        Self {
            id: id.to_string(),
            script: script.iter().map(|s| s.to_string()).collect(),
            position: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AnalysisAgent for ScriptedDebater {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.id
    }

    async fn analyze(&self, _ctx: &AgentContext) -> AgentResult<AgentReport> {
        Ok(AgentReport::new(
            self.id.clone(),
            "Position grounded in the usual indicators.",
            0.8,
        ))
    }

    async fn debate_turn(&self, _prompt: &DebatePrompt) -> AgentResult<String> {
        let i = self
            .position
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(self.script[i % self.script.len()].clone())
    }
}

async fn run_to_completion(
    engine: &DeliberationEngine,
    question: &str,
) -> consilium::AnalysisState {
    let mut run = engine.run(AnalysisRequest::new(question)).unwrap();
    while let Some(event) = run.events.recv().await {
        if event.stage == StageTag::Done {
            break;
        }
    }
    run.finish().await.unwrap()
}

#[tokio::test]
async fn meta_debate_triggers_exactly_one_refocus_after_turn_30() {
    // Five agents whose every utterance is dense with meta vocabulary. The
    // abstract question forces the complex budget so the debate can reach
    // turn 30.
    let meta_line = "The framework of this analytical approach is epistemically prior to any \
                     performative contradiction in the paradigm itself";

    let mut engine = DeliberationEngine::new(EngineConfig::default());
    for id in ["alpha", "beta", "gamma", "delta", "epsilon"].iter() {
        engine.add_agent(Arc::new(ScriptedDebater::new(id, vec![meta_line])));
    }

    let state = run_to_completion(
        &engine,
        "Discuss epistemic frameworks for analyzing a national strategy on long-horizon investment",
    )
    .await;

    let debate = state.debate.as_ref().unwrap();
    assert!(debate.refocused, "meta-debate detector should have fired");

    let refocus_turns: Vec<_> = debate
        .turns
        .iter()
        .filter(|t| t.speaker == "moderator" && t.text.starts_with("Refocus"))
        .collect();
    assert_eq!(refocus_turns.len(), 1, "exactly one refocus utterance");
    assert!(
        refocus_turns[0].index > 30,
        "refocus must come after turn 30, got {}",
        refocus_turns[0].index
    );
    // The refocus restates the original question.
    assert!(refocus_turns[0].text.contains("epistemic frameworks"));

    // Termination stayed within the complex budget.
    assert!(debate.turns.len() as u32 <= 125);
}

#[tokio::test]
async fn agreement_saturation_ends_the_debate_early() {
    let agree_line = "I agree with the emerging consensus; we have found common ground here";

    let mut engine = DeliberationEngine::new(EngineConfig::default());
    for id in ["alpha", "beta", "gamma", "delta", "epsilon", "zeta"].iter() {
        engine.add_agent(Arc::new(ScriptedDebater::new(id, vec![agree_line])));
    }

    let state = run_to_completion(
        &engine,
        "Should the sovereign wealth allocation to the energy sector change?",
    )
    .await;

    let debate = state.debate.as_ref().unwrap();
    assert_eq!(debate.completion.to_string(), "substantively-complete");
    // Six agents × five phases would be 30+ turns; agreement saturation
    // must have cut that short.
    assert!(
        debate.turns.len() < 30,
        "expected early termination, got {} turns",
        debate.turns.len()
    );
}

#[tokio::test]
async fn debate_results_carry_monotone_turn_indices_and_phase_flags() {
    let mut engine = DeliberationEngine::new(EngineConfig::default());
    engine.add_agent(Arc::new(ScriptedDebater::new(
        "alpha",
        vec!["Expansion is affordable under current reserves"],
    )));
    engine.add_agent(Arc::new(ScriptedDebater::new(
        "beta",
        vec!["Expansion strains the fiscal balance beyond comfort"],
    )));

    let state = run_to_completion(&engine, "Compare fiscal positions versus the benchmark").await;

    let debate = state.debate.as_ref().unwrap();
    for (i, turn) in debate.turns.iter().enumerate() {
        assert_eq!(turn.index as usize, i + 1);
    }
    assert!(!debate.completed_phases.is_empty());
    assert!(!debate.consensus.is_empty());
}
