//! Agent roster and selection.
//!
//! The roster holds every registered agent under its canonical id, in
//! registration order. Selection chooses the active subset from the
//! classification: everything for complex queries, a curated per-intent
//! subset for standard ones, one or two agents for simple lookups.
//!
//! Canonicalization here is a correctness requirement, not cosmetics:
//! downstream state is keyed by agent id, and two registrations differing
//! only in case would double-count reports.

use crate::consilium::agent::{canonical_agent_id, AnalysisAgent};
use crate::consilium::classifier::{Classification, Complexity, Intent};
use std::collections::HashMap;
use std::sync::Arc;

/// Registered agents, keyed by canonical id, iteration in registration order.
#[derive(Default)]
pub struct AgentRoster {
    agents: HashMap<String, Arc<dyn AnalysisAgent>>,
    order: Vec<String>,
}

impl AgentRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent. Returns `false` (and keeps the first registration)
    /// when another agent already normalizes to the same canonical id.
    pub fn register(&mut self, agent: Arc<dyn AnalysisAgent>) -> bool {
        let canonical = canonical_agent_id(agent.id());
        if canonical.is_empty() {
            log::warn!("agent '{}' normalizes to an empty id; ignored", agent.id());
            return false;
        }
        if self.agents.contains_key(&canonical) {
            log::warn!(
                "agent '{}' duplicates canonical id '{}'; keeping the first registration",
                agent.id(),
                canonical
            );
            return false;
        }
        self.order.push(canonical.clone());
        self.agents.insert(canonical, agent);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, canonical_id: &str) -> Option<Arc<dyn AnalysisAgent>> {
        self.agents.get(canonical_id).map(Arc::clone)
    }

    /// All agents in registration order.
    pub fn all(&self) -> Vec<Arc<dyn AnalysisAgent>> {
        self.order
            .iter()
            .filter_map(|id| self.agents.get(id).map(Arc::clone))
            .collect()
    }

    /// Canonical ids in registration order.
    pub fn ids(&self) -> &[String] {
        &self.order
    }
}

/// Curated selection rules. Ids are canonicalized on construction so callers
/// can write them naturally.
#[derive(Debug, Clone)]
pub struct SelectionRules {
    /// Agents to run for standard-complexity queries, per intent. Intents
    /// without an entry fall back to the first `standard_cap` roster agents.
    pub standard_by_intent: HashMap<Intent, Vec<String>>,
    /// Agents to run for simple queries. Empty falls back to the first
    /// `simple_cap` roster agents.
    pub simple_agents: Vec<String>,
    pub standard_cap: usize,
    pub simple_cap: usize,
}

impl Default for SelectionRules {
    fn default() -> Self {
        Self {
            standard_by_intent: HashMap::new(),
            simple_agents: Vec::new(),
            standard_cap: 4,
            simple_cap: 2,
        }
    }
}

impl SelectionRules {
    pub fn with_standard(mut self, intent: Intent, ids: Vec<String>) -> Self {
        self.standard_by_intent
            .insert(intent, ids.iter().map(|id| canonical_agent_id(id)).collect());
        self
    }

    pub fn with_simple(mut self, ids: Vec<String>) -> Self {
        self.simple_agents = ids.iter().map(|id| canonical_agent_id(id)).collect();
        self
    }
}

/// Chooses the active agent set for a request.
#[derive(Debug, Clone, Default)]
pub struct AgentSelector {
    rules: SelectionRules,
}

impl AgentSelector {
    pub fn new(rules: SelectionRules) -> Self {
        Self { rules }
    }

    /// Select agents for the classification, in roster order, canonical ids,
    /// no duplicates.
    pub fn select(
        &self,
        roster: &AgentRoster,
        classification: &Classification,
    ) -> Vec<Arc<dyn AnalysisAgent>> {
        match classification.complexity {
            Complexity::Complex => roster.all(),
            Complexity::Standard => {
                let curated = self.rules.standard_by_intent.get(&classification.intent);
                self.pick(roster, curated, self.rules.standard_cap)
            }
            Complexity::Simple => {
                let curated = if self.rules.simple_agents.is_empty() {
                    None
                } else {
                    Some(&self.rules.simple_agents)
                };
                self.pick(roster, curated, self.rules.simple_cap)
            }
        }
    }

    fn pick(
        &self,
        roster: &AgentRoster,
        curated: Option<&Vec<String>>,
        cap: usize,
    ) -> Vec<Arc<dyn AnalysisAgent>> {
        match curated {
            Some(ids) => {
                let mut selected = Vec::new();
                let mut seen: Vec<&str> = Vec::new();
                for id in ids {
                    if seen.contains(&id.as_str()) {
                        continue;
                    }
                    match roster.get(id) {
                        Some(agent) => {
                            seen.push(id.as_str());
                            selected.push(agent);
                        }
                        None => log::warn!("selection rule names unknown agent '{}'", id),
                    }
                }
                selected
            }
            None => roster.all().into_iter().take(cap).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consilium::agent::{AgentContext, AgentReport, AgentResult, DebatePrompt};
    use crate::consilium::classifier::Classifier;
    use async_trait::async_trait;

    struct NamedAgent {
        id: String,
    }

    #[async_trait]
    impl AnalysisAgent for NamedAgent {
        fn id(&self) -> &str {
            &self.id
        }

        fn name(&self) -> &str {
            &self.id
        }

        async fn analyze(&self, _ctx: &AgentContext) -> AgentResult<AgentReport> {
            Ok(AgentReport::new(self.id.clone(), "ok", 0.9))
        }

        async fn debate_turn(&self, _prompt: &DebatePrompt) -> AgentResult<String> {
            Ok("position".to_string())
        }
    }

    fn roster(ids: &[&str]) -> AgentRoster {
        let mut roster = AgentRoster::new();
        for id in ids {
            roster.register(Arc::new(NamedAgent { id: id.to_string() }));
        }
        roster
    }

    #[test]
    fn case_variant_registration_is_rejected() {
        let mut roster = AgentRoster::new();
        assert!(roster.register(Arc::new(NamedAgent {
            id: "Economist".into()
        })));
        assert!(!roster.register(Arc::new(NamedAgent {
            id: "ECONOMIST".into()
        })));
        assert_eq!(roster.len(), 1);
        assert_eq!(roster.ids(), &["economist".to_string()]);
    }

    #[test]
    fn complex_selects_all_agents() {
        let roster = roster(&["economist", "labor_analyst", "fiscal", "trade", "social"]);
        let classification = Classifier::default()
            .classify("Should we invest $5 billion in a national strategy for food security?");
        assert_eq!(classification.complexity, Complexity::Complex);

        let selected = AgentSelector::default().select(&roster, &classification);
        assert_eq!(selected.len(), 5);
    }

    #[test]
    fn simple_selects_at_most_two_by_default() {
        let roster = roster(&["economist", "labor_analyst", "fiscal"]);
        let classification = Classifier::default().classify("What is the unemployment rate?");
        assert_eq!(classification.complexity, Complexity::Simple);

        let selected = AgentSelector::default().select(&roster, &classification);
        assert_eq!(selected.len(), 2);
        assert_eq!(canonical_agent_id(selected[0].id()), "economist");
    }

    #[test]
    fn standard_uses_curated_intent_subset() {
        let roster = roster(&["economist", "labor_analyst", "fiscal", "trade"]);
        let rules = SelectionRules::default().with_standard(
            Intent::Comparison,
            vec!["Trade".into(), "Economist".into(), "Trade".into()],
        );
        let classification =
            Classifier::default().classify("Compare GDP growth versus inflation benchmarks");
        assert_eq!(classification.complexity, Complexity::Standard);

        let selected = AgentSelector::new(rules).select(&roster, &classification);
        let ids: Vec<String> = selected
            .iter()
            .map(|a| canonical_agent_id(a.id()))
            .collect();
        assert_eq!(ids, vec!["trade".to_string(), "economist".to_string()]);
    }
}
