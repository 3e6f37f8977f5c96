//! Routing of help requests found in agent output.

use crate::load_balancer::LoadBalancer;
use crate::similarity::truncate_chars;
use crate::task_store::TaskStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

/// Output excerpt carried into the collaboration task description.
pub const EXCERPT_CHARS: usize = 200;

/// `keyword` in a request routes it to `agent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Specialization {
    pub keyword: String,
    pub agent: String,
}

/// Detects collaboration triggers in agent output and picks a helper.
pub struct CollaborationRouter {
    triggers: Vec<String>,
    specializations: Vec<Specialization>,
    agents: Vec<String>,
}

impl CollaborationRouter {
    pub fn new(
        triggers: Vec<String>,
        specializations: Vec<Specialization>,
        agents: Vec<String>,
    ) -> Self {
        Self {
            triggers: triggers.into_iter().map(|t| t.to_lowercase()).collect(),
            specializations,
            agents,
        }
    }

    /// The first trigger phrase found in `output`, if any.
    pub fn detect_trigger(&self, output: &str) -> Option<&str> {
        let lowered = output.to_lowercase();
        self.triggers
            .iter()
            .find(|t| !t.is_empty() && lowered.contains(t.as_str()))
            .map(String::as_str)
    }

    /// Pick a helper for `requester`.
    ///
    /// The first specialization whose keyword appears as a word in `context`
    /// and whose agent is someone else with spare capacity wins. Otherwise the
    /// least busy of all other agents.
    pub fn find_helper(
        &self,
        requester: &str,
        context: &str,
        balancer: &LoadBalancer,
    ) -> Option<String> {
        let lowered = context.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        let by_keyword = self.specializations.iter().find(|s| {
            s.agent != requester
                && words.contains(&s.keyword.to_lowercase().as_str())
                && balancer.can_assign(&s.agent)
        });
        if let Some(spec) = by_keyword {
            return Some(spec.agent.clone());
        }

        let others: Vec<&str> = self
            .agents
            .iter()
            .map(String::as_str)
            .filter(|a| *a != requester)
            .collect();
        balancer.least_busy(&others)
    }

    /// Request help on behalf of `requester` when `output` contains a trigger.
    ///
    /// Returns the collaboration task id, which may be an existing task when
    /// the request duplicates one already open.
    pub async fn route(
        &self,
        store: &TaskStore,
        balancer: &LoadBalancer,
        requester: &str,
        output: &str,
    ) -> Option<Uuid> {
        let trigger = self.detect_trigger(output)?;
        let Some(helper) = self.find_helper(requester, output, balancer) else {
            debug!(agent = %requester, trigger = %trigger, "No helper available for collaboration");
            return None;
        };

        let excerpt = truncate_chars(output, EXCERPT_CHARS);
        let ellipsis = if excerpt.len() < output.len() { "..." } else { "" };
        let description = format!("Collaboration requested by {requester}: {excerpt}{ellipsis}");
        let context = HashMap::from([
            ("output".to_string(), serde_json::json!(output)),
            ("trigger".to_string(), serde_json::json!(trigger)),
        ]);

        let id = store
            .request_collaboration(requester, &helper, &description, context)
            .await;
        info!(from = %requester, to = %helper, task_id = %id, "Routed collaboration request");
        Some(id)
    }
}
