use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// In-flight bookkeeping for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSlot {
    pub current_tasks: usize,
    pub max_concurrent_tasks: usize,
    pub task_ids: Vec<Uuid>,
    pub last_assigned: Option<DateTime<Utc>>,
    pub last_completed: Option<DateTime<Utc>>,
}

/// Tracks how many tasks each agent is running and how many it may run.
///
/// Counters live behind one mutex, so check-and-increment is atomic across
/// dispatch workers. Nothing here is persisted; after a restart every agent
/// starts idle.
pub struct LoadBalancer {
    default_max: usize,
    limits: HashMap<String, usize>,
    slots: Mutex<HashMap<String, AgentSlot>>,
}

impl LoadBalancer {
    pub fn new(default_max: usize) -> Self {
        Self {
            default_max,
            limits: HashMap::new(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Per-agent overrides of the default limit.
    pub fn with_limits(mut self, limits: HashMap<String, usize>) -> Self {
        self.limits = limits;
        self
    }

    pub fn max_for(&self, agent: &str) -> usize {
        self.limits.get(agent).copied().unwrap_or(self.default_max)
    }

    pub fn can_assign(&self, agent: &str) -> bool {
        self.available_slots(agent) > 0
    }

    /// How many more tasks `agent` may start right now.
    pub fn available_slots(&self, agent: &str) -> usize {
        let current = self
            .slots
            .lock()
            .get(agent)
            .map(|s| s.current_tasks)
            .unwrap_or(0);
        self.max_for(agent).saturating_sub(current)
    }

    /// Count `task_id` against `agent`. Returns false, changing nothing, when
    /// the agent is already at its limit.
    pub fn assign(&self, agent: &str, task_id: Uuid) -> bool {
        let max = self.max_for(agent);
        let mut slots = self.slots.lock();
        let slot = slots.entry(agent.to_string()).or_default();
        slot.max_concurrent_tasks = max;
        if slot.current_tasks >= max {
            return false;
        }
        slot.current_tasks += 1;
        slot.task_ids.push(task_id);
        slot.last_assigned = Some(Utc::now());
        debug!(agent = %agent, task_id = %task_id, in_flight = slot.current_tasks, "Slot assigned");
        true
    }

    /// Release the slot held by `task_id`. Unknown ids are ignored.
    pub fn complete(&self, agent: &str, task_id: Uuid) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(agent) else {
            return;
        };
        let Some(pos) = slot.task_ids.iter().position(|id| *id == task_id) else {
            return;
        };
        slot.task_ids.swap_remove(pos);
        slot.current_tasks = slot.current_tasks.saturating_sub(1);
        slot.last_completed = Some(Utc::now());
        debug!(agent = %agent, task_id = %task_id, in_flight = slot.current_tasks, "Slot released");
    }

    /// Take a slot that is released when the returned guard drops.
    ///
    /// The guard is keyed by a fresh reservation id until [`SlotGuard::bind`]
    /// attaches the real task id.
    pub fn acquire(self: &Arc<Self>, agent: &str) -> Option<SlotGuard> {
        let reservation = Uuid::new_v4();
        self.assign(agent, reservation).then(|| SlotGuard {
            balancer: Arc::clone(self),
            agent: agent.to_string(),
            task_id: reservation,
        })
    }

    /// Among `candidates` that can take work, the one with the fewest tasks
    /// in flight. Ties go to the earliest candidate.
    pub fn least_busy<S: AsRef<str>>(&self, candidates: &[S]) -> Option<String> {
        let slots = self.slots.lock();
        candidates
            .iter()
            .map(AsRef::as_ref)
            .filter_map(|agent| {
                let current = slots.get(agent).map(|s| s.current_tasks).unwrap_or(0);
                (current < self.max_for(agent)).then_some((agent, current))
            })
            .min_by_key(|(_, current)| *current)
            .map(|(agent, _)| agent.to_string())
    }

    /// Tasks in flight across all agents.
    pub fn in_flight(&self) -> usize {
        self.slots.lock().values().map(|s| s.current_tasks).sum()
    }

    pub fn snapshot(&self) -> BTreeMap<String, AgentSlot> {
        self.slots
            .lock()
            .iter()
            .map(|(agent, slot)| (agent.clone(), slot.clone()))
            .collect()
    }
}

/// A held concurrency slot. Dropping it releases the slot, whatever path the
/// dispatch took to get there.
pub struct SlotGuard {
    balancer: Arc<LoadBalancer>,
    agent: String,
    task_id: Uuid,
}

impl SlotGuard {
    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Re-key the slot to the task that is actually running in it.
    pub fn bind(&mut self, task_id: Uuid) {
        let mut slots = self.balancer.slots.lock();
        if let Some(id) = slots
            .get_mut(&self.agent)
            .and_then(|slot| slot.task_ids.iter_mut().find(|id| **id == self.task_id))
        {
            *id = task_id;
            self.task_id = task_id;
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.balancer.complete(&self.agent, self.task_id);
    }
}
