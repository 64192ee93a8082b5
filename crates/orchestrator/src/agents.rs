//! Agent registry: worker identity, capabilities and availability.
//!
//! ## Matching
//!
//! An agent can serve a step when it is `Available` and its capability set is a
//! superset of the step's required capabilities. Agents are scanned in
//! registration order and the first match wins.
//!
//! ## Locking
//!
//! All records live behind one mutex. [`AgentRegistry::try_acquire`] performs
//! the match and the `Busy` transition under a single lock acquisition, so two
//! processes racing for the same agent can never both capture it. The mutex is
//! never held across an `.await`.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use apm_core::{AgentId, ApmError, ApmResult, StepId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Available,
    Busy,
}

/// Snapshot of a registered agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentRecord {
    pub agent_id: AgentId,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    pub current_task: Option<StepId>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(skip)]
    lease: Option<u64>,
}

impl AgentRecord {
    fn new(agent_id: AgentId, capabilities: BTreeSet<String>) -> Self {
        Self {
            agent_id,
            capabilities,
            status: AgentStatus::Available,
            current_task: None,
            last_heartbeat: Utc::now(),
            lease: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == AgentStatus::Available
    }

    /// Available and capable of everything in `required`.
    pub fn can_serve(&self, required: &BTreeSet<String>) -> bool {
        self.is_available() && required.is_subset(&self.capabilities)
    }

    fn occupy(&mut self, step_id: &StepId, lease: Option<u64>) {
        self.status = AgentStatus::Busy;
        self.current_task = Some(step_id.clone());
        self.lease = lease;
    }

    fn release(&mut self) {
        self.status = AgentStatus::Available;
        self.current_task = None;
        self.lease = None;
    }
}

#[derive(Debug, Default)]
struct Inner {
    /// Registration order is the scan order.
    agents: Vec<AgentRecord>,
    next_lease: u64,
}

impl Inner {
    fn position(&self, agent_id: &str) -> Option<usize> {
        self.agents.iter().position(|a| a.agent_id == agent_id)
    }

    fn get_mut(&mut self, agent_id: &str) -> ApmResult<&mut AgentRecord> {
        self.agents
            .iter_mut()
            .find(|a| a.agent_id == agent_id)
            .ok_or_else(|| ApmError::AgentNotFound {
                agent_id: agent_id.into(),
            })
    }
}

/// Shared registry of agents.
///
/// Cloning is cheap and every clone sees the same records.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Every mutation leaves the records consistent, so a poisoned lock is safe
    // to keep using.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Idempotent upsert: the agent ends up `Available`, with no current task
    /// and a fresh heartbeat. Re-registration keeps the original scan position.
    pub fn register_agent<I, S>(&self, agent_id: impl Into<AgentId>, capabilities: I) -> AgentRecord
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let agent_id = agent_id.into();
        let capabilities: BTreeSet<String> = capabilities.into_iter().map(Into::into).collect();
        let record = AgentRecord::new(agent_id.clone(), capabilities);

        let mut inner = self.lock();
        match inner.position(agent_id.as_str()) {
            Some(idx) => inner.agents[idx] = record.clone(),
            None => inner.agents.push(record.clone()),
        }
        record
    }

    /// First agent (registration order) that can serve `required`.
    ///
    /// Point-in-time read: the answer may be stale by the time the caller acts
    /// on it. Use [`try_acquire`](Self::try_acquire) to match and claim
    /// atomically.
    pub fn find_available_agent(&self, required: &BTreeSet<String>) -> Option<AgentId> {
        self.lock()
            .agents
            .iter()
            .find(|a| a.can_serve(required))
            .map(|a| a.agent_id.clone())
    }

    pub fn mark_busy(&self, agent_id: &str, step_id: &StepId) -> ApmResult<()> {
        self.lock().get_mut(agent_id)?.occupy(step_id, None);
        Ok(())
    }

    pub fn mark_available(&self, agent_id: &str) -> ApmResult<()> {
        self.lock().get_mut(agent_id)?.release();
        Ok(())
    }

    /// Match and mark busy in one critical section.
    ///
    /// The returned lease puts the agent back to `Available` when dropped.
    pub fn try_acquire(&self, required: &BTreeSet<String>, step_id: &StepId) -> Option<AgentLease> {
        let mut inner = self.lock();
        inner.next_lease += 1;
        let token = inner.next_lease;

        let record = inner.agents.iter_mut().find(|a| a.can_serve(required))?;
        record.occupy(step_id, Some(token));

        Some(AgentLease {
            registry: self.clone(),
            agent_id: record.agent_id.clone(),
            token,
        })
    }

    /// Refresh the heartbeat of a registered agent.
    pub fn heartbeat(&self, agent_id: &str) -> ApmResult<DateTime<Utc>> {
        let mut inner = self.lock();
        let record = inner.get_mut(agent_id)?;
        record.last_heartbeat = Utc::now();
        Ok(record.last_heartbeat)
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        let inner = self.lock();
        inner
            .position(agent_id)
            .map(|idx| inner.agents[idx].clone())
    }

    /// All agents in registration order.
    pub fn snapshot(&self) -> Vec<AgentRecord> {
        self.lock().agents.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Only the holder of the current lease may release through it: an agent
    // that was re-registered and re-acquired in the meantime stays busy.
    fn release_lease(&self, agent_id: &AgentId, token: u64) {
        let mut inner = self.lock();
        if let Ok(record) = inner.get_mut(agent_id.as_str()) {
            if record.lease == Some(token) {
                record.release();
            }
        }
    }
}

/// Exclusive claim on an agent for the duration of one step.
#[derive(Debug)]
pub struct AgentLease {
    registry: AgentRegistry,
    agent_id: AgentId,
    token: u64,
}

impl AgentLease {
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }
}

impl Drop for AgentLease {
    fn drop(&mut self) {
        self.registry.release_lease(&self.agent_id, self.token);
    }
}
