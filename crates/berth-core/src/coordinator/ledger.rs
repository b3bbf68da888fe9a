//! Per-agent resource claims taken while an install is in flight.
//!
//! An agent's status only shows the resources of a new slot once the install
//! has returned. Until then the claim sits in the ledger, so a concurrent
//! install checking the same agent sees the capacity as already taken.
//!
//! The status is read while the ledger is locked. A claim is released only
//! after the install has been folded into the agent status, so a reader sees
//! either the pending claim or the updated status, never neither. Briefly
//! seeing both only makes a concurrent install more conservative.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::status::AgentStatus;

#[derive(Debug, Default)]
pub struct ResourceLedger {
    pending: Mutex<HashMap<String, Vec<BTreeMap<String, u64>>>>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `required` on the agent whose status `read_status` returns, if
    /// its free capacity minus claims still in flight covers every named
    /// resource. A resource the agent does not advertise counts as zero.
    pub fn try_claim(
        &self,
        read_status: impl FnOnce() -> AgentStatus,
        required: &BTreeMap<String, u64>,
    ) -> Option<Claim<'_>> {
        let mut pending = self.pending.lock();
        let agent = read_status();
        let in_flight = pending.get(&agent.agent_id).map(Vec::as_slice).unwrap_or_default();

        let available = agent.available_resources();
        for (name, amount) in required {
            let free = available.get(name).copied().unwrap_or(0);
            let claimed: u64 = in_flight.iter().filter_map(|c| c.get(name)).sum();
            if free.saturating_sub(claimed) < *amount {
                return None;
            }
        }

        pending
            .entry(agent.agent_id.clone())
            .or_default()
            .push(required.clone());
        Some(Claim {
            ledger: self,
            agent_id: agent.agent_id.clone(),
            resources: required.clone(),
        })
    }

    /// Resources currently claimed on `agent_id`.
    pub fn claimed(&self, agent_id: &str) -> BTreeMap<String, u64> {
        let pending = self.pending.lock();
        let mut total = BTreeMap::new();
        for claim in pending.get(agent_id).into_iter().flatten() {
            for (name, amount) in claim {
                *total.entry(name.clone()).or_insert(0) += amount;
            }
        }
        total
    }

    fn release(&self, agent_id: &str, resources: &BTreeMap<String, u64>) {
        let mut pending = self.pending.lock();
        if let Some(claims) = pending.get_mut(agent_id) {
            if let Some(index) = claims.iter().position(|c| c == resources) {
                claims.swap_remove(index);
            }
            if claims.is_empty() {
                pending.remove(agent_id);
            }
        }
    }
}

/// A held claim; released when dropped.
#[derive(Debug)]
pub struct Claim<'a> {
    ledger: &'a ResourceLedger,
    agent_id: String,
    resources: BTreeMap<String, u64>,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.ledger.release(&self.agent_id, &self.resources);
    }
}
