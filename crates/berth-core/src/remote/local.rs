//! In-process agents.

use std::sync::Arc;

use anyhow::Context;
use parking_lot::RwLock;
use url::Url;
use uuid::Uuid;

use super::ServiceDescriptor;
use crate::agent::Agent;
use crate::assignment::Installation;
use crate::fs::write_atomic;
use crate::slot::{ClearOutcome, Slot};
use crate::status::{AgentStatus, SlotStatus};

/// File the local inventory push writes into the slots directory.
pub const SERVICE_INVENTORY_FILE: &str = "service-inventory.json";

/// An agent living in the coordinator's process. Status is always live.
#[derive(Debug)]
pub struct LocalRemoteAgent {
    agent: Arc<Agent>,
    internal_uri: RwLock<Option<Url>>,
}

impl LocalRemoteAgent {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self {
            agent,
            internal_uri: RwLock::new(None),
        }
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    pub fn agent_id(&self) -> &str {
        self.agent.agent_id()
    }

    pub fn status(&self) -> AgentStatus {
        let mut status = self.agent.status();
        if let Some(uri) = self.internal_uri.read().clone() {
            status.internal_uri = Some(uri);
        }
        status
    }

    pub fn install(&self, installation: &Installation) -> anyhow::Result<SlotStatus> {
        self.agent.install(installation)
    }

    pub fn slots(&self) -> Vec<LocalRemoteSlot> {
        self.agent
            .all_slots()
            .into_iter()
            .map(|slot| LocalRemoteSlot {
                slot,
                agent: self.agent.clone(),
            })
            .collect()
    }

    pub fn set_internal_uri(&self, uri: Url) {
        *self.internal_uri.write() = Some(uri);
    }

    /// Write the inventory next to the slots.
    pub fn push_service_inventory(&self, services: &[ServiceDescriptor]) {
        let path = self.agent.slots_dir().join(SERVICE_INVENTORY_FILE);
        let result = serde_json::to_vec_pretty(services)
            .context("Failed to serialize service inventory")
            .and_then(|bytes| write_atomic(&path, &bytes));
        if let Err(e) = result {
            tracing::warn!("Failed to write service inventory {}: {:#}", path.display(), e);
        }
    }

    pub fn terminate_slot(&self, name: &str) -> anyhow::Result<SlotStatus> {
        self.agent
            .terminate_slot(name)
            .with_context(|| format!("Slot {} not found on agent {}", name, self.agent_id()))?
    }
}

/// A slot of an in-process agent.
#[derive(Debug, Clone)]
pub struct LocalRemoteSlot {
    slot: Arc<Slot>,
    agent: Arc<Agent>,
}

impl LocalRemoteSlot {
    pub fn id(&self) -> Uuid {
        self.slot.id()
    }

    pub fn name(&self) -> &str {
        self.slot.name()
    }

    pub fn status(&self) -> anyhow::Result<SlotStatus> {
        self.slot.status()
    }

    pub fn assign(&self, installation: &Installation) -> anyhow::Result<SlotStatus> {
        self.slot.assign(installation)
    }

    pub fn clear(&self) -> anyhow::Result<ClearOutcome> {
        self.slot.clear()
    }

    pub fn start(&self) -> anyhow::Result<SlotStatus> {
        self.slot.start()
    }

    pub fn stop(&self) -> anyhow::Result<SlotStatus> {
        self.slot.stop()
    }

    pub fn restart(&self) -> anyhow::Result<SlotStatus> {
        self.slot.restart()
    }

    /// Terminate through the agent so the slot also leaves its registry.
    pub fn terminate(&self) -> anyhow::Result<SlotStatus> {
        self.agent
            .terminate_slot(self.slot.name())
            .unwrap_or_else(|| self.slot.terminate())
    }
}
