//! Coordinator-side proxies for agents and their slots.
//!
//! An agent is either hosted in the coordinator's own process
//! ([`LocalRemoteAgent`]) or reached over HTTP ([`HttpRemoteAgent`]). Both
//! offer the same operations and report the same status types.

pub mod http;
pub mod local;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::assignment::Installation;
use crate::slot::ClearOutcome;
use crate::status::{AgentStatus, SlotStatus};

pub use http::{AgentTransport, Body, HttpAgentTransport, HttpRemoteAgent, HttpRemoteSlot, TransportResponse};
pub use local::{LocalRemoteAgent, LocalRemoteSlot};

/// A running service, as published in the service inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub service_type: String,
    pub pool: String,
    pub location: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Proxy for one agent.
#[derive(Debug)]
pub enum RemoteAgent {
    Local(LocalRemoteAgent),
    Http(HttpRemoteAgent),
}

impl RemoteAgent {
    pub fn agent_id(&self) -> String {
        match self {
            Self::Local(agent) => agent.agent_id().to_string(),
            Self::Http(agent) => agent.agent_id().to_string(),
        }
    }

    /// Latest known status; live for local agents, cached for HTTP ones.
    pub fn status(&self) -> AgentStatus {
        match self {
            Self::Local(agent) => agent.status(),
            Self::Http(agent) => agent.status(),
        }
    }

    /// Create a slot on the agent and assign `installation` to it.
    pub fn install(&self, installation: &Installation) -> anyhow::Result<SlotStatus> {
        match self {
            Self::Local(agent) => agent.install(installation),
            Self::Http(agent) => agent.install(installation),
        }
    }

    pub fn slots(&self) -> Vec<RemoteSlot> {
        match self {
            Self::Local(agent) => agent.slots().into_iter().map(RemoteSlot::Local).collect(),
            Self::Http(agent) => agent.slots().into_iter().map(RemoteSlot::Http).collect(),
        }
    }

    pub fn slot_by_id(&self, id: Uuid) -> Option<RemoteSlot> {
        self.slots().into_iter().find(|slot| slot.id() == id)
    }

    pub fn set_internal_uri(&self, uri: Url) {
        match self {
            Self::Local(agent) => agent.set_internal_uri(uri),
            Self::Http(agent) => agent.set_internal_uri(uri),
        }
    }

    /// Best-effort publication of the fleet's running services.
    pub fn push_service_inventory(&self, services: &[ServiceDescriptor]) {
        match self {
            Self::Local(agent) => agent.push_service_inventory(services),
            Self::Http(agent) => agent.push_service_inventory(services),
        }
    }

    /// Re-read the agent's status. Never fails; see [`HttpRemoteAgent::refresh_status`].
    pub fn refresh_status(&self) {
        match self {
            Self::Local(_) => {}
            Self::Http(agent) => agent.refresh_status(),
        }
    }

    pub fn terminate_slot(&self, name: &str) -> anyhow::Result<SlotStatus> {
        match self {
            Self::Local(agent) => agent.terminate_slot(name),
            Self::Http(agent) => agent.terminate_slot(name),
        }
    }
}

/// Proxy for one slot.
#[derive(Debug, Clone)]
pub enum RemoteSlot {
    Local(LocalRemoteSlot),
    Http(HttpRemoteSlot),
}

impl RemoteSlot {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Local(slot) => slot.id(),
            Self::Http(slot) => slot.id(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Local(slot) => slot.name(),
            Self::Http(slot) => slot.name(),
        }
    }

    pub fn status(&self) -> anyhow::Result<SlotStatus> {
        match self {
            Self::Local(slot) => slot.status(),
            Self::Http(slot) => slot.status(),
        }
    }

    pub fn assign(&self, installation: &Installation) -> anyhow::Result<SlotStatus> {
        match self {
            Self::Local(slot) => slot.assign(installation),
            Self::Http(slot) => slot.assign(installation),
        }
    }

    pub fn clear(&self) -> anyhow::Result<ClearOutcome> {
        match self {
            Self::Local(slot) => slot.clear(),
            Self::Http(slot) => slot.clear(),
        }
    }

    pub fn start(&self) -> anyhow::Result<SlotStatus> {
        match self {
            Self::Local(slot) => slot.start(),
            Self::Http(slot) => slot.start(),
        }
    }

    pub fn stop(&self) -> anyhow::Result<SlotStatus> {
        match self {
            Self::Local(slot) => slot.stop(),
            Self::Http(slot) => slot.stop(),
        }
    }

    pub fn restart(&self) -> anyhow::Result<SlotStatus> {
        match self {
            Self::Local(slot) => slot.restart(),
            Self::Http(slot) => slot.restart(),
        }
    }

    pub fn terminate(&self) -> anyhow::Result<SlotStatus> {
        match self {
            Self::Local(slot) => slot.terminate(),
            Self::Http(slot) => slot.terminate(),
        }
    }
}
