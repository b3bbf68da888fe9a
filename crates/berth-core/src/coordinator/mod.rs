//! Fleet-wide control over a set of agents.
//!
//! The coordinator keeps one [`RemoteAgent`] per agent id. Reads snapshot the
//! registry and return a [`Listing`] carrying a fingerprint of what was seen.
//! Mutating verbs accept that fingerprint back and refuse to run when the
//! fleet has changed since. Every verb applies to each target independently
//! and reports per-slot outcomes in a [`FleetReport`].

pub mod filter;
pub mod ledger;
pub mod prefix;
pub mod version;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Context;
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::artifact::Repository;
use crate::assignment::{Assignment, Installation, UpgradeVersions};
use crate::config::CoordinatorConfig;
use crate::error::BerthError;
use crate::remote::{AgentTransport, HttpRemoteAgent, RemoteAgent, RemoteSlot, ServiceDescriptor};
use crate::status::{AgentLifecycleState, AgentStatus, SlotLifecycleState, SlotStatus};

pub use filter::{AgentFilter, SlotFilter};
pub use ledger::{Claim, ResourceLedger};
pub use prefix::shortest_unique_prefix;
pub use version::{agents_version, check_version, slots_version};

/// Shortest id prefix a listing will suggest.
pub const MIN_PREFIX_LEN: usize = 4;

/// Pool every published service belongs to.
pub const DEFAULT_POOL: &str = "general";

// =============================================================================
// Results
// =============================================================================

/// A filtered read of the fleet.
#[derive(Debug, Clone, Serialize)]
pub struct Listing<T> {
    /// Fingerprint of the whole fleet at the time of the read.
    pub version: String,
    /// Characters of an id needed to tell every known id apart.
    pub prefix_len: usize,
    pub items: Vec<T>,
}

/// A slot together with the agent hosting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FleetSlot {
    pub agent_id: String,
    pub host: Option<String>,
    pub location: String,
    #[serde(flatten)]
    pub status: SlotStatus,
}

impl FleetSlot {
    fn new(agent: &AgentStatus, status: SlotStatus) -> Self {
        Self {
            agent_id: agent.agent_id.clone(),
            host: agent.host().map(str::to_string),
            location: format!("{}{}", agent.location, status.path),
            status,
        }
    }
}

/// A slot a fleet command could not handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotFailure {
    pub slot_id: Uuid,
    pub slot_name: String,
    pub agent_id: String,
    pub error: String,
}

/// Per-slot outcome of a fleet command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FleetReport {
    pub succeeded: Vec<SlotStatus>,
    pub failed: Vec<SlotFailure>,
}

impl FleetReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, target: &Target, result: anyhow::Result<SlotStatus>) {
        match result {
            Ok(status) => self.succeeded.push(status),
            Err(e) => {
                tracing::warn!(
                    "slot {} on agent {} failed: {:#}",
                    target.slot.name,
                    target.agent_id,
                    e
                );
                self.failed.push(SlotFailure {
                    slot_id: target.slot.id,
                    slot_name: target.slot.name.clone(),
                    agent_id: target.agent_id.clone(),
                    error: format!("{:#}", e),
                });
            }
        }
    }
}

/// A matched slot and the agent proxy to reach it through.
struct Target {
    agent: Arc<RemoteAgent>,
    agent_id: String,
    slot: SlotStatus,
}

impl Target {
    fn remote_slot(&self) -> anyhow::Result<RemoteSlot> {
        self.agent.slot_by_id(self.slot.id).with_context(|| {
            format!(
                "Slot {} no longer exists on agent {}",
                self.slot.name, self.agent_id
            )
        })
    }
}

// =============================================================================
// Coordinator
// =============================================================================

pub struct Coordinator {
    repository: Arc<Repository>,
    environment: String,
    agents: RwLock<BTreeMap<String, Arc<RemoteAgent>>>,
    ledger: ResourceLedger,
    transport: Option<Arc<dyn AgentTransport>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("environment", &self.environment)
            .field("agents", &self.agents.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Create a coordinator with no agents.
    ///
    /// Without a transport only in-process agents can be registered; see
    /// [`Coordinator::with_transport`].
    pub fn new(repository: Arc<Repository>, config: &CoordinatorConfig) -> Self {
        Self {
            repository,
            environment: config.environment.clone(),
            agents: RwLock::new(BTreeMap::new()),
            ledger: ResourceLedger::new(),
            transport: None,
        }
    }

    /// Use `transport` to reach agents that announce themselves.
    pub fn with_transport(mut self, transport: Arc<dyn AgentTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repository
    }

    // -------------------------------------------------------------------------
    // Registry
    // -------------------------------------------------------------------------

    /// Register `agent`, replacing any agent with the same id.
    pub fn add_agent(&self, agent: RemoteAgent) -> Arc<RemoteAgent> {
        let agent = Arc::new(agent);
        let agent_id = agent.agent_id();
        tracing::info!("agent {} registered", agent_id);
        self.agents.write().insert(agent_id, agent.clone());
        agent
    }

    pub fn remove_agent(&self, agent_id: &str) -> Option<Arc<RemoteAgent>> {
        let removed = self.agents.write().remove(agent_id);
        if removed.is_some() {
            tracing::info!("agent {} removed", agent_id);
        }
        removed
    }

    pub fn agent(&self, agent_id: &str) -> Option<Arc<RemoteAgent>> {
        self.agents.read().get(agent_id).cloned()
    }

    /// Snapshot of every registered agent, ordered by id.
    pub fn agents(&self) -> Vec<Arc<RemoteAgent>> {
        self.agents.read().values().cloned().collect()
    }

    /// Record an announcement from an agent on another host.
    ///
    /// Unknown agents are registered as HTTP agents; known ones have their
    /// cached status replaced. An announcing agent is online by definition.
    pub fn update_agent_status(&self, status: AgentStatus) -> anyhow::Result<()> {
        let status = status.with_state(AgentLifecycleState::Online);

        if let Some(agent) = self.agent(&status.agent_id) {
            match agent.as_ref() {
                RemoteAgent::Http(http) => http.update_status(status),
                RemoteAgent::Local(_) => {
                    tracing::debug!("ignoring announcement from local agent {}", status.agent_id)
                }
            }
            return Ok(());
        }

        let transport = self.transport.clone().with_context(|| {
            format!(
                "Cannot register agent {}: coordinator has no agent transport",
                status.agent_id
            )
        })?;
        self.add_agent(RemoteAgent::Http(HttpRemoteAgent::new(status, transport)));
        Ok(())
    }

    /// Mark an agent offline. Returns false for unknown and local agents.
    pub fn agent_offline(&self, agent_id: &str) -> bool {
        match self.agent(agent_id).as_deref() {
            Some(RemoteAgent::Http(http)) => {
                http.set_offline();
                true
            }
            _ => false,
        }
    }

    /// Re-read the status of every agent.
    pub fn refresh_all(&self) {
        for agent in self.agents() {
            agent.refresh_status();
        }
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    fn statuses(&self) -> Vec<(Arc<RemoteAgent>, AgentStatus)> {
        self.agents()
            .into_iter()
            .map(|agent| {
                let status = agent.status();
                (agent, status)
            })
            .collect()
    }

    fn all_slots(statuses: &[(Arc<RemoteAgent>, AgentStatus)]) -> Vec<SlotStatus> {
        statuses
            .iter()
            .flat_map(|(_, status)| status.slots.iter().cloned())
            .collect()
    }

    fn slot_prefix_len(slots: &[SlotStatus]) -> usize {
        let ids: Vec<String> = slots.iter().map(|slot| slot.id.to_string()).collect();
        shortest_unique_prefix(&ids, MIN_PREFIX_LEN)
    }

    pub fn agents_status(&self, filter: &AgentFilter) -> Listing<AgentStatus> {
        let statuses: Vec<AgentStatus> = self.statuses().into_iter().map(|(_, s)| s).collect();
        let ids: Vec<&str> = statuses.iter().map(|s| s.agent_id.as_str()).collect();

        Listing {
            version: agents_version(&statuses),
            prefix_len: shortest_unique_prefix(&ids, MIN_PREFIX_LEN),
            items: statuses.into_iter().filter(|s| filter.matches(s)).collect(),
        }
    }

    pub fn agent_status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.agent(agent_id).map(|agent| agent.status())
    }

    pub fn slots_status(&self, filter: &SlotFilter) -> Listing<FleetSlot> {
        let statuses = self.statuses();
        let slots = Self::all_slots(&statuses);

        let items = statuses
            .iter()
            .flat_map(|(_, agent)| {
                agent
                    .slots
                    .iter()
                    .filter(|slot| filter.matches(agent, slot))
                    .map(|slot| FleetSlot::new(agent, slot.clone()))
            })
            .collect();

        Listing {
            version: slots_version(&slots),
            prefix_len: Self::slot_prefix_len(&slots),
            items,
        }
    }

    /// Snapshot the fleet, check `expected` against it and return the slots
    /// matching `filter`.
    fn targets(&self, filter: &SlotFilter, expected: Option<&str>) -> anyhow::Result<Vec<Target>> {
        let statuses = self.statuses();
        check_version(expected, &slots_version(&Self::all_slots(&statuses)))?;

        let mut targets = Vec::new();
        for (agent, status) in &statuses {
            for slot in status.slots.iter().filter(|slot| filter.matches(status, slot)) {
                targets.push(Target {
                    agent: agent.clone(),
                    agent_id: status.agent_id.clone(),
                    slot: slot.clone(),
                });
            }
        }
        Ok(targets)
    }

    fn for_each_slot(
        &self,
        filter: &SlotFilter,
        expected: Option<&str>,
        op: impl Fn(&RemoteSlot) -> anyhow::Result<SlotStatus>,
    ) -> anyhow::Result<FleetReport> {
        let mut report = FleetReport::default();
        for target in self.targets(filter, expected)? {
            let result = target.remote_slot().and_then(|slot| op(&slot));
            report.record(&target, result);
        }
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Fleet verbs
    // -------------------------------------------------------------------------

    /// Install `assignment` on up to `limit` online agents matching `filter`.
    ///
    /// Agents are tried in id order. An agent is used only if its free
    /// resources cover what the installation declares. A failure on one
    /// agent is logged and the next agent is tried.
    pub fn install(
        &self,
        filter: &AgentFilter,
        limit: usize,
        assignment: &Assignment,
        expected: Option<&str>,
    ) -> anyhow::Result<Vec<SlotStatus>> {
        let statuses = self.statuses();
        let agents: Vec<AgentStatus> = statuses.iter().map(|(_, s)| s.clone()).collect();
        check_version(expected, &agents_version(&agents))?;

        let installation = self
            .repository
            .installation(assignment)
            .with_context(|| format!("Failed to resolve {}", assignment))?;

        let mut installed = Vec::new();
        for (agent, status) in statuses {
            if installed.len() >= limit {
                break;
            }
            if status.state != AgentLifecycleState::Online || !filter.matches(&status) {
                continue;
            }

            let Some(_claim) = self.ledger.try_claim(|| agent.status(), &installation.resources)
            else {
                tracing::debug!(
                    "agent {} lacks resources for {}",
                    status.agent_id,
                    installation.assignment
                );
                continue;
            };

            match agent.install(&installation) {
                Ok(slot) => {
                    tracing::info!(
                        "installed {} in {} on agent {}",
                        installation.assignment,
                        slot.name,
                        status.agent_id
                    );
                    installed.push(slot);
                }
                Err(e) => tracing::warn!(
                    "install of {} on agent {} failed: {:#}",
                    installation.assignment,
                    status.agent_id,
                    e
                ),
            }
        }
        Ok(installed)
    }

    /// Move matching slots to new binary and/or config versions.
    ///
    /// Every new installation is resolved before any slot is touched, so a
    /// resolution failure leaves the fleet as it was. Unassigned slots are
    /// reported as failures.
    pub fn upgrade(
        &self,
        filter: &SlotFilter,
        versions: &UpgradeVersions,
        expected: Option<&str>,
    ) -> anyhow::Result<FleetReport> {
        if versions.is_empty() {
            anyhow::bail!("Upgrade needs a binary version, a config version, or both");
        }

        let targets = self.targets(filter, expected)?;
        let mut installations: HashMap<Assignment, Installation> = HashMap::new();
        for assignment in targets.iter().filter_map(|t| t.slot.assignment.as_ref()) {
            if installations.contains_key(assignment) {
                continue;
            }
            let upgraded = versions.upgrade(assignment);
            let installation = self
                .repository
                .installation(&upgraded)
                .with_context(|| format!("Failed to resolve upgrade {}", upgraded))?;
            installations.insert(assignment.clone(), installation);
        }

        let mut report = FleetReport::default();
        for target in targets {
            let result = match target
                .slot
                .assignment
                .as_ref()
                .and_then(|a| installations.get(a))
            {
                Some(installation) => target.remote_slot().and_then(|slot| slot.assign(installation)),
                None => Err(BerthError::IllegalState {
                    slot: target.slot.name.clone(),
                    reason: "can not be upgraded because the slot is not assigned".to_string(),
                }
                .into()),
            };
            report.record(&target, result);
        }
        Ok(report)
    }

    /// Start or stop matching slots. Only `Running` and `Stopped` are
    /// accepted; use [`Coordinator::restart`] to restart.
    pub fn set_state(
        &self,
        state: SlotLifecycleState,
        filter: &SlotFilter,
        expected: Option<&str>,
    ) -> anyhow::Result<FleetReport> {
        match state {
            SlotLifecycleState::Running => self.for_each_slot(filter, expected, RemoteSlot::start),
            SlotLifecycleState::Stopped => self.for_each_slot(filter, expected, RemoteSlot::stop),
            other => anyhow::bail!(
                "Cannot set slots to {}: only RUNNING and STOPPED can be set directly",
                other
            ),
        }
    }

    pub fn restart(&self, filter: &SlotFilter, expected: Option<&str>) -> anyhow::Result<FleetReport> {
        self.for_each_slot(filter, expected, RemoteSlot::restart)
    }

    /// Clear and remove matching slots from their agents.
    pub fn terminate(
        &self,
        filter: &SlotFilter,
        expected: Option<&str>,
    ) -> anyhow::Result<FleetReport> {
        self.for_each_slot(filter, expected, RemoteSlot::terminate)
    }

    /// Clear the assignment of matching slots. A slot whose process refused
    /// to stop keeps its deployment and is reported as failed.
    pub fn reset(&self, filter: &SlotFilter, expected: Option<&str>) -> anyhow::Result<FleetReport> {
        self.for_each_slot(filter, expected, |slot| slot.clear()?.into_result())
    }

    // -------------------------------------------------------------------------
    // Service inventory
    // -------------------------------------------------------------------------

    /// Descriptors for every running slot in the fleet.
    pub fn service_inventory(&self) -> Vec<ServiceDescriptor> {
        let mut services = Vec::new();
        for (_, agent) in self.statuses() {
            for slot in &agent.slots {
                let (SlotLifecycleState::Running, Some(assignment)) = (slot.state, &slot.assignment)
                else {
                    continue;
                };
                services.push(ServiceDescriptor {
                    id: slot.id,
                    service_type: assignment.config.component().to_string(),
                    pool: DEFAULT_POOL.to_string(),
                    location: format!("{}{}", agent.location, slot.path),
                    properties: BTreeMap::from([
                        ("binary".to_string(), assignment.binary.to_string()),
                        ("config".to_string(), assignment.config.to_string()),
                        ("environment".to_string(), self.environment.clone()),
                    ]),
                });
            }
        }
        services
    }

    /// Send the current inventory to every online agent.
    pub fn push_service_inventory(&self) {
        let services = self.service_inventory();
        for agent in self.agents() {
            if agent.status().state == AgentLifecycleState::Online {
                agent.push_service_inventory(&services);
            }
        }
    }
}
