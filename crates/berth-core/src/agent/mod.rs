//! Agent: the slots hosted on one machine.

pub mod announcer;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::artifact::Fetcher;
use crate::assignment::Installation;
use crate::config::AgentConfig;
use crate::deployment::DeploymentStore;
use crate::deployment::store::SLOT_ID_FILE;
use crate::error::BerthError;
use crate::fs::write_atomic;
use crate::slot::{LifecycleManager, Slot};
use crate::status::{AgentLifecycleState, AgentStatus, SlotLifecycleState, SlotStatus};

pub use announcer::Announcer;

pub const AGENT_ID_FILE: &str = "berth-agent-id.txt";

/// Attempts at finding a free slot name before giving up.
const MAX_SLOT_ATTEMPTS: u32 = 10_000;

/// All slots of one host.
pub struct Agent {
    agent_id: String,
    config: AgentConfig,
    fetcher: Arc<Fetcher>,
    lifecycle: Arc<dyn LifecycleManager>,
    slots: RwLock<BTreeMap<String, Arc<Slot>>>,
    /// Serializes slot name allocation.
    naming: Mutex<()>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("agent_id", &self.agent_id)
            .field("slots_dir", &self.config.slots_dir)
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Create a new Agent rooted at `config.slots_dir`.
    ///
    /// The agent id is read from (or written to) the slots directory, and
    /// every `slot<N>` directory holding a slot id file is reopened.
    pub fn new(
        config: AgentConfig,
        fetcher: Arc<Fetcher>,
        lifecycle: Arc<dyn LifecycleManager>,
    ) -> anyhow::Result<Self> {
        let slots_dir = config.slots_dir.clone();
        fs::create_dir_all(&slots_dir).with_context(|| {
            format!("Failed to create slots directory: {}", slots_dir.display())
        })?;

        let agent_id = load_or_create_agent_id(&slots_dir)?;
        let agent = Self {
            agent_id,
            config,
            fetcher,
            lifecycle,
            slots: RwLock::new(BTreeMap::new()),
            naming: Mutex::new(()),
        };
        agent.recover_slots()?;
        Ok(agent)
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn slots_dir(&self) -> &Path {
        &self.config.slots_dir
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Create an empty slot under the lowest unused `slot<N>` name.
    pub fn add_new_slot(&self) -> anyhow::Result<Arc<Slot>> {
        let _naming = self.naming.lock();

        let name = {
            let slots = self.slots.read();
            (1..=MAX_SLOT_ATTEMPTS)
                .map(|n| format!("slot{}", n))
                .find(|name| !slots.contains_key(name) && !self.slots_dir().join(name).exists())
                .ok_or(BerthError::Exhausted("slot"))?
        };

        let slot = Arc::new(self.open_slot(&name)?);
        self.slots.write().insert(name.clone(), slot.clone());
        tracing::info!("agent {} added {}", self.agent_id, name);
        Ok(slot)
    }

    /// Add a slot and assign `installation` to it.
    ///
    /// The slot is terminated again if the assignment fails.
    pub fn install(&self, installation: &Installation) -> anyhow::Result<SlotStatus> {
        let slot = self.add_new_slot()?;
        match slot.assign(installation) {
            Ok(status) => Ok(status),
            Err(e) => {
                if let Some(Err(cleanup)) = self.terminate_slot(slot.name()) {
                    tracing::warn!("Failed to remove {} after failed install: {:#}", slot.name(), cleanup);
                }
                Err(e)
            }
        }
    }

    pub fn get_slot(&self, name: &str) -> Option<Arc<Slot>> {
        self.slots.read().get(name).cloned()
    }

    pub fn get_slot_by_id(&self, id: Uuid) -> Option<Arc<Slot>> {
        self.slots.read().values().find(|slot| slot.id() == id).cloned()
    }

    /// Snapshot of every slot, in name order.
    pub fn all_slots(&self) -> Vec<Arc<Slot>> {
        self.slots.read().values().cloned().collect()
    }

    /// Clear a slot and forget it. The directory stays on disk.
    ///
    /// Returns `false` when no such slot exists. A slot whose process cannot
    /// be stopped stays registered.
    pub fn delete_slot(&self, name: &str) -> anyhow::Result<bool> {
        let Some(slot) = self.get_slot(name) else {
            return Ok(false);
        };
        slot.clear()?.into_result()?;
        self.slots.write().remove(name);
        Ok(true)
    }

    /// Terminate a slot and remove it from the registry.
    pub fn terminate_slot(&self, name: &str) -> Option<anyhow::Result<SlotStatus>> {
        let slot = self.get_slot(name)?;
        let result = slot.terminate();
        if result.is_ok() {
            self.slots.write().remove(name);
        }
        Some(result)
    }

    /// Aggregate status of the agent and all its slots.
    pub fn status(&self) -> AgentStatus {
        let slots = self
            .all_slots()
            .iter()
            .filter_map(|slot| match slot.status() {
                Ok(status) if status.state == SlotLifecycleState::Terminated => None,
                Ok(status) => Some(status),
                Err(e) => {
                    tracing::warn!("status of {} unavailable: {:#}", slot.name(), e);
                    // A held lock would only time out again.
                    let known = match BerthError::find(&e) {
                        Some(BerthError::LockTimeout { .. }) => None,
                        _ => slot.unknown_status().ok(),
                    };
                    Some(known.unwrap_or_else(|| {
                        SlotStatus::unassigned(slot.id(), slot.name())
                            .with_state(SlotLifecycleState::Unknown)
                    }))
                }
            })
            .collect();

        AgentStatus {
            agent_id: self.agent_id.clone(),
            state: AgentLifecycleState::Online,
            internal_uri: self.config.internal_uri.clone(),
            external_uri: self.config.external_uri.clone(),
            location: self
                .config
                .location
                .clone()
                .unwrap_or_else(|| format!("/local/{}", self.agent_id)),
            instance_type: self.config.instance_type.clone(),
            resources: self.config.resources.clone(),
            slots,
        }
    }

    fn open_slot(&self, name: &str) -> anyhow::Result<Slot> {
        let store = DeploymentStore::open(self.slots_dir().join(name), name, self.fetcher.clone())?;
        Ok(Slot::new(
            name,
            store,
            self.lifecycle.clone(),
            self.config.max_lock_wait(),
        ))
    }

    fn recover_slots(&self) -> anyhow::Result<()> {
        let entries = fs::read_dir(self.slots_dir())
            .with_context(|| format!("Failed to read {}", self.slots_dir().display()))?;

        let mut slots = self.slots.write();
        for entry in entries {
            let path = entry
                .with_context(|| format!("Failed to read {}", self.slots_dir().display()))?
                .path();
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            if !is_slot_name(&name) || !path.join(SLOT_ID_FILE).is_file() {
                continue;
            }
            let slot = self.open_slot(&name)?;
            tracing::info!("agent {} recovered {} ({})", self.agent_id, name, slot.id());
            slots.insert(name, Arc::new(slot));
        }
        Ok(())
    }
}

fn is_slot_name(name: &str) -> bool {
    name.strip_prefix("slot")
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

fn load_or_create_agent_id(slots_dir: &Path) -> anyhow::Result<String> {
    let path: PathBuf = slots_dir.join(AGENT_ID_FILE);
    if let Ok(raw) = fs::read_to_string(&path) {
        let raw = raw.trim();
        if !raw.is_empty() {
            return Ok(raw.to_string());
        }
    }
    let id = Uuid::new_v4().to_string();
    write_atomic(&path, id.as_bytes())?;
    Ok(id)
}
