//! Slot state machine.
//!
//! A slot wraps one [`DeploymentStore`] and a [`LifecycleManager`]. Every
//! operation takes the slot's own lock with a bounded wait, so transitions
//! on one slot are totally ordered while other slots proceed independently.
//!
//! ```text
//! UNASSIGNED --assign--> STOPPED <--start/stop/restart--> RUNNING
//!      ^                    |                                |
//!      +------clear---------+--------------------------------+
//!                 any --terminate--> TERMINATED
//! ```

pub mod lifecycle;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::assignment::Installation;
use crate::deployment::{Deployment, DeploymentStore};
use crate::error::BerthError;
use crate::status::{SlotLifecycleState, SlotStatus};

pub use lifecycle::{InMemoryLifecycleManager, LauncherLifecycleManager, LifecycleManager};

/// Result of clearing a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearOutcome {
    /// The deployment (if any) was stopped and removed.
    Cleared(SlotStatus),
    /// Stopping failed; the deployment is still installed and active.
    StopFailed { status: SlotStatus, reason: String },
}

impl ClearOutcome {
    pub fn status(&self) -> &SlotStatus {
        match self {
            Self::Cleared(status) | Self::StopFailed { status, .. } => status,
        }
    }

    pub fn is_cleared(&self) -> bool {
        matches!(self, Self::Cleared(_))
    }

    /// The cleared status, or an `IllegalState` error carrying the reason.
    pub fn into_result(self) -> anyhow::Result<SlotStatus> {
        match self {
            Self::Cleared(status) => Ok(status),
            Self::StopFailed { status, reason } => Err(BerthError::IllegalState {
                slot: status.name,
                reason: format!("could not be stopped: {}", reason),
            }
            .into()),
        }
    }
}

struct SlotInner {
    store: DeploymentStore,
    terminated: bool,
}

/// One slot on an agent.
pub struct Slot {
    id: Uuid,
    name: String,
    slot_dir: PathBuf,
    lock_wait: Duration,
    lifecycle: Arc<dyn LifecycleManager>,
    inner: Mutex<SlotInner>,
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("slot_dir", &self.slot_dir)
            .finish_non_exhaustive()
    }
}

impl Slot {
    /// Create a new Slot over an opened store.
    pub fn new(
        name: &str,
        store: DeploymentStore,
        lifecycle: Arc<dyn LifecycleManager>,
        lock_wait: Duration,
    ) -> Self {
        Self {
            id: store.slot_id(),
            name: name.to_string(),
            slot_dir: store.slot_dir().to_path_buf(),
            lock_wait,
            lifecycle,
            inner: Mutex::new(SlotInner {
                store,
                terminated: false,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slot_dir(&self) -> &Path {
        &self.slot_dir
    }

    /// Install `installation` and make it the active deployment.
    ///
    /// The new deployment is installed before the old one is touched. The
    /// slot is left stopped.
    pub fn assign(&self, installation: &Installation) -> anyhow::Result<SlotStatus> {
        let mut inner = self.lock()?;

        let new = inner.store.install(installation)?;
        let old = inner.store.active().cloned();

        if let Some(old) = &old {
            let stopped = match self.lifecycle.stop(old) {
                Ok(SlotLifecycleState::Stopped) => Ok(()),
                Ok(state) => Err(anyhow::anyhow!("deployment is still {}", state)),
                Err(e) => Err(e),
            };
            if let Err(e) = stopped {
                discard(&mut inner.store, &new);
                return Err(e).with_context(|| {
                    format!("Failed to stop {} in slot {}", old.id, self.name)
                });
            }
        }

        if let Err(e) = inner.store.activate(new.id) {
            discard(&mut inner.store, &new);
            return Err(e);
        }

        if let Some(old) = old {
            if let Err(e) = inner.store.remove(old.id) {
                tracing::warn!("Failed to remove {} from slot {}: {:#}", old.id, self.name, e);
            }
        }

        tracing::info!("slot {} assigned {}", self.name, installation.assignment);
        Ok(self.snapshot(&inner.store, SlotLifecycleState::Stopped))
    }

    /// Stop and remove the active deployment.
    pub fn clear(&self) -> anyhow::Result<ClearOutcome> {
        let mut inner = self.lock()?;
        self.clear_locked(&mut inner)
    }

    pub fn start(&self) -> anyhow::Result<SlotStatus> {
        self.drive("started", |lifecycle, deployment| lifecycle.start(deployment))
    }

    pub fn stop(&self) -> anyhow::Result<SlotStatus> {
        self.drive("stopped", |lifecycle, deployment| lifecycle.stop(deployment))
    }

    /// Restart and report where the process ended up.
    pub fn restart(&self) -> anyhow::Result<SlotStatus> {
        self.drive("restarted", |lifecycle, deployment| {
            match lifecycle.restart(deployment)? {
                SlotLifecycleState::Restarting => lifecycle.status(deployment),
                state => Ok(state),
            }
        })
    }

    /// Live status, queried from the lifecycle manager.
    pub fn status(&self) -> anyhow::Result<SlotStatus> {
        let inner = self
            .inner
            .try_lock_for(self.lock_wait)
            .ok_or_else(|| BerthError::LockTimeout {
                slot: self.name.clone(),
            })?;
        if inner.terminated {
            return Ok(SlotStatus::terminated(self.id, &self.name));
        }
        self.live_status(&inner.store)
    }

    /// What the slot holds, with the process state reported as unknown.
    pub fn unknown_status(&self) -> anyhow::Result<SlotStatus> {
        let inner = self
            .inner
            .try_lock_for(self.lock_wait)
            .ok_or_else(|| BerthError::LockTimeout {
                slot: self.name.clone(),
            })?;
        if inner.terminated {
            return Ok(SlotStatus::terminated(self.id, &self.name));
        }
        Ok(self.snapshot(&inner.store, SlotLifecycleState::Unknown))
    }

    /// Clear the slot, then delete its directory for good.
    pub fn terminate(&self) -> anyhow::Result<SlotStatus> {
        let mut inner = self.lock()?;
        self.clear_locked(&mut inner)?.into_result()?;

        std::fs::remove_dir_all(&self.slot_dir).with_context(|| {
            format!("Failed to remove slot directory {}", self.slot_dir.display())
        })?;
        inner.terminated = true;
        tracing::info!("slot {} terminated", self.name);
        Ok(SlotStatus::terminated(self.id, &self.name))
    }

    /// Whether the active deployment still matches its install-time hash.
    pub fn verify(&self) -> anyhow::Result<Option<bool>> {
        let inner = self.lock()?;
        let Some(active) = inner.store.active() else {
            return Ok(None);
        };
        let current = inner.store.tree_hash(active.id)?;
        Ok(Some(current == active.tree_hash))
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, SlotInner>> {
        let inner = self
            .inner
            .try_lock_for(self.lock_wait)
            .ok_or_else(|| BerthError::LockTimeout {
                slot: self.name.clone(),
            })?;
        if inner.terminated {
            return Err(BerthError::SlotTerminated(self.name.clone()).into());
        }
        Ok(inner)
    }

    fn clear_locked(&self, inner: &mut SlotInner) -> anyhow::Result<ClearOutcome> {
        let Some(active) = inner.store.active().cloned() else {
            return Ok(ClearOutcome::Cleared(SlotStatus::unassigned(self.id, &self.name)));
        };

        match self.lifecycle.stop(&active) {
            Ok(SlotLifecycleState::Stopped) => {}
            Ok(state) => {
                return Ok(ClearOutcome::StopFailed {
                    status: self.snapshot(&inner.store, state),
                    reason: format!("deployment is still {}", state),
                });
            }
            Err(e) => {
                tracing::warn!("slot {} could not stop {}: {:#}", self.name, active.id, e);
                let status = self.live_status(&inner.store).unwrap_or_else(|e| {
                    tracing::warn!("{:#}", e);
                    self.snapshot(&inner.store, SlotLifecycleState::Unknown)
                });
                return Ok(ClearOutcome::StopFailed {
                    status,
                    reason: format!("{:#}", e),
                });
            }
        }

        inner.store.remove(active.id)?;
        tracing::info!("slot {} cleared", self.name);
        Ok(ClearOutcome::Cleared(SlotStatus::unassigned(
            self.id, &self.name,
        )))
    }

    fn drive(
        &self,
        verb: &str,
        op: impl FnOnce(&dyn LifecycleManager, &Deployment) -> anyhow::Result<SlotLifecycleState>,
    ) -> anyhow::Result<SlotStatus> {
        let inner = self.lock()?;
        let Some(active) = inner.store.active() else {
            return Err(BerthError::IllegalState {
                slot: self.name.clone(),
                reason: format!("can not be {} because the slot is not assigned", verb),
            }
            .into());
        };
        let state = op(self.lifecycle.as_ref(), active)
            .with_context(|| format!("Slot {} could not be {}", self.name, verb))?;
        Ok(self.snapshot(&inner.store, state))
    }

    fn live_status(&self, store: &DeploymentStore) -> anyhow::Result<SlotStatus> {
        let Some(active) = store.active() else {
            return Ok(SlotStatus::unassigned(self.id, &self.name));
        };
        let state = self
            .lifecycle
            .status(active)
            .with_context(|| format!("Failed to read status of {} in slot {}", active.id, self.name))?;
        Ok(self.snapshot(store, state))
    }

    fn snapshot(&self, store: &DeploymentStore, state: SlotLifecycleState) -> SlotStatus {
        let Some(active) = store.active() else {
            return SlotStatus::unassigned(self.id, &self.name);
        };
        SlotStatus {
            assignment: Some(active.assignment.clone()),
            state,
            resources: active.installation.resources.clone(),
            installed_hash: Some(active.tree_hash.clone()),
            ..SlotStatus::unassigned(self.id, &self.name)
        }
    }
}

/// Roll back a freshly installed deployment after a failed switch.
fn discard(store: &mut DeploymentStore, deployment: &Deployment) {
    if let Err(e) = store.remove(deployment.id) {
        tracing::warn!(
            "Failed to roll back {} in {}: {:#}",
            deployment.id,
            store.slot_dir().display(),
            e
        );
    }
}
