//! Process lifecycle of an installed deployment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use parking_lot::Mutex;

use crate::deployment::Deployment;
use crate::status::SlotLifecycleState;

/// Starts and stops the process belonging to a deployment.
///
/// Implementations report the state the process ended up in.
pub trait LifecycleManager: Send + Sync {
    fn start(&self, deployment: &Deployment) -> anyhow::Result<SlotLifecycleState>;
    fn stop(&self, deployment: &Deployment) -> anyhow::Result<SlotLifecycleState>;
    fn restart(&self, deployment: &Deployment) -> anyhow::Result<SlotLifecycleState>;
    fn status(&self, deployment: &Deployment) -> anyhow::Result<SlotLifecycleState>;
}

// =============================================================================
// Launcher script
// =============================================================================

/// Exit code of `launcher status` for a process that is not running.
const LAUNCHER_NOT_RUNNING: i32 = 3;

/// Drives `bin/launcher <verb>` inside the deployment directory.
///
/// `status` exits 0 when running and 3 when stopped. Other verbs exit 0 on
/// success.
#[derive(Debug, Clone)]
pub struct LauncherLifecycleManager {
    launcher: PathBuf,
}

impl Default for LauncherLifecycleManager {
    fn default() -> Self {
        Self::new("bin/launcher")
    }
}

impl LauncherLifecycleManager {
    /// Create a new LauncherLifecycleManager running `launcher` (relative to
    /// the deployment directory).
    pub fn new(launcher: impl Into<PathBuf>) -> Self {
        Self {
            launcher: launcher.into(),
        }
    }

    fn run(&self, dir: &Path, verb: &str) -> anyhow::Result<std::process::Output> {
        let launcher = dir.join(&self.launcher);
        Command::new(&launcher)
            .arg(verb)
            .current_dir(dir)
            .output()
            .with_context(|| format!("Failed to run {} {}", launcher.display(), verb))
    }

    fn run_verb(
        &self,
        deployment: &Deployment,
        verb: &str,
        success: SlotLifecycleState,
    ) -> anyhow::Result<SlotLifecycleState> {
        let output = self.run(deployment.dir(), verb)?;
        if !output.status.success() {
            anyhow::bail!(
                "launcher {} failed for {} ({}): {}",
                verb,
                deployment.id,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(success)
    }
}

impl LifecycleManager for LauncherLifecycleManager {
    fn start(&self, deployment: &Deployment) -> anyhow::Result<SlotLifecycleState> {
        self.run_verb(deployment, "start", SlotLifecycleState::Running)
    }

    fn stop(&self, deployment: &Deployment) -> anyhow::Result<SlotLifecycleState> {
        self.run_verb(deployment, "stop", SlotLifecycleState::Stopped)
    }

    fn restart(&self, deployment: &Deployment) -> anyhow::Result<SlotLifecycleState> {
        self.run_verb(deployment, "restart", SlotLifecycleState::Running)
    }

    fn status(&self, deployment: &Deployment) -> anyhow::Result<SlotLifecycleState> {
        let output = self.run(deployment.dir(), "status")?;
        Ok(match output.status.code() {
            Some(0) => SlotLifecycleState::Running,
            Some(LAUNCHER_NOT_RUNNING) => SlotLifecycleState::Stopped,
            _ => SlotLifecycleState::Unknown,
        })
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Records the state of each deployment directory without running anything.
#[derive(Debug, Default)]
pub struct InMemoryLifecycleManager {
    states: Mutex<HashMap<PathBuf, SlotLifecycleState>>,
    fail_stops: AtomicBool,
}

impl InMemoryLifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `stop` fail (or succeed again).
    pub fn set_fail_stops(&self, fail: bool) {
        self.fail_stops.store(fail, Ordering::SeqCst);
    }

    fn set(&self, deployment: &Deployment, state: SlotLifecycleState) -> SlotLifecycleState {
        self.states
            .lock()
            .insert(deployment.dir().to_path_buf(), state);
        state
    }
}

impl LifecycleManager for InMemoryLifecycleManager {
    fn start(&self, deployment: &Deployment) -> anyhow::Result<SlotLifecycleState> {
        Ok(self.set(deployment, SlotLifecycleState::Running))
    }

    fn stop(&self, deployment: &Deployment) -> anyhow::Result<SlotLifecycleState> {
        if self.fail_stops.load(Ordering::SeqCst) {
            anyhow::bail!("refusing to stop {}", deployment.id);
        }
        Ok(self.set(deployment, SlotLifecycleState::Stopped))
    }

    fn restart(&self, deployment: &Deployment) -> anyhow::Result<SlotLifecycleState> {
        Ok(self.set(deployment, SlotLifecycleState::Running))
    }

    fn status(&self, deployment: &Deployment) -> anyhow::Result<SlotLifecycleState> {
        Ok(self
            .states
            .lock()
            .get(deployment.dir())
            .copied()
            .unwrap_or(SlotLifecycleState::Stopped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::{Assignment, Installation};
    use crate::deployment::DeploymentId;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn deployment(dir: &Path) -> Deployment {
        let installation = Installation {
            assignment: Assignment::parse("fruit:apple:1.0", "@prod:apple:1.0").expect("parse"),
            binary_file: url::Url::parse("file:///repo/apple-1.0.tar.gz").expect("url"),
            config_files: BTreeMap::new(),
            resources: BTreeMap::new(),
        };
        Deployment::new(
            DeploymentId::new(1),
            dir.to_path_buf(),
            &installation,
            String::new(),
        )
    }

    #[test]
    fn in_memory_tracks_state_per_deployment() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let manager = InMemoryLifecycleManager::new();
        let deployment = deployment(tmp.path());

        assert_eq!(
            manager.status(&deployment).expect("status"),
            SlotLifecycleState::Stopped
        );
        manager.start(&deployment).expect("start");
        assert_eq!(
            manager.status(&deployment).expect("status"),
            SlotLifecycleState::Running
        );

        manager.set_fail_stops(true);
        assert!(manager.stop(&deployment).is_err());
        assert_eq!(
            manager.status(&deployment).expect("status"),
            SlotLifecycleState::Running
        );
    }

    #[cfg(unix)]
    #[test]
    fn launcher_exit_codes_map_to_states() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().expect("tempdir should succeed");
        let bin = tmp.path().join("bin");
        std::fs::create_dir_all(&bin).expect("mkdir");
        let script = bin.join("launcher");
        std::fs::write(
            &script,
            "#!/bin/sh\ncase \"$1\" in\n  start) touch running ;;\n  stop) rm -f running ;;\n  status) [ -f running ] && exit 0 || exit 3 ;;\n  *) exit 1 ;;\nesac\n",
        )
        .expect("write launcher");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");

        let manager = LauncherLifecycleManager::default();
        let deployment = deployment(tmp.path());

        assert_eq!(
            manager.status(&deployment).expect("status"),
            SlotLifecycleState::Stopped
        );
        assert_eq!(
            manager.start(&deployment).expect("start"),
            SlotLifecycleState::Running
        );
        assert_eq!(
            manager.status(&deployment).expect("status"),
            SlotLifecycleState::Running
        );
        assert_eq!(
            manager.stop(&deployment).expect("stop"),
            SlotLifecycleState::Stopped
        );
        assert!(manager.restart(&deployment).is_err(), "unknown verb exits 1");
    }
}
