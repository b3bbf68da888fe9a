//! Slot state machine and agent slot registry.

mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use tempfile::TempDir;
use url::Url;

use berth_core::agent::Agent;
use berth_core::assignment::{Assignment, Installation};
use berth_core::config::AgentConfig;
use berth_core::deployment::{Deployment, DeploymentStore};
use berth_core::error::BerthError;
use berth_core::slot::{ClearOutcome, InMemoryLifecycleManager, LifecycleManager, Slot};
use berth_core::status::SlotLifecycleState;

use support::{TestRepo, agent, agent_with, apple_repo, fetcher};

// =============================================================================
// Test Helpers
// =============================================================================

struct Fixture {
    _tmp: TempDir,
    repo: TestRepo,
    lifecycle: Arc<InMemoryLifecycleManager>,
    slot: Slot,
}

fn fixture() -> Fixture {
    let tmp = TempDir::new().expect("tempdir should succeed");
    let repo = apple_repo(&tmp);
    let lifecycle = Arc::new(InMemoryLifecycleManager::new());
    let store = DeploymentStore::open(tmp.path().join("slot1"), "slot1", fetcher())
        .expect("store should open");
    let slot = Slot::new("slot1", store, lifecycle.clone(), Duration::from_millis(200));
    Fixture {
        _tmp: tmp,
        repo,
        lifecycle,
        slot,
    }
}

fn installation(repo: &TestRepo, binary: &str, config: &str) -> Installation {
    repo.repository(&["fruit"])
        .installation(&Assignment::parse(binary, config).expect("assignment should parse"))
        .expect("installation should resolve")
}

fn is_illegal_state(error: &anyhow::Error) -> bool {
    matches!(BerthError::find(error), Some(BerthError::IllegalState { .. }))
}

/// In-memory lifecycle whose status query can be made to fail.
#[derive(Default)]
struct BrokenStatus {
    inner: InMemoryLifecycleManager,
    broken: AtomicBool,
}

impl LifecycleManager for BrokenStatus {
    fn start(&self, deployment: &Deployment) -> anyhow::Result<SlotLifecycleState> {
        self.inner.start(deployment)
    }

    fn stop(&self, deployment: &Deployment) -> anyhow::Result<SlotLifecycleState> {
        self.inner.stop(deployment)
    }

    fn restart(&self, deployment: &Deployment) -> anyhow::Result<SlotLifecycleState> {
        self.inner.restart(deployment)
    }

    fn status(&self, deployment: &Deployment) -> anyhow::Result<SlotLifecycleState> {
        if self.broken.load(Ordering::SeqCst) {
            anyhow::bail!("launcher crashed");
        }
        self.inner.status(deployment)
    }
}

/// In-memory lifecycle whose `start` parks on a gate: once to say it has
/// begun, once more to be let go.
struct GatedStart {
    inner: InMemoryLifecycleManager,
    gate: Barrier,
}

impl GatedStart {
    fn new() -> Self {
        Self {
            inner: InMemoryLifecycleManager::new(),
            gate: Barrier::new(2),
        }
    }
}

impl LifecycleManager for GatedStart {
    fn start(&self, deployment: &Deployment) -> anyhow::Result<SlotLifecycleState> {
        self.gate.wait();
        self.gate.wait();
        self.inner.start(deployment)
    }

    fn stop(&self, deployment: &Deployment) -> anyhow::Result<SlotLifecycleState> {
        self.inner.stop(deployment)
    }

    fn restart(&self, deployment: &Deployment) -> anyhow::Result<SlotLifecycleState> {
        self.inner.restart(deployment)
    }

    fn status(&self, deployment: &Deployment) -> anyhow::Result<SlotLifecycleState> {
        self.inner.status(deployment)
    }
}

// =============================================================================
// Slot
// =============================================================================

#[test]
fn assign_leaves_slot_stopped() {
    let f = fixture();
    let apple = installation(&f.repo, "fruit:apple:1.0", "@prod:apple:1.0");

    let assigned = f.slot.assign(&apple).expect("assign should succeed");
    assert_eq!(assigned.state, SlotLifecycleState::Stopped);
    assert_eq!(assigned.assignment.as_ref(), Some(&apple.assignment));

    let status = f.slot.status().expect("status should succeed");
    assert_eq!(status.state, SlotLifecycleState::Stopped);
    assert_eq!(status.assignment.as_ref(), Some(&apple.assignment));
    assert_eq!(status.resources["memory"], 512);
}

#[test]
fn reassign_of_running_slot_stops_and_replaces() {
    let f = fixture();
    f.slot
        .assign(&installation(&f.repo, "fruit:apple:1.0", "@prod:apple:1.0"))
        .expect("assign should succeed");
    f.slot.start().expect("start should succeed");

    let upgraded = installation(&f.repo, "fruit:apple:2.0", "@prod:apple:2.0");
    let status = f.slot.assign(&upgraded).expect("reassign should succeed");

    assert_eq!(status.state, SlotLifecycleState::Stopped);
    assert_eq!(status.assignment.as_ref(), Some(&upgraded.assignment));
    assert!(!f.slot.slot_dir().join("deployment1").exists());
    assert!(f.slot.slot_dir().join("deployment2").is_dir());
}

#[test]
fn lifecycle_verbs_on_unassigned_slot_fail() {
    let f = fixture();

    for result in [f.slot.start(), f.slot.stop(), f.slot.restart()] {
        let error = result.expect_err("unassigned slot must not change state");
        assert!(is_illegal_state(&error), "unexpected error: {:#}", error);
    }
    assert_eq!(
        f.slot.status().expect("status should succeed").state,
        SlotLifecycleState::Unassigned
    );
}

#[test]
fn start_stop_restart_report_lifecycle_state() {
    let f = fixture();
    f.slot
        .assign(&installation(&f.repo, "fruit:apple:1.0", "@prod:apple:1.0"))
        .expect("assign should succeed");

    assert_eq!(f.slot.start().expect("start").state, SlotLifecycleState::Running);
    assert_eq!(f.slot.stop().expect("stop").state, SlotLifecycleState::Stopped);
    assert_eq!(
        f.slot.stop().expect("second stop").state,
        SlotLifecycleState::Stopped
    );
    assert_eq!(
        f.slot.restart().expect("restart").state,
        SlotLifecycleState::Running
    );
    assert!(f.slot.slot_dir().join("deployment1").is_dir());
}

#[test]
fn clear_twice_is_unassigned_both_times() {
    let f = fixture();
    f.slot
        .assign(&installation(&f.repo, "fruit:apple:1.0", "@prod:apple:1.0"))
        .expect("assign should succeed");

    for _ in 0..2 {
        let outcome = f.slot.clear().expect("clear should succeed");
        assert!(outcome.is_cleared());
        assert_eq!(outcome.status().state, SlotLifecycleState::Unassigned);
    }
    assert!(!f.slot.slot_dir().join("deployment1").exists());
}

#[test]
fn clear_keeps_deployment_when_stop_fails() {
    let f = fixture();
    let apple = installation(&f.repo, "fruit:apple:1.0", "@prod:apple:1.0");
    f.slot.assign(&apple).expect("assign should succeed");
    f.slot.start().expect("start should succeed");
    f.lifecycle.set_fail_stops(true);

    let outcome = f.slot.clear().expect("clear should report an outcome");
    let ClearOutcome::StopFailed { status, .. } = &outcome else {
        panic!("expected StopFailed, got {:?}", outcome);
    };
    assert_eq!(status.state, SlotLifecycleState::Running);
    assert_eq!(status.assignment.as_ref(), Some(&apple.assignment));
    assert!(f.slot.slot_dir().join("deployment1").is_dir());
    assert!(is_illegal_state(
        &outcome.into_result().expect_err("stop failure is an error")
    ));

    f.lifecycle.set_fail_stops(false);
    assert!(f.slot.clear().expect("clear should succeed").is_cleared());
}

#[test]
fn failed_stop_aborts_reassign_and_keeps_old_deployment() {
    let f = fixture();
    let apple = installation(&f.repo, "fruit:apple:1.0", "@prod:apple:1.0");
    f.slot.assign(&apple).expect("assign should succeed");
    f.slot.start().expect("start should succeed");
    f.lifecycle.set_fail_stops(true);

    assert!(
        f.slot
            .assign(&installation(&f.repo, "fruit:apple:2.0", "@prod:apple:2.0"))
            .is_err()
    );
    let status = f.slot.status().expect("status should succeed");
    assert_eq!(status.assignment.as_ref(), Some(&apple.assignment));
    assert_eq!(status.state, SlotLifecycleState::Running);
    assert!(!f.slot.slot_dir().join("deployment2").exists());
}

#[test]
fn terminate_removes_directory_and_blocks_further_use() {
    let f = fixture();
    f.slot
        .assign(&installation(&f.repo, "fruit:apple:1.0", "@prod:apple:1.0"))
        .expect("assign should succeed");

    let status = f.slot.terminate().expect("terminate should succeed");
    assert_eq!(status.state, SlotLifecycleState::Terminated);
    assert!(!f.slot.slot_dir().exists());
    assert_eq!(
        f.slot.status().expect("status should succeed").state,
        SlotLifecycleState::Terminated
    );

    let error = f.slot.start().expect_err("terminated slot must reject commands");
    assert!(matches!(
        BerthError::find(&error),
        Some(BerthError::SlotTerminated(_))
    ));
}

#[test]
fn verify_detects_modified_deployment() {
    let f = fixture();
    assert_eq!(f.slot.verify().expect("verify should succeed"), None);

    f.slot
        .assign(&installation(&f.repo, "fruit:apple:1.0", "@prod:apple:1.0"))
        .expect("assign should succeed");
    assert_eq!(f.slot.verify().expect("verify should succeed"), Some(true));

    std::fs::write(f.slot.slot_dir().join("deployment1/README"), "tampered")
        .expect("file should be rewritten");
    assert_eq!(f.slot.verify().expect("verify should succeed"), Some(false));
}

#[test]
fn status_error_from_lifecycle_is_reported() {
    let tmp = TempDir::new().expect("tempdir should succeed");
    let repo = apple_repo(&tmp);
    let lifecycle = Arc::new(BrokenStatus::default());
    let store = DeploymentStore::open(tmp.path().join("slot1"), "slot1", fetcher())
        .expect("store should open");
    let slot = Slot::new("slot1", store, lifecycle.clone(), Duration::from_millis(200));
    slot.assign(&installation(&repo, "fruit:apple:1.0", "@prod:apple:1.0"))
        .expect("assign should succeed");

    lifecycle.broken.store(true, Ordering::SeqCst);
    let err = slot.status().expect_err("status should fail");
    let message = format!("{:#}", err);
    assert!(message.contains("slot1"), "{}", message);
    assert!(message.contains("launcher crashed"), "{}", message);

    lifecycle.broken.store(false, Ordering::SeqCst);
    let status = slot.status().expect("status should succeed");
    assert_eq!(status.state, SlotLifecycleState::Stopped);
}

#[test]
fn busy_slot_times_out_other_callers() {
    let tmp = TempDir::new().expect("tempdir should succeed");
    let repo = apple_repo(&tmp);
    let lifecycle = Arc::new(GatedStart::new());
    let store = DeploymentStore::open(tmp.path().join("slot1"), "slot1", fetcher())
        .expect("store should open");
    let slot = Slot::new("slot1", store, lifecycle.clone(), Duration::from_millis(50));
    slot.assign(&installation(&repo, "fruit:apple:1.0", "@prod:apple:1.0"))
        .expect("assign should succeed");

    std::thread::scope(|scope| {
        let starter = scope.spawn(|| slot.start());
        // start now holds the slot lock
        lifecycle.gate.wait();

        for result in [slot.status(), slot.stop()] {
            let err = result.expect_err("busy slot should time out");
            assert!(matches!(
                BerthError::find(&err),
                Some(BerthError::LockTimeout { slot: name }) if name == "slot1"
            ));
        }

        lifecycle.gate.wait();
        let started = starter
            .join()
            .expect("start thread should not panic")
            .expect("start should succeed");
        assert_eq!(started.state, SlotLifecycleState::Running);
    });

    let status = slot.status().expect("status should succeed once the lock is free");
    assert_eq!(status.state, SlotLifecycleState::Running);
}

// =============================================================================
// Agent
// =============================================================================

#[test]
fn agent_names_slots_with_lowest_free_number() {
    let tmp = TempDir::new().expect("tempdir should succeed");
    let agent = agent(&tmp.path().join("slots"), &[]);

    let first = agent.add_new_slot().expect("slot should be created");
    let second = agent.add_new_slot().expect("slot should be created");
    assert_eq!(first.name(), "slot1");
    assert_eq!(second.name(), "slot2");

    assert!(agent.delete_slot("slot1").expect("delete should succeed"));
    assert!(!agent.delete_slot("slot1").expect("second delete is a miss"));
    assert!(agent.get_slot("slot1").is_none());

    // slot1's directory is still on disk, so the name is not reused.
    let third = agent.add_new_slot().expect("slot should be created");
    assert_eq!(third.name(), "slot3");
}

#[test]
fn agent_recovers_slots_and_id_after_restart() {
    let tmp = TempDir::new().expect("tempdir should succeed");
    let repo = apple_repo(&tmp);
    let slots_dir = tmp.path().join("slots");

    let (agent_id, slot_id) = {
        let agent = agent(&slots_dir, &[("cpu", 2), ("memory", 1024)]);
        let status = agent
            .install(&installation(&repo, "fruit:apple:1.0", "@prod:apple:1.0"))
            .expect("install should succeed");
        (agent.agent_id().to_string(), status.id)
    };

    let agent = agent(&slots_dir, &[("cpu", 2), ("memory", 1024)]);
    assert_eq!(agent.agent_id(), agent_id);
    let slot = agent.get_slot_by_id(slot_id).expect("slot should be recovered");
    assert_eq!(slot.name(), "slot1");

    let status = agent.status();
    assert_eq!(status.slots.len(), 1);
    assert_eq!(status.slots[0].state, SlotLifecycleState::Stopped);
    assert_eq!(status.available_resources()["cpu"], 1);
    assert_eq!(status.location, format!("/local/{}", agent_id));
}

#[test]
fn agent_terminate_drops_slot_from_status() {
    let tmp = TempDir::new().expect("tempdir should succeed");
    let repo = apple_repo(&tmp);
    let agent = agent(&tmp.path().join("slots"), &[]);
    let status = agent
        .install(&installation(&repo, "fruit:apple:1.0", "@prod:apple:1.0"))
        .expect("install should succeed");

    let terminated = agent
        .terminate_slot(&status.name)
        .expect("slot should exist")
        .expect("terminate should succeed");
    assert_eq!(terminated.state, SlotLifecycleState::Terminated);
    assert!(agent.get_slot(&status.name).is_none());
    assert!(agent.status().slots.is_empty());
    assert!(agent.terminate_slot(&status.name).is_none());
}

#[test]
fn failed_agent_install_leaves_no_slot() {
    let tmp = TempDir::new().expect("tempdir should succeed");
    let repo = apple_repo(&tmp);
    let agent: Arc<Agent> = agent_with(
        &tmp.path().join("slots"),
        &[],
        Arc::new(InMemoryLifecycleManager::new()),
    );
    let mut broken = installation(&repo, "fruit:apple:1.0", "@prod:apple:1.0");
    broken.binary_file = repo.base().join("fruit/apple/9.9/apple-9.9.tar.gz").expect("url");

    assert!(agent.install(&broken).is_err());
    assert!(agent.status().slots.is_empty());
    assert!(!tmp.path().join("slots/slot1").exists());
}

#[test]
fn agent_status_keeps_assignment_when_lifecycle_status_fails() {
    let tmp = TempDir::new().expect("tempdir should succeed");
    let repo = apple_repo(&tmp);
    let lifecycle = Arc::new(BrokenStatus::default());
    let agent = agent_with(&tmp.path().join("slots"), &[("memory", 1024)], lifecycle.clone());
    let installed = agent
        .install(&installation(&repo, "fruit:apple:1.0", "@prod:apple:1.0"))
        .expect("install should succeed");

    lifecycle.broken.store(true, Ordering::SeqCst);
    let slot = agent.get_slot(&installed.name).expect("slot should exist");
    assert!(slot.status().is_err());

    let status = agent.status();
    assert_eq!(status.slots.len(), 1);
    assert_eq!(status.slots[0].state, SlotLifecycleState::Unknown);
    assert_eq!(status.slots[0].assignment, installed.assignment);
    assert_eq!(status.available_resources()["memory"], 512);
}

#[test]
fn agent_reports_configured_external_uri() {
    let tmp = TempDir::new().expect("tempdir should succeed");
    let mut config = AgentConfig::with_slots_dir(tmp.path().join("slots"));
    config.internal_uri = Some(Url::parse("http://10.0.0.5:8080/").expect("url"));
    config.external_uri = Some(Url::parse("https://apple.example.com/").expect("url"));
    let agent = Agent::new(config, fetcher(), Arc::new(InMemoryLifecycleManager::new()))
        .expect("agent should start");

    let status = agent.status();
    assert_eq!(status.internal_uri.as_ref().map(Url::as_str), Some("http://10.0.0.5:8080/"));
    assert_eq!(status.external_uri.as_ref().map(Url::as_str), Some("https://apple.example.com/"));
}
