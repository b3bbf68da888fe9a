//! Fleet fingerprints for optimistic concurrency.
//!
//! A fingerprint is a blake3 hash over the ordered `(id, state, assignment)`
//! tuples of every entity in a listing. Callers echo the fingerprint they saw
//! back with a mutating command; a mismatch aborts the command before it
//! touches anything.

use crate::error::BerthError;
use crate::status::{AgentStatus, SlotStatus};

/// Fingerprint of a set of slots, independent of input order.
pub fn slots_version(slots: &[SlotStatus]) -> String {
    let mut ordered: Vec<&SlotStatus> = slots.iter().collect();
    ordered.sort_by_key(|slot| slot.id);

    let mut hasher = blake3::Hasher::new();
    for slot in ordered {
        slot.update_fingerprint(&mut hasher);
    }
    hasher.finalize().to_hex().to_string()
}

/// Fingerprint of a set of agents and the slots they host.
pub fn agents_version(agents: &[AgentStatus]) -> String {
    let mut ordered: Vec<&AgentStatus> = agents.iter().collect();
    ordered.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

    let mut hasher = blake3::Hasher::new();
    for agent in ordered {
        hasher.update(agent.agent_id.as_bytes());
        hasher.update(&[0x00]);
        hasher.update(agent.state.as_str().as_bytes());
        hasher.update(&[0x00]);

        let mut slots: Vec<&SlotStatus> = agent.slots.iter().collect();
        slots.sort_by_key(|slot| slot.id);
        for slot in slots {
            slot.update_fingerprint(&mut hasher);
        }
        hasher.update(&[0xFE]);
    }
    hasher.finalize().to_hex().to_string()
}

/// Fail with [`BerthError::VersionConflict`] unless `expected` is absent or
/// equal to `actual`.
pub fn check_version(expected: Option<&str>, actual: &str) -> Result<(), BerthError> {
    match expected {
        Some(expected) if expected != actual => Err(BerthError::VersionConflict {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::SlotLifecycleState;
    use uuid::Uuid;

    #[test]
    fn slot_order_does_not_matter() {
        let a = SlotStatus::unassigned(Uuid::new_v4(), "slot1");
        let b = SlotStatus::unassigned(Uuid::new_v4(), "slot2");

        assert_eq!(
            slots_version(&[a.clone(), b.clone()]),
            slots_version(&[b, a])
        );
    }

    #[test]
    fn state_change_changes_version() {
        let slot = SlotStatus::unassigned(Uuid::new_v4(), "slot1");
        let before = slots_version(std::slice::from_ref(&slot));
        let after = slots_version(&[slot.with_state(SlotLifecycleState::Stopped)]);

        assert_ne!(before, after);
    }

    #[test]
    fn stale_version_is_rejected() {
        assert!(check_version(None, "abc").is_ok());
        assert!(check_version(Some("abc"), "abc").is_ok());
        assert!(matches!(
            check_version(Some("old"), "new"),
            Err(BerthError::VersionConflict { .. })
        ));
    }
}
