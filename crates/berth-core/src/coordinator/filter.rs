//! Predicates selecting slots and agents for fleet commands.
//!
//! Each criterion accepts several patterns (any may match); criteria are
//! combined with AND. An empty filter matches everything.

use globset::{Glob, GlobSet, GlobSetBuilder};
use uuid::Uuid;

use crate::assignment::Assignment;
use crate::error::BerthError;
use crate::status::{AgentLifecycleState, AgentStatus, SlotLifecycleState, SlotStatus};

/// Compiled set of glob patterns.
#[derive(Debug, Clone)]
struct Patterns {
    raw: Vec<String>,
    set: GlobSet,
}

impl Patterns {
    fn add(existing: Option<Patterns>, pattern: String) -> Result<Patterns, BerthError> {
        let mut raw = existing.map(|p| p.raw).unwrap_or_default();
        raw.push(pattern);

        let mut builder = GlobSetBuilder::new();
        for pattern in &raw {
            let glob = Glob::new(pattern)
                .map_err(|e| BerthError::InvalidFilter(format!("'{}': {}", pattern, e)))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| BerthError::InvalidFilter(e.to_string()))?;
        Ok(Patterns { raw, set })
    }

    fn is_match(&self, candidate: &str) -> bool {
        self.set.is_match(candidate)
    }
}

/// Slot ids are matched by prefix unless the pattern says otherwise.
fn id_pattern(pattern: &str) -> String {
    if pattern.ends_with('*') {
        pattern.to_string()
    } else {
        format!("{}*", pattern)
    }
}

fn matches_id(patterns: &Option<Patterns>, id: Uuid) -> bool {
    patterns
        .as_ref()
        .is_none_or(|p| p.is_match(&id.to_string()))
}

fn matches_host(patterns: &Option<Patterns>, agent: &AgentStatus) -> bool {
    patterns
        .as_ref()
        .is_none_or(|p| agent.host().is_some_and(|host| p.is_match(host)))
}

// =============================================================================
// Slot filter
// =============================================================================

/// Selects slots by host, slot id, state, binary and config.
#[derive(Debug, Clone, Default)]
pub struct SlotFilter {
    hosts: Option<Patterns>,
    ids: Option<Patterns>,
    states: Option<Vec<SlotLifecycleState>>,
    binaries: Option<Patterns>,
    configs: Option<Patterns>,
}

impl SlotFilter {
    /// Filter matching every slot.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, glob: &str) -> Result<Self, BerthError> {
        self.hosts = Some(Patterns::add(self.hosts.take(), glob.to_string())?);
        Ok(self)
    }

    /// Slot UUID glob; a bare prefix matches every id starting with it.
    pub fn slot_id(mut self, glob: &str) -> Result<Self, BerthError> {
        self.ids = Some(Patterns::add(self.ids.take(), id_pattern(glob))?);
        Ok(self)
    }

    /// One-letter state codes, e.g. `"rs"` for running or stopped.
    pub fn state_codes(mut self, codes: &str) -> Result<Self, BerthError> {
        let mut states = self.states.take().unwrap_or_default();
        for code in codes.chars() {
            let state = SlotLifecycleState::from_code(code).ok_or_else(|| {
                BerthError::InvalidFilter(format!("unknown slot state code '{}'", code))
            })?;
            states.push(state);
        }
        self.states = Some(states);
        Ok(self)
    }

    pub fn state(mut self, state: SlotLifecycleState) -> Self {
        self.states.get_or_insert_with(Vec::new).push(state);
        self
    }

    pub fn binary(mut self, glob: &str) -> Result<Self, BerthError> {
        self.binaries = Some(Patterns::add(self.binaries.take(), glob.to_string())?);
        Ok(self)
    }

    pub fn config(mut self, glob: &str) -> Result<Self, BerthError> {
        self.configs = Some(Patterns::add(self.configs.take(), glob.to_string())?);
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_none()
            && self.ids.is_none()
            && self.states.is_none()
            && self.binaries.is_none()
            && self.configs.is_none()
    }

    pub fn matches(&self, agent: &AgentStatus, slot: &SlotStatus) -> bool {
        let assignment = slot.assignment.as_ref();
        let assigned_match = |patterns: &Option<Patterns>, text: fn(&Assignment) -> String| {
            patterns
                .as_ref()
                .is_none_or(|p| assignment.is_some_and(|a| p.is_match(&text(a))))
        };

        matches_host(&self.hosts, agent)
            && matches_id(&self.ids, slot.id)
            && self
                .states
                .as_ref()
                .is_none_or(|states| states.contains(&slot.state))
            && assigned_match(&self.binaries, |a| a.binary.to_string())
            && assigned_match(&self.configs, |a| a.config.to_string())
    }
}

// =============================================================================
// Agent filter
// =============================================================================

/// Selects agents by host, hosted slot id and agent state.
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    hosts: Option<Patterns>,
    slot_ids: Option<Patterns>,
    states: Option<Vec<AgentLifecycleState>>,
}

impl AgentFilter {
    /// Filter matching every agent.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, glob: &str) -> Result<Self, BerthError> {
        self.hosts = Some(Patterns::add(self.hosts.take(), glob.to_string())?);
        Ok(self)
    }

    /// Agents hosting a slot whose id matches.
    pub fn slot_id(mut self, glob: &str) -> Result<Self, BerthError> {
        self.slot_ids = Some(Patterns::add(self.slot_ids.take(), id_pattern(glob))?);
        Ok(self)
    }

    /// One-letter agent state codes: `o` online, `x` offline, `p` provisioning.
    pub fn state_codes(mut self, codes: &str) -> Result<Self, BerthError> {
        let mut states = self.states.take().unwrap_or_default();
        for code in codes.chars() {
            let state = AgentLifecycleState::from_code(code).ok_or_else(|| {
                BerthError::InvalidFilter(format!("unknown agent state code '{}'", code))
            })?;
            states.push(state);
        }
        self.states = Some(states);
        Ok(self)
    }

    pub fn matches(&self, agent: &AgentStatus) -> bool {
        matches_host(&self.hosts, agent)
            && self
                .slot_ids
                .as_ref()
                .is_none_or(|p| agent.slots.iter().any(|s| p.is_match(&s.id.to_string())))
            && self
                .states
                .as_ref()
                .is_none_or(|states| states.contains(&agent.state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use url::Url;

    fn agent(host: &str, state: AgentLifecycleState) -> AgentStatus {
        AgentStatus {
            agent_id: format!("agent-{}", host),
            state,
            internal_uri: Some(Url::parse(&format!("http://{}:7770/", host)).expect("url")),
            external_uri: None,
            location: String::new(),
            instance_type: None,
            resources: BTreeMap::new(),
            slots: Vec::new(),
        }
    }

    fn slot(state: SlotLifecycleState, binary: Option<&str>) -> SlotStatus {
        SlotStatus {
            assignment: binary.map(|b| Assignment::parse(b, "@prod:apple:1.0").expect("parse")),
            state,
            ..SlotStatus::unassigned(Uuid::new_v4(), "slot1")
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = SlotFilter::new();
        assert!(filter.is_empty());
        assert!(filter.matches(
            &agent("h1.example.com", AgentLifecycleState::Online),
            &slot(SlotLifecycleState::Unassigned, None)
        ));
    }

    #[test]
    fn criteria_are_and_ed() {
        let filter = SlotFilter::new()
            .host("*.example.com")
            .expect("host glob")
            .state_codes("r")
            .expect("state codes");
        let host = agent("h1.example.com", AgentLifecycleState::Online);
        let other = agent("h1.example.org", AgentLifecycleState::Online);

        assert!(filter.matches(&host, &slot(SlotLifecycleState::Running, Some("fruit:apple:1.0"))));
        assert!(!filter.matches(&host, &slot(SlotLifecycleState::Stopped, Some("fruit:apple:1.0"))));
        assert!(!filter.matches(&other, &slot(SlotLifecycleState::Running, Some("fruit:apple:1.0"))));
    }

    #[test]
    fn slot_id_matches_by_prefix() {
        let s = slot(SlotLifecycleState::Stopped, None);
        let prefix: String = s.id.to_string().chars().take(6).collect();
        let host = agent("h1", AgentLifecycleState::Online);

        assert!(SlotFilter::new().slot_id(&prefix).expect("glob").matches(&host, &s));
        assert!(!SlotFilter::new().slot_id("zzzz").expect("glob").matches(&host, &s));
    }

    #[test]
    fn binary_glob_skips_unassigned_slots() {
        let filter = SlotFilter::new().binary("fruit:apple:*").expect("glob");
        let host = agent("h1", AgentLifecycleState::Online);

        assert!(filter.matches(&host, &slot(SlotLifecycleState::Stopped, Some("fruit:apple:2.0"))));
        assert!(!filter.matches(&host, &slot(SlotLifecycleState::Stopped, Some("fruit:banana:2.0"))));
        assert!(!filter.matches(&host, &slot(SlotLifecycleState::Unassigned, None)));
    }

    #[test]
    fn bad_criteria_are_rejected() {
        assert!(matches!(
            SlotFilter::new().state_codes("rz"),
            Err(BerthError::InvalidFilter(_))
        ));
        assert!(matches!(
            SlotFilter::new().host("[unclosed"),
            Err(BerthError::InvalidFilter(_))
        ));
        assert!(matches!(
            AgentFilter::new().state_codes("q"),
            Err(BerthError::InvalidFilter(_))
        ));
    }

    #[test]
    fn agent_filter_by_state_and_slot() {
        let mut online = agent("h1", AgentLifecycleState::Online);
        let s = slot(SlotLifecycleState::Stopped, None);
        online.slots.push(s.clone());
        let offline = agent("h2", AgentLifecycleState::Offline);

        let by_state = AgentFilter::new().state_codes("o").expect("codes");
        assert!(by_state.matches(&online));
        assert!(!by_state.matches(&offline));

        let by_slot = AgentFilter::new().slot_id(&s.id.to_string()).expect("glob");
        assert!(by_slot.matches(&online));
        assert!(!by_slot.matches(&offline));
    }
}
