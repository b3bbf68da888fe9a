//! Berth Core Library
//!
//! Fleet orchestration: a coordinator drives agents, each agent hosts slots,
//! and each slot runs one versioned binary plus config installation.

pub mod agent;
pub mod artifact;
pub mod assignment;
pub mod config;
pub mod coordinator;
pub mod deployment;
pub mod error;
pub mod fs;
pub mod remote;
pub mod slot;
pub mod status;

/// Re-exports of commonly used types
pub mod prelude {
    // Configuration
    pub use crate::config::{AgentConfig, BerthConfig, CoordinatorConfig, RepositoryConfig};

    // Artifacts
    pub use crate::artifact::{
        BinaryCoordinate, ConfigCoordinate, Fetcher, Repository, ResolvedCoordinate,
    };
    pub use crate::assignment::{Assignment, Installation, UpgradeVersions};

    // Agents and slots
    pub use crate::agent::{Agent, Announcer};
    pub use crate::deployment::{Deployment, DeploymentId, DeploymentStore};
    pub use crate::slot::{
        ClearOutcome, InMemoryLifecycleManager, LauncherLifecycleManager, LifecycleManager, Slot,
    };
    pub use crate::status::{AgentLifecycleState, AgentStatus, SlotLifecycleState, SlotStatus};

    // Coordination
    pub use crate::coordinator::{
        AgentFilter, Coordinator, FleetReport, FleetSlot, Listing, SlotFailure, SlotFilter,
    };
    pub use crate::remote::{
        AgentTransport, HttpAgentTransport, HttpRemoteAgent, LocalRemoteAgent, RemoteAgent,
        RemoteSlot, ServiceDescriptor,
    };

    // Errors
    pub use crate::error::BerthError;
}
