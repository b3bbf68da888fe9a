//! Domain error kinds.
//!
//! Plumbing code returns `anyhow::Result` and attaches context with
//! `with_context`. Failures callers need to tell apart are raised as a
//! [`BerthError`] and can be recovered with `downcast_ref::<BerthError>()`.

use thiserror::Error;

/// Errors with a distinct meaning to callers of the core.
#[derive(Debug, Error)]
pub enum BerthError {
    /// A binary or config coordinate string could not be parsed.
    #[error("Invalid coordinate '{input}': {reason}")]
    InvalidCoordinate { input: String, reason: String },

    /// A filter criterion (glob, state code) is malformed.
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// No repository base serves the artifact.
    #[error("Unable to find {coordinate} at {searched:?}")]
    ArtifactNotFound {
        coordinate: String,
        searched: Vec<String>,
    },

    /// More than one default group resolves the artifact.
    #[error("Ambiguous coordinate {coordinate} matched {matches:?}")]
    AmbiguousArtifact {
        coordinate: String,
        matches: Vec<String>,
    },

    /// A binary archive does not have exactly one root directory.
    #[error("Invalid archive {binary}: {reason}")]
    MalformedArchive { binary: String, reason: String },

    /// The per-slot lock could not be acquired in time.
    #[error("Timed out waiting for lock on slot {slot}")]
    LockTimeout { slot: String },

    /// The operation is not valid in the slot's current state.
    #[error("Slot {slot} {reason}")]
    IllegalState { slot: String, reason: String },

    /// The slot has been terminated and removed from its agent.
    #[error("Slot {0} has been terminated")]
    SlotTerminated(String),

    /// The caller acted on a stale view of the fleet.
    #[error("Expected version {expected} does not match current version {actual}")]
    VersionConflict { expected: String, actual: String },

    /// The agent could not be reached over the network.
    #[error("Agent {agent} is unreachable: {reason}")]
    AgentUnreachable { agent: String, reason: String },

    /// The agent answered with an unexpected HTTP status.
    #[error("Unexpected HTTP status {status} from {uri}")]
    UnexpectedStatus { status: u16, uri: String },

    /// A bounded search for a free name ran out of attempts.
    #[error("Could not find a free {0} name")]
    Exhausted(&'static str),
}

impl BerthError {
    /// Look for a [`BerthError`] anywhere in an `anyhow` error chain.
    pub fn find(error: &anyhow::Error) -> Option<&BerthError> {
        error.chain().find_map(|cause| cause.downcast_ref::<BerthError>())
    }
}
