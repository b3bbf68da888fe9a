//! Agents reached over HTTP.
//!
//! Paths, relative to the agent's internal URI:
//!
//! | Verb   | Path                             | Body           | Expect |
//! |--------|----------------------------------|----------------|--------|
//! | GET    | `v1/agent/`                      |                | 200    |
//! | POST   | `v1/agent/slot/`                 | Installation   | 201    |
//! | PUT    | `v1/agent/slot/<name>/lifecycle` | `start` etc.   | 200    |
//! | PUT    | `v1/agent/slot/<name>/assignment`| Installation   | 200    |
//! | DELETE | `v1/agent/slot/<name>/assignment`|                | 200    |
//! | DELETE | `v1/agent/slot/<name>`           |                | 200    |
//! | PUT    | `v1/serviceInventory`            | descriptors    | 2xx    |

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use parking_lot::RwLock;
use reqwest::Method;
use serde::de::DeserializeOwned;
use url::Url;
use uuid::Uuid;

use super::ServiceDescriptor;
use crate::assignment::Installation;
use crate::error::BerthError;
use crate::slot::ClearOutcome;
use crate::status::{AgentLifecycleState, AgentStatus, SlotLifecycleState, SlotStatus};

// =============================================================================
// Transport
// =============================================================================

/// Request body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(serde_json::Value),
    Text(String),
}

/// Raw response of an agent call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Blocking HTTP round trips to agents.
///
/// `Err` means the agent could not be reached at all; any HTTP answer,
/// including error statuses, is `Ok`.
pub trait AgentTransport: Send + Sync {
    fn send(&self, method: Method, uri: &Url, body: Option<Body>)
    -> anyhow::Result<TransportResponse>;
}

/// [`AgentTransport`] backed by reqwest on a private tokio runtime.
pub struct HttpAgentTransport {
    client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
}

impl std::fmt::Debug for HttpAgentTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAgentTransport").finish_non_exhaustive()
    }
}

impl HttpAgentTransport {
    /// Create a new HttpAgentTransport with a per-request timeout.
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create tokio runtime: {}", e))?;
        Ok(Self { client, runtime })
    }

    async fn round_trip(
        &self,
        method: Method,
        uri: &Url,
        body: Option<Body>,
    ) -> anyhow::Result<TransportResponse> {
        let mut request = self.client.request(method.clone(), uri.clone());
        request = match body {
            Some(Body::Json(value)) => request.json(&value),
            Some(Body::Text(text)) => request
                .header(reqwest::header::CONTENT_TYPE, "text/plain")
                .body(text),
            None => request,
        };

        let response = request
            .send()
            .await
            .with_context(|| format!("{} {} failed", method, uri))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read response body from {}", uri))?;
        Ok(TransportResponse {
            status,
            body: body.to_vec(),
        })
    }
}

impl AgentTransport for HttpAgentTransport {
    fn send(
        &self,
        method: Method,
        uri: &Url,
        body: Option<Body>,
    ) -> anyhow::Result<TransportResponse> {
        self.runtime.block_on(self.round_trip(method, uri, body))
    }
}

// =============================================================================
// Remote agent
// =============================================================================

struct Shared {
    agent_id: String,
    status: RwLock<AgentStatus>,
    transport: Arc<dyn AgentTransport>,
    inventory_reachable: AtomicBool,
}

impl Shared {
    fn base(&self) -> anyhow::Result<Url> {
        let status = self.status.read();
        status.internal_uri.clone().ok_or_else(|| {
            BerthError::AgentUnreachable {
                agent: self.agent_id.clone(),
                reason: "no internal URI known".to_string(),
            }
            .into()
        })
    }

    /// Send a request and require `expected` back.
    ///
    /// Failing to reach the agent marks it offline.
    fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Body>,
        expected: u16,
    ) -> anyhow::Result<Vec<u8>> {
        let uri = self
            .base()?
            .join(path)
            .with_context(|| format!("Invalid agent path {}", path))?;

        let response = match self.transport.send(method, &uri, body) {
            Ok(response) => response,
            Err(e) => {
                self.mark_unreachable();
                return Err(BerthError::AgentUnreachable {
                    agent: self.agent_id.clone(),
                    reason: format!("{:#}", e),
                }
                .into());
            }
        };

        if response.status != expected {
            return Err(BerthError::UnexpectedStatus {
                status: response.status,
                uri: uri.to_string(),
            }
            .into());
        }
        Ok(response.body)
    }

    fn call_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Body>,
        expected: u16,
    ) -> anyhow::Result<T> {
        let bytes = self.call(method, path, body, expected)?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Invalid response from agent {} for {}", self.agent_id, path))
    }

    /// Offline with unknown slots, unless still provisioning.
    fn mark_unreachable(&self) {
        let mut status = self.status.write();
        if status.state == AgentLifecycleState::Provisioning {
            return;
        }
        if status.state != AgentLifecycleState::Offline {
            tracing::warn!("agent {} is offline", self.agent_id);
        }
        *status = status.offline();
    }

    fn fold(&self, slot: SlotStatus) -> SlotStatus {
        let mut status = self.status.write();
        *status = status.with_slot_status(slot.clone());
        slot
    }
}

/// An agent on another host, seen through a cached status.
#[derive(Clone)]
pub struct HttpRemoteAgent {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for HttpRemoteAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemoteAgent")
            .field("agent_id", &self.shared.agent_id)
            .finish_non_exhaustive()
    }
}

impl HttpRemoteAgent {
    /// Create a new HttpRemoteAgent seeded with a known status.
    pub fn new(status: AgentStatus, transport: Arc<dyn AgentTransport>) -> Self {
        Self {
            shared: Arc::new(Shared {
                agent_id: status.agent_id.clone(),
                status: RwLock::new(status),
                transport,
                inventory_reachable: AtomicBool::new(true),
            }),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.shared.agent_id
    }

    /// The cached status.
    pub fn status(&self) -> AgentStatus {
        self.shared.status.read().clone()
    }

    /// Replace the cached status, e.g. from an announcement.
    pub fn update_status(&self, status: AgentStatus) {
        *self.shared.status.write() = status;
    }

    /// Mark the agent offline and every slot unknown.
    pub fn set_offline(&self) {
        let mut status = self.shared.status.write();
        *status = status.offline();
    }

    /// Re-read the status from the agent.
    ///
    /// Failures are not returned: the agent goes offline with every slot
    /// unknown, except while provisioning.
    pub fn refresh_status(&self) {
        match self
            .shared
            .call_json::<AgentStatus>(Method::GET, "v1/agent/", None, 200)
        {
            Ok(mut fresh) => {
                let mut status = self.shared.status.write();
                if fresh.internal_uri.is_none() {
                    fresh.internal_uri = status.internal_uri.clone();
                }
                if status.state != AgentLifecycleState::Online {
                    tracing::info!("agent {} is online", self.shared.agent_id);
                }
                fresh.state = AgentLifecycleState::Online;
                *status = fresh;
            }
            Err(e) => {
                tracing::debug!("refresh of agent {} failed: {:#}", self.shared.agent_id, e);
                self.shared.mark_unreachable();
            }
        }
    }

    pub fn install(&self, installation: &Installation) -> anyhow::Result<SlotStatus> {
        let body = Body::Json(serde_json::to_value(installation)?);
        let slot: SlotStatus =
            self.shared
                .call_json(Method::POST, "v1/agent/slot/", Some(body), 201)?;
        Ok(self.shared.fold(slot))
    }

    pub fn slots(&self) -> Vec<HttpRemoteSlot> {
        self.shared
            .status
            .read()
            .slots
            .iter()
            .map(|slot| HttpRemoteSlot {
                id: slot.id,
                name: slot.name.clone(),
                shared: self.shared.clone(),
            })
            .collect()
    }

    pub fn set_internal_uri(&self, uri: Url) {
        self.shared.status.write().internal_uri = Some(uri);
    }

    /// PUT the inventory; logs only when reachability changes.
    pub fn push_service_inventory(&self, services: &[ServiceDescriptor]) {
        let result = serde_json::to_value(services)
            .map_err(anyhow::Error::from)
            .and_then(|body| {
                self.shared
                    .call(Method::PUT, "v1/serviceInventory", Some(Body::Json(body)), 200)
            });

        let was_reachable = self
            .shared
            .inventory_reachable
            .swap(result.is_ok(), Ordering::SeqCst);
        match (&result, was_reachable) {
            (Err(e), true) => tracing::error!(
                "Unable to push service inventory to agent {}: {:#}",
                self.shared.agent_id,
                e
            ),
            (Ok(_), false) => tracing::info!(
                "Service inventory push to agent {} succeeded",
                self.shared.agent_id
            ),
            _ => {}
        }
    }

    pub fn terminate_slot(&self, name: &str) -> anyhow::Result<SlotStatus> {
        let slot: SlotStatus = self.shared.call_json(
            Method::DELETE,
            &format!("v1/agent/slot/{}", name),
            None,
            200,
        )?;
        Ok(self.shared.fold(slot))
    }
}

// =============================================================================
// Remote slot
// =============================================================================

/// A slot of an HTTP agent. Results are folded into the agent's cache.
#[derive(Clone)]
pub struct HttpRemoteSlot {
    id: Uuid,
    name: String,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for HttpRemoteSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemoteSlot")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl HttpRemoteSlot {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cached status of this slot.
    pub fn status(&self) -> anyhow::Result<SlotStatus> {
        self.shared
            .status
            .read()
            .slot_by_id(self.id)
            .cloned()
            .with_context(|| format!("Slot {} is no longer known", self.name))
    }

    pub fn assign(&self, installation: &Installation) -> anyhow::Result<SlotStatus> {
        let body = Body::Json(serde_json::to_value(installation)?);
        self.put_json(&format!("v1/agent/slot/{}/assignment", self.name), Some(body))
    }

    /// Clear the slot; a slot still assigned afterwards failed to stop.
    pub fn clear(&self) -> anyhow::Result<ClearOutcome> {
        let slot: SlotStatus = self.shared.call_json(
            Method::DELETE,
            &format!("v1/agent/slot/{}/assignment", self.name),
            None,
            200,
        )?;
        let slot = self.shared.fold(slot);
        if slot.assignment.is_none() {
            Ok(ClearOutcome::Cleared(slot))
        } else {
            let reason = format!("agent reported the slot {}", slot.state);
            Ok(ClearOutcome::StopFailed {
                status: slot,
                reason,
            })
        }
    }

    pub fn start(&self) -> anyhow::Result<SlotStatus> {
        self.lifecycle("start")
    }

    pub fn stop(&self) -> anyhow::Result<SlotStatus> {
        self.lifecycle("stop")
    }

    pub fn restart(&self) -> anyhow::Result<SlotStatus> {
        self.lifecycle("restart")
    }

    pub fn terminate(&self) -> anyhow::Result<SlotStatus> {
        let slot: SlotStatus = self.shared.call_json(
            Method::DELETE,
            &format!("v1/agent/slot/{}", self.name),
            None,
            200,
        )?;
        let slot = if slot.state == SlotLifecycleState::Terminated {
            slot
        } else {
            slot.with_state(SlotLifecycleState::Terminated)
        };
        Ok(self.shared.fold(slot))
    }

    fn lifecycle(&self, action: &str) -> anyhow::Result<SlotStatus> {
        self.put_json(
            &format!("v1/agent/slot/{}/lifecycle", self.name),
            Some(Body::Text(action.to_string())),
        )
    }

    fn put_json(&self, path: &str, body: Option<Body>) -> anyhow::Result<SlotStatus> {
        let slot: SlotStatus = self.shared.call_json(Method::PUT, path, body, 200)?;
        Ok(self.shared.fold(slot))
    }
}
