//! Periodic announcement of an agent's status to its coordinator.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use url::Url;

use super::Agent;

/// Background thread that PUTs the agent status to
/// `<coordinator>/v1/announce/<agentId>` once per interval.
///
/// Dropping the announcer stops the thread.
#[derive(Debug)]
pub struct Announcer {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Announcer {
    /// Start announcing `agent` to `coordinator`.
    pub fn start(
        agent: Arc<Agent>,
        coordinator: Url,
        interval: Duration,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let announce_uri = coordinator
            .join(&format!("v1/announce/{}", agent.agent_id()))
            .with_context(|| format!("Invalid coordinator URI: {}", coordinator))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create tokio runtime: {}", e))?;

        let (stop, stopped) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name(format!("berth-announce-{}", agent.agent_id()))
            .spawn(move || {
                loop {
                    let status = agent.status();
                    let result = runtime.block_on(async {
                        client
                            .put(announce_uri.clone())
                            .json(&status)
                            .send()
                            .await
                            .and_then(|response| response.error_for_status())
                            .map(|_| ())
                    });
                    if let Err(e) = result {
                        tracing::warn!("announcement to {} failed: {}", announce_uri, e);
                    }

                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
            })
            .context("Failed to spawn announcer thread")?;

        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("announcer thread panicked");
            }
        }
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
