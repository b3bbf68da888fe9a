//! Shared fixtures: in-memory archives and `file://` repositories.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use parking_lot::Mutex;
use reqwest::Method;
use serde_json::Value;
use tempfile::TempDir;
use url::Url;

use berth_core::agent::Agent;
use berth_core::artifact::{Fetcher, Repository};
use berth_core::assignment::Installation;
use berth_core::config::{AgentConfig, CoordinatorConfig};
use berth_core::coordinator::Coordinator;
use berth_core::remote::{AgentTransport, Body, LocalRemoteAgent, RemoteAgent, TransportResponse};
use berth_core::slot::{InMemoryLifecycleManager, LifecycleManager};
use berth_core::status::{AgentLifecycleState, AgentStatus};

pub const GROUP: &str = "fruit";

// =============================================================================
// Archives
// =============================================================================

/// A `.tar.gz` holding `files` under the single directory `root`.
pub fn tar_gz(root: &str, files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{}/{}", root, path), *contents)
            .expect("tar entry should be appended");
    }
    builder
        .into_inner()
        .expect("tar should finish")
        .finish()
        .expect("gzip should finish")
}

/// A launcher-style binary archive for `artifact-version`.
pub fn binary_archive(artifact: &str, version: &str) -> Vec<u8> {
    let launcher = format!("#!/bin/sh\necho {} {}\n", artifact, version);
    tar_gz(
        &format!("{}-{}", artifact, version),
        &[
            ("bin/launcher", launcher.as_bytes()),
            ("README", b"berth test binary"),
        ],
    )
}

// =============================================================================
// Repository
// =============================================================================

/// A `file://` repository rooted in a temp directory.
pub struct TestRepo {
    pub root: PathBuf,
}

impl TestRepo {
    pub fn new(tmp: &TempDir) -> Self {
        let root = tmp.path().join("repo");
        fs::create_dir_all(&root).expect("repo dir should be created");
        Self { root }
    }

    pub fn base(&self) -> Url {
        Url::from_directory_path(&self.root).expect("repo path should be absolute")
    }

    pub fn repository(&self, default_groups: &[&str]) -> Repository {
        Repository::new(
            default_groups.iter().map(|g| g.to_string()).collect(),
            vec![self.base()],
            fetcher(),
        )
    }

    fn version_dir(&self, group: &str, artifact: &str, version: &str) -> PathBuf {
        let dir = self
            .root
            .join(group.replace('.', "/"))
            .join(artifact)
            .join(version);
        fs::create_dir_all(&dir).expect("version dir should be created");
        dir
    }

    /// Publish raw bytes as `artifact-file_version.tar.gz`.
    pub fn publish_bytes(
        &self,
        group: &str,
        artifact: &str,
        version: &str,
        file_version: &str,
        bytes: &[u8],
    ) -> PathBuf {
        let path = self
            .version_dir(group, artifact, version)
            .join(format!("{}-{}.tar.gz", artifact, file_version));
        fs::write(&path, bytes).expect("artifact should be written");
        path
    }

    pub fn publish_binary(&self, group: &str, artifact: &str, version: &str) {
        self.publish_bytes(group, artifact, version, version, &binary_archive(artifact, version));
    }

    /// Publish a snapshot build and its `maven-metadata.xml`.
    pub fn publish_snapshot(&self, group: &str, artifact: &str, base: &str, stamp: &str, build: u32) {
        let version = format!("{}-SNAPSHOT", base);
        let file_version = format!("{}-{}-{}", base, stamp, build);
        self.publish_bytes(
            group,
            artifact,
            &version,
            &file_version,
            &binary_archive(artifact, &file_version),
        );
        let metadata = format!(
            r#"<metadata>
  <versioning>
    <snapshotVersions>
      <snapshotVersion>
        <extension>tar.gz</extension>
        <value>{}</value>
      </snapshotVersion>
    </snapshotVersions>
  </versioning>
</metadata>"#,
            file_version
        );
        fs::write(
            self.version_dir(group, artifact, &version).join("maven-metadata.xml"),
            metadata,
        )
        .expect("metadata should be written");
    }

    /// Publish a config bundle: an index listing `files`, plus the files.
    pub fn publish_config(
        &self,
        group: &str,
        component: &str,
        environment: &str,
        version: &str,
        files: &[(&str, &str)],
    ) {
        let dir = self.version_dir(group, component, version);
        let mut index = String::from("# berth config index\n");
        for (path, contents) in files {
            let target = dir.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).expect("config dir should be created");
            }
            fs::write(&target, contents).expect("config file should be written");
            index.push_str(path);
            index.push('\n');
        }
        let mut file = fs::File::create(
            dir.join(format!("{}-{}-{}.config", component, version, environment)),
        )
        .expect("index should be created");
        file.write_all(index.as_bytes())
            .expect("index should be written");
    }

    /// Config bundle declaring `cpu` and `memory` requirements.
    pub fn publish_config_with_resources(
        &self,
        group: &str,
        component: &str,
        environment: &str,
        version: &str,
        cpu: u64,
        memory: u64,
    ) {
        let resources = format!("cpu={}\nmemory={}\n", cpu, memory);
        self.publish_config(
            group,
            component,
            environment,
            version,
            &[
                ("etc/config.properties", "http-server.http.port=8080\n"),
                ("berth-resources.properties", &resources),
            ],
        );
    }
}

/// The standard repo: `fruit:apple:1.0`, `fruit:apple:2.0` and
/// `@prod:apple:1.0`/`2.0` requiring one cpu and 512 memory.
pub fn apple_repo(tmp: &TempDir) -> TestRepo {
    let repo = TestRepo::new(tmp);
    repo.publish_binary(GROUP, "apple", "1.0");
    repo.publish_binary(GROUP, "apple", "2.0");
    repo.publish_config_with_resources(GROUP, "apple", "prod", "1.0", 1, 512);
    repo.publish_config_with_resources(GROUP, "apple", "prod", "2.0", 1, 512);
    repo
}

// =============================================================================
// Agents
// =============================================================================

pub fn fetcher() -> Arc<Fetcher> {
    Arc::new(Fetcher::new(Duration::from_secs(1)).expect("fetcher should be created"))
}

pub fn agent_config(slots_dir: &Path, resources: &[(&str, u64)]) -> AgentConfig {
    AgentConfig {
        resources: resources
            .iter()
            .map(|(name, amount)| (name.to_string(), *amount))
            .collect::<BTreeMap<_, _>>(),
        ..AgentConfig::with_slots_dir(slots_dir)
    }
}

pub fn agent_with(
    slots_dir: &Path,
    resources: &[(&str, u64)],
    lifecycle: Arc<dyn LifecycleManager>,
) -> Arc<Agent> {
    Arc::new(
        Agent::new(agent_config(slots_dir, resources), fetcher(), lifecycle)
            .expect("agent should start"),
    )
}

pub fn agent(slots_dir: &Path, resources: &[(&str, u64)]) -> Arc<Agent> {
    agent_with(slots_dir, resources, Arc::new(InMemoryLifecycleManager::new()))
}

/// A coordinator over `repo` with no agents.
pub fn coordinator(repo: &TestRepo) -> Coordinator {
    Coordinator::new(Arc::new(repo.repository(&[GROUP])), &CoordinatorConfig::default())
}

pub fn add_local_agent(coordinator: &Coordinator, agent: Arc<Agent>) -> Arc<RemoteAgent> {
    coordinator.add_agent(RemoteAgent::Local(LocalRemoteAgent::new(agent)))
}

// =============================================================================
// Loopback transport
// =============================================================================

/// Serves the agent HTTP API straight from an in-process [`Agent`].
///
/// `set_down(true)` makes every request fail as if the host were gone.
pub struct LoopbackTransport {
    agent: Arc<Agent>,
    down: AtomicBool,
    requests: Mutex<Vec<(Method, String)>>,
}

impl LoopbackTransport {
    pub fn new(agent: Arc<Agent>) -> Arc<Self> {
        Arc::new(Self {
            agent,
            down: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Method and path of every request that reached the agent.
    pub fn requests(&self) -> Vec<(Method, String)> {
        self.requests.lock().clone()
    }

    fn route(&self, method: &Method, path: &str, body: Option<Body>) -> anyhow::Result<(u16, Value)> {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        match (method.as_str(), segments.as_slice()) {
            ("GET", ["v1", "agent"]) => Ok((200, serde_json::to_value(self.agent.status())?)),
            ("POST", ["v1", "agent", "slot"]) => {
                let installation: Installation = serde_json::from_value(json_body(body)?)?;
                Ok((201, serde_json::to_value(self.agent.install(&installation)?)?))
            }
            ("PUT", ["v1", "serviceInventory"]) => Ok((200, Value::Null)),
            (verb, ["v1", "agent", "slot", name, rest @ ..]) => {
                if verb == "DELETE" && rest.is_empty() {
                    return match self.agent.terminate_slot(name) {
                        Some(status) => Ok((200, serde_json::to_value(status?)?)),
                        None => Ok((404, Value::Null)),
                    };
                }
                let Some(slot) = self.agent.get_slot(name) else {
                    return Ok((404, Value::Null));
                };
                let status = match (verb, rest) {
                    ("PUT", ["lifecycle"]) => match text_body(body)?.as_str() {
                        "start" => slot.start()?,
                        "stop" => slot.stop()?,
                        "restart" => slot.restart()?,
                        other => anyhow::bail!("unknown lifecycle action {}", other),
                    },
                    ("PUT", ["assignment"]) => {
                        let installation: Installation = serde_json::from_value(json_body(body)?)?;
                        slot.assign(&installation)?
                    }
                    ("DELETE", ["assignment"]) => slot.clear()?.status().clone(),
                    _ => return Ok((404, Value::Null)),
                };
                Ok((200, serde_json::to_value(status)?))
            }
            _ => Ok((404, Value::Null)),
        }
    }
}

impl AgentTransport for LoopbackTransport {
    fn send(&self, method: Method, uri: &Url, body: Option<Body>) -> anyhow::Result<TransportResponse> {
        if self.down.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused: {}", uri);
        }
        self.requests
            .lock()
            .push((method.clone(), uri.path().to_string()));

        let (status, value) = match self.route(&method, uri.path(), body) {
            Ok(answer) => answer,
            Err(e) => (500, Value::String(format!("{:#}", e))),
        };
        Ok(TransportResponse {
            status,
            body: serde_json::to_vec(&value)?,
        })
    }
}

fn json_body(body: Option<Body>) -> anyhow::Result<Value> {
    match body {
        Some(Body::Json(value)) => Ok(value),
        other => anyhow::bail!("expected a JSON body, got {:?}", other),
    }
}

fn text_body(body: Option<Body>) -> anyhow::Result<String> {
    match body {
        Some(Body::Text(text)) => Ok(text),
        other => anyhow::bail!("expected a text body, got {:?}", other),
    }
}

/// Status an agent would announce, as seen by the coordinator before any
/// refresh.
pub fn announced(agent: &Agent, state: AgentLifecycleState) -> AgentStatus {
    AgentStatus {
        state,
        internal_uri: Some(Url::parse("http://agent.test:7770/").expect("url")),
        ..agent.status()
    }
}
