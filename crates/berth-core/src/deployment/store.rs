//! Crash-recoverable record of the deployments installed in one slot.
//!
//! Layout of a slot directory:
//!
//! ```text
//! <slot_dir>/
//!   berth-slot-id.txt             slot UUID
//!   berth-active-deployment.txt   id of the active deployment
//!   berth-next-deployment.txt     lowest deployment number never handed out
//!   berth-deployment1.json        descriptor of deployment1
//!   deployment1/                  deployment tree
//! ```
//!
//! A deployment is recorded (descriptor written, directory renamed into
//! place) before anything points at it, so after a crash the active pointer
//! never names a deployment that was not fully installed.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use anyhow::Context;
use regex::Regex;
use url::Url;
use uuid::Uuid;

use super::archive;
use super::{Deployment, DeploymentId};
use crate::artifact::Fetcher;
use crate::assignment::Installation;
use crate::error::BerthError;
use crate::fs::{hash_tree, remove_file_if_exists, write_atomic};

pub const ACTIVE_DEPLOYMENT_FILE: &str = "berth-active-deployment.txt";
pub const SLOT_ID_FILE: &str = "berth-slot-id.txt";
pub const NEXT_DEPLOYMENT_FILE: &str = "berth-next-deployment.txt";

/// Attempts at finding a free deployment id before giving up.
const MAX_ID_ATTEMPTS: u32 = 10_000;

static DESCRIPTOR_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^berth-deployment([0-9]+)\.json$").expect("descriptor pattern is valid")
});

/// Deployments of one slot, mirrored on disk.
///
/// Not synchronized; the owning slot serializes access.
#[derive(Debug)]
pub struct DeploymentStore {
    slot_name: String,
    slot_dir: PathBuf,
    slot_id: Uuid,
    fetcher: Arc<Fetcher>,
    deployments: BTreeMap<DeploymentId, Deployment>,
    active: Option<DeploymentId>,
    /// Ids below this were handed out at some point and are never reused.
    next_id: u32,
}

impl DeploymentStore {
    /// Open (or create) the store in `slot_dir`, recovering prior state.
    pub fn open(
        slot_dir: impl Into<PathBuf>,
        slot_name: &str,
        fetcher: Arc<Fetcher>,
    ) -> anyhow::Result<Self> {
        let slot_dir = slot_dir.into();
        fs::create_dir_all(&slot_dir)
            .with_context(|| format!("Failed to create slot directory: {}", slot_dir.display()))?;

        let deployments = recover_deployments(&slot_dir)?;
        warn_unknown_directories(&slot_dir, &deployments)?;
        let active = recover_active(&slot_dir, &deployments)?;
        let slot_id = load_or_create_slot_id(&slot_dir)?;
        let next_id = recover_next_id(&slot_dir)?;

        Ok(Self {
            slot_name: slot_name.to_string(),
            slot_dir,
            slot_id,
            fetcher,
            deployments,
            active,
            next_id,
        })
    }

    pub fn slot_id(&self) -> Uuid {
        self.slot_id
    }

    pub fn slot_name(&self) -> &str {
        &self.slot_name
    }

    pub fn slot_dir(&self) -> &Path {
        &self.slot_dir
    }

    pub fn active(&self) -> Option<&Deployment> {
        self.active.and_then(|id| self.deployments.get(&id))
    }

    /// All recorded deployments, in id order.
    pub fn deployments(&self) -> impl Iterator<Item = &Deployment> {
        self.deployments.values()
    }

    pub fn get(&self, id: DeploymentId) -> Option<&Deployment> {
        self.deployments.get(&id)
    }

    /// Download, extract and record a new deployment. It is not activated.
    pub fn install(&mut self, installation: &Installation) -> anyhow::Result<Deployment> {
        let id = self.next_deployment_id()?;
        write_atomic(
            &self.slot_dir.join(NEXT_DEPLOYMENT_FILE),
            (id.number() + 1).to_string().as_bytes(),
        )?;
        self.next_id = id.number() + 1;
        let deployment_dir = self.slot_dir.join(id.to_string());
        let binary = installation.assignment.binary.to_string();

        // Dropping the scratch dir removes whatever is left in it.
        let scratch = tempfile::Builder::new()
            .prefix(".install-")
            .tempdir_in(&self.slot_dir)
            .with_context(|| {
                format!("Failed to create scratch dir in {}", self.slot_dir.display())
            })?;

        let data = self
            .fetcher
            .read(&installation.binary_file)
            .with_context(|| {
                format!(
                    "Unable to download binary {} from {}",
                    binary, installation.binary_file
                )
            })?;

        let unpack_dir = scratch.path().join("unpack");
        archive::extract(&data, &unpack_dir).map_err(|e| BerthError::MalformedArchive {
            binary: binary.clone(),
            reason: format!("{:#}", e),
        })?;
        let root = archive::single_root(&unpack_dir)?
            .map_err(|reason| BerthError::MalformedArchive {
                binary: binary.clone(),
                reason,
            })?;

        for (path, uri) in &installation.config_files {
            self.copy_config_file(&root, path, uri).with_context(|| {
                format!(
                    "Unable to download config file {} from {} for config {}",
                    path, uri, installation.assignment.config
                )
            })?;
        }

        let tree_hash = hash_tree(&root)?;
        let deployment = Deployment::new(id, deployment_dir.clone(), installation, tree_hash);

        self.save_descriptor(&deployment)?;
        if let Err(e) = fs::rename(&root, &deployment_dir) {
            let _ = remove_file_if_exists(&self.descriptor_path(id));
            return Err(e).with_context(|| {
                format!("Failed to move deployment into {}", deployment_dir.display())
            });
        }

        tracing::info!(
            "installed {} as {} in slot {}",
            installation.assignment,
            id,
            self.slot_name
        );
        self.deployments.insert(id, deployment.clone());
        Ok(deployment)
    }

    /// Point the slot at an installed deployment.
    pub fn activate(&mut self, id: DeploymentId) -> anyhow::Result<Deployment> {
        let deployment = self
            .deployments
            .get(&id)
            .cloned()
            .with_context(|| format!("Unknown deployment {} in slot {}", id, self.slot_name))?;

        // Disk first: memory never points somewhere the disk does not.
        write_atomic(
            &self.slot_dir.join(ACTIVE_DEPLOYMENT_FILE),
            id.to_string().as_bytes(),
        )?;
        self.active = Some(id);
        Ok(deployment)
    }

    /// Delete a deployment's pointer (if active), descriptor and tree.
    pub fn remove(&mut self, id: DeploymentId) -> anyhow::Result<()> {
        if self.active == Some(id) {
            remove_file_if_exists(&self.slot_dir.join(ACTIVE_DEPLOYMENT_FILE))?;
            self.active = None;
        }

        remove_file_if_exists(&self.descriptor_path(id))?;
        let dir = self.slot_dir.join(id.to_string());
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove deployment {}", dir.display()))?;
        }
        self.deployments.remove(&id);
        Ok(())
    }

    /// Recompute the tree hash of an installed deployment.
    pub fn tree_hash(&self, id: DeploymentId) -> anyhow::Result<String> {
        let deployment = self
            .deployments
            .get(&id)
            .with_context(|| format!("Unknown deployment {} in slot {}", id, self.slot_name))?;
        hash_tree(deployment.dir())
    }

    fn next_deployment_id(&self) -> anyhow::Result<DeploymentId> {
        let start = self.next_id.max(1);
        (start..start.saturating_add(MAX_ID_ATTEMPTS))
            .map(DeploymentId::new)
            .find(|id| {
                !self.deployments.contains_key(id)
                    && !self.descriptor_path(*id).exists()
                    && !self.slot_dir.join(id.to_string()).exists()
            })
            .ok_or_else(|| BerthError::Exhausted("deployment").into())
    }

    fn copy_config_file(&self, root: &Path, path: &str, uri: &Url) -> anyhow::Result<()> {
        let relative = Path::new(path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            anyhow::bail!("config path escapes the deployment: {}", path);
        }

        let target = root.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let data = self.fetcher.read(uri)?;
        fs::write(&target, data).with_context(|| format!("Failed to write {}", target.display()))
    }

    fn descriptor_path(&self, id: DeploymentId) -> PathBuf {
        self.slot_dir.join(format!("berth-{}.json", id))
    }

    fn save_descriptor(&self, deployment: &Deployment) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(deployment)
            .context("Failed to serialize deployment descriptor")?;
        write_atomic(&self.descriptor_path(deployment.id), &bytes)
    }
}

fn recover_deployments(slot_dir: &Path) -> anyhow::Result<BTreeMap<DeploymentId, Deployment>> {
    let mut deployments = BTreeMap::new();

    for entry in list_dir(slot_dir)? {
        let name = entry.file_name().to_string_lossy().to_string();
        if !DESCRIPTOR_NAME.is_match(&name) {
            continue;
        }

        let path = entry.path();
        let mut deployment: Deployment = match fs::read(&path)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(anyhow::Error::from))
        {
            Ok(deployment) => deployment,
            Err(e) => {
                tracing::error!("Invalid deployment descriptor {}: {:#}", path.display(), e);
                continue;
            }
        };

        let dir = slot_dir.join(deployment.id.to_string());
        if !dir.is_dir() {
            tracing::warn!(
                "{} references a deployment that no longer exists: deleting",
                path.display()
            );
            remove_file_if_exists(&path)?;
            continue;
        }
        deployment.set_dir(dir);
        deployments.insert(deployment.id, deployment);
    }

    Ok(deployments)
}

fn warn_unknown_directories(
    slot_dir: &Path,
    deployments: &BTreeMap<DeploymentId, Deployment>,
) -> anyhow::Result<()> {
    for entry in list_dir(slot_dir)? {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let known = entry
            .file_name()
            .to_string_lossy()
            .parse::<DeploymentId>()
            .is_ok_and(|id| deployments.contains_key(&id));
        if !known {
            tracing::warn!("Unknown directory in slot: {}", path.display());
        }
    }
    Ok(())
}

fn recover_active(
    slot_dir: &Path,
    deployments: &BTreeMap<DeploymentId, Deployment>,
) -> anyhow::Result<Option<DeploymentId>> {
    let pointer = slot_dir.join(ACTIVE_DEPLOYMENT_FILE);
    if !pointer.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(&pointer)
        .with_context(|| format!("Failed to read {}", pointer.display()))?;
    let raw = raw.trim();
    match raw.parse::<DeploymentId>() {
        Ok(id) if deployments.contains_key(&id) => Ok(Some(id)),
        _ => {
            tracing::warn!("The active deployment [{}] is missing: deleting pointer", raw);
            remove_file_if_exists(&pointer)?;
            Ok(None)
        }
    }
}

/// One past the highest deployment number seen in the marker file, a
/// descriptor or a deployment directory.
fn recover_next_id(slot_dir: &Path) -> anyhow::Result<u32> {
    let marker = slot_dir.join(NEXT_DEPLOYMENT_FILE);
    let mut next = 1;
    if marker.exists() {
        let raw = fs::read_to_string(&marker)
            .with_context(|| format!("Failed to read {}", marker.display()))?;
        match raw.trim().parse::<u32>() {
            Ok(n) => next = n,
            Err(_) => tracing::warn!("Invalid deployment counter [{}] in {}", raw.trim(), marker.display()),
        }
    }

    for entry in list_dir(slot_dir)? {
        let name = entry.file_name().to_string_lossy().to_string();
        let number = DESCRIPTOR_NAME
            .captures(&name)
            .and_then(|c| c[1].parse::<u32>().ok())
            .or_else(|| name.parse::<DeploymentId>().ok().map(DeploymentId::number));
        if let Some(number) = number {
            next = next.max(number.saturating_add(1));
        }
    }
    Ok(next)
}

fn load_or_create_slot_id(slot_dir: &Path) -> anyhow::Result<Uuid> {
    let path = slot_dir.join(SLOT_ID_FILE);
    if path.exists() {
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        match Uuid::parse_str(raw.trim()) {
            Ok(id) => return Ok(id),
            Err(_) => {
                tracing::warn!(
                    "Invalid slot id [{}]: replacing {}",
                    raw.trim(),
                    path.display()
                );
                remove_file_if_exists(&path)?;
            }
        }
    }

    let id = Uuid::new_v4();
    write_atomic(&path, id.to_string().as_bytes())?;
    Ok(id)
}

fn list_dir(dir: &Path) -> anyhow::Result<Vec<fs::DirEntry>> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to read directory entries: {}", dir.display()))?;
    entries.sort_by_key(|entry| entry.file_name());
    Ok(entries)
}
