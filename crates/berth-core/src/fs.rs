//! Filesystem helpers shared by the deployment store and the agent.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use tempfile::NamedTempFile;

/// Replace `path` with `contents` via a sibling temp file and a rename.
///
/// Readers see either the old or the new contents, never a partial write
/// and never a missing file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
    tmp.write_all(contents)
        .and_then(|()| tmp.as_file().sync_all())
        .with_context(|| format!("Failed to write temp file for {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("Failed to move temp file into place at {}", path.display()))?;
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub fn remove_file_if_exists(path: &Path) -> anyhow::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

/// Deterministic blake3 hash of a directory tree.
///
/// Entries are visited in name order. Files contribute
/// `path 0x00 contents`, directories `path 0xFF`, symlinks
/// `path 0xFE target`.
pub fn hash_tree(root: &Path) -> anyhow::Result<String> {
    let mut hasher = blake3::Hasher::new();
    hash_entries(&mut hasher, root, "")?;
    Ok(hasher.finalize().to_hex().to_string())
}

fn hash_entries(hasher: &mut blake3::Hasher, dir: &Path, prefix: &str) -> anyhow::Result<()> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to read directory entries: {}", dir.display()))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let rel = format!("{}{}", prefix, entry.file_name().to_string_lossy());
        let path = entry.path();
        let kind = entry
            .file_type()
            .with_context(|| format!("Failed to stat {}", path.display()))?;

        hasher.update(rel.as_bytes());
        if kind.is_symlink() {
            let target = fs::read_link(&path)
                .with_context(|| format!("Failed to read link {}", path.display()))?;
            hasher.update(&[0xFE]);
            hasher.update(target.to_string_lossy().as_bytes());
        } else if kind.is_dir() {
            hasher.update(&[0xFF]);
            hash_entries(hasher, &path, &format!("{}/", rel))?;
        } else {
            hasher.update(&[0x00]);
            let content =
                fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
            hasher.update(&content);
        }
    }
    Ok(())
}
