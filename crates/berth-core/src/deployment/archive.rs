//! Binary archive extraction.
//!
//! Archives are recognised by their magic bytes: gzip (`1f 8b`) is treated
//! as a gzipped tarball, `PK\x03\x04` as a zip file.

use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Extract an archive into `dest`, creating it if needed.
pub fn extract(data: &[u8], dest: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create extract directory: {}", dest.display()))?;

    if data.starts_with(GZIP_MAGIC) {
        extract_tar_gz(data, dest)
    } else if data.starts_with(ZIP_MAGIC) {
        extract_zip(data, dest)
    } else {
        anyhow::bail!("Unrecognised archive format (expected tar.gz or zip)")
    }
}

/// The single top-level directory of an extracted archive.
///
/// Returns the reason as an error string when the layout is wrong, so the
/// caller can report it against the binary's coordinate.
pub fn single_root(dir: &Path) -> anyhow::Result<Result<PathBuf, String>> {
    let mut entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to read directory entries: {}", dir.display()))?;

    if entries.len() != 1 {
        return Ok(Err(format!(
            "archive does not have a single root directory ({} top-level entries)",
            entries.len()
        )));
    }
    let root = entries.remove(0).path();
    if !root.is_dir() {
        return Ok(Err("archive root is not a directory".to_string()));
    }
    Ok(Ok(root))
}

fn extract_tar_gz(data: &[u8], dest: &Path) -> anyhow::Result<()> {
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(Cursor::new(data)));
    archive.set_preserve_permissions(true);
    // `unpack` refuses entries that would escape `dest`.
    archive
        .unpack(dest)
        .with_context(|| format!("Failed to extract tar archive into {}", dest.display()))
}

fn extract_zip(data: &[u8], dest: &Path) -> anyhow::Result<()> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(data)).context("Failed to read zip archive")?;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .with_context(|| format!("Failed to read zip entry {}", i))?;

        let Some(outpath) = file.enclosed_name().map(|path| dest.join(path)) else {
            tracing::warn!("skipping zip entry with unsafe path: {}", file.name());
            continue;
        };

        if file.is_dir() {
            std::fs::create_dir_all(&outpath)
                .with_context(|| format!("Failed to create directory: {}", outpath.display()))?;
            continue;
        }

        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create parent directory: {}", parent.display())
            })?;
        }

        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)
            .with_context(|| format!("Failed to read zip entry: {}", file.name()))?;
        std::fs::File::create(&outpath)
            .and_then(|mut out| out.write_all(&buffer))
            .with_context(|| format!("Failed to write file: {}", outpath.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = file.unix_mode() {
                std::fs::set_permissions(&outpath, std::fs::Permissions::from_mode(mode))
                    .with_context(|| format!("Failed to set mode on {}", outpath.display()))?;
            }
        }
    }

    Ok(())
}
