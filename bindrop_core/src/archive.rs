//! Folder transfers are tar archives. Blocking; run on the worker pool.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::{Component, Path};
use tar::{Archive, Builder};
use tempfile::NamedTempFile;
use tracing::warn;
use walkdir::WalkDir;

pub struct TarArchive {
    /// Deleted when dropped
    pub file: NamedTempFile,
    /// Folder name with a `.tar` suffix
    pub name: String,
    pub size: u64,
}

/// Archive `folder` into a temp file inside `work_dir`.
/// Entries are rooted at the folder's own name.
pub fn create_tar_archive(folder: &Path, work_dir: &Path) -> Result<TarArchive> {
    if !folder.is_dir() {
        anyhow::bail!("Not a directory: {}", folder.display());
    }
    let folder_name = folder
        .file_name()
        .and_then(|n| n.to_str())
        .context("Invalid folder name")?;

    std::fs::create_dir_all(work_dir)
        .with_context(|| format!("Failed to create {}", work_dir.display()))?;
    let temp = tempfile::Builder::new()
        .prefix("bindrop-")
        .suffix(".tar")
        .tempfile_in(work_dir)
        .context("Failed to create temporary archive")?;

    {
        let mut builder = Builder::new(temp.reopen().context("Failed to open archive")?);
        for entry in WalkDir::new(folder) {
            let entry = entry.context("Failed to read directory entry")?;
            let path = entry.path();
            let rel_path = path
                .strip_prefix(folder)
                .context("Failed to calculate relative path")?;
            if rel_path.as_os_str().is_empty() {
                continue;
            }
            let archive_path = Path::new(folder_name).join(rel_path);

            if path.is_symlink() {
                // Links could point anywhere on the sender's disk
                continue;
            } else if path.is_dir() {
                builder
                    .append_dir(&archive_path, path)
                    .with_context(|| format!("Failed to add directory: {}", path.display()))?;
            } else if path.is_file() {
                builder
                    .append_path_with_name(path, &archive_path)
                    .with_context(|| format!("Failed to add file: {}", path.display()))?;
            }
        }
        builder.finish().context("Failed to finalize archive")?;
    }

    let size = std::fs::metadata(temp.path())
        .context("Failed to read archive metadata")?
        .len();
    Ok(TarArchive {
        file: temp,
        name: format!("{}.tar", folder_name),
        size,
    })
}

fn is_safe_entry(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Unpack an archive into `dest`. Returns the entries that were skipped.
pub fn extract_tar_archive(archive_path: &Path, dest: &Path) -> Result<Vec<String>> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open {}", archive_path.display()))?;

    let mut archive = Archive::new(file);
    archive.set_preserve_permissions(false);
    archive.set_preserve_ownerships(false);

    let mut skipped = Vec::new();
    for entry in archive.entries().context("Failed to read archive entries")? {
        let mut entry = entry.context("Failed to read archive entry")?;
        let entry_path = entry.path().context("Bad entry path")?.into_owned();

        let kind = entry.header().entry_type();
        if !is_safe_entry(&entry_path) || !(kind.is_file() || kind.is_dir()) {
            warn!(entry = %entry_path.display(), "Skipping archive entry");
            skipped.push(entry_path.display().to_string());
            continue;
        }
        entry
            .unpack_in(dest)
            .with_context(|| format!("Failed to extract {}", entry_path.display()))?;
    }
    Ok(skipped)
}
