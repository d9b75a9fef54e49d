use std::fs;
use std::io;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::runtime::{ARCHIVE_FILE_NAME, PRESERVED_CONFIG_NAME, WP_CONFIG_FILE, WP_CONTENT_DIR};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileTreeReport {
    pub removed_content: bool,
    pub moved: Vec<String>,
    pub overwritten: Vec<String>,
}

/// Swaps the target's files for the backup's while keeping the target's
/// `wp-config.php`.
pub fn replace_file_tree(target_root: &Path, temp_dir: &Path, dump_name: &str) -> Result<FileTreeReport> {
    let target_config = target_root.join(WP_CONFIG_FILE);
    let preserved = temp_dir.join(PRESERVED_CONFIG_NAME);
    preserve_target_config(&target_config, &preserved)?;

    let mut report = FileTreeReport {
        removed_content: remove_content_dir(&target_root.join(WP_CONTENT_DIR))?,
        ..FileTreeReport::default()
    };

    let excluded = [dump_name, ARCHIVE_FILE_NAME, PRESERVED_CONFIG_NAME, WP_CONFIG_FILE];
    let mut entries = fs::read_dir(temp_dir)
        .with_context(|| format!("failed to read {}", temp_dir.display()))?
        .collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        if excluded.contains(&name.as_str()) {
            continue;
        }
        let destination = target_root.join(&name);
        if fs::symlink_metadata(&destination).is_ok() {
            warn!("{} exists and will be replaced from the backup", destination.display());
            remove_path(&destination)?;
            report.overwritten.push(name.clone());
        }
        move_path(&entry.path(), &destination)?;
        debug!("moved {name}");
        report.moved.push(name);
    }

    if report.moved.is_empty() {
        warn!("no entries were moved from the backup; check the archive layout");
    } else {
        info!("moved {} entries into {}", report.moved.len(), target_root.display());
    }

    fs::copy(&preserved, &target_config).with_context(|| {
        format!(
            "failed to restore {} from {}",
            target_config.display(),
            preserved.display()
        )
    })?;
    Ok(report)
}

pub fn preserve_target_config(target_config: &Path, preserved: &Path) -> Result<()> {
    if !target_config.is_file() {
        bail!("target configuration {} is missing", target_config.display());
    }
    fs::copy(target_config, preserved)
        .with_context(|| format!("failed to preserve {}", target_config.display()))?;
    Ok(())
}

/// `true` when something was removed.
fn remove_content_dir(content: &Path) -> Result<bool> {
    match fs::symlink_metadata(content) {
        Ok(_) => {
            remove_path(content)?;
            info!("removed {}", content.display());
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("failed to inspect {}", content.display())),
    }
}

fn remove_path(path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path)
        .with_context(|| format!("failed to inspect {}", path.display()))?;
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
    .with_context(|| format!("failed to remove {}", path.display()))
}

fn move_path(from: &Path, to: &Path) -> Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
            copy_recursive(from, to)?;
            remove_path(from)
        }
        Err(err) => Err(err)
            .with_context(|| format!("failed to move {} to {}", from.display(), to.display())),
    }
}

fn copy_recursive(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(from)?;
        let destination = if relative.as_os_str().is_empty() {
            to.to_path_buf()
        } else {
            to.join(relative)
        };
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&destination)
                .with_context(|| format!("failed to create {}", destination.display()))?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &destination)?;
        } else {
            fs::copy(entry.path(), &destination)
                .with_context(|| format!("failed to copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    let link = fs::read_link(from)?;
    std::os::unix::fs::symlink(&link, to)
        .with_context(|| format!("failed to recreate link {}", to.display()))
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    fs::copy(from, to)?;
    Ok(())
}
