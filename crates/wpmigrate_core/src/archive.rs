use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::command::{CommandRunner, Invocation, ProcessExecutor};
use crate::runtime::ARCHIVE_FILE_NAME;

pub const DUMP_PREFIX: &str = "database_";
pub const DUMP_EXTENSION: &str = ".sql";

/// Unpacks the downloaded archive in place, overwriting on conflict.
pub fn extract_archive<E: ProcessExecutor>(
    runner: &mut CommandRunner<E>,
    unzip: &Path,
    temp_dir: &Path,
    path_env: Option<OsString>,
) -> Result<()> {
    let invocation = Invocation::new(unzip)
        .args(["-o", ARCHIVE_FILE_NAME])
        .current_dir(temp_dir)
        .path_env(path_env);
    runner
        .run_checked(&invocation)
        .context("failed to extract the backup archive")?;
    info!("archive extracted into {}", temp_dir.display());
    Ok(())
}

pub fn is_database_dump(name: &str) -> bool {
    name.len() > DUMP_PREFIX.len() + DUMP_EXTENSION.len()
        && name.starts_with(DUMP_PREFIX)
        && name.ends_with(DUMP_EXTENSION)
}

/// The single `database_*.sql` file at the top of `temp_dir`.
pub fn locate_database_dump(temp_dir: &Path) -> Result<PathBuf> {
    let mut found = Vec::new();
    for entry in fs::read_dir(temp_dir)
        .with_context(|| format!("failed to read {}", temp_dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if is_database_dump(&name) && entry.file_type()?.is_file() {
            found.push(name);
        }
    }
    found.sort();

    match found.as_slice() {
        [single] => {
            info!("database dump: {single}");
            Ok(temp_dir.join(single))
        }
        [] => bail!(
            "backup contains no database dump ({DUMP_PREFIX}*{DUMP_EXTENSION}) in {}",
            temp_dir.display()
        ),
        many => bail!(
            "backup contains {} database dumps, expected exactly one: {}",
            many.len(),
            many.join(", ")
        ),
    }
}
