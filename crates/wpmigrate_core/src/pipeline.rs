use std::fmt;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::archive::{extract_archive, locate_database_dump};
use crate::command::{CommandRunner, ProcessExecutor};
use crate::config::Settings;
use crate::database::{DatabaseReport, read_site_url, reset_and_import};
use crate::files::{FileTreeReport, replace_file_tree};
use crate::permissions::{PermissionReport, remove_permission_script, restore_permissions};
use crate::prefix::{PrefixOutcome, reconcile_table_prefix};
use crate::remote::{BackupSource, DownloadSummary, ScriptFetcher, download_archive, request_backup};
use crate::rewrite::{RewriteReport, rewrite_urls};
use crate::runtime::{
    MigrationContext, discover_tool, discover_wp_cli, ensure_target_ready, prepare_temp_dir,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Preflight,
    Trigger,
    Download,
    Extract,
    LocateDump,
    Database,
    Prefix,
    UrlRewrite,
    FileTree,
    Permissions,
    Finalize,
}

impl Stage {
    pub const ALL: [Stage; 11] = [
        Stage::Preflight,
        Stage::Trigger,
        Stage::Download,
        Stage::Extract,
        Stage::LocateDump,
        Stage::Database,
        Stage::Prefix,
        Stage::UrlRewrite,
        Stage::FileTree,
        Stage::Permissions,
        Stage::Finalize,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preflight => "preflight",
            Self::Trigger => "backup trigger",
            Self::Download => "download",
            Self::Extract => "extract",
            Self::LocateDump => "locate database dump",
            Self::Database => "database reset and import",
            Self::Prefix => "table prefix",
            Self::UrlRewrite => "URL rewrite",
            Self::FileTree => "file tree replacement",
            Self::Permissions => "permissions",
            Self::Finalize => "finalize",
        }
    }

    fn number(self) -> usize {
        Self::ALL
            .iter()
            .position(|stage| *stage == self)
            .map_or(0, |index| index + 1)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub target_url: String,
    pub backup_filename: String,
    pub archive: DownloadSummary,
    pub dump: PathBuf,
    pub database: DatabaseReport,
    pub prefix: PrefixOutcome,
    pub rewrite: RewriteReport,
    pub files: FileTreeReport,
    pub permissions: PermissionReport,
    pub completed: Vec<Stage>,
}

/// A run that stopped at `stage`. Every stage after it was skipped.
#[derive(Debug, Error)]
#[error("migration failed during {stage}: {error:#}")]
pub struct MigrationFailure {
    pub stage: Stage,
    pub completed: Vec<Stage>,
    /// Kept on disk for inspection when present.
    pub temp_dir: Option<PathBuf>,
    pub error: anyhow::Error,
}

pub struct Pipeline<'a, E, R, W>
where
    E: ProcessExecutor,
    R: BackupSource + ScriptFetcher,
    W: Write,
{
    settings: &'a Settings,
    context: MigrationContext,
    runner: &'a mut CommandRunner<E>,
    remote: &'a mut R,
    progress: &'a mut W,
    completed: Vec<Stage>,
}

impl<'a, E, R, W> Pipeline<'a, E, R, W>
where
    E: ProcessExecutor,
    R: BackupSource + ScriptFetcher,
    W: Write,
{
    pub fn new(
        settings: &'a Settings,
        context: MigrationContext,
        runner: &'a mut CommandRunner<E>,
        remote: &'a mut R,
        progress: &'a mut W,
    ) -> Self {
        Self {
            settings,
            context,
            runner,
            remote,
            progress,
            completed: Vec::new(),
        }
    }

    /// Runs every stage in order and cleans up. The temporary directory is
    /// removed only when every stage succeeded.
    pub fn run(mut self) -> Result<MigrationReport, MigrationFailure> {
        let outcome = self.execute();
        self.cleanup(outcome.is_ok());
        outcome.map_err(|(stage, error)| {
            let temp_dir = self.context.temp_dir.clone();
            MigrationFailure {
                stage,
                completed: self.completed.clone(),
                temp_dir: temp_dir.exists().then_some(temp_dir),
                error,
            }
        })
    }

    fn stage<T>(
        &mut self,
        stage: Stage,
        action: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T, (Stage, anyhow::Error)> {
        let banner = writeln!(
            self.progress,
            "==> [{}/{}] {stage}",
            stage.number(),
            Stage::ALL.len()
        );
        let result = banner
            .context("failed to write progress")
            .and_then(|()| action(self));
        match result {
            Ok(value) => {
                self.completed.push(stage);
                Ok(value)
            }
            Err(err) => Err((stage, err)),
        }
    }

    fn execute(&mut self) -> Result<MigrationReport, (Stage, anyhow::Error)> {
        self.stage(Stage::Preflight, Self::preflight)?;

        let backup = self.stage(Stage::Trigger, |this| {
            let backup = request_backup(this.remote)?;
            info!(
                "backup {} ready ({} bytes)",
                backup.filename, backup.file_size
            );
            Ok(backup)
        })?;

        let archive = self.stage(Stage::Download, |this| {
            let summary = download_archive(
                this.remote,
                &this.context.archive_path(),
                backup.file_size,
                this.settings.remote.chunk_size,
                this.progress,
            )?;
            info!(
                "downloaded {} bytes (sha256 {})",
                summary.bytes_written, summary.sha256
            );
            Ok(summary)
        })?;

        self.stage(Stage::Extract, |this| {
            let unzip = this.context.unzip()?.to_path_buf();
            extract_archive(
                this.runner,
                &unzip,
                &this.context.temp_dir,
                this.context.path_env.clone(),
            )
        })?;

        let dump = self.stage(Stage::LocateDump, |this| {
            locate_database_dump(&this.context.temp_dir)
        })?;

        let database = self.stage(Stage::Database, |this| {
            let wp = this.context.wp()?;
            let site_url = read_site_url(this.runner, &wp)?;
            info!("target site URL: {site_url}");
            this.context.site_url = Some(site_url);
            reset_and_import(this.runner, &wp, &dump)
        })?;
        let target_url = self.context.site_url.clone().unwrap_or_default();

        let prefix = self.stage(Stage::Prefix, |this| {
            reconcile_table_prefix(
                &this.context.backup_config_path(),
                &this.context.config_path(),
            )
        })?;

        let rewrite = self.stage(Stage::UrlRewrite, |this| {
            let wp = this.context.wp()?;
            Ok(rewrite_urls(
                this.runner,
                &wp,
                &this.context.source_domain,
                &target_url,
            ))
        })?;

        let files = self.stage(Stage::FileTree, |this| {
            let dump_name = dump
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            replace_file_tree(&this.context.target_root, &this.context.temp_dir, &dump_name)
        })?;

        let permissions = self.stage(Stage::Permissions, |this| {
            Ok(restore_permissions(
                this.runner,
                this.remote,
                &this.settings.permissions,
                &this.context.target_root,
                this.context.path_env.clone(),
            ))
        })?;

        self.stage(Stage::Finalize, |this| {
            let wp = this.context.wp()?;
            wp.rewrite_flush(this.runner);
            wp.option_update(this.runner, "siteurl", &target_url);
            wp.option_update(this.runner, "home", &target_url);
            wp.cache_flush(this.runner);
            Ok(())
        })?;

        Ok(MigrationReport {
            target_url,
            backup_filename: backup.filename,
            archive,
            dump,
            database,
            prefix,
            rewrite,
            files,
            permissions,
            completed: self.completed.clone(),
        })
    }

    fn preflight(&mut self) -> Result<()> {
        let root = self.context.target_root.clone();
        ensure_target_ready(&root)?;

        let unzip = discover_tool(&self.settings.tools.unzip, self.context.path_env.as_deref())?;
        info!("archive tool: {}", unzip.display());
        self.context.unzip = Some(unzip);

        let wp_cli = discover_wp_cli(&self.settings.tools, self.context.path_env.as_deref())?;
        info!(
            "WP-CLI: {} (found via {})",
            wp_cli.path.display(),
            wp_cli.source.as_str()
        );
        if let Some(extended) = wp_cli.path_env {
            self.context.path_env = Some(extended);
        }
        self.context.wp_cli = Some(wp_cli.path);
        let version = self
            .context
            .wp()?
            .version(self.runner)
            .context("WP-CLI is installed but does not run")?;
        info!("{version}");

        writeln!(
            self.progress,
            "WARNING: the database behind {root} will be dropped and {root}/wp-content replaced with the backup from {domain}.",
            root = root.display(),
            domain = self.context.source_domain
        )?;

        prepare_temp_dir(&self.context.temp_dir)
    }

    fn cleanup(&mut self, succeeded: bool) {
        remove_permission_script(&self.context.permission_script_path());
        let temp_dir = &self.context.temp_dir;
        if !succeeded {
            if temp_dir.exists() {
                error!(
                    "temporary directory {} kept for inspection; remove it with `rm -rf {}`",
                    temp_dir.display(),
                    temp_dir.display()
                );
            }
            return;
        }
        if let Err(err) = fs::remove_dir_all(temp_dir) {
            warn!("could not remove {}: {err}", temp_dir.display());
        } else {
            info!("removed {}", temp_dir.display());
        }
    }
}
