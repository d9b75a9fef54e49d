use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};

use crate::command::{CommandResult, CommandRunner, Invocation, ProcessExecutor};

pub const WP_CLI_FLAGS: &[&str] = &["--allow-root"];

pub const SEARCH_REPLACE_FLAGS: &[&str] = &[
    "--all-tables-with-prefix",
    "--recurse-objects",
    "--skip-columns=guid",
    "--precise",
    "--report-changed-only",
];

/// Builds WP-CLI invocations rooted at the target installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WpCli {
    program: PathBuf,
    cwd: PathBuf,
    path_env: Option<OsString>,
}

impl WpCli {
    pub fn new(program: impl Into<PathBuf>, cwd: impl Into<PathBuf>, path_env: Option<OsString>) -> Self {
        Self {
            program: program.into(),
            cwd: cwd.into(),
            path_env,
        }
    }

    pub fn invocation(&self, args: &[&str]) -> Invocation {
        Invocation::new(&self.program)
            .args(args.iter().copied())
            .args(WP_CLI_FLAGS.iter().copied())
            .current_dir(&self.cwd)
            .path_env(self.path_env.clone())
    }

    pub fn version<E: ProcessExecutor>(&self, runner: &mut CommandRunner<E>) -> Result<String> {
        let result = runner.run_checked(&self.invocation(&["--version"]))?;
        Ok(result.stdout.trim().to_string())
    }

    /// Reads an option; an empty value is an error.
    pub fn option_get<E: ProcessExecutor>(
        &self,
        runner: &mut CommandRunner<E>,
        name: &str,
    ) -> Result<String> {
        let result = runner.run_checked(&self.invocation(&["option", "get", name]))?;
        let value = result.stdout.trim().to_string();
        if value.is_empty() {
            bail!("option `{name}` is empty");
        }
        Ok(value)
    }

    pub fn option_update<E: ProcessExecutor>(
        &self,
        runner: &mut CommandRunner<E>,
        name: &str,
        value: &str,
    ) -> Option<CommandResult> {
        runner.run_tolerant(&self.invocation(&["option", "update", name, value]))
    }

    pub fn db_create<E: ProcessExecutor>(
        &self,
        runner: &mut CommandRunner<E>,
    ) -> Option<CommandResult> {
        runner.run_tolerant(&self.invocation(&["db", "create"]))
    }

    pub fn db_drop<E: ProcessExecutor>(&self, runner: &mut CommandRunner<E>) -> Result<CommandResult> {
        runner.run_checked(&self.invocation(&["db", "drop", "--yes"]))
    }

    pub fn db_check<E: ProcessExecutor>(
        &self,
        runner: &mut CommandRunner<E>,
    ) -> Option<CommandResult> {
        runner.run_tolerant(&self.invocation(&["db", "check"]))
    }

    pub fn db_import<E: ProcessExecutor>(
        &self,
        runner: &mut CommandRunner<E>,
        dump: &Path,
    ) -> Result<CommandResult> {
        let dump = dump.to_string_lossy();
        runner.run_checked(&self.invocation(&["db", "import", dump.as_ref()]))
    }

    pub fn search_replace<E: ProcessExecutor>(
        &self,
        runner: &mut CommandRunner<E>,
        from: &str,
        to: &str,
    ) -> Option<CommandResult> {
        let mut args = vec!["search-replace", from, to];
        args.extend_from_slice(SEARCH_REPLACE_FLAGS);
        runner.run_tolerant(&self.invocation(&args))
    }

    pub fn rewrite_flush<E: ProcessExecutor>(
        &self,
        runner: &mut CommandRunner<E>,
    ) -> Option<CommandResult> {
        runner.run_tolerant(&self.invocation(&["rewrite", "flush", "--hard"]))
    }

    pub fn cache_flush<E: ProcessExecutor>(
        &self,
        runner: &mut CommandRunner<E>,
    ) -> Option<CommandResult> {
        runner.run_tolerant(&self.invocation(&["cache", "flush"]))
    }
}
