use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::command::{Classification, CommandResult, CommandRunner, ProcessExecutor};
use crate::wp_cli::WpCli;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseReport {
    pub created_initially: bool,
    pub recreated: bool,
    pub check_passed: bool,
}

/// Reads the target's current `siteurl`; this is the URL every rewrite points at.
pub fn read_site_url<E: ProcessExecutor>(runner: &mut CommandRunner<E>, wp: &WpCli) -> Result<String> {
    wp.option_get(runner, "siteurl")
        .context("could not read the target `siteurl` option")
}

/// Drops and recreates the target database, then imports `dump`.
pub fn reset_and_import<E: ProcessExecutor>(
    runner: &mut CommandRunner<E>,
    wp: &WpCli,
    dump: &Path,
) -> Result<DatabaseReport> {
    let created_initially = ensure_database(wp.db_create(runner), "initial `db create`")?;

    wp.db_drop(runner).context("`db drop` failed")?;
    info!("database dropped");

    let recreated = ensure_database(wp.db_create(runner), "`db create` after drop")?;

    let check_passed = wp.db_check(runner).is_some_and(|result| result.succeeded());
    if !check_passed {
        warn!("`db check` did not pass before import; the dump may create the database itself");
    }

    if !dump.is_file() {
        bail!("database dump {} disappeared before import", dump.display());
    }
    wp.db_import(runner, dump)
        .with_context(|| format!("failed to import {}", dump.display()))?;
    info!("database imported from {}", dump.display());

    Ok(DatabaseReport {
        created_initially,
        recreated,
        check_passed,
    })
}

/// `true` when the database was created, `false` when it already existed.
fn ensure_database(result: Option<CommandResult>, label: &str) -> Result<bool> {
    let Some(result) = result else {
        bail!("{label} could not be started");
    };
    match result.classification {
        Classification::Success => Ok(true),
        Classification::Benign(_) => Ok(false),
        Classification::HardFailure => bail!("{label} failed with exit code {}", result.code),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;
    use crate::command::testing::{ScriptedExecutor, output};

    fn wp(root: &Path) -> WpCli {
        WpCli::new("/usr/local/bin/wp", root, None)
    }

    #[test]
    fn reset_runs_create_drop_create_check_import_in_order() {
        let temp = tempdir().expect("tempdir");
        let dump = temp.path().join("database_1.sql");
        fs::write(&dump, "CREATE TABLE x;").expect("write dump");

        let executor = ScriptedExecutor::default().respond(|invocation| {
            (invocation.args.first().map(String::as_str) == Some("db")
                && invocation.args.get(1).map(String::as_str) == Some("create"))
            .then(|| Ok(output(1, "", "ERROR: database exists")))
        });
        let mut runner = CommandRunner::new(executor);
        let report = reset_and_import(&mut runner, &wp(temp.path()), &dump).expect("reset");

        assert!(!report.created_initially);
        assert!(!report.recreated);
        assert!(report.check_passed);
        let subcommands = runner
            .executor()
            .calls
            .iter()
            .map(|call| call.args[..2].join(" "))
            .collect::<Vec<_>>();
        assert_eq!(
            subcommands,
            vec!["db create", "db drop", "db create", "db check", "db import"]
        );
    }

    #[test]
    fn unknown_create_failure_aborts_before_drop() {
        let temp = tempdir().expect("tempdir");
        let dump = temp.path().join("database_1.sql");
        fs::write(&dump, "").expect("write dump");

        let mut runner = CommandRunner::new(
            ScriptedExecutor::default().queue(output(1, "", "Access denied for user 'wp'")),
        );
        let error = reset_and_import(&mut runner, &wp(temp.path()), &dump).expect_err("fatal");
        assert!(error.to_string().contains("initial `db create`"));
        assert_eq!(runner.executor().calls.len(), 1);
    }

    #[test]
    fn failed_import_is_fatal() {
        let temp = tempdir().expect("tempdir");
        let dump = temp.path().join("database_1.sql");
        fs::write(&dump, "").expect("write dump");

        let executor = ScriptedExecutor::default().respond(|invocation| {
            (invocation.args.get(1).map(String::as_str) == Some("import"))
                .then(|| Ok(output(1, "", "syntax error")))
        });
        let mut runner = CommandRunner::new(executor);
        let error = reset_and_import(&mut runner, &wp(temp.path()), &dump).expect_err("fatal");
        assert!(format!("{error:#}").contains("syntax error"));
    }

    #[test]
    fn failed_check_is_only_a_warning() {
        let temp = tempdir().expect("tempdir");
        let dump = temp.path().join("database_1.sql");
        fs::write(&dump, "").expect("write dump");

        let executor = ScriptedExecutor::default().respond(|invocation| {
            (invocation.args.get(1).map(String::as_str) == Some("check"))
                .then(|| Ok(output(1, "", "Unknown database")))
        });
        let mut runner = CommandRunner::new(executor);
        let report = reset_and_import(&mut runner, &wp(temp.path()), &dump).expect("reset");
        assert!(!report.check_passed);
        assert!(report.created_initially);
    }
}
