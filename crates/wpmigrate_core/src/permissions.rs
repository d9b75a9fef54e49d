use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::command::{CommandRunner, Invocation, ProcessExecutor};
use crate::config::{PermissionPolicy, PermissionSettings};
use crate::remote::ScriptFetcher;
use crate::runtime::WP_CONFIG_FILE;

pub const PERMISSION_SCRIPT_NAME: &str = "izolka-fix-permissions.sh";
pub const SCRIPT_MODE: u32 = 0o551;
pub const DIR_MODE: u32 = 0o755;
pub const FILE_MODE: u32 = 0o644;
pub const CONFIG_MODE: u32 = 0o640;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionReport {
    pub policy: PermissionPolicy,
    pub adjusted: usize,
    pub failures: usize,
    pub script_exit: Option<i32>,
}

impl PermissionReport {
    fn new(policy: PermissionPolicy) -> Self {
        Self {
            policy,
            adjusted: 0,
            failures: 0,
            script_exit: None,
        }
    }
}

/// Best-effort ownership and mode restoration under `target_root`.
///
/// Nothing here aborts the migration once the tree is in place. Per-path
/// failures are counted; a script that cannot be fetched, staged or started
/// and a non-zero script exit are logged.
pub fn restore_permissions<E, F>(
    runner: &mut CommandRunner<E>,
    fetcher: &mut F,
    settings: &PermissionSettings,
    target_root: &Path,
    path_env: Option<OsString>,
) -> PermissionReport
where
    E: ProcessExecutor,
    F: ScriptFetcher,
{
    match settings.policy {
        PermissionPolicy::Direct => apply_direct(runner, settings, target_root, path_env),
        PermissionPolicy::Script => run_script(runner, fetcher, settings, target_root, path_env),
    }
}

fn apply_direct<E: ProcessExecutor>(
    runner: &mut CommandRunner<E>,
    settings: &PermissionSettings,
    target_root: &Path,
    path_env: Option<OsString>,
) -> PermissionReport {
    let mut report = PermissionReport::new(PermissionPolicy::Direct);
    let owner = format!("{}:{}", settings.web_user, settings.web_group);
    let chown = Invocation::new("chown")
        .args(["-R", owner.as_str(), "."])
        .current_dir(target_root)
        .path_env(path_env);
    if !runner
        .run_tolerant(&chown)
        .is_some_and(|result| result.succeeded())
    {
        warn!("ownership of {} was not changed to {owner}", target_root.display());
    }

    for entry in WalkDir::new(target_root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!("skipping unreadable entry: {err}");
                report.failures += 1;
                continue;
            }
        };
        let file_type = entry.file_type();
        let mode = if file_type.is_dir() {
            DIR_MODE
        } else if !file_type.is_file() {
            continue;
        } else if entry.depth() == 1 && entry.file_name() == WP_CONFIG_FILE {
            CONFIG_MODE
        } else {
            FILE_MODE
        };
        match set_mode(entry.path(), mode) {
            Ok(()) => report.adjusted += 1,
            Err(err) => {
                debug!("chmod {mode:o} {} failed: {err}", entry.path().display());
                report.failures += 1;
            }
        }
    }

    if report.failures > 0 {
        warn!(
            "permissions adjusted on {} paths; {} paths could not be changed",
            report.adjusted, report.failures
        );
    } else {
        info!("permissions adjusted on {} paths", report.adjusted);
    }
    report
}

fn run_script<E, F>(
    runner: &mut CommandRunner<E>,
    fetcher: &mut F,
    settings: &PermissionSettings,
    target_root: &Path,
    path_env: Option<OsString>,
) -> PermissionReport
where
    E: ProcessExecutor,
    F: ScriptFetcher,
{
    let mut report = PermissionReport::new(PermissionPolicy::Script);
    let Some(url) = settings.script_url.as_deref() else {
        warn!("permission policy `script` has no script URL; permissions left unchanged");
        return report;
    };
    let body = match fetcher.fetch_script(url) {
        Ok(body) => body,
        Err(err) => {
            warn!("permission script unavailable, permissions left unchanged: {err}");
            return report;
        }
    };

    let script = target_root.join(PERMISSION_SCRIPT_NAME);
    let staged = fs::write(&script, body)
        .map_err(|err| format!("could not write {}: {err}", script.display()))
        .and_then(|()| {
            set_mode(&script, SCRIPT_MODE)
                .map_err(|err| format!("could not make {} executable: {err}", script.display()))
        });
    let outcome = match staged {
        Ok(()) => {
            let invocation = Invocation::new(&script)
                .current_dir(target_root)
                .path_env(path_env);
            runner.run_tolerant(&invocation)
        }
        Err(reason) => {
            warn!("{reason}; permissions left unchanged");
            remove_permission_script(&script);
            return report;
        }
    };
    remove_permission_script(&script);

    match outcome {
        Some(result) => {
            report.script_exit = Some(result.code);
            if result.succeeded() {
                info!("permission script finished");
            }
        }
        None => warn!("permission script could not be started"),
    }
    report
}

/// Deletes the staged script if present. Safe to call repeatedly.
pub fn remove_permission_script(script: &Path) {
    match fs::remove_file(script) {
        Ok(()) => debug!("removed {}", script.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!("could not remove {}: {err}", script.display()),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use std::cell::Cell;
    use std::os::unix::fs::PermissionsExt;
    use std::rc::Rc;

    use tempfile::tempdir;

    use super::*;
    use crate::command::testing::{ScriptedExecutor, output};
    use crate::remote::testing::FakeRemote;

    fn settings(policy: PermissionPolicy, script_url: Option<&str>) -> PermissionSettings {
        PermissionSettings {
            policy,
            script_url: script_url.map(str::to_string),
            web_user: "www-data".to_string(),
            web_group: "www-data".to_string(),
        }
    }

    fn mode(path: &Path) -> u32 {
        fs::metadata(path).expect("metadata").permissions().mode() & 0o777
    }

    #[test]
    fn direct_policy_chowns_then_normalizes_modes() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("wp-content/uploads")).expect("dirs");
        fs::write(root.join("wp-config.php"), "<?php").expect("config");
        fs::write(root.join("index.php"), "<?php").expect("index");
        fs::write(root.join("wp-content/uploads/wp-config.php"), "x").expect("nested");
        fs::set_permissions(root.join("index.php"), fs::Permissions::from_mode(0o600))
            .expect("chmod");

        let mut runner = CommandRunner::new(ScriptedExecutor::default());
        let mut fetcher = FakeRemote::default();
        let report = restore_permissions(
            &mut runner,
            &mut fetcher,
            &settings(PermissionPolicy::Direct, None),
            root,
            None,
        );

        assert_eq!(report.failures, 0);
        assert_eq!(report.adjusted, 6);
        assert_eq!(mode(&root.join("index.php")), FILE_MODE);
        assert_eq!(mode(&root.join("wp-config.php")), CONFIG_MODE);
        assert_eq!(mode(&root.join("wp-content/uploads/wp-config.php")), FILE_MODE);
        assert_eq!(mode(&root.join("wp-content")), DIR_MODE);
        assert_eq!(
            runner.executor().rendered_calls(),
            vec!["chown -R www-data:www-data ."]
        );
        assert!(fetcher.script_calls.is_empty());
    }

    #[test]
    fn failed_chown_is_not_fatal() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("index.php"), "<?php").expect("index");
        let mut runner = CommandRunner::new(
            ScriptedExecutor::default().queue(output(1, "", "chown: operation not permitted")),
        );
        let report = restore_permissions(
            &mut runner,
            &mut FakeRemote::default(),
            &settings(PermissionPolicy::Direct, None),
            temp.path(),
            None,
        );
        assert_eq!(report.adjusted, 2);
    }

    #[test]
    fn script_policy_runs_and_always_removes_script() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().to_path_buf();
        let script = root.join(PERMISSION_SCRIPT_NAME);
        let seen_mode = Rc::new(Cell::new(0u32));
        let seen = Rc::clone(&seen_mode);
        let executor = ScriptedExecutor::default().respond(move |invocation| {
            seen.set(mode(&invocation.program));
            Some(Ok(output(3, "", "chown: some files skipped")))
        });
        let mut runner = CommandRunner::new(executor);
        let mut fetcher = FakeRemote {
            script: Some(b"#!/bin/sh\nexit 3\n".to_vec()),
            ..FakeRemote::default()
        };

        let report = restore_permissions(
            &mut runner,
            &mut fetcher,
            &settings(PermissionPolicy::Script, Some("https://scripts.test/fix.sh")),
            &root,
            None,
        );

        assert_eq!(report.script_exit, Some(3));
        assert_eq!(seen_mode.get(), SCRIPT_MODE);
        assert!(!script.exists());
        assert_eq!(fetcher.script_calls, vec!["https://scripts.test/fix.sh"]);
        let call = &runner.executor().calls[0];
        assert_eq!(call.program, script);
        assert_eq!(call.cwd.as_deref(), Some(root.as_path()));
    }

    #[test]
    fn unavailable_script_leaves_permissions_alone() {
        let temp = tempdir().expect("tempdir");
        let mut runner = CommandRunner::new(ScriptedExecutor::default());
        let report = restore_permissions(
            &mut runner,
            &mut FakeRemote::default(),
            &settings(PermissionPolicy::Script, Some("https://scripts.test/fix.sh")),
            temp.path(),
            None,
        );
        assert_eq!(report.script_exit, None);
        assert!(runner.executor().calls.is_empty());
        assert!(!temp.path().join(PERMISSION_SCRIPT_NAME).exists());
    }

    #[test]
    fn unwritable_script_location_is_not_fatal() {
        let temp = tempdir().expect("tempdir");
        let missing_root = temp.path().join("gone");
        let mut runner = CommandRunner::new(ScriptedExecutor::default());
        let mut fetcher = FakeRemote {
            script: Some(b"#!/bin/sh\nexit 0\n".to_vec()),
            ..FakeRemote::default()
        };

        let report = restore_permissions(
            &mut runner,
            &mut fetcher,
            &settings(PermissionPolicy::Script, Some("https://scripts.test/fix.sh")),
            &missing_root,
            None,
        );

        assert_eq!(report.policy, PermissionPolicy::Script);
        assert_eq!(report.script_exit, None);
        assert_eq!(fetcher.script_calls.len(), 1);
        assert!(runner.executor().calls.is_empty());
        assert!(!missing_root.join(PERMISSION_SCRIPT_NAME).exists());
    }

    #[test]
    fn removing_a_missing_script_is_quiet() {
        let temp = tempdir().expect("tempdir");
        remove_permission_script(&temp.path().join(PERMISSION_SCRIPT_NAME));
    }
}
