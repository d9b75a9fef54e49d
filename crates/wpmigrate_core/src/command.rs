use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Result;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::permissions::PERMISSION_SCRIPT_NAME;

/// One external process call: program, argument vector and the environment
/// slice the migration controls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub path_env: Option<OsString>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            path_env: None,
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn path_env(mut self, value: Option<OsString>) -> Self {
        self.path_env = value;
        self
    }

    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    pub fn display(&self) -> String {
        let mut parts = vec![self.program.to_string_lossy().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

pub trait ProcessExecutor {
    fn execute(&mut self, invocation: &Invocation) -> io::Result<ProcessOutput>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl ProcessExecutor for SystemExecutor {
    fn execute(&mut self, invocation: &Invocation) -> io::Result<ProcessOutput> {
        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args);
        if let Some(cwd) = &invocation.cwd {
            command.current_dir(cwd);
        }
        if let Some(path_env) = &invocation.path_env {
            command.env("PATH", path_env);
        }
        let output = command.output()?;
        Ok(ProcessOutput {
            // Killed by a signal: no exit code.
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    Benign(&'static str),
    HardFailure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub classification: Classification,
}

impl CommandResult {
    pub fn succeeded(&self) -> bool {
        self.classification == Classification::Success
    }

    pub fn is_hard_failure(&self) -> bool {
        self.classification == Classification::HardFailure
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnFailure {
    Abort,
    Tolerate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleScope {
    /// Leading arguments after the program, e.g. `["db", "create"]`.
    Subcommand(&'static [&'static str]),
    /// File name of the program itself.
    Program(&'static str),
}

/// Known-harmless non-zero exits. An empty pattern list accepts any output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenignRule {
    pub scope: RuleScope,
    pub patterns: &'static [&'static str],
    pub note: &'static str,
}

impl BenignRule {
    fn applies_to(&self, invocation: &Invocation) -> bool {
        match self.scope {
            RuleScope::Subcommand(tokens) => {
                invocation.args.len() >= tokens.len()
                    && tokens
                        .iter()
                        .zip(&invocation.args)
                        .all(|(token, arg)| token == arg)
            }
            RuleScope::Program(name) => invocation.program_name() == name,
        }
    }

    fn matches_output(&self, stdout: &str, stderr: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let haystack = format!("{stdout}\n{stderr}").to_ascii_lowercase();
        self.patterns
            .iter()
            .any(|pattern| haystack.contains(&pattern.to_ascii_lowercase()))
    }
}

// Coupled to the wording of the current WP-CLI release; an unknown message
// degrades to a warning, never to an abort.
pub const DEFAULT_BENIGN_RULES: &[BenignRule] = &[
    BenignRule {
        scope: RuleScope::Subcommand(&["db", "create"]),
        patterns: &["database exists"],
        note: "database already exists",
    },
    BenignRule {
        scope: RuleScope::Subcommand(&["search-replace"]),
        patterns: &["made 0 replacements", "no replacements"],
        note: "nothing to replace",
    },
    BenignRule {
        scope: RuleScope::Subcommand(&["cache", "flush"]),
        patterns: &["object cache", "cache backend", "not supported"],
        note: "no object cache backend",
    },
    BenignRule {
        scope: RuleScope::Subcommand(&["db", "check"]),
        patterns: &[],
        note: "pre-import database check is advisory",
    },
    BenignRule {
        scope: RuleScope::Program(PERMISSION_SCRIPT_NAME),
        patterns: &[],
        note: "permission script reported its own diagnostics",
    },
];

pub fn classify(
    rules: &[BenignRule],
    invocation: &Invocation,
    output: &ProcessOutput,
) -> Classification {
    if output.code == 0 {
        return Classification::Success;
    }
    rules
        .iter()
        .find(|rule| {
            rule.applies_to(invocation) && rule.matches_output(&output.stdout, &output.stderr)
        })
        .map(|rule| Classification::Benign(rule.note))
        .unwrap_or(Classification::HardFailure)
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command `{command}` exited with code {code}{detail}")]
    Failed {
        command: String,
        code: i32,
        detail: String,
    },
    #[error("command `{command}` could not be started")]
    Unavailable { command: String },
}

pub struct CommandRunner<E: ProcessExecutor> {
    executor: E,
    rules: &'static [BenignRule],
}

impl<E: ProcessExecutor> CommandRunner<E> {
    pub fn new(executor: E) -> Self {
        Self::with_rules(executor, DEFAULT_BENIGN_RULES)
    }

    pub fn with_rules(executor: E, rules: &'static [BenignRule]) -> Self {
        Self { executor, rules }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Runs `invocation`.
    ///
    /// `Ok(None)` means the process could not be started at all and must be
    /// treated like a hard failure. With [`OnFailure::Abort`] a non-zero exit
    /// becomes an `Err`; with [`OnFailure::Tolerate`] it is classified,
    /// logged, and handed back.
    pub fn run(
        &mut self,
        invocation: &Invocation,
        on_failure: OnFailure,
    ) -> Result<Option<CommandResult>> {
        let Some(result) = self.execute_and_classify(invocation) else {
            return Ok(None);
        };
        if result.succeeded() {
            return Ok(Some(result));
        }

        match on_failure {
            OnFailure::Abort => {
                error!(
                    command = %invocation.display(),
                    code = result.code,
                    "command failed"
                );
                log_streams(&result, true);
                Err(CommandError::Failed {
                    command: invocation.display(),
                    code: result.code,
                    detail: failure_detail(&result),
                }
                .into())
            }
            OnFailure::Tolerate => {
                match result.classification {
                    Classification::Benign(note) => {
                        info!(
                            command = %invocation.display(),
                            code = result.code,
                            "tolerated: {note}"
                        );
                    }
                    _ => {
                        warn!(
                            command = %invocation.display(),
                            code = result.code,
                            "command returned a non-zero exit code"
                        );
                        log_streams(&result, false);
                    }
                }
                Ok(Some(result))
            }
        }
    }

    /// Fatal-on-error run; an unstartable process is also an error.
    pub fn run_checked(&mut self, invocation: &Invocation) -> Result<CommandResult> {
        self.run(invocation, OnFailure::Abort)?.ok_or_else(|| {
            CommandError::Unavailable {
                command: invocation.display(),
            }
            .into()
        })
    }

    /// Non-fatal run; `None` when the process could not be started.
    pub fn run_tolerant(&mut self, invocation: &Invocation) -> Option<CommandResult> {
        match self.run(invocation, OnFailure::Tolerate) {
            Ok(result) => result,
            Err(_) => None,
        }
    }

    fn execute_and_classify(&mut self, invocation: &Invocation) -> Option<CommandResult> {
        info!("-> running: {}", invocation.display());
        let output = match self.executor.execute(invocation) {
            Ok(output) => output,
            Err(err) => {
                log_spawn_error(&invocation.program, &err);
                return None;
            }
        };
        let classification = classify(self.rules, invocation, &output);
        Some(CommandResult {
            code: output.code,
            stdout: output.stdout,
            stderr: output.stderr,
            classification,
        })
    }
}

fn log_spawn_error(program: &Path, err: &io::Error) {
    match err.kind() {
        io::ErrorKind::NotFound => {
            error!("command `{}` not found", program.display());
        }
        io::ErrorKind::PermissionDenied => {
            error!("permission denied while starting `{}`: {err}", program.display());
        }
        _ => {
            error!("unexpected error while starting `{}`: {err}", program.display());
        }
    }
}

fn log_streams(result: &CommandResult, as_error: bool) {
    for (label, text) in [("stdout", &result.stdout), ("stderr", &result.stderr)] {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if as_error {
            error!("{label}:\n{trimmed}");
        } else {
            warn!("{label}:\n{trimmed}");
        }
    }
}

fn failure_detail(result: &CommandResult) -> String {
    let stderr = result.stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}


#[cfg(test)]
mod tests {
    use std::io;

    use super::testing::{ScriptedExecutor, output};
    use super::*;

    fn wp(args: &[&str]) -> Invocation {
        Invocation::new("/usr/local/bin/wp")
            .args(args.iter().copied())
            .arg("--allow-root")
    }

    #[test]
    fn zero_exit_is_success() {
        let mut runner = CommandRunner::new(ScriptedExecutor::default().queue(output(0, "ok", "")));
        let result = runner
            .run(&wp(&["option", "get", "siteurl"]), OnFailure::Abort)
            .expect("run")
            .expect("started");
        assert_eq!(result.classification, Classification::Success);
        assert_eq!(result.stdout, "ok");
    }

    #[test]
    fn abort_turns_non_zero_exit_into_error() {
        let mut runner =
            CommandRunner::new(ScriptedExecutor::default().queue(output(1, "", "Error: boom")));
        let error = runner
            .run(&wp(&["db", "drop", "--yes"]), OnFailure::Abort)
            .expect_err("must fail");
        match error.downcast_ref::<CommandError>() {
            Some(CommandError::Failed { code, detail, .. }) => {
                assert_eq!(*code, 1);
                assert!(detail.contains("boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn abort_does_not_consult_benign_rules() {
        let mut runner = CommandRunner::new(
            ScriptedExecutor::default().queue(output(1, "", "ERROR 1007: database exists")),
        );
        assert!(runner.run(&wp(&["db", "create"]), OnFailure::Abort).is_err());
    }

    #[test]
    fn tolerate_classifies_database_exists_as_benign() {
        let mut runner = CommandRunner::new(ScriptedExecutor::default().queue(output(
            1,
            "",
            "ERROR 1007 (HY000): Can't create database 'wp'; Database Exists",
        )));
        let result = runner
            .run_tolerant(&wp(&["db", "create"]))
            .expect("started");
        assert_eq!(
            result.classification,
            Classification::Benign("database already exists")
        );
    }

    #[test]
    fn tolerate_keeps_unknown_failures_as_hard() {
        let mut runner = CommandRunner::new(
            ScriptedExecutor::default().queue(output(1, "", "Access denied for user")),
        );
        let result = runner
            .run_tolerant(&wp(&["db", "create"]))
            .expect("started");
        assert!(result.is_hard_failure());
    }

    #[test]
    fn rules_are_scoped_to_their_subcommand() {
        let mut runner = CommandRunner::new(
            ScriptedExecutor::default().queue(output(1, "", "database exists")),
        );
        let result = runner
            .run_tolerant(&wp(&["db", "import", "dump.sql"]))
            .expect("started");
        assert!(result.is_hard_failure());
    }

    #[test]
    fn permission_script_output_is_benign_by_program_name() {
        let mut runner =
            CommandRunner::new(ScriptedExecutor::default().queue(output(2, "", "chmod: denied")));
        let invocation = Invocation::new(format!("/var/www/html/wp/{PERMISSION_SCRIPT_NAME}"));
        let result = runner.run_tolerant(&invocation).expect("started");
        assert!(matches!(result.classification, Classification::Benign(_)));
    }

    #[test]
    fn spawn_failure_yields_sentinel() {
        let executor = ScriptedExecutor::default().respond(|_| {
            Some(Err(io::Error::new(io::ErrorKind::NotFound, "no such file")))
        });
        let mut runner = CommandRunner::new(executor);
        let invocation = Invocation::new("/missing/tool");
        assert!(runner.run(&invocation, OnFailure::Abort).expect("no error").is_none());
        assert!(runner.run_tolerant(&invocation).is_none());

        let error = runner.run_checked(&invocation).expect_err("sentinel is fatal");
        assert!(matches!(
            error.downcast_ref::<CommandError>(),
            Some(CommandError::Unavailable { .. })
        ));
    }

    #[test]
    fn invocation_display_and_program_name() {
        let invocation = wp(&["cache", "flush"]).current_dir("/srv");
        assert_eq!(
            invocation.display(),
            "/usr/local/bin/wp cache flush --allow-root"
        );
        assert_eq!(invocation.program_name(), "wp");
        assert_eq!(invocation.cwd.as_deref(), Some(Path::new("/srv")));
    }

    #[test]
    fn classify_matches_case_insensitively_across_streams() {
        let invocation = wp(&["search-replace", "http://a", "http://b"]);
        let classification = classify(
            DEFAULT_BENIGN_RULES,
            &invocation,
            &output(1, "Success: Made 0 replacements.", ""),
        );
        assert_eq!(classification, Classification::Benign("nothing to replace"));
    }

    #[test]
    fn missing_object_cache_is_benign_for_cache_flush_only() {
        let missing = output(1, "", "Error: Object cache backend not found");
        assert_eq!(
            classify(DEFAULT_BENIGN_RULES, &wp(&["cache", "flush"]), &missing),
            Classification::Benign("no object cache backend")
        );
        assert_eq!(
            classify(DEFAULT_BENIGN_RULES, &wp(&["rewrite", "flush", "--hard"]), &missing),
            Classification::HardFailure
        );
    }
}
