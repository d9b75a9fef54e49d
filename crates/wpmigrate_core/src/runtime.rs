use std::env;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::config::{Settings, ToolSettings};
use crate::permissions::PERMISSION_SCRIPT_NAME;
use crate::wp_cli::WpCli;

pub const WP_CONFIG_FILE: &str = "wp-config.php";
pub const WP_CONTENT_DIR: &str = "wp-content";
pub const REQUIRED_TARGET_PATHS: &[&str] = &[WP_CONFIG_FILE, "wp-admin", "wp-includes"];
pub const ARCHIVE_FILE_NAME: &str = "backup_finalny.zip";
pub const PRESERVED_CONFIG_NAME: &str = "wp-config.php.original_target";

/// Everything one migration run knows about itself. Discovery results are
/// written here during preflight and read by the later stages.
#[derive(Debug, Clone)]
pub struct MigrationContext {
    pub source_domain: String,
    pub api_key: String,
    pub target_root: PathBuf,
    pub temp_dir: PathBuf,
    pub path_env: Option<OsString>,
    pub wp_cli: Option<PathBuf>,
    pub unzip: Option<PathBuf>,
    pub site_url: Option<String>,
}

impl MigrationContext {
    pub fn new(
        source_domain: &str,
        api_key: &str,
        settings: &Settings,
        path_env: Option<OsString>,
    ) -> Result<Self> {
        let source_domain = normalize_source_domain(source_domain)?;
        let api_key = api_key.trim().to_string();
        if api_key.is_empty() {
            bail!("API key must not be empty");
        }
        Ok(Self {
            source_domain,
            api_key,
            temp_dir: settings.target_root.join(&settings.temp_dir_name),
            target_root: settings.target_root.clone(),
            path_env,
            wp_cli: None,
            unzip: None,
            site_url: None,
        })
    }

    pub fn config_path(&self) -> PathBuf {
        self.target_root.join(WP_CONFIG_FILE)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.temp_dir.join(ARCHIVE_FILE_NAME)
    }

    pub fn preserved_config_path(&self) -> PathBuf {
        self.temp_dir.join(PRESERVED_CONFIG_NAME)
    }

    pub fn backup_config_path(&self) -> PathBuf {
        self.temp_dir.join(WP_CONFIG_FILE)
    }

    pub fn permission_script_path(&self) -> PathBuf {
        self.target_root.join(PERMISSION_SCRIPT_NAME)
    }

    pub fn wp(&self) -> Result<WpCli> {
        let program = self
            .wp_cli
            .clone()
            .ok_or_else(|| anyhow::anyhow!("WP-CLI has not been discovered yet"))?;
        Ok(WpCli::new(program, &self.target_root, self.path_env.clone()))
    }

    pub fn unzip(&self) -> Result<&Path> {
        self.unzip
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("archive tool has not been discovered yet"))
    }
}

/// Accepts `example.com`, tolerating a pasted scheme or trailing slash.
pub fn normalize_source_domain(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let domain = without_scheme.trim_end_matches('/').to_ascii_lowercase();
    if domain.is_empty() {
        bail!("source domain must not be empty");
    }
    if domain.contains('/') || domain.chars().any(char::is_whitespace) {
        bail!("source domain must be a bare hostname (got {raw:?})");
    }
    Ok(domain)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetStatus {
    pub root_exists: bool,
    pub missing: Vec<&'static str>,
}

pub fn inspect_target(root: &Path) -> TargetStatus {
    let root_exists = root.is_dir();
    let missing = REQUIRED_TARGET_PATHS
        .iter()
        .copied()
        .filter(|name| !root.join(name).exists())
        .collect();
    TargetStatus {
        root_exists,
        missing,
    }
}

pub fn ensure_target_ready(root: &Path) -> Result<()> {
    let status = inspect_target(root);
    if !status.root_exists {
        bail!("target root {} does not exist", root.display());
    }
    if !status.missing.is_empty() {
        let lines = status
            .missing
            .iter()
            .map(|name| format!("  - {name}"))
            .collect::<Vec<_>>()
            .join("\n");
        bail!(
            "{} does not look like a WordPress root. Missing:\n{lines}",
            root.display()
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSource {
    Path,
    Fallback,
    ExtendedPath,
}

impl ToolSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Path => "PATH",
            Self::Fallback => "fallback",
            Self::ExtendedPath => "extended PATH",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredTool {
    pub path: PathBuf,
    pub source: ToolSource,
    /// Set when discovery had to extend PATH; children must inherit it.
    pub path_env: Option<OsString>,
}

/// PATH lookup, then the well-known install path, then PATH extended with
/// extra directories.
pub fn discover_wp_cli(tools: &ToolSettings, path_env: Option<&OsStr>) -> Result<DiscoveredTool> {
    if let Some(path) = find_executable(&tools.wp_cli, path_env) {
        return Ok(DiscoveredTool {
            path,
            source: ToolSource::Path,
            path_env: None,
        });
    }

    if is_executable(&tools.wp_cli_fallback) {
        return Ok(DiscoveredTool {
            path: tools.wp_cli_fallback.clone(),
            source: ToolSource::Fallback,
            path_env: None,
        });
    }

    let mut dirs = tools.extra_path_dirs.clone();
    if let Some(parent) = tools.wp_cli_fallback.parent() {
        dirs.push(parent.to_path_buf());
    }
    if let Some(existing) = path_env {
        dirs.extend(env::split_paths(existing));
    }
    let extended = env::join_paths(&dirs).context("failed to build an extended PATH")?;
    if let Some(path) = find_executable(&tools.wp_cli, Some(extended.as_os_str())) {
        return Ok(DiscoveredTool {
            path,
            source: ToolSource::ExtendedPath,
            path_env: Some(extended),
        });
    }

    bail!(
        "WP-CLI (`{}`) is not installed: not on PATH, not at {}, not in {}",
        tools.wp_cli,
        tools.wp_cli_fallback.display(),
        tools
            .extra_path_dirs
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    )
}

pub fn discover_tool(name: &str, path_env: Option<&OsStr>) -> Result<PathBuf> {
    find_executable(name, path_env)
        .ok_or_else(|| anyhow::anyhow!("required tool `{name}` is not installed"))
}

/// Resolves `name` against `path_env`; names containing a separator are
/// checked as paths.
pub fn find_executable(name: &str, path_env: Option<&OsStr>) -> Option<PathBuf> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    if name.contains(std::path::MAIN_SEPARATOR) {
        let candidate = PathBuf::from(name);
        return is_executable(&candidate).then_some(candidate);
    }
    let path_env = path_env?;
    env::split_paths(path_env)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Removes leftovers of an earlier failed run and recreates the directory.
pub fn prepare_temp_dir(temp_dir: &Path) -> Result<()> {
    if temp_dir.exists() {
        fs::remove_dir_all(temp_dir)
            .with_context(|| format!("failed to clear stale {}", temp_dir.display()))?;
    }
    fs::create_dir_all(temp_dir).with_context(|| format!("failed to create {}", temp_dir.display()))
}
