use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TARGET_ROOT: &str = "/var/www/html/wp";
pub const DEFAULT_TEMP_DIR_NAME: &str = "izolka-migration-temp";
pub const DEFAULT_SCHEME: &str = "https";
pub const DEFAULT_API_BASE_PATH: &str = "/wp-json/izolka-migrate/v1";
pub const DEFAULT_TRIGGER_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_CHUNK_SIZE_BYTES: usize = 5_242_880;
pub const DEFAULT_USER_AGENT: &str = "wpmigrate/0.3";
pub const DEFAULT_WP_CLI: &str = "wp";
pub const DEFAULT_WP_CLI_FALLBACK: &str = "/usr/local/bin/wp";
pub const DEFAULT_EXTRA_PATH_DIRS: &[&str] = &["/usr/local/bin", "/usr/bin", "/bin"];
pub const DEFAULT_UNZIP: &str = "unzip";
pub const DEFAULT_WEB_USER: &str = "www-data";
pub const DEFAULT_WEB_GROUP: &str = "www-data";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MigrateConfig {
    #[serde(default)]
    pub target: TargetSection,
    #[serde(default)]
    pub remote: RemoteSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub permissions: PermissionsSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct TargetSection {
    pub root_dir: Option<PathBuf>,
    pub temp_dir_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RemoteSection {
    pub scheme: Option<String>,
    pub api_base_path: Option<String>,
    pub trigger_timeout_secs: Option<u64>,
    pub download_timeout_secs: Option<u64>,
    pub chunk_size_bytes: Option<usize>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ToolsSection {
    pub wp_cli: Option<String>,
    pub wp_cli_fallback: Option<PathBuf>,
    #[serde(default)]
    pub extra_path_dirs: Vec<PathBuf>,
    pub unzip: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct PermissionsSection {
    pub policy: Option<String>,
    pub script_url: Option<String>,
    pub web_user: Option<String>,
    pub web_group: Option<String>,
}

/// Load and parse a MigrateConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MigrateConfig> {
    if !config_path.exists() {
        return Ok(MigrateConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MigrateConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Config file location: flag > WPMIGRATE_CONFIG > none.
pub fn resolve_config_path(flag: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = flag {
        return Some(path.to_path_buf());
    }
    env::var("WPMIGRATE_CONFIG")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Config,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Config => "config",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionPolicy {
    /// Recursive chown plus a best-effort chmod walk.
    Direct,
    /// Download and run an external fix-permissions script.
    Script,
}

impl PermissionPolicy {
    pub fn parse(value: &str) -> Result<Self> {
        if value.trim().eq_ignore_ascii_case("direct") {
            return Ok(Self::Direct);
        }
        if value.trim().eq_ignore_ascii_case("script") {
            return Ok(Self::Script);
        }
        bail!("unsupported permission policy: {value} (expected direct|script)")
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Script => "script",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SettingOverrides {
    pub target_root: Option<PathBuf>,
    pub wp_cli: Option<String>,
    pub permission_policy: Option<PermissionPolicy>,
}

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub scheme: String,
    pub api_base_path: String,
    pub trigger_timeout: Duration,
    pub download_timeout: Duration,
    pub chunk_size: usize,
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct PermissionSettings {
    pub policy: PermissionPolicy,
    pub script_url: Option<String>,
    pub web_user: String,
    pub web_group: String,
}

#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub wp_cli: String,
    pub wp_cli_fallback: PathBuf,
    pub extra_path_dirs: Vec<PathBuf>,
    pub unzip: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub target_root: PathBuf,
    pub target_root_source: ValueSource,
    pub temp_dir_name: String,
    pub remote: RemoteSettings,
    pub tools: ToolSettings,
    pub permissions: PermissionSettings,
}

impl Settings {
    pub fn diagnostics(&self) -> String {
        format!(
            "target_root={} ({})\ntemp_dir_name={}\nremote.scheme={}\nremote.api_base_path={}\nremote.trigger_timeout_secs={}\nremote.download_timeout_secs={}\nremote.chunk_size_bytes={}\ntools.wp_cli={}\ntools.wp_cli_fallback={}\ntools.unzip={}\npermissions.policy={}\npermissions.owner={}:{}",
            self.target_root.display(),
            self.target_root_source.as_str(),
            self.temp_dir_name,
            self.remote.scheme,
            self.remote.api_base_path,
            self.remote.trigger_timeout.as_secs(),
            self.remote.download_timeout.as_secs(),
            self.remote.chunk_size,
            self.tools.wp_cli,
            self.tools.wp_cli_fallback.display(),
            self.tools.unzip,
            self.permissions.policy.as_str(),
            self.permissions.web_user,
            self.permissions.web_group,
        )
    }
}

/// Resolve every setting: flag > env > config > default.
pub fn resolve_settings(config: &MigrateConfig, overrides: &SettingOverrides) -> Result<Settings> {
    resolve_settings_with_lookup(config, overrides, |key| env::var(key).ok())
}

pub(crate) fn resolve_settings_with_lookup<F>(
    config: &MigrateConfig,
    overrides: &SettingOverrides,
    lookup_env: F,
) -> Result<Settings>
where
    F: Fn(&str) -> Option<String>,
{
    let env_value = |key: &str| {
        lookup_env(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    let (target_root, target_root_source) = if let Some(path) = &overrides.target_root {
        (path.clone(), ValueSource::Flag)
    } else if let Some(value) = env_value("WPMIGRATE_TARGET_ROOT") {
        (PathBuf::from(value), ValueSource::Env)
    } else if let Some(path) = &config.target.root_dir {
        (path.clone(), ValueSource::Config)
    } else {
        (PathBuf::from(DEFAULT_TARGET_ROOT), ValueSource::Default)
    };
    if !target_root.is_absolute() {
        bail!(
            "target root must be an absolute path: {}",
            target_root.display()
        );
    }

    let temp_dir_name = env_value("WPMIGRATE_TEMP_DIR_NAME")
        .or_else(|| config.target.temp_dir_name.clone())
        .unwrap_or_else(|| DEFAULT_TEMP_DIR_NAME.to_string());
    if temp_dir_name.is_empty() || temp_dir_name.contains('/') || temp_dir_name == ".." {
        bail!("temp dir name must be a single path component: {temp_dir_name:?}");
    }

    let trigger_timeout_secs = parse_env_u64(&env_value, "WPMIGRATE_TRIGGER_TIMEOUT_SECS")?
        .or(config.remote.trigger_timeout_secs)
        .unwrap_or(DEFAULT_TRIGGER_TIMEOUT_SECS);
    let download_timeout_secs = parse_env_u64(&env_value, "WPMIGRATE_DOWNLOAD_TIMEOUT_SECS")?
        .or(config.remote.download_timeout_secs)
        .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_SECS);
    if trigger_timeout_secs == 0 || download_timeout_secs == 0 {
        bail!("remote timeouts must be greater than zero");
    }
    let chunk_size = parse_env_u64(&env_value, "WPMIGRATE_CHUNK_SIZE_BYTES")?
        .map(|value| value as usize)
        .or(config.remote.chunk_size_bytes)
        .unwrap_or(DEFAULT_CHUNK_SIZE_BYTES);
    if chunk_size == 0 {
        bail!("chunk size must be greater than zero");
    }

    let remote = RemoteSettings {
        scheme: env_value("WPMIGRATE_SCHEME")
            .or_else(|| config.remote.scheme.clone())
            .unwrap_or_else(|| DEFAULT_SCHEME.to_string()),
        api_base_path: normalize_base_path(
            &env_value("WPMIGRATE_API_BASE_PATH")
                .or_else(|| config.remote.api_base_path.clone())
                .unwrap_or_else(|| DEFAULT_API_BASE_PATH.to_string()),
        ),
        trigger_timeout: Duration::from_secs(trigger_timeout_secs),
        download_timeout: Duration::from_secs(download_timeout_secs),
        chunk_size,
        user_agent: env_value("WPMIGRATE_USER_AGENT")
            .or_else(|| config.remote.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
    };
    if remote.scheme != "https" && remote.scheme != "http" {
        bail!("unsupported remote scheme: {} (expected http|https)", remote.scheme);
    }

    let tools = ToolSettings {
        wp_cli: overrides
            .wp_cli
            .clone()
            .or_else(|| env_value("WPMIGRATE_WP_CLI"))
            .or_else(|| config.tools.wp_cli.clone())
            .unwrap_or_else(|| DEFAULT_WP_CLI.to_string()),
        wp_cli_fallback: env_value("WPMIGRATE_WP_CLI_FALLBACK")
            .map(PathBuf::from)
            .or_else(|| config.tools.wp_cli_fallback.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WP_CLI_FALLBACK)),
        extra_path_dirs: if config.tools.extra_path_dirs.is_empty() {
            DEFAULT_EXTRA_PATH_DIRS.iter().map(PathBuf::from).collect()
        } else {
            config.tools.extra_path_dirs.clone()
        },
        unzip: env_value("WPMIGRATE_UNZIP")
            .or_else(|| config.tools.unzip.clone())
            .unwrap_or_else(|| DEFAULT_UNZIP.to_string()),
    };

    let policy = match &overrides.permission_policy {
        Some(policy) => *policy,
        None => match env_value("WPMIGRATE_PERMISSION_POLICY").or_else(|| config.permissions.policy.clone()) {
            Some(value) => PermissionPolicy::parse(&value)?,
            None => PermissionPolicy::Direct,
        },
    };
    let script_url = env_value("WPMIGRATE_PERMISSION_SCRIPT_URL")
        .or_else(|| config.permissions.script_url.clone())
        .filter(|value| !value.trim().is_empty());
    if policy == PermissionPolicy::Script {
        match script_url.as_deref() {
            None => bail!(
                "permission policy `script` requires permissions.script_url (or WPMIGRATE_PERMISSION_SCRIPT_URL)"
            ),
            Some(url) if !url.starts_with("https://") => {
                bail!("permission script must be fetched over https: {url}")
            }
            Some(_) => {}
        }
    }
    let permissions = PermissionSettings {
        policy,
        script_url,
        web_user: env_value("WPMIGRATE_WEB_USER")
            .or_else(|| config.permissions.web_user.clone())
            .unwrap_or_else(|| DEFAULT_WEB_USER.to_string()),
        web_group: env_value("WPMIGRATE_WEB_GROUP")
            .or_else(|| config.permissions.web_group.clone())
            .unwrap_or_else(|| DEFAULT_WEB_GROUP.to_string()),
    };

    Ok(Settings {
        target_root,
        target_root_source,
        temp_dir_name,
        remote,
        tools,
        permissions,
    })
}

fn parse_env_u64<F>(env_value: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    match env_value(key) {
        Some(value) => value
            .parse::<u64>()
            .map(Some)
            .with_context(|| format!("{key} must be a non-negative integer, got {value:?}")),
        None => Ok(None),
    }
}

fn normalize_base_path(value: &str) -> String {
    let trimmed = value.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::tempdir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/wpmigrate.toml")).expect("load config");
        assert_eq!(config, MigrateConfig::default());
    }

    #[test]
    fn load_config_parses_all_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("wpmigrate.toml");
        fs::write(
            &config_path,
            r#"
[target]
root_dir = "/srv/site"
temp_dir_name = "scratch"

[remote]
trigger_timeout_secs = 90
chunk_size_bytes = 1024

[tools]
wp_cli = "wp-cli"
extra_path_dirs = ["/opt/wp/bin"]

[permissions]
policy = "script"
script_url = "https://example.org/fix.sh"
web_user = "nginx"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.target.root_dir, Some(PathBuf::from("/srv/site")));
        assert_eq!(config.target.temp_dir_name.as_deref(), Some("scratch"));
        assert_eq!(config.remote.trigger_timeout_secs, Some(90));
        assert_eq!(config.remote.chunk_size_bytes, Some(1024));
        assert_eq!(config.tools.wp_cli.as_deref(), Some("wp-cli"));
        assert_eq!(config.tools.extra_path_dirs, vec![PathBuf::from("/opt/wp/bin")]);
        assert_eq!(config.permissions.policy.as_deref(), Some("script"));
        assert_eq!(config.permissions.web_user.as_deref(), Some("nginx"));
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("wpmigrate.toml");
        fs::write(&config_path, "[target\nroot_dir = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn defaults_match_original_layout() {
        let settings =
            resolve_settings_with_lookup(&MigrateConfig::default(), &SettingOverrides::default(), no_env)
                .expect("resolve");
        assert_eq!(settings.target_root, PathBuf::from(DEFAULT_TARGET_ROOT));
        assert_eq!(settings.target_root_source, ValueSource::Default);
        assert_eq!(settings.temp_dir_name, "izolka-migration-temp");
        assert_eq!(settings.remote.api_base_path, "/wp-json/izolka-migrate/v1");
        assert_eq!(settings.remote.trigger_timeout, Duration::from_secs(60));
        assert_eq!(settings.remote.download_timeout, Duration::from_secs(300));
        assert_eq!(settings.remote.chunk_size, 5 * 1024 * 1024);
        assert_eq!(settings.tools.wp_cli, "wp");
        assert_eq!(settings.permissions.policy, PermissionPolicy::Direct);
        assert_eq!(settings.permissions.web_user, "www-data");
    }

    #[test]
    fn flag_beats_env_beats_config() {
        let mut config = MigrateConfig::default();
        config.target.root_dir = Some(PathBuf::from("/from/config"));
        let env = HashMap::from([(
            "WPMIGRATE_TARGET_ROOT".to_string(),
            "/from/env".to_string(),
        )]);

        let settings = resolve_settings_with_lookup(&config, &SettingOverrides::default(), |key| {
            env.get(key).cloned()
        })
        .expect("resolve");
        assert_eq!(settings.target_root, PathBuf::from("/from/env"));
        assert_eq!(settings.target_root_source, ValueSource::Env);

        let overrides = SettingOverrides {
            target_root: Some(PathBuf::from("/from/flag")),
            ..SettingOverrides::default()
        };
        let settings =
            resolve_settings_with_lookup(&config, &overrides, |key| env.get(key).cloned())
                .expect("resolve");
        assert_eq!(settings.target_root, PathBuf::from("/from/flag"));
        assert_eq!(settings.target_root_source, ValueSource::Flag);

        let settings =
            resolve_settings_with_lookup(&config, &SettingOverrides::default(), no_env)
                .expect("resolve");
        assert_eq!(settings.target_root_source, ValueSource::Config);
    }

    #[test]
    fn script_policy_requires_https_url() {
        let mut config = MigrateConfig::default();
        config.permissions.policy = Some("script".to_string());
        let error = resolve_settings_with_lookup(&config, &SettingOverrides::default(), no_env)
            .expect_err("missing url");
        assert!(error.to_string().contains("requires permissions.script_url"));

        config.permissions.script_url = Some("http://example.org/fix.sh".to_string());
        let error = resolve_settings_with_lookup(&config, &SettingOverrides::default(), no_env)
            .expect_err("plain http");
        assert!(error.to_string().contains("https"));

        config.permissions.script_url = Some("https://example.org/fix.sh".to_string());
        let settings = resolve_settings_with_lookup(&config, &SettingOverrides::default(), no_env)
            .expect("resolve");
        assert_eq!(settings.permissions.policy, PermissionPolicy::Script);
    }

    #[test]
    fn invalid_env_number_is_reported() {
        let env = HashMap::from([(
            "WPMIGRATE_DOWNLOAD_TIMEOUT_SECS".to_string(),
            "soon".to_string(),
        )]);
        let error = resolve_settings_with_lookup(
            &MigrateConfig::default(),
            &SettingOverrides::default(),
            |key| env.get(key).cloned(),
        )
        .expect_err("must fail");
        assert!(error.to_string().contains("WPMIGRATE_DOWNLOAD_TIMEOUT_SECS"));
    }

    #[test]
    fn relative_target_root_is_rejected() {
        let overrides = SettingOverrides {
            target_root: Some(PathBuf::from("relative/site")),
            ..SettingOverrides::default()
        };
        let error = resolve_settings_with_lookup(&MigrateConfig::default(), &overrides, no_env)
            .expect_err("must fail");
        assert!(error.to_string().contains("absolute"));
    }

    #[test]
    fn base_path_is_normalized() {
        assert_eq!(normalize_base_path("wp-json/x/v1/"), "/wp-json/x/v1");
        assert_eq!(normalize_base_path("/wp-json/x/v1"), "/wp-json/x/v1");
    }

    #[test]
    fn permission_policy_parse_is_case_insensitive() {
        assert_eq!(PermissionPolicy::parse("Script").expect("parse"), PermissionPolicy::Script);
        assert_eq!(PermissionPolicy::parse(" direct ").expect("parse"), PermissionPolicy::Direct);
        assert!(PermissionPolicy::parse("chmod").is_err());
    }
}
