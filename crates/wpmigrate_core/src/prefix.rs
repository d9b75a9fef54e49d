use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use tracing::{info, warn};

fn table_prefix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$table_prefix\s*=\s*'([^']+)';").expect("table prefix pattern is valid")
    })
}

pub fn parse_table_prefix(config: &str) -> Option<String> {
    table_prefix_pattern()
        .captures(config)
        .and_then(|captures| captures.get(1))
        .map(|value| value.as_str().to_string())
}

pub fn read_table_prefix(config_path: &Path) -> Result<Option<String>> {
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    Ok(parse_table_prefix(&content))
}

/// Replaces the first assignment line, keeping every other byte of the file.
/// `None` when no line carries an assignment.
pub fn rewrite_table_prefix(config: &str, prefix: &str) -> Option<String> {
    let pattern = table_prefix_pattern();
    let mut replaced = false;
    let mut output = String::with_capacity(config.len() + prefix.len());
    for line in config.split_inclusive('\n') {
        if !replaced && pattern.is_match(line) {
            let body = line.trim_end_matches(['\r', '\n']);
            let ending = &line[body.len()..];
            output.push_str(&format!("$table_prefix = '{prefix}';"));
            output.push_str(ending);
            replaced = true;
        } else {
            output.push_str(line);
        }
    }
    replaced.then_some(output)
}

pub fn write_table_prefix(config_path: &Path, prefix: &str) -> Result<()> {
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let Some(updated) = rewrite_table_prefix(&content, prefix) else {
        bail!(
            "{} has no `$table_prefix` assignment to update",
            config_path.display()
        );
    };
    fs::write(config_path, updated)
        .with_context(|| format!("failed to write {}", config_path.display()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefixOutcome {
    BackupConfigMissing,
    BackupPrefixUnreadable,
    AlreadyMatching(String),
    Updated { from: Option<String>, to: String },
}

/// Makes the target configuration use the table prefix the imported data
/// was written with.
pub fn reconcile_table_prefix(backup_config: &Path, target_config: &Path) -> Result<PrefixOutcome> {
    if !backup_config.is_file() {
        warn!(
            "backup has no {}; keeping the target table prefix",
            backup_config.display()
        );
        return Ok(PrefixOutcome::BackupConfigMissing);
    }
    let Some(backup_prefix) = read_table_prefix(backup_config)? else {
        warn!("could not read the table prefix from the backup configuration");
        return Ok(PrefixOutcome::BackupPrefixUnreadable);
    };
    let target_prefix = read_table_prefix(target_config)?;
    if target_prefix.as_deref() == Some(backup_prefix.as_str()) {
        info!("table prefix already `{backup_prefix}`");
        return Ok(PrefixOutcome::AlreadyMatching(backup_prefix));
    }

    write_table_prefix(target_config, &backup_prefix)
        .context("could not align the target table prefix with the imported database")?;
    info!(
        "table prefix changed from `{}` to `{backup_prefix}`",
        target_prefix.as_deref().unwrap_or("<none>")
    );
    Ok(PrefixOutcome::Updated {
        from: target_prefix,
        to: backup_prefix,
    })
}
