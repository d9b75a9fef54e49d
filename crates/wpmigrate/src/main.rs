use std::env;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::error;
use tracing_subscriber::EnvFilter;
use wpmigrate_core::command::{CommandRunner, SystemExecutor};
use wpmigrate_core::config::{
    MigrateConfig, PermissionPolicy, SettingOverrides, Settings, load_config, resolve_config_path,
    resolve_settings,
};
use wpmigrate_core::pipeline::{MigrationReport, Pipeline};
use wpmigrate_core::remote::HttpRemote;
use wpmigrate_core::runtime::MigrationContext;

#[derive(Debug, Parser)]
#[command(
    name = "wpmigrate",
    version,
    about = "Replace this host's WordPress site with a backup pulled from an izolka-migrate source"
)]
struct Cli {
    /// Source site domain, e.g. example.com
    #[arg(required_unless_present = "diagnostics")]
    source_domain: Option<String>,
    /// API key configured in the source site's izolka-migrate plugin
    #[arg(required_unless_present = "diagnostics")]
    api_key: Option<String>,
    #[arg(long, value_name = "PATH", help = "WordPress root to overwrite")]
    target_root: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, value_name = "PROGRAM", help = "WP-CLI executable name or path")]
    wp_cli: Option<String>,
    #[arg(long, value_name = "POLICY", help = "Permission policy: direct or script")]
    permissions: Option<String>,
    #[arg(short, long, action = ArgAction::Count, help = "More log output (-vv for trace)")]
    verbose: u8,
    #[arg(short, long, conflicts_with = "verbose", help = "Only warnings and errors")]
    quiet: bool,
    #[arg(long, help = "Print resolved settings")]
    diagnostics: bool,
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let default_level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = if verbose > 0 || quiet {
        EnvFilter::new(default_level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let settings = resolve_runtime_settings(&cli)?;
    if cli.diagnostics {
        println!("{}", settings.diagnostics());
    }
    let (Some(source_domain), Some(api_key)) = (cli.source_domain, cli.api_key) else {
        return Ok(());
    };

    let context = MigrationContext::new(&source_domain, &api_key, &settings, env::var_os("PATH"))?;
    let mut remote = HttpRemote::new(&settings.remote, &context.source_domain, &context.api_key)?;
    let mut runner = CommandRunner::new(SystemExecutor);
    let mut stdout = io::stdout();

    let pipeline = Pipeline::new(&settings, context, &mut runner, &mut remote, &mut stdout);
    match pipeline.run() {
        Ok(report) => {
            print_summary(&report);
            Ok(())
        }
        Err(failure) => {
            if let Some(temp_dir) = &failure.temp_dir {
                error!("temporary files kept in {}", temp_dir.display());
            }
            Err(failure.into())
        }
    }
}

fn resolve_runtime_settings(cli: &Cli) -> Result<Settings> {
    let config = match resolve_config_path(cli.config.as_deref()) {
        Some(path) => load_config(&path)?,
        None => MigrateConfig::default(),
    };
    let permission_policy = cli
        .permissions
        .as_deref()
        .map(PermissionPolicy::parse)
        .transpose()
        .context("invalid --permissions value")?;
    let overrides = SettingOverrides {
        target_root: cli.target_root.clone(),
        wp_cli: cli.wp_cli.clone(),
        permission_policy,
    };
    resolve_settings(&config, &overrides)
}

fn print_summary(report: &MigrationReport) {
    let rule = "-".repeat(51);
    println!();
    println!("{rule}");
    println!("Migration complete.");
    println!("The target site should now be served at: {}", report.target_url);
    println!(
        "Backup {}: {} bytes, sha256 {}",
        report.backup_filename, report.archive.bytes_written, report.archive.sha256
    );
    println!(
        "URL rewrite: {} replaced, {} unchanged, {} failed",
        report.rewrite.replaced.len(),
        report.rewrite.unchanged.len(),
        report.rewrite.failed.len()
    );
    if !report.rewrite.failed.is_empty() {
        println!(
            "Replace these by hand with `wp search-replace`: {}",
            report.rewrite.failed.join(", ")
        );
    }
    println!("Check the site and the server logs before sending traffic to it.");
    println!("{rule}");
}
