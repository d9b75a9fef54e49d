use tracing::{info, warn};

use crate::command::{Classification, CommandRunner, ProcessExecutor};
use crate::wp_cli::WpCli;

/// `http`/`https` crossed with the bare and `www.` host. A domain that
/// already carries `www.` keeps only its own two URLs.
pub fn url_variants(source_domain: &str) -> Vec<String> {
    let hosts = if source_domain.starts_with("www.") {
        vec![source_domain.to_string()]
    } else {
        vec![source_domain.to_string(), format!("www.{source_domain}")]
    };
    let mut variants = Vec::with_capacity(4);
    for scheme in ["http", "https"] {
        for host in &hosts {
            let url = format!("{scheme}://{host}");
            if !variants.contains(&url) {
                variants.push(url);
            }
        }
    }
    variants
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteReport {
    pub replaced: Vec<String>,
    pub unchanged: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
}

/// Points every source URL variant at `target_url`. No outcome here is fatal.
pub fn rewrite_urls<E: ProcessExecutor>(
    runner: &mut CommandRunner<E>,
    wp: &WpCli,
    source_domain: &str,
    target_url: &str,
) -> RewriteReport {
    let target = target_url.trim_end_matches('/');
    let mut report = RewriteReport::default();
    for variant in url_variants(source_domain) {
        if variant == target {
            info!("skipping {variant}: already the target URL");
            report.skipped.push(variant);
            continue;
        }
        match wp.search_replace(runner, &variant, target) {
            Some(result) => match result.classification {
                Classification::Success => report.replaced.push(variant),
                Classification::Benign(_) => report.unchanged.push(variant),
                Classification::HardFailure => report.failed.push(variant),
            },
            None => report.failed.push(variant),
        }
    }
    if !report.failed.is_empty() {
        warn!(
            "search-replace did not complete for: {}",
            report.failed.join(", ")
        );
    }
    report
}
