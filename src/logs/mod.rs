use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::EnvFilter;

use crate::core::{ClusterTarget, MitigationReport, NodeResult, StatusCounts};

#[derive(Debug, Serialize)]
struct RunLog<'a> {
    schema_version: &'static str,
    tool_version: String,
    command: &'static str,
    started_at: String,
    finished_at: String,
    status: &'static str,
    clusters: Vec<&'a str>,
    summary: StatusCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    report_path: Option<String>,
    rows: &'a [NodeResult],
}

/// Installs the stderr diagnostics subscriber. `RUST_LOG` wins when set.
pub fn init_tracing(verbose: bool, quiet: bool) {
    let default_level = if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

pub fn logs_dir(home_dir: &Path) -> PathBuf {
    home_dir.join(".config/amafix/logs")
}

pub fn write_run_log(
    home_dir: &Path,
    started_at: OffsetDateTime,
    finished_at: OffsetDateTime,
    clusters: &[ClusterTarget],
    report: &MitigationReport,
    report_path: Option<&Path>,
) -> Result<PathBuf> {
    let dir = logs_dir(home_dir);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory: {}", dir.display()))?;

    let pid = std::process::id();
    let ts = finished_at.unix_timestamp_nanos();
    let path = dir.join(format!("run-{pid}-{ts}.json"));

    let log = RunLog {
        schema_version: "1.0",
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
        command: "run",
        started_at: started_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| "unknown".to_string()),
        finished_at: finished_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| "unknown".to_string()),
        status: if report.has_failures() {
            "completed_with_failures"
        } else {
            "ok"
        },
        clusters: clusters.iter().map(ClusterTarget::as_str).collect(),
        summary: report.summary(),
        report_path: report_path.map(|p| p.display().to_string()),
        rows: report.rows(),
    };

    let buf = serde_json::to_vec_pretty(&log).context("failed to serialize run log (JSON)")?;
    std::fs::write(&path, buf)
        .with_context(|| format!("failed to write run log: {}", path.display()))?;
    tracing::debug!(path = %path.display(), "run log written");
    Ok(path)
}
