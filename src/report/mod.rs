//! Tabular report persistence.
//!
//! Column names and order are consumed by downstream tooling and must not change.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use time::OffsetDateTime;

use crate::core::{MitigationReport, NodeResult, NodeStatus};

pub const CSV_COLUMNS: [&str; 5] = [
    "ClusterName",
    "NodeName",
    "Status",
    "Message",
    "ComponentVersion",
];

const LINE_END: &str = "\r\n";

/// Receives the finalized report.
pub trait ReportSink {
    fn write(&self, report: &MitigationReport) -> Result<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct CsvReportSink {
    path: PathBuf,
}

impl CsvReportSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReportSink for CsvReportSink {
    fn write(&self, report: &MitigationReport) -> Result<PathBuf> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create report directory: {}", parent.display()))?;
        }
        let mut file = std::fs::File::create(&self.path)
            .with_context(|| format!("failed to create report: {}", self.path.display()))?;
        write_csv(&mut file, report)
            .with_context(|| format!("failed to write report: {}", self.path.display()))?;
        file.flush()
            .with_context(|| format!("failed to write report: {}", self.path.display()))?;
        tracing::info!(path = %self.path.display(), rows = report.len(), "report written");
        Ok(self.path.clone())
    }
}

/// `AMAMitigationReport-<YYYYMMDD-HHMMSS>.csv` under `dir`.
pub fn default_report_path(dir: &Path, at: OffsetDateTime) -> PathBuf {
    let fmt = time::macros::format_description!("[year][month][day]-[hour][minute][second]");
    let stamp = at
        .format(fmt)
        .unwrap_or_else(|_| at.unix_timestamp().to_string());
    dir.join(format!("AMAMitigationReport-{stamp}.csv"))
}

pub fn write_csv<W: Write>(out: &mut W, report: &MitigationReport) -> std::io::Result<()> {
    write_record(out, &CSV_COLUMNS)?;
    for row in report.rows() {
        write_record(
            out,
            &[
                row.cluster_name.as_str(),
                row.node_name.as_str(),
                row.status.as_str(),
                row.message.as_str(),
                row.component_version.as_str(),
            ],
        )?;
    }
    Ok(())
}

pub fn to_csv(report: &MitigationReport) -> String {
    let mut buf = Vec::new();
    // Writing into a Vec cannot fail.
    let _ = write_csv(&mut buf, report);
    String::from_utf8_lossy(&buf).into_owned()
}

fn write_record<W: Write>(out: &mut W, fields: &[&str]) -> std::io::Result<()> {
    let line = fields
        .iter()
        .map(|f| quote(f))
        .collect::<Vec<_>>()
        .join(",");
    out.write_all(line.as_bytes())?;
    out.write_all(LINE_END.as_bytes())
}

fn quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

pub fn read_report(path: &Path) -> Result<MitigationReport> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read report: {}", path.display()))?;
    parse_csv(&text).with_context(|| format!("invalid report: {}", path.display()))
}

pub fn parse_csv(text: &str) -> Result<MitigationReport> {
    let mut records = parse_records(text)?.into_iter();
    let Some(header) = records.next() else {
        bail!("report is empty");
    };
    let header: Vec<&str> = header.iter().map(|h| h.trim()).collect();
    if header != CSV_COLUMNS {
        bail!(
            "unexpected header: {} (expected {})",
            header.join(","),
            CSV_COLUMNS.join(",")
        );
    }

    let mut rows = Vec::new();
    for (idx, record) in records.enumerate() {
        let row_no = idx + 2;
        let [cluster, node, status, message, version]: [String; 5] =
            record.try_into().map_err(|r: Vec<String>| {
                anyhow::anyhow!("record {row_no}: expected 5 fields, found {}", r.len())
            })?;
        let status = status
            .parse::<NodeStatus>()
            .map_err(|e| anyhow::anyhow!("record {row_no}: {e}"))?;
        rows.push(NodeResult {
            cluster_name: cluster,
            node_name: node,
            status,
            message,
            component_version: version,
        });
    }
    Ok(rows.into_iter().collect())
}

/// Splits CSV text into records. Quoted fields may hold separators, quotes
/// and line breaks; blank lines are skipped.
pub(crate) fn parse_records(text: &str) -> Result<Vec<Vec<String>>> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut quoted = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
            continue;
        }

        match c {
            '"' if field.is_empty() && !quoted => {
                in_quotes = true;
                quoted = true;
            }
            ',' => {
                record.push(std::mem::take(&mut field));
                quoted = false;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\r' | '\n' => {
                end_record(&mut records, &mut record, &mut field, quoted);
                quoted = false;
            }
            other => field.push(other),
        }
    }

    if in_quotes {
        bail!("unterminated quoted field");
    }
    end_record(&mut records, &mut record, &mut field, quoted);
    Ok(records)
}

fn end_record(
    records: &mut Vec<Vec<String>>,
    record: &mut Vec<String>,
    field: &mut String,
    quoted: bool,
) {
    if record.is_empty() && field.is_empty() && !quoted {
        return;
    }
    record.push(std::mem::take(field));
    records.push(std::mem::take(record));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ClusterTarget, NodeIdentity, NodeOutcome};

    fn sample() -> MitigationReport {
        let c1 = ClusterTarget::new("C1");
        let c2 = ClusterTarget::new("C2");
        vec![
            NodeResult::cluster_unavailable(&c1, "Unable to reach cluster: RPC server unavailable"),
            NodeResult::from_outcome(
                &c2,
                &NodeIdentity::new("n1"),
                NodeOutcome::success(
                    "Mitigation applied: renamed \"a.exe\", then verified",
                    Some("1.39.0.0".parse().expect("version")),
                ),
            ),
            NodeResult::node_failure(&c2, &NodeIdentity::new("n2"), "line one\nline two"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn header_is_quoted_with_crlf() {
        let csv = to_csv(&MitigationReport::default());
        assert_eq!(
            csv,
            "\"ClusterName\",\"NodeName\",\"Status\",\"Message\",\"ComponentVersion\"\r\n"
        );
    }

    #[test]
    fn rows_quote_every_field_and_double_embedded_quotes() {
        let csv = to_csv(&sample());
        assert!(csv.contains(
            "\"C2\",\"n1\",\"Success\",\"Mitigation applied: renamed \"\"a.exe\"\", then verified\",\"1.39.0.0\"\r\n"
        ));
        assert!(csv.contains("\"C1\",\"C1 (cluster unavailable)\",\"Fail\","));
    }

    #[test]
    fn written_report_reads_back_identically() {
        let report = sample();
        let parsed = parse_csv(&to_csv(&report)).expect("parse");
        assert_eq!(parsed, report);
    }

    #[test]
    fn reader_accepts_unquoted_lf_files() {
        let text = "ClusterName,NodeName,Status,Message,ComponentVersion\nC,n1,Skipped,AMA Extension not installed,N/A\n\n";
        let parsed = parse_csv(text).expect("parse");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.rows()[0].status, NodeStatus::Skipped);
        assert_eq!(parsed.rows()[0].component_version, "N/A");
    }

    #[test]
    fn reader_rejects_other_headers() {
        let err = parse_csv("Cluster,Node,Status,Message,Version\r\n").expect_err("bad header");
        assert!(err.to_string().contains("unexpected header"));
        assert!(parse_csv("").is_err());
    }

    #[test]
    fn reader_rejects_short_records_and_bad_status() {
        let header = "\"ClusterName\",\"NodeName\",\"Status\",\"Message\",\"ComponentVersion\"\r\n";
        assert!(parse_csv(&format!("{header}\"C\",\"n1\"\r\n")).is_err());
        assert!(parse_csv(&format!("{header}\"C\",\"n1\",\"OK\",\"m\",\"N/A\"\r\n")).is_err());
        assert!(parse_csv(&format!("{header}\"C,\"n1\r\n")).is_err());
    }

    #[test]
    fn default_path_uses_timestamp() {
        let at = time::macros::datetime!(2024-03-05 07:08:09 UTC);
        let path = default_report_path(Path::new("out"), at);
        assert_eq!(path, Path::new("out").join("AMAMitigationReport-20240305-070809.csv"));
    }

    #[test]
    fn sink_writes_file_that_reads_back() {
        let dir = std::env::temp_dir().join(format!("amafix-report-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let path = CsvReportSink::new(dir.join("nested").join("r.csv"))
            .write(&sample())
            .expect("write");
        assert_eq!(read_report(&path).expect("read"), sample());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
