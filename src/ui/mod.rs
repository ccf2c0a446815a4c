use anyhow::Error;
use std::io::{self, Write};
use std::path::Path;
use unicode_width::UnicodeWidthChar;

use crate::core::{ClusterTarget, MitigationReport, NodeOutcome, NodeResult, NodeStatus, StatusCounts};

const MESSAGE_MAX_CHARS: usize = 96;

#[derive(Debug, Clone)]
pub struct UiConfig {
    pub color: bool,
    pub stdin_is_tty: bool,
    pub stdout_is_tty: bool,
    pub stderr_is_tty: bool,
    pub max_table_rows: usize,
    pub quiet: bool,
    pub verbose: bool,
}

pub fn eprintln_error(err: &Error) {
    let mut stderr = io::stderr().lock();
    let _ = writeln!(stderr, "error:");
    let _ = writeln!(stderr, "  {err}");

    let mut causes = err.chain().skip(1).peekable();
    if causes.peek().is_some() {
        let _ = writeln!(stderr, "caused by:");
        for cause in causes {
            let _ = writeln!(stderr, "  - {cause}");
        }
    }

    let _ = writeln!(stderr, "next:");
    let _ = writeln!(stderr, "  - re-run with `--verbose` for diagnostics");
    let _ = writeln!(stderr, "  - see `amafix --help` for commands and options");
}

pub fn print_report(report: &MitigationReport, cfg: &UiConfig, report_path: Option<&Path>) {
    if cfg.quiet {
        return;
    }
    let mut out = io::stdout().lock();
    let color = cfg.color && cfg.stdout_is_tty;

    write_results_table(&mut out, report.rows(), cfg.max_table_rows, color);
    let _ = writeln!(out);
    write_summary(&mut out, &report.summary(), color);
    if let Some(path) = report_path {
        let _ = writeln!(out, "Report: {}", path.display());
    }
}

pub fn print_node_outcome(outcome: &NodeOutcome, cfg: &UiConfig) {
    if cfg.quiet {
        return;
    }
    let color = cfg.color && cfg.stdout_is_tty;
    let mut out = io::stdout().lock();
    let _ = writeln!(out, "Status:  {}", format_status(outcome.status, color));
    let _ = writeln!(out, "Version: {}", outcome.component_version);
    let _ = writeln!(out, "Message: {}", outcome.message);
}

pub fn print_plan(clusters: &[ClusterTarget], topology: &str, channel: &str, workers: usize) {
    let mut out = io::stdout().lock();
    let _ = writeln!(out, "Plan (dry run, nothing was contacted):");
    let _ = writeln!(out, "  topology: {topology}");
    let _ = writeln!(out, "  channel:  {channel}");
    let _ = writeln!(out, "  workers:  {workers}");
    let _ = writeln!(out, "  clusters ({}):", clusters.len());
    for cluster in clusters {
        let _ = writeln!(out, "    - {cluster}");
    }
}

pub fn write_summary(out: &mut dyn Write, counts: &StatusCounts, color: bool) {
    let _ = writeln!(
        out,
        "Summary: {} {}  {} {}  {} {}  (total {})",
        format_status(NodeStatus::Success, color),
        counts.success,
        format_status(NodeStatus::Skipped, color),
        counts.skipped,
        format_status(NodeStatus::Fail, color),
        counts.fail,
        counts.total()
    );
}

pub fn write_results_table(out: &mut dyn Write, rows: &[NodeResult], limit: usize, color: bool) {
    let labels = ["Cluster", "Node", "Status", "Version", "Message"];
    let shown = &rows[..rows.len().min(limit)];

    let cluster_w = column_width(shown.iter().map(|r| r.cluster_name.as_str()), labels[0]);
    let node_w = column_width(shown.iter().map(|r| r.node_name.as_str()), labels[1]);
    let status_w = visible_width_ansi(labels[2]).max("Skipped".len());
    let version_w = column_width(shown.iter().map(|r| r.component_version.as_str()), labels[3]);

    let _ = writeln!(
        out,
        "{}  {}  {}  {}  {}",
        pad_end_display(labels[0], cluster_w),
        pad_end_display(labels[1], node_w),
        pad_end_display(labels[2], status_w),
        pad_end_display(labels[3], version_w),
        labels[4]
    );
    let _ = writeln!(
        out,
        "{}  {}  {}  {}  {}",
        "-".repeat(cluster_w),
        "-".repeat(node_w),
        "-".repeat(status_w),
        "-".repeat(version_w),
        "-".repeat(labels[4].len())
    );

    for row in shown {
        let message = single_line(&row.message);
        let _ = writeln!(
            out,
            "{}  {}  {}  {}  {}",
            pad_end_display(&row.cluster_name, cluster_w),
            pad_end_display(&row.node_name, node_w),
            pad_end_display(&format_status(row.status, color), status_w),
            pad_end_display(&row.component_version, version_w),
            truncate_middle(&message, MESSAGE_MAX_CHARS)
        );
    }

    if rows.len() > shown.len() {
        let _ = writeln!(
            out,
            "... {} more row(s) in the report file",
            rows.len() - shown.len()
        );
    }
}

fn column_width<'a>(values: impl Iterator<Item = &'a str>, label: &str) -> usize {
    values
        .map(visible_width_ansi)
        .max()
        .unwrap_or(0)
        .max(visible_width_ansi(label))
}

fn single_line(s: &str) -> String {
    s.split(['\r', '\n'])
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" / ")
}

fn truncate_middle(s: &str, max_chars: usize) -> String {
    let len = s.chars().count();
    if len <= max_chars {
        return s.to_string();
    }

    let keep = max_chars.saturating_sub(3);
    let left = keep / 2;
    let right = keep.saturating_sub(left);

    let prefix: String = s.chars().take(left).collect();
    let suffix: String = s.chars().skip(len - right).collect();

    format!("{prefix}...{suffix}")
}

fn format_status(status: NodeStatus, color: bool) -> String {
    let s = status.as_str();
    if !color {
        return s.to_string();
    }

    let code = match status {
        NodeStatus::Success => "32",
        NodeStatus::Skipped => "90",
        NodeStatus::Fail => "31",
    };
    format!("\x1b[{code}m{s}\x1b[0m")
}

fn pad_end_display(s: &str, width: usize) -> String {
    let w = visible_width_ansi(s);
    if w >= width {
        return s.to_string();
    }
    format!("{s}{}", " ".repeat(width - w))
}

fn visible_width_ansi(s: &str) -> usize {
    let mut width: usize = 0;
    let mut chars = s.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' && chars.peek() == Some(&'[') {
            let _ = chars.next();
            for ch2 in chars.by_ref() {
                if ch2 == 'm' {
                    break;
                }
            }
            continue;
        }
        width = width.saturating_add(UnicodeWidthChar::width(ch).unwrap_or(0));
    }
    width
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ClusterTarget, NodeIdentity};

    fn render(rows: &[NodeResult], limit: usize, color: bool) -> String {
        let mut buf = Vec::new();
        write_results_table(&mut buf, rows, limit, color);
        String::from_utf8(buf).expect("utf8")
    }

    fn rows() -> Vec<NodeResult> {
        let c = ClusterTarget::new("C2");
        vec![
            NodeResult::node_failure(&c, &NodeIdentity::new("n1"), "Failed to connect to node: timeout"),
            NodeResult::from_outcome(
                &c,
                &NodeIdentity::new("node-long-name"),
                NodeOutcome::skipped("AMA Extension not installed"),
            ),
        ]
    }

    #[test]
    fn table_aligns_columns_without_color() {
        let out = render(&rows(), 10, false);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 4);
        let status_col = lines[0].find("Status").expect("status header");
        assert_eq!(lines[2].find("Fail"), Some(status_col));
        assert_eq!(lines[3].find("Skipped"), Some(status_col));
        assert!(!out.contains('\x1b'));
    }

    #[test]
    fn colored_status_keeps_alignment() {
        let out = render(&rows(), 10, true);
        let lines: Vec<&str> = out.lines().collect();
        assert!(lines[2].contains("\x1b[31mFail\x1b[0m"));
        let version_col = |line: &str| visible_width_ansi(line.split("N/A").next().unwrap_or(""));
        assert_eq!(version_col(lines[2]), version_col(lines[3]));
    }

    #[test]
    fn table_reports_hidden_rows() {
        let out = render(&rows(), 1, false);
        assert!(out.contains("... 1 more row(s)"));
        assert!(!out.contains("node-long-name"));
    }

    #[test]
    fn summary_lists_each_status() {
        let mut buf = Vec::new();
        write_summary(
            &mut buf,
            &StatusCounts {
                success: 3,
                skipped: 1,
                fail: 2,
            },
            false,
        );
        assert_eq!(
            String::from_utf8(buf).expect("utf8"),
            "Summary: Success 3  Skipped 1  Fail 2  (total 6)\n"
        );
    }

    #[test]
    fn multi_line_messages_are_flattened() {
        assert_eq!(single_line("a\r\n\r\nb\n"), "a / b");
        assert_eq!(truncate_middle("abcdefghij", 7), "ab...ij");
    }
}
