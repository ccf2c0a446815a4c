use std::path::Path;

use anyhow::{Context, Result};

const CLUSTER_COLUMN: &str = "ClusterName";

pub(crate) fn read_cluster_file(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read cluster list: {}", path.display()))?;
    parse_cluster_list(&text).with_context(|| format!("invalid cluster list: {}", path.display()))
}

/// A CSV whose header has a `ClusterName` column, or one name per line.
pub(crate) fn parse_cluster_list(text: &str) -> Result<Vec<String>> {
    let records = crate::report::parse_records(text)?;
    let Some(header) = records.first() else {
        return Ok(Vec::new());
    };

    let column = header
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case(CLUSTER_COLUMN));
    let names = match column {
        Some(idx) => records[1..]
            .iter()
            .filter_map(|r| r.get(idx))
            .map(|n| n.trim().to_string())
            .collect::<Vec<_>>(),
        None => text
            .trim_start_matches('\u{feff}')
            .lines()
            .map(|l| l.trim().trim_matches('"').trim().to_string())
            .filter(|l| !l.starts_with('#'))
            .collect(),
    };
    Ok(names.into_iter().filter(|n| !n.is_empty()).collect())
}
