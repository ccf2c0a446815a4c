use serde::{Deserialize, Serialize};

use crate::core::{NodeResult, NodeStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub success: usize,
    pub skipped: usize,
    pub fail: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.success + self.skipped + self.fail
    }
}

/// Finalized, ordered report rows. Built through [`ReportBuilder`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MitigationReport {
    rows: Vec<NodeResult>,
}

impl MitigationReport {
    pub fn rows(&self) -> &[NodeResult] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn summary(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for row in &self.rows {
            match row.status {
                NodeStatus::Success => counts.success += 1,
                NodeStatus::Skipped => counts.skipped += 1,
                NodeStatus::Fail => counts.fail += 1,
            }
        }
        counts
    }

    pub fn has_failures(&self) -> bool {
        self.rows.iter().any(|r| r.status == NodeStatus::Fail)
    }
}

#[derive(Debug, Default)]
pub struct ReportBuilder {
    rows: Vec<NodeResult>,
}

impl ReportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, row: NodeResult) {
        self.rows.push(row);
    }

    pub fn finish(self) -> MitigationReport {
        MitigationReport { rows: self.rows }
    }
}

impl FromIterator<NodeResult> for MitigationReport {
    fn from_iter<T: IntoIterator<Item = NodeResult>>(iter: T) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}
