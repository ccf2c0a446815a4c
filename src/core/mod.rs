mod layout;
mod node_result;
mod process;
mod report;
mod target;
mod version;

pub use layout::ComponentLayout;
pub use node_result::{NodeOutcome, NodeResult, NodeStatus, VERSION_NOT_AVAILABLE};
pub use process::{ParentProcess, ProcessEntry, ProcessObservation, observe};
pub use report::{MitigationReport, ReportBuilder, StatusCounts};
pub use target::{ClusterTarget, NodeIdentity};
pub use version::{
    ComponentVersion, MITIGATION_THRESHOLD, VersionParseError, compare, parse_version,
};
