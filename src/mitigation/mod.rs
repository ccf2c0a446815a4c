//! Per-node decision engine.
//!
//! Each step either hands a typed value to the next step or ends the run with
//! a terminal [`NodeOutcome`]; `Err` carries the terminal outcome whether it is
//! a success, a skip or a failure. Steps run strictly in order on one thread.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::{ComponentLayout, ComponentVersion, MITIGATION_THRESHOLD, NodeOutcome};
use crate::locator::{InstallRoot, LocateTrace, Located, Locator};
use crate::platform::{CancelToken, NodeHost};

pub const RENAMED_SUFFIX: &str = ".org";
pub const NOT_INSTALLED_MESSAGE: &str = "AMA Extension not installed";

type Step<T> = Result<T, NodeOutcome>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MitigationSettings {
    pub layout: ComponentLayout,
    pub stop_settle: Duration,
}

impl Default for MitigationSettings {
    fn default() -> Self {
        Self {
            layout: ComponentLayout::default(),
            stop_settle: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPaths {
    pub source: PathBuf,
    pub renamed: PathBuf,
}

impl TargetPaths {
    pub fn compute(root: &Path, relative: &str) -> Result<Self, String> {
        if relative.trim().is_empty() {
            return Err("executable path is empty".to_string());
        }

        let segments: Vec<&str> = relative.split(['/', '\\']).collect();
        for segment in &segments {
            if segment.is_empty() || *segment == "." || *segment == ".." || segment.contains(':') {
                return Err(format!(
                    "invalid segment {segment:?} in executable path {relative:?}"
                ));
            }
        }

        let Some(file_name) = segments.last() else {
            return Err("executable path is empty".to_string());
        };
        let source = segments
            .iter()
            .fold(root.to_path_buf(), |acc, segment| acc.join(segment));
        let renamed = source.with_file_name(format!("{file_name}{RENAMED_SUFFIX}"));

        Ok(Self { source, renamed })
    }
}

pub struct MitigationEngine<'h> {
    host: &'h dyn NodeHost,
    settings: MitigationSettings,
    locator: Locator,
    abort: Option<CancelToken>,
}

impl<'h> MitigationEngine<'h> {
    pub fn new(host: &'h dyn NodeHost, settings: MitigationSettings) -> Self {
        let locator = Locator::standard(&settings.layout, settings.stop_settle);
        Self::with_locator(host, settings, locator)
    }

    pub fn with_locator(
        host: &'h dyn NodeHost,
        settings: MitigationSettings,
        locator: Locator,
    ) -> Self {
        Self {
            host,
            settings,
            locator,
            abort: None,
        }
    }

    /// Once `abort` fires, no process is stopped and no file is renamed.
    pub fn with_abort(mut self, abort: CancelToken) -> Self {
        self.abort = Some(abort);
        self
    }

    pub fn run(&self) -> NodeOutcome {
        let mut trace = LocateTrace::default();
        let outcome = match self.evaluate(&mut trace) {
            Ok(outcome) | Err(outcome) => outcome,
        };
        tracing::info!(
            status = %outcome.status,
            version = %outcome.component_version,
            stopped = trace.stopped.len(),
            "{}",
            outcome.message
        );
        outcome
    }

    fn evaluate(&self, trace: &mut LocateTrace) -> Step<NodeOutcome> {
        self.check_abort("stopping processes", None)?;
        let root = self.resolve_install_root(trace)?;
        let version = self.parse_version(&root)?;
        self.gate(version)?;
        let targets = self.target_paths(&root, version)?;
        self.check_idempotency(&targets, version)?;
        self.check_abort("rename", Some(version))?;
        self.rename(&targets, version)?;
        Ok(self.verify(&targets, version, trace))
    }

    fn check_abort(&self, before: &str, version: Option<ComponentVersion>) -> Step<()> {
        match &self.abort {
            Some(abort) if abort.is_cancelled() => Err(NodeOutcome::fail(
                format!("Mitigation aborted before {before}"),
                version,
            )),
            _ => Ok(()),
        }
    }

    fn resolve_install_root(&self, trace: &mut LocateTrace) -> Step<InstallRoot> {
        match self.locator.locate(self.host, trace) {
            Ok(Located::Root(root)) => Ok(root),
            Ok(Located::NotInstalled) => Err(NodeOutcome::skipped(NOT_INSTALLED_MESSAGE)),
            Ok(Located::NotFound) => Err(NodeOutcome::fail(
                "Unable to determine installation folder",
                None,
            )),
            Err(err) => Err(NodeOutcome::fail(err.to_string(), None)),
        }
    }

    fn parse_version(&self, root: &InstallRoot) -> Step<ComponentVersion> {
        let Some(folder) = root.folder_name() else {
            return Err(NodeOutcome::fail(
                format!(
                    "Unable to determine version from folder name: {}",
                    root.path.display()
                ),
                None,
            ));
        };
        folder
            .parse::<ComponentVersion>()
            .map_err(|err| NodeOutcome::fail(err.to_string(), None))
    }

    fn gate(&self, version: ComponentVersion) -> Step<()> {
        if version.requires_mitigation() {
            return Ok(());
        }
        Err(NodeOutcome::success(
            format!("No mitigation needed: version {version} is at or above {MITIGATION_THRESHOLD}"),
            Some(version),
        ))
    }

    fn target_paths(&self, root: &InstallRoot, version: ComponentVersion) -> Step<TargetPaths> {
        TargetPaths::compute(&root.path, &self.settings.layout.executable_relative_path).map_err(
            |err| NodeOutcome::fail(format!("Failed to build target path: {err}"), Some(version)),
        )
    }

    fn check_idempotency(&self, targets: &TargetPaths, version: ComponentVersion) -> Step<()> {
        if self.host.exists(&targets.source) {
            return Ok(());
        }
        if self.host.exists(&targets.renamed) {
            return Err(NodeOutcome::success(
                format!(
                    "Mitigation already applied: {} exists",
                    targets.renamed.display()
                ),
                Some(version),
            ));
        }
        Err(NodeOutcome::fail(
            format!(
                "Neither {} nor {} found; cannot mitigate",
                targets.source.display(),
                targets.renamed.display()
            ),
            Some(version),
        ))
    }

    fn rename(&self, targets: &TargetPaths, version: ComponentVersion) -> Step<()> {
        self.host
            .rename(&targets.source, &targets.renamed)
            .map_err(|err| {
                NodeOutcome::fail(
                    format!(
                        "Failed to rename {} to {}: {err}",
                        targets.source.display(),
                        targets.renamed.display()
                    ),
                    Some(version),
                )
            })
    }

    fn verify(
        &self,
        targets: &TargetPaths,
        version: ComponentVersion,
        trace: &LocateTrace,
    ) -> NodeOutcome {
        if !self.host.exists(&targets.renamed) {
            return NodeOutcome::fail(
                format!(
                    "Rename did not verify: {} not found",
                    targets.renamed.display()
                ),
                Some(version),
            );
        }

        let mut message = format!(
            "Mitigation applied: renamed {} to {}",
            file_name(&targets.source),
            file_name(&targets.renamed)
        );
        if !trace.stopped.is_empty() {
            message.push_str(&format!(
                " after stopping {} process(es)",
                trace.stopped.len()
            ));
        }
        NodeOutcome::success(message, Some(version))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeStatus;
    use crate::platform::testing::FakeHost;

    const PLUGIN_ROOT: &str = "/packages/plugins/ama";
    const REL: &str = "Monitoring/Agent/MetricsExtension.Native.exe";

    fn settings() -> MitigationSettings {
        MitigationSettings {
            layout: ComponentLayout {
                monitored_executable: "MetricsExtension.Native.exe".to_string(),
                health_monitor_executable: "AMAExtHealthMonitor.exe".to_string(),
                plugin_root: PathBuf::from(PLUGIN_ROOT),
                executable_relative_path: REL.to_string(),
            },
            stop_settle: Duration::from_millis(1500),
        }
    }

    fn source(version: &str) -> PathBuf {
        PathBuf::from(PLUGIN_ROOT)
            .join(version)
            .join("Monitoring/Agent/MetricsExtension.Native.exe")
    }

    fn renamed(version: &str) -> PathBuf {
        PathBuf::from(PLUGIN_ROOT)
            .join(version)
            .join("Monitoring/Agent/MetricsExtension.Native.exe.org")
    }

    fn run(host: &FakeHost) -> NodeOutcome {
        MitigationEngine::new(host, settings()).run()
    }

    #[test]
    fn not_installed_without_process_or_directory() {
        let outcome = run(&FakeHost::new());
        assert_eq!(outcome.status, NodeStatus::Skipped);
        assert_eq!(outcome.message, "AMA Extension not installed");
        assert_eq!(outcome.component_version, "N/A");
    }

    #[test]
    fn stops_process_and_renames_affected_version() {
        let host = FakeHost::new()
            .with_process(
                100,
                Some(4),
                "AMAExtHealthMonitor.exe",
                Some("/packages/plugins/ama/1.39.0.0/bin/AMAExtHealthMonitor.exe"),
            )
            .with_process(101, Some(100), "MetricsExtension.Native.exe", None)
            .with_file(source("1.39.0.0"));

        let outcome = run(&host);
        assert_eq!(outcome.status, NodeStatus::Success, "{}", outcome.message);
        assert_eq!(outcome.component_version, "1.39.0.0");
        assert!(outcome.message.contains("renamed MetricsExtension.Native.exe to MetricsExtension.Native.exe.org"));
        assert!(outcome.message.contains("1 process(es)"));
        assert_eq!(host.terminated(), vec![101]);
        assert!(!host.has_file(source("1.39.0.0")));
        assert!(host.has_file(renamed("1.39.0.0")));
    }

    #[test]
    fn fixed_version_needs_no_mitigation_regardless_of_files() {
        let host = FakeHost::new().with_subdirectories(PLUGIN_ROOT, &["1.41.0.0"]);
        let outcome = run(&host);
        assert_eq!(outcome.status, NodeStatus::Success);
        assert!(outcome.message.starts_with("No mitigation needed"));
        assert_eq!(outcome.component_version, "1.41.0.0");
        assert!(host.renames().is_empty());
    }

    #[test]
    fn version_just_below_threshold_proceeds_to_mitigation() {
        let host = FakeHost::new()
            .with_subdirectories(PLUGIN_ROOT, &["1.40.0.0"])
            .with_file(source("1.40.0.0"));
        let outcome = run(&host);
        assert_eq!(outcome.status, NodeStatus::Success);
        assert!(outcome.message.starts_with("Mitigation applied"));
        assert_eq!(host.renames().len(), 1);
    }

    #[test]
    fn neither_file_present_fails() {
        let host = FakeHost::new().with_subdirectories(PLUGIN_ROOT, &["1.39.0.0"]);
        let outcome = run(&host);
        assert_eq!(outcome.status, NodeStatus::Fail);
        assert!(outcome.message.starts_with("Neither"));
        assert!(outcome.message.contains("cannot mitigate"));
        assert_eq!(outcome.component_version, "1.39.0.0");
        assert!(host.renames().is_empty());
    }

    #[test]
    fn second_run_is_idempotent_and_does_not_rename_again() {
        let host = FakeHost::new()
            .with_subdirectories(PLUGIN_ROOT, &["1.39.0.0"])
            .with_file(source("1.39.0.0"));

        let first = run(&host);
        let second = run(&host);

        assert_eq!(first.status, NodeStatus::Success);
        assert_eq!(second.status, NodeStatus::Success);
        assert!(second.message.starts_with("Mitigation already applied"));
        assert_eq!(host.renames().len(), 1);
    }

    #[test]
    fn unparseable_folder_name_fails_without_version() {
        let host = FakeHost::new().with_subdirectories(PLUGIN_ROOT, &["current"]);
        let outcome = run(&host);
        assert_eq!(outcome.status, NodeStatus::Fail);
        assert_eq!(
            outcome.message,
            "Unable to determine version from folder name: current"
        );
        assert_eq!(outcome.component_version, "N/A");
    }

    #[test]
    fn stop_failure_fails_before_version_is_known() {
        let host = FakeHost::new()
            .with_process(100, Some(4), "AMAExtHealthMonitor.exe", Some("/packages/plugins/ama/1.39.0.0/bin/AMAExtHealthMonitor.exe"))
            .with_process(101, Some(100), "MetricsExtension.Native.exe", None)
            .with_file(source("1.39.0.0"))
            .failing_terminate();
        let outcome = run(&host);
        assert_eq!(outcome.status, NodeStatus::Fail);
        assert!(outcome.message.starts_with("Failed to stop process"));
        assert_eq!(outcome.component_version, "N/A");
        assert!(host.renames().is_empty());
    }

    #[test]
    fn rename_error_surfaces_os_text() {
        let host = FakeHost::new()
            .with_subdirectories(PLUGIN_ROOT, &["1.39.0.0"])
            .with_file(source("1.39.0.0"))
            .failing_rename(std::io::ErrorKind::PermissionDenied);
        let outcome = run(&host);
        assert_eq!(outcome.status, NodeStatus::Fail);
        assert!(outcome.message.starts_with("Failed to rename"));
        assert!(outcome.message.contains("The process cannot access the file"));
        assert_eq!(outcome.component_version, "1.39.0.0");
    }

    #[test]
    fn rename_that_leaves_no_sibling_does_not_verify() {
        let host = FakeHost::new()
            .with_subdirectories(PLUGIN_ROOT, &["1.39.0.0"])
            .with_file(source("1.39.0.0"))
            .rename_without_effect();
        let outcome = run(&host);
        assert_eq!(outcome.status, NodeStatus::Fail);
        assert!(outcome.message.starts_with("Rename did not verify"));
    }

    #[test]
    fn bad_relative_path_fails_with_known_version() {
        let host = FakeHost::new().with_subdirectories(PLUGIN_ROOT, &["1.39.0.0"]);
        let mut s = settings();
        s.layout.executable_relative_path = "../outside.exe".to_string();
        let outcome = MitigationEngine::new(&host, s).run();
        assert_eq!(outcome.status, NodeStatus::Fail);
        assert!(outcome.message.starts_with("Failed to build target path"));
        assert_eq!(outcome.component_version, "1.39.0.0");
    }

    #[test]
    fn aborted_engine_touches_nothing() {
        let host = FakeHost::new()
            .with_process(
                100,
                Some(4),
                "AMAExtHealthMonitor.exe",
                Some("/packages/plugins/ama/1.39.0.0/bin/AMAExtHealthMonitor.exe"),
            )
            .with_process(101, Some(100), "MetricsExtension.Native.exe", None)
            .with_file(source("1.39.0.0"));
        let abort = CancelToken::new();
        abort.cancel();

        let outcome = MitigationEngine::new(&host, settings()).with_abort(abort).run();
        assert_eq!(outcome.status, NodeStatus::Fail);
        assert!(outcome.message.starts_with("Mitigation aborted"));
        assert!(host.terminated().is_empty());
        assert!(host.renames().is_empty());
        assert!(host.has_file(source("1.39.0.0")));
    }

    #[test]
    fn target_paths_append_suffix_to_file_name() {
        let paths = TargetPaths::compute(Path::new("/root/1.39.0.0"), r"Monitoring\Agent\x.exe")
            .expect("compute");
        assert_eq!(paths.source, PathBuf::from("/root/1.39.0.0/Monitoring/Agent/x.exe"));
        assert_eq!(paths.renamed, PathBuf::from("/root/1.39.0.0/Monitoring/Agent/x.exe.org"));
    }

    #[test]
    fn target_paths_reject_empty_absolute_and_drive_paths() {
        let root = Path::new("/root/1.39.0.0");
        assert!(TargetPaths::compute(root, "").is_err());
        assert!(TargetPaths::compute(root, "/abs/x.exe").is_err());
        assert!(TargetPaths::compute(root, "a//x.exe").is_err());
        assert!(TargetPaths::compute(root, r"C:\x.exe").is_err());
        assert!(TargetPaths::compute(root, "a/").is_err());
    }
}
