//! Install-root resolution.
//!
//! Resolvers run in order and the first one that finds a root wins. The
//! process-derived resolver runs first and the plugin directory scan is the
//! fallback.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::{ComponentLayout, ComponentVersion, ProcessObservation, observe};
use crate::platform::NodeHost;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootSource {
    ProcessAnchor { anchor: PathBuf },
    DirectoryScan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRoot {
    pub path: PathBuf,
    pub source: RootSource,
}

impl InstallRoot {
    pub fn folder_name(&self) -> Option<String> {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(InstallRoot),
    NotInstalled,
    NoMatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Located {
    Root(InstallRoot),
    NotInstalled,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoppedProcess {
    pub pid: u32,
    pub name: String,
}

/// Side effects resolvers performed while looking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocateTrace {
    pub stopped: Vec<StoppedProcess>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocateError {
    #[error("Unable to enumerate processes: {0}")]
    ProcessQuery(String),
    #[error("Failed to stop process {name} (PID {pid}): {detail}")]
    StopFailed {
        name: String,
        pid: u32,
        detail: String,
    },
    #[error("Unable to determine installation folder: {0}")]
    DirectoryScan(String),
}

pub trait InstallRootResolver {
    fn name(&self) -> &'static str;

    fn resolve(
        &self,
        host: &dyn NodeHost,
        trace: &mut LocateTrace,
    ) -> Result<Resolution, LocateError>;
}

pub type BoxedResolver = Box<dyn InstallRootResolver + Send + Sync>;

pub struct Locator {
    resolvers: Vec<BoxedResolver>,
}

impl Locator {
    pub fn new(resolvers: Vec<BoxedResolver>) -> Self {
        Self { resolvers }
    }

    pub fn standard(layout: &ComponentLayout, stop_settle: Duration) -> Self {
        Self::new(vec![
            Box::new(ProcessAnchorResolver {
                monitored_executable: layout.monitored_executable.clone(),
                health_monitor_executable: layout.health_monitor_executable.clone(),
                stop_settle,
            }),
            Box::new(PluginDirectoryResolver {
                plugin_root: layout.plugin_root.clone(),
            }),
        ])
    }

    pub fn locate(
        &self,
        host: &dyn NodeHost,
        trace: &mut LocateTrace,
    ) -> Result<Located, LocateError> {
        let mut not_installed = false;
        for resolver in &self.resolvers {
            match resolver.resolve(host, trace)? {
                Resolution::Found(root) => {
                    tracing::debug!(
                        resolver = resolver.name(),
                        root = %root.path.display(),
                        "install root resolved"
                    );
                    return Ok(Located::Root(root));
                }
                Resolution::NotInstalled => {
                    tracing::debug!(resolver = resolver.name(), "component not installed");
                    not_installed = true;
                }
                Resolution::NoMatch => {
                    tracing::debug!(resolver = resolver.name(), "no install root");
                }
            }
        }

        Ok(if not_installed {
            Located::NotInstalled
        } else {
            Located::NotFound
        })
    }
}

/// Finds monitored processes owned by the health monitor, stops them, and
/// takes the health monitor's executable as the anchor two levels below the root.
pub struct ProcessAnchorResolver {
    pub monitored_executable: String,
    pub health_monitor_executable: String,
    pub stop_settle: Duration,
}

impl ProcessAnchorResolver {
    fn owned_instances<'a>(
        &self,
        observations: &'a [ProcessObservation],
    ) -> Vec<&'a ProcessObservation> {
        observations
            .iter()
            .filter(|o| o.is_named(&self.monitored_executable))
            .filter(|o| {
                let owned = o.parent_is_named(&self.health_monitor_executable);
                if !owned {
                    tracing::info!(
                        pid = o.pid,
                        parent_pid = ?o.parent_pid,
                        "leaving {} running: not owned by {}",
                        self.monitored_executable,
                        self.health_monitor_executable
                    );
                }
                owned
            })
            .collect()
    }
}

impl InstallRootResolver for ProcessAnchorResolver {
    fn name(&self) -> &'static str {
        "process-anchor"
    }

    fn resolve(
        &self,
        host: &dyn NodeHost,
        trace: &mut LocateTrace,
    ) -> Result<Resolution, LocateError> {
        let entries = host
            .processes()
            .map_err(|e| LocateError::ProcessQuery(format!("{e:#}")))?;
        let observations = observe(&entries);

        let mut anchor: Option<PathBuf> = None;
        for instance in self.owned_instances(&observations) {
            host.terminate(instance.pid)
                .map_err(|e| LocateError::StopFailed {
                    name: instance.name.clone(),
                    pid: instance.pid,
                    detail: format!("{e:#}"),
                })?;
            host.settle(self.stop_settle);
            trace.stopped.push(StoppedProcess {
                pid: instance.pid,
                name: instance.name.clone(),
            });
            tracing::info!(pid = instance.pid, "stopped {}", instance.name);

            let parent_path = instance
                .parent
                .as_ref()
                .and_then(|p| p.executable_path.clone());
            match (&anchor, parent_path) {
                (None, Some(path)) => anchor = Some(path),
                (Some(current), Some(path)) if *current != path => {
                    tracing::warn!(
                        kept = %current.display(),
                        ignored = %path.display(),
                        "health monitor instances disagree on install root"
                    );
                }
                _ => {}
            }
        }

        let Some(anchor) = anchor else {
            return Ok(Resolution::NoMatch);
        };
        let Some(root) = root_from_anchor(&anchor) else {
            tracing::warn!(anchor = %anchor.display(), "anchor is too shallow for an install root");
            return Ok(Resolution::NoMatch);
        };

        Ok(Resolution::Found(InstallRoot {
            path: root,
            source: RootSource::ProcessAnchor { anchor },
        }))
    }
}

fn root_from_anchor(anchor: &Path) -> Option<PathBuf> {
    let root = anchor.parent()?.parent()?;
    root.file_name()?;
    Some(root.to_path_buf())
}

/// Picks the greatest version-named directory under the plugin root.
pub struct PluginDirectoryResolver {
    pub plugin_root: PathBuf,
}

impl InstallRootResolver for PluginDirectoryResolver {
    fn name(&self) -> &'static str {
        "plugin-directory"
    }

    fn resolve(
        &self,
        host: &dyn NodeHost,
        _trace: &mut LocateTrace,
    ) -> Result<Resolution, LocateError> {
        let names = host
            .list_subdirectories(&self.plugin_root)
            .map_err(|e| LocateError::DirectoryScan(format!("{e:#}")))?;
        let Some(names) = names else {
            return Ok(Resolution::NotInstalled);
        };

        match select_active_folder(&names) {
            Some(name) => Ok(Resolution::Found(InstallRoot {
                path: self.plugin_root.join(name),
                source: RootSource::DirectoryScan,
            })),
            None => Ok(Resolution::NotInstalled),
        }
    }
}

/// Numerically greatest version name; falls back to the lexicographically
/// greatest name when no folder parses as a version.
fn select_active_folder(names: &[String]) -> Option<&str> {
    let by_version = names
        .iter()
        .filter_map(|n| n.parse::<ComponentVersion>().ok().map(|v| (v, n)))
        .max_by(|(a, an), (b, bn)| a.cmp(b).then_with(|| an.cmp(bn)))
        .map(|(_, n)| n.as_str());

    by_version.or_else(|| names.iter().max().map(String::as_str))
}
