use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MONITORED_EXECUTABLE: &str = "MetricsExtension.Native.exe";
pub const DEFAULT_HEALTH_MONITOR_EXECUTABLE: &str = "AMAExtHealthMonitor.exe";
pub const DEFAULT_PLUGIN_ROOT: &str =
    r"C:\Packages\Plugins\Microsoft.Azure.Monitor.AzureMonitorWindowsAgent";
pub const DEFAULT_EXECUTABLE_RELATIVE_PATH: &str =
    "Monitoring/Agent/Extensions/MetricsExtension/MetricsExtension.Native.exe";

/// Where the monitored component lives on a node and what its processes are called.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentLayout {
    pub monitored_executable: String,
    pub health_monitor_executable: String,
    pub plugin_root: PathBuf,
    /// Relative to a versioned install root; `/` and `\` both separate segments.
    pub executable_relative_path: String,
}

impl Default for ComponentLayout {
    fn default() -> Self {
        Self {
            monitored_executable: DEFAULT_MONITORED_EXECUTABLE.to_string(),
            health_monitor_executable: DEFAULT_HEALTH_MONITOR_EXECUTABLE.to_string(),
            plugin_root: PathBuf::from(DEFAULT_PLUGIN_ROOT),
            executable_relative_path: DEFAULT_EXECUTABLE_RELATIVE_PATH.to_string(),
        }
    }
}
