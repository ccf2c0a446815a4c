use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::ComponentLayout;

pub const CONFIG_ENV: &str = "AMAFIX_CONFIG";

pub const DEFAULT_CHANNEL_COMMAND: [&str; 5] = [
    "powershell",
    "-NoProfile",
    "-NonInteractive",
    "-Command",
    "Invoke-Command -ComputerName '{node}' -ScriptBlock { & amafix node --json }",
];

pub const DEFAULT_TOPOLOGY_COMMAND: [&str; 5] = [
    "powershell",
    "-NoProfile",
    "-NonInteractive",
    "-Command",
    "Get-ClusterNode -Cluster '{cluster}' | Select-Object -ExpandProperty Name",
];

#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub ui: UiConfig,
    pub component: ComponentLayout,
    pub engine: EngineConfig,
    pub fleet: FleetConfig,
    pub topology: TopologyConfig,
    pub channel: ChannelConfig,
    pub report: ReportConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UiConfig {
    pub color: bool,
    pub max_table_rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    pub stop_settle_ms: u64,
    /// Budget for each local OS command (process query, taskkill).
    pub command_timeout_secs: u64,
}

impl EngineConfig {
    pub fn stop_settle(&self) -> Duration {
        Duration::from_millis(self.stop_settle_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetConfig {
    pub workers: usize,
    pub node_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologyKind {
    Command,
    Static,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopologyConfig {
    pub kind: TopologyKind,
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub clusters: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Local,
    Command,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self {
            ui: UiConfig {
                color: true,
                max_table_rows: 50,
            },
            component: ComponentLayout::default(),
            engine: EngineConfig {
                stop_settle_ms: 2000,
                command_timeout_secs: 60,
            },
            fleet: FleetConfig {
                workers: crate::fleet::DEFAULT_WORKERS,
                node_timeout_secs: crate::fleet::DEFAULT_NODE_TIMEOUT.as_secs(),
            },
            topology: TopologyConfig {
                kind: TopologyKind::Command,
                command: DEFAULT_TOPOLOGY_COMMAND.iter().map(|s| s.to_string()).collect(),
                timeout_secs: 60,
                clusters: BTreeMap::new(),
            },
            channel: ChannelConfig {
                kind: ChannelKind::Command,
                command: DEFAULT_CHANNEL_COMMAND.iter().map(|s| s.to_string()).collect(),
            },
            report: ReportConfig { output_dir: None },
            config_path: None,
        }
    }
}

impl fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TopologyKind::Command => "command",
            TopologyKind::Static => "static",
        })
    }
}

impl FromStr for TopologyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "command" => Ok(TopologyKind::Command),
            "static" => Ok(TopologyKind::Static),
            other => Err(format!("invalid topology kind: {other} (expected command|static)")),
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelKind::Local => "local",
            ChannelKind::Command => "command",
        })
    }
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(ChannelKind::Local),
            "command" => Ok(ChannelKind::Command),
            other => Err(format!("invalid channel kind: {other} (expected local|command)")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    ui: Option<RawUiConfig>,
    component: Option<RawComponentConfig>,
    engine: Option<RawEngineConfig>,
    fleet: Option<RawFleetConfig>,
    topology: Option<RawTopologyConfig>,
    channel: Option<RawChannelConfig>,
    report: Option<RawReportConfig>,
}

#[derive(Debug, Deserialize)]
struct RawUiConfig {
    color: Option<bool>,
    max_table_rows: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawComponentConfig {
    monitored_executable: Option<String>,
    health_monitor_executable: Option<String>,
    plugin_root: Option<PathBuf>,
    executable_relative_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEngineConfig {
    stop_settle_ms: Option<u64>,
    command_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawFleetConfig {
    workers: Option<usize>,
    node_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawTopologyConfig {
    kind: Option<TopologyKind>,
    command: Option<Vec<String>>,
    timeout_secs: Option<u64>,
    clusters: Option<BTreeMap<String, Vec<String>>>,
}

#[derive(Debug, Deserialize)]
struct RawChannelConfig {
    kind: Option<ChannelKind>,
    command: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawReportConfig {
    output_dir: Option<PathBuf>,
}

pub fn default_config_path(home_dir: &Path) -> PathBuf {
    home_dir.join(".config/amafix/config.toml")
}

/// `--config`, then `AMAFIX_CONFIG`, then the default under the home directory.
/// Returns the path and whether it was requested explicitly.
pub fn resolve_config_path(cli_path: Option<&Path>, home_dir: &Path) -> (PathBuf, bool) {
    if let Some(p) = cli_path {
        return (p.to_path_buf(), true);
    }
    match std::env::var_os(CONFIG_ENV) {
        Some(p) if !p.is_empty() => (PathBuf::from(p), true),
        _ => (default_config_path(home_dir), false),
    }
}

pub fn load(config_path: Option<&Path>, home_dir: &Path) -> Result<EffectiveConfig> {
    let mut cfg = EffectiveConfig::default();
    let (path, explicit) = resolve_config_path(config_path, home_dir);

    if path.exists() {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let raw: RawConfig = toml::from_str(&s)
            .with_context(|| format!("failed to parse config file (TOML): {}", path.display()))?;
        apply_raw_config(&mut cfg, raw);
        cfg.config_path = Some(path.display().to_string());
    } else if explicit {
        anyhow::bail!("config file not found: {}", path.display());
    }

    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok())?;
    validate(&cfg)?;

    tracing::debug!(config_path = ?cfg.config_path, "configuration loaded");
    Ok(cfg)
}

fn apply_raw_config(cfg: &mut EffectiveConfig, raw: RawConfig) {
    if let Some(ui) = raw.ui {
        if let Some(color) = ui.color {
            cfg.ui.color = color;
        }
        if let Some(max_table_rows) = ui.max_table_rows {
            cfg.ui.max_table_rows = max_table_rows;
        }
    }

    if let Some(component) = raw.component {
        if let Some(v) = component.monitored_executable {
            cfg.component.monitored_executable = v;
        }
        if let Some(v) = component.health_monitor_executable {
            cfg.component.health_monitor_executable = v;
        }
        if let Some(v) = component.plugin_root {
            cfg.component.plugin_root = v;
        }
        if let Some(v) = component.executable_relative_path {
            cfg.component.executable_relative_path = v;
        }
    }

    if let Some(engine) = raw.engine {
        if let Some(v) = engine.stop_settle_ms {
            cfg.engine.stop_settle_ms = v;
        }
        if let Some(v) = engine.command_timeout_secs {
            cfg.engine.command_timeout_secs = v;
        }
    }

    if let Some(fleet) = raw.fleet {
        if let Some(v) = fleet.workers {
            cfg.fleet.workers = v;
        }
        if let Some(v) = fleet.node_timeout_secs {
            cfg.fleet.node_timeout_secs = v;
        }
    }

    if let Some(topology) = raw.topology {
        if let Some(v) = topology.kind {
            cfg.topology.kind = v;
        }
        if let Some(v) = topology.command {
            cfg.topology.command = v;
        }
        if let Some(v) = topology.timeout_secs {
            cfg.topology.timeout_secs = v;
        }
        if let Some(v) = topology.clusters {
            cfg.topology.clusters = v;
        }
    }

    if let Some(channel) = raw.channel {
        if let Some(v) = channel.kind {
            cfg.channel.kind = v;
        }
        if let Some(v) = channel.command {
            cfg.channel.command = v;
        }
    }

    if let Some(report) = raw.report {
        if let Some(v) = report.output_dir {
            cfg.report.output_dir = Some(v);
        }
    }
}

fn apply_env_overrides(
    cfg: &mut EffectiveConfig,
    var: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(v) = var("AMAFIX_UI_COLOR") {
        cfg.ui.color = parse_bool(&v).context("AMAFIX_UI_COLOR")?;
    }
    if let Some(v) = var("AMAFIX_UI_MAX_TABLE_ROWS") {
        cfg.ui.max_table_rows = v
            .trim()
            .parse::<usize>()
            .context("AMAFIX_UI_MAX_TABLE_ROWS")?;
    }
    if let Some(v) = var("AMAFIX_COMPONENT_PLUGIN_ROOT") {
        let v = v.trim();
        if !v.is_empty() {
            cfg.component.plugin_root = PathBuf::from(v);
        }
    }
    if let Some(v) = var("AMAFIX_ENGINE_STOP_SETTLE_MS") {
        cfg.engine.stop_settle_ms = v
            .trim()
            .parse::<u64>()
            .context("AMAFIX_ENGINE_STOP_SETTLE_MS")?;
    }
    if let Some(v) = var("AMAFIX_FLEET_WORKERS") {
        cfg.fleet.workers = v.trim().parse::<usize>().context("AMAFIX_FLEET_WORKERS")?;
    }
    if let Some(v) = var("AMAFIX_FLEET_NODE_TIMEOUT_SECS") {
        cfg.fleet.node_timeout_secs = v
            .trim()
            .parse::<u64>()
            .context("AMAFIX_FLEET_NODE_TIMEOUT_SECS")?;
    }
    if let Some(v) = var("AMAFIX_TOPOLOGY_KIND") {
        cfg.topology.kind = v
            .parse::<TopologyKind>()
            .map_err(anyhow::Error::msg)
            .context("AMAFIX_TOPOLOGY_KIND")?;
    }
    if let Some(v) = var("AMAFIX_CHANNEL_KIND") {
        cfg.channel.kind = v
            .parse::<ChannelKind>()
            .map_err(anyhow::Error::msg)
            .context("AMAFIX_CHANNEL_KIND")?;
    }
    if let Some(v) = var("AMAFIX_REPORT_OUTPUT_DIR") {
        let v = v.trim();
        if !v.is_empty() {
            cfg.report.output_dir = Some(PathBuf::from(v));
        }
    }

    Ok(())
}

fn validate(cfg: &EffectiveConfig) -> Result<()> {
    if cfg.fleet.workers == 0 {
        anyhow::bail!("fleet.workers must be at least 1");
    }
    if cfg.fleet.node_timeout_secs == 0 {
        anyhow::bail!("fleet.node_timeout_secs must be at least 1");
    }
    if cfg.topology.kind == TopologyKind::Command && cfg.topology.command.is_empty() {
        anyhow::bail!("topology.command must not be empty when topology.kind = \"command\"");
    }
    if cfg.channel.kind == ChannelKind::Command && cfg.channel.command.is_empty() {
        anyhow::bail!("channel.command must not be empty when channel.kind = \"command\"");
    }
    Ok(())
}

fn parse_bool(s: &str) -> Result<bool> {
    let s = s.trim().to_ascii_lowercase();
    match s.as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow::anyhow!(
            "invalid boolean: {s} (expected true|false|1|0|yes|no|on|off)"
        )),
    }
}
