use std::io;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;
use time::OffsetDateTime;

use crate::config::{ChannelKind, EffectiveConfig, TopologyKind};
use crate::core::{ClusterTarget, MitigationReport, StatusCounts};
use crate::dispatch::{CommandChannel, LocalChannel, NodeDispatcher, RemoteChannel};
use crate::fleet::{Fleet, FleetOptions};
use crate::mitigation::{MitigationEngine, MitigationSettings};
use crate::platform::{CancelToken, LocalHost};
use crate::report::{CsvReportSink, ReportSink};
use crate::topology::{CommandTopology, StaticTopology, TopologyProvider};
use crate::ui::UiConfig;

mod input;

const CONFIRM_WORD: &str = "mitigate";

#[derive(Debug, Parser)]
#[command(
    name = "amafix",
    version,
    about = "Stops the affected Azure Monitor Agent MetricsExtension binary and renames it out of the way on every cluster node"
)]
pub struct Cli {
    #[arg(long, global = true)]
    pub json: bool,
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,
    #[arg(long, global = true)]
    pub verbose: bool,
    #[arg(long, global = true)]
    pub quiet: bool,
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Per-node timeout in seconds (overrides fleet.node_timeout_secs).
    #[arg(long, global = true)]
    pub timeout: Option<u64>,
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Mitigate every node of the given clusters and write a CSV report.
    Run(RunArgs),
    /// Run the mitigation on this host only.
    Node(NodeArgs),
    /// Print a previously written report.
    Report(ReportArgs),
    Completion(CompletionArgs),
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(long = "cluster")]
    pub clusters: Vec<String>,
    /// CSV with a ClusterName column, or one cluster name per line.
    #[arg(long)]
    pub input: Option<PathBuf>,
    #[arg(long)]
    pub output: Option<PathBuf>,
    #[arg(long)]
    pub workers: Option<usize>,
    #[arg(long)]
    pub yes: bool,
}

#[derive(Debug, Args)]
pub struct NodeArgs {}

#[derive(Debug, Args)]
pub struct ReportArgs {
    #[arg(long)]
    pub input: PathBuf,
}

#[derive(Debug, Args)]
pub struct CompletionArgs {
    pub shell: String,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[arg(long)]
    pub show: bool,
}

#[derive(Debug, Serialize)]
struct RunJson<'a> {
    summary: StatusCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    report_path: Option<String>,
    rows: &'a MitigationReport,
}

#[derive(Debug, Serialize)]
struct PlanJson<'a> {
    dry_run: bool,
    topology: TopologyKind,
    channel: ChannelKind,
    workers: usize,
    node_timeout_secs: u64,
    clusters: &'a [ClusterTarget],
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    crate::logs::init_tracing(cli.verbose, cli.quiet);

    let stdin_is_tty = io::stdin().is_terminal();
    let stdout_is_tty = io::stdout().is_terminal();
    let stderr_is_tty = io::stderr().is_terminal();

    let home_dir = crate::platform::effective_home_dir()?;
    let mut cfg = crate::config::load(cli.config.as_deref(), &home_dir)
        .map_err(crate::exit::invalid_args_err)?;

    if let Some(timeout) = cli.timeout {
        if timeout == 0 {
            return Err(crate::exit::invalid_args("--timeout must be at least 1 second"));
        }
        cfg.fleet.node_timeout_secs = timeout;
    }

    let ui_cfg = UiConfig {
        color: stdout_is_tty && cfg.ui.color && !cli.no_color,
        stdin_is_tty,
        stdout_is_tty,
        stderr_is_tty,
        max_table_rows: cfg.ui.max_table_rows,
        quiet: cli.quiet,
        verbose: cli.verbose,
    };

    let flags = cli_flags(&cli);
    match cli.command {
        Commands::Run(args) => run_fleet(&flags, args, &cfg, &ui_cfg, &home_dir)?,
        Commands::Node(_args) => {
            let settings = mitigation_settings(&cfg);
            if cli.dry_run {
                if cli.json {
                    write_json(&settings.layout)?;
                } else if !ui_cfg.quiet {
                    println!("dry-run: would inspect {}", settings.layout.plugin_root.display());
                    println!("  monitored executable: {}", settings.layout.monitored_executable);
                    println!("  health monitor:       {}", settings.layout.health_monitor_executable);
                    println!("  rename target:        {}", settings.layout.executable_relative_path);
                }
                return Ok(());
            }

            let host = LocalHost::new(cfg.engine.command_timeout());
            let outcome = MitigationEngine::new(&host, settings).run();
            if cli.json {
                // One line: remote callers parse the last stdout line.
                let line = serde_json::to_string(&outcome)?;
                write_stdout(line.as_bytes())?;
            } else {
                crate::ui::print_node_outcome(&outcome, &ui_cfg);
                if outcome.status == crate::core::NodeStatus::Fail {
                    return Err(crate::exit::node_failures(outcome.message));
                }
            }
        }
        Commands::Report(args) => {
            let report =
                crate::report::read_report(&args.input).map_err(crate::exit::invalid_args_err)?;
            if cli.json {
                write_json(&RunJson {
                    summary: report.summary(),
                    report_path: Some(args.input.display().to_string()),
                    rows: &report,
                })?;
            } else {
                crate::ui::print_report(&report, &ui_cfg, None);
            }
        }
        Commands::Completion(args) => {
            let shell = parse_shell(&args.shell)?;
            let mut cmd = Cli::command();
            let mut out = std::io::stdout().lock();
            clap_complete::generate(shell, &mut cmd, "amafix", &mut out);
        }
        Commands::Config(args) => {
            if args.show {
                if cli.json {
                    write_json(&cfg)?;
                } else {
                    let text = toml::to_string_pretty(&cfg)
                        .context("failed to render configuration as TOML")?;
                    println!("{text}");
                }
            } else if !ui_cfg.quiet {
                eprintln!("config: use `amafix config --show`");
            }
        }
    }

    Ok(())
}

struct GlobalFlags {
    json: bool,
    quiet: bool,
    dry_run: bool,
}

fn cli_flags(cli: &Cli) -> GlobalFlags {
    GlobalFlags {
        json: cli.json,
        quiet: cli.quiet,
        dry_run: cli.dry_run,
    }
}

fn run_fleet(
    flags: &GlobalFlags,
    args: RunArgs,
    cfg: &EffectiveConfig,
    ui_cfg: &UiConfig,
    home_dir: &Path,
) -> Result<()> {
    let mut names = args.clusters.clone();
    if let Some(path) = &args.input {
        names.extend(input::read_cluster_file(path).map_err(crate::exit::invalid_args_err)?);
    }
    let clusters: Vec<ClusterTarget> = names
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .map(ClusterTarget::new)
        .collect();
    if clusters.is_empty() {
        return Err(crate::exit::invalid_args(
            "no clusters given (use --cluster NAME or --input FILE)",
        ));
    }
    let clusters = Fleet::plan(&clusters)?;

    let workers = args.workers.unwrap_or(cfg.fleet.workers);
    if workers == 0 {
        return Err(crate::exit::invalid_args("--workers must be at least 1"));
    }

    let topology = build_topology(cfg);
    let channel = build_channel(cfg)?;

    if flags.dry_run {
        if flags.json {
            write_json(&PlanJson {
                dry_run: true,
                topology: cfg.topology.kind,
                channel: cfg.channel.kind,
                workers,
                node_timeout_secs: cfg.fleet.node_timeout_secs,
                clusters: &clusters,
            })?;
        } else if !ui_cfg.quiet {
            crate::ui::print_plan(
                &clusters,
                &cfg.topology.kind.to_string(),
                &cfg.channel.kind.to_string(),
                workers,
            );
        }
        return Ok(());
    }

    if !args.yes {
        if !(ui_cfg.stdin_is_tty && ui_cfg.stderr_is_tty) {
            return Err(crate::exit::invalid_args(
                "run changes every node it reaches; pass --yes when not attached to a terminal",
            ));
        }
        let prompt = format!(
            "This stops {} and renames it on every node of {} cluster(s). Type '{CONFIRM_WORD}' to continue: ",
            cfg.component.monitored_executable,
            clusters.len()
        );
        if !confirm_exact(&prompt, CONFIRM_WORD)? {
            if !ui_cfg.quiet {
                eprintln!("Cancelled.");
            }
            return Ok(());
        }
    }

    let fleet = Fleet::new(
        topology,
        NodeDispatcher::new(channel),
        FleetOptions {
            workers,
            node_timeout: Duration::from_secs(cfg.fleet.node_timeout_secs),
            show_progress: ui_cfg.stderr_is_tty && !flags.quiet && !flags.json,
        },
    );

    install_interrupt_handler(fleet.cancel_token(), ui_cfg.quiet);

    let started_at = OffsetDateTime::now_utc();
    let report = fleet.run(&clusters)?;
    let finished_at = OffsetDateTime::now_utc();
    if fleet.cancel_token().is_cancelled() {
        tracing::warn!("run interrupted; pending nodes were recorded as cancelled");
    }

    let output = match &args.output {
        Some(path) => path.clone(),
        None => {
            let dir = cfg
                .report
                .output_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("."));
            crate::report::default_report_path(&dir, finished_at)
        }
    };
    let report_path = CsvReportSink::new(output).write(&report)?;

    if let Err(err) = crate::logs::write_run_log(
        home_dir,
        started_at,
        finished_at,
        &clusters,
        &report,
        Some(&report_path),
    ) {
        tracing::warn!(error = %format!("{err:#}"), "run log not written");
    }

    if flags.json {
        write_json(&RunJson {
            summary: report.summary(),
            report_path: Some(report_path.display().to_string()),
            rows: &report,
        })?;
    } else {
        crate::ui::print_report(&report, ui_cfg, Some(&report_path));
    }

    let summary = report.summary();
    if summary.fail > 0 {
        return Err(crate::exit::node_failures(format!(
            "{} of {} row(s) failed; see {}",
            summary.fail,
            summary.total(),
            report_path.display()
        )));
    }
    Ok(())
}

/// First Ctrl-C stops dispatching new nodes so the report is still written;
/// a second one exits immediately.
fn install_interrupt_handler(cancel: CancelToken, quiet: bool) {
    let installed = ctrlc::set_handler(move || {
        if cancel.is_cancelled() {
            std::process::exit(crate::exit::ExitCode::Interrupted.as_i32());
        }
        if !quiet {
            eprintln!(
                "\nInterrupted: waiting for in-flight nodes, then writing the report (Ctrl-C again to abort)"
            );
        }
        cancel.cancel();
    });
    if let Err(err) = installed {
        tracing::warn!(error = %err, "Ctrl-C handler not installed");
    }
}

fn mitigation_settings(cfg: &EffectiveConfig) -> MitigationSettings {
    MitigationSettings {
        layout: cfg.component.clone(),
        stop_settle: cfg.engine.stop_settle(),
    }
}

fn build_topology(cfg: &EffectiveConfig) -> Arc<dyn TopologyProvider> {
    match cfg.topology.kind {
        TopologyKind::Static => Arc::new(StaticTopology::new(cfg.topology.clusters.clone())),
        TopologyKind::Command => Arc::new(CommandTopology::new(
            cfg.topology.command.clone(),
            Duration::from_secs(cfg.topology.timeout_secs),
        )),
    }
}

fn build_channel(cfg: &EffectiveConfig) -> Result<Arc<dyn RemoteChannel>> {
    Ok(match cfg.channel.kind {
        ChannelKind::Local => Arc::new(LocalChannel::new(
            mitigation_settings(cfg),
            cfg.engine.command_timeout(),
        )),
        ChannelKind::Command => Arc::new(
            CommandChannel::new(cfg.channel.command.clone())
                .map_err(|e| crate::exit::invalid_args(e.to_string()))?,
        ),
    })
}

fn write_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let mut buf = serde_json::to_vec_pretty(value)?;
    buf.push(b'\n');
    write_stdout(&buf)
}

fn write_stdout(buf: &[u8]) -> Result<()> {
    use std::io::Write;

    let mut stdout = std::io::stdout().lock();
    let line_end: &[u8] = if buf.ends_with(b"\n") { b"" } else { b"\n" };
    for chunk in [buf, line_end] {
        match stdout.write_all(chunk) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn confirm_exact(prompt: &str, expected: &str) -> Result<bool> {
    use std::io::{BufRead, Write};

    let mut stderr = std::io::stderr().lock();
    write!(stderr, "{prompt}")?;
    stderr.flush()?;

    let mut input = String::new();
    let mut stdin = std::io::stdin().lock();
    let n = stdin.read_line(&mut input)?;
    if n == 0 {
        return Ok(false);
    }
    Ok(input.trim() == expected)
}

fn parse_shell(s: &str) -> Result<clap_complete::Shell> {
    let s = s.trim().to_ascii_lowercase();
    match s.as_str() {
        "bash" => Ok(clap_complete::Shell::Bash),
        "zsh" => Ok(clap_complete::Shell::Zsh),
        "fish" => Ok(clap_complete::Shell::Fish),
        "powershell" | "pwsh" => Ok(clap_complete::Shell::PowerShell),
        other => Err(crate::exit::invalid_args(format!(
            "unsupported shell: {other} (expected bash|zsh|fish|powershell)"
        ))),
    }
}
