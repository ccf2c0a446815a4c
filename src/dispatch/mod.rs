//! Running the decision engine on a node through a remote-execution channel.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::{ClusterTarget, NodeIdentity, NodeOutcome, NodeResult};
use crate::mitigation::{MitigationEngine, MitigationSettings};
use crate::platform::{
    CancelToken, CommandError, CommandRunOptions, LocalHost, NodeHost, host_name,
    names_this_host, run_command_with_options,
};

pub const NODE_PLACEHOLDER: &str = "{node}";
pub const CANCELLED_MESSAGE: &str = "Dispatch cancelled before the node was contacted";
pub const LOCAL_ONLY_MESSAGE: &str = "local channel can only target this host";

const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub timeout: Duration,
    pub cancel: CancelToken,
}

impl DispatchContext {
    pub fn new(timeout: Duration, cancel: CancelToken) -> Self {
        Self { timeout, cancel }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Connectivity(String),
    #[error("unreadable response: {0}")]
    Protocol(String),
}

/// Executes the decision engine with the target node's local view.
pub trait RemoteChannel: Send + Sync {
    fn name(&self) -> &'static str;

    fn execute(
        &self,
        node: &NodeIdentity,
        ctx: &DispatchContext,
    ) -> Result<NodeOutcome, ChannelError>;
}

/// Runs the engine in this process against [`LocalHost`]. Only nodes that
/// name this machine are accepted.
#[derive(Clone)]
pub struct LocalChannel {
    settings: MitigationSettings,
    host: Arc<dyn NodeHost + Send + Sync>,
    host_name: Option<String>,
}

impl LocalChannel {
    pub fn new(settings: MitigationSettings, command_timeout: Duration) -> Self {
        Self::with_host(Arc::new(LocalHost::new(command_timeout)), settings)
    }

    pub fn with_host(host: Arc<dyn NodeHost + Send + Sync>, settings: MitigationSettings) -> Self {
        Self {
            settings,
            host,
            host_name: host_name(),
        }
    }
}

impl RemoteChannel for LocalChannel {
    fn name(&self) -> &'static str {
        "local"
    }

    fn execute(
        &self,
        node: &NodeIdentity,
        ctx: &DispatchContext,
    ) -> Result<NodeOutcome, ChannelError> {
        if ctx.cancel.is_cancelled() {
            return Err(ChannelError::Cancelled);
        }
        if !names_this_host(node.as_str(), self.host_name.as_deref()) {
            return Err(ChannelError::Connectivity(LOCAL_ONLY_MESSAGE.to_string()));
        }

        let settings = self.settings.clone();
        let host = Arc::clone(&self.host);
        let abort = CancelToken::new();
        let worker_abort = abort.clone();
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name(format!("amafix-node-{node}"))
            .spawn(move || {
                let outcome = MitigationEngine::new(&*host, settings)
                    .with_abort(worker_abort)
                    .run();
                let _ = tx.send(outcome);
            })
            .map_err(|e| ChannelError::Connectivity(format!("failed to start worker: {e}")))?;

        // A step in progress cannot be interrupted; the abort token keeps a
        // late worker from renaming after its row has been recorded.
        let deadline = Instant::now() + ctx.timeout;
        loop {
            if ctx.cancel.is_cancelled() {
                abort.cancel();
                return Err(ChannelError::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                abort.cancel();
                return Err(ChannelError::Timeout(ctx.timeout));
            }
            match rx.recv_timeout(remaining.min(RESULT_POLL_INTERVAL)) {
                Ok(outcome) => return Ok(outcome),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ChannelError::Connectivity(
                        "node worker exited without a result".to_string(),
                    ));
                }
            }
        }
    }
}

/// Spawns a command per node and reads the engine outcome from its stdout.
#[derive(Debug, Clone)]
pub struct CommandChannel {
    argv: Vec<String>,
}

impl CommandChannel {
    pub fn new(argv: Vec<String>) -> Result<Self, ChannelError> {
        if argv.first().is_none_or(|p| p.trim().is_empty()) {
            return Err(ChannelError::Connectivity(
                "channel command is empty".to_string(),
            ));
        }
        Ok(Self { argv })
    }

    pub fn argv_for(&self, node: &NodeIdentity) -> Vec<String> {
        self.argv
            .iter()
            .map(|a| a.replace(NODE_PLACEHOLDER, node.as_str()))
            .collect()
    }
}

impl RemoteChannel for CommandChannel {
    fn name(&self) -> &'static str {
        "command"
    }

    fn execute(
        &self,
        node: &NodeIdentity,
        ctx: &DispatchContext,
    ) -> Result<NodeOutcome, ChannelError> {
        if ctx.cancel.is_cancelled() {
            return Err(ChannelError::Cancelled);
        }

        let argv = self.argv_for(node);
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| ChannelError::Connectivity("channel command is empty".to_string()))?;
        let args: Vec<&str> = rest.iter().map(String::as_str).collect();
        let options = CommandRunOptions {
            env: vec![],
            cancel: Some(ctx.cancel.clone()),
        };

        let out = run_command_with_options(program, &args, ctx.timeout, &options).map_err(
            |err| match err {
                CommandError::Timeout { timeout, .. } => ChannelError::Timeout(timeout),
                CommandError::Cancelled { .. } => ChannelError::Cancelled,
                other => ChannelError::Connectivity(other.to_string()),
            },
        )?;

        if out.exit_code != 0 {
            let detail = out
                .first_stderr_line()
                .map(str::to_string)
                .unwrap_or_else(|| format!("exit code {}", out.exit_code));
            return Err(ChannelError::Connectivity(detail));
        }

        parse_outcome(&out.stdout)
    }
}

/// Last stdout line that parses as a node outcome; earlier noise is ignored.
pub fn parse_outcome(stdout: &str) -> Result<NodeOutcome, ChannelError> {
    let mut last_error = None;
    for line in stdout.lines().rev().map(str::trim).filter(|l| !l.is_empty()) {
        match serde_json::from_str::<NodeOutcome>(line.trim_start_matches('\u{feff}')) {
            Ok(outcome) => return Ok(outcome),
            Err(err) => {
                if last_error.is_none() {
                    last_error = Some(err.to_string());
                }
            }
        }
    }
    Err(ChannelError::Protocol(
        last_error.unwrap_or_else(|| "no output".to_string()),
    ))
}

pub struct NodeDispatcher {
    channel: Arc<dyn RemoteChannel>,
}

impl NodeDispatcher {
    pub fn new(channel: Arc<dyn RemoteChannel>) -> Self {
        Self { channel }
    }

    pub fn channel_name(&self) -> &'static str {
        self.channel.name()
    }

    /// Always yields a row; channel failures become Fail rows.
    pub fn dispatch(
        &self,
        cluster: &ClusterTarget,
        node: &NodeIdentity,
        ctx: &DispatchContext,
    ) -> NodeResult {
        if ctx.cancel.is_cancelled() {
            return NodeResult::node_failure(cluster, node, CANCELLED_MESSAGE);
        }

        tracing::debug!(%cluster, %node, channel = self.channel.name(), "dispatching");
        match self.channel.execute(node, ctx) {
            Ok(outcome) => NodeResult::from_outcome(cluster, node, outcome),
            Err(ChannelError::Cancelled) => {
                tracing::warn!(%cluster, %node, "dispatch cancelled");
                NodeResult::node_failure(cluster, node, "Failed to connect to node: cancelled")
            }
            Err(err) => {
                tracing::warn!(%cluster, %node, error = %err, "node unreachable");
                NodeResult::node_failure(cluster, node, format!("Failed to connect to node: {err}"))
            }
        }
    }
}
