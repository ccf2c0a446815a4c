use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;

use anyhow::Result;

use crate::core::{ClusterTarget, MitigationReport, NodeIdentity, NodeResult, ReportBuilder};
use crate::dispatch::{DispatchContext, NodeDispatcher};
use crate::platform::CancelToken;
use crate::topology::{TopologyError, TopologyProvider};

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct FleetOptions {
    pub workers: usize,
    pub node_timeout: Duration,
    pub show_progress: bool,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            node_timeout: DEFAULT_NODE_TIMEOUT,
            show_progress: false,
        }
    }
}

struct NodeJob {
    slot: usize,
    cluster: ClusterTarget,
    node: NodeIdentity,
}

/// Drives every node of every requested cluster through the dispatcher.
pub struct Fleet {
    topology: Arc<dyn TopologyProvider>,
    dispatcher: NodeDispatcher,
    opts: FleetOptions,
    cancel: CancelToken,
}

impl Fleet {
    pub fn new(
        topology: Arc<dyn TopologyProvider>,
        dispatcher: NodeDispatcher,
        opts: FleetOptions,
    ) -> Self {
        Self {
            topology,
            dispatcher,
            opts,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Input clusters in order with later duplicates dropped.
    pub fn plan(clusters: &[ClusterTarget]) -> Result<Vec<ClusterTarget>> {
        if clusters.is_empty() {
            return Err(crate::exit::invalid_args("no clusters to process"));
        }
        let mut seen = HashSet::new();
        let mut planned = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            if seen.insert(cluster.as_str().to_string()) {
                planned.push(cluster.clone());
            } else {
                tracing::info!(%cluster, "duplicate cluster ignored");
            }
        }
        Ok(planned)
    }

    /// Every planned cluster yields at least one row; rows come back in the
    /// order a sequential cluster-then-node walk would produce them.
    pub fn run(&self, clusters: &[ClusterTarget]) -> Result<MitigationReport> {
        let clusters = Self::plan(clusters)?;

        let mut slots: Vec<Option<NodeResult>> = Vec::new();
        let mut jobs = Vec::new();
        for cluster in &clusters {
            match self.topology.resolve_nodes(cluster) {
                Ok(nodes) => {
                    tracing::info!(%cluster, nodes = nodes.len(), "cluster resolved");
                    for node in nodes {
                        jobs.push(NodeJob {
                            slot: slots.len(),
                            cluster: cluster.clone(),
                            node,
                        });
                        slots.push(None);
                    }
                }
                Err(err) => {
                    tracing::warn!(%cluster, error = %err, "cluster skipped");
                    let row = match &err {
                        TopologyError::ClusterUnavailable(_) => {
                            NodeResult::cluster_unavailable(cluster, err.to_string())
                        }
                        TopologyError::NodesUnavailable(_) => {
                            NodeResult::nodes_unavailable(cluster, err.to_string())
                        }
                    };
                    slots.push(Some(row));
                }
            }
        }

        for (slot, row) in self.dispatch_all(&jobs) {
            slots[slot] = Some(row);
        }

        // Scoped workers either deliver every row or propagate their panic.
        let mut builder = ReportBuilder::new();
        for row in slots.into_iter().flatten() {
            builder.push(row);
        }
        Ok(builder.finish())
    }

    fn dispatch_all(&self, jobs: &[NodeJob]) -> Vec<(usize, NodeResult)> {
        if jobs.is_empty() {
            return Vec::new();
        }

        let workers = self.opts.workers.max(1).min(jobs.len());
        let pb = self.progress_bar(jobs.len());
        let next = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel::<(usize, NodeResult)>();
        let mut results = Vec::with_capacity(jobs.len());

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let next = &next;
                scope.spawn(move || {
                    loop {
                        let i = next.fetch_add(1, Ordering::SeqCst);
                        let Some(job) = jobs.get(i) else {
                            break;
                        };
                        let ctx = DispatchContext::new(self.opts.node_timeout, self.cancel.clone());
                        let row = self.dispatcher.dispatch(&job.cluster, &job.node, &ctx);
                        if tx.send((job.slot, row)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);

            for (slot, row) in rx {
                if let Some(pb) = &pb {
                    pb.set_message(format!("{} / {}", row.cluster_name, row.node_name));
                    pb.inc(1);
                }
                results.push((slot, row));
            }
        });

        if let Some(pb) = pb {
            pb.finish_and_clear();
        }
        results
    }

    fn progress_bar(&self, len: usize) -> Option<indicatif::ProgressBar> {
        use std::io::IsTerminal;
        if !self.opts.show_progress || !std::io::stderr().is_terminal() {
            return None;
        }
        let pb = indicatif::ProgressBar::new(len as u64);
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        let style = indicatif::ProgressStyle::with_template(
            "{spinner} [{bar:30}] {pos}/{len} {wide_msg}",
        )
        .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar());
        pb.set_style(style);
        pb.enable_steady_tick(Duration::from_millis(120));
        Some(pb)
    }
}
