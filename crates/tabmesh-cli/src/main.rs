//! tabmesh: Run a group of nodes on an in-memory channel and report the leader.
//!
//! Every node runs the full protocol (sealed connect handshakes, TTL-bounded
//! bully election, leadership announcements) against a shared in-process
//! bus, the same way co-located workers share a broadcast channel.

mod report;
mod settings;

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tabmesh_core::{BroadcastTransport, KeyStore, MemoryHub, Node, NodeConfig, NodeId, SecretKey};

use report::{GroupReport, NodeReport};
use settings::Overrides;

#[derive(Parser, Debug)]
#[command(name = "tabmesh")]
#[command(about = "Peer discovery and leader election over a shared broadcast channel")]
struct Args {
    /// Number of nodes to run (ignored when --id is given)
    #[arg(short, long, default_value_t = 3)]
    nodes: usize,

    /// Explicit node ids as 16 hex chars (repeat or comma-separate)
    #[arg(long = "id", value_delimiter = ',')]
    ids: Vec<NodeId>,

    /// Resource identifier the channel is named after
    #[arg(short, long)]
    resource: Option<String>,

    /// Default hop budget for frames
    #[arg(long)]
    ttl: Option<u32>,

    /// Election timeout in milliseconds
    #[arg(long)]
    election_timeout_ms: Option<u64>,

    /// JSON config file (command-line flags take precedence)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Give every node the same key so peers verify each other's handshakes
    #[arg(long)]
    shared_key: bool,

    /// After the first election, shut the leader down and report the re-election
    #[arg(long)]
    failover: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            resource: self.resource.clone(),
            ttl: self.ttl,
            election_timeout_ms: self.election_timeout_ms,
        }
    }

    fn node_ids(&self) -> Vec<NodeId> {
        if self.ids.is_empty() {
            (0..self.nodes).map(|_| NodeId::generate()).collect()
        } else {
            self.ids.clone()
        }
    }
}

fn spawn_group(
    hub: &MemoryHub,
    config: &NodeConfig,
    ids: &[NodeId],
    group_key: Option<&SecretKey>,
) -> Result<Vec<Node>> {
    let channel = config.channel();
    ids.iter()
        .map(|id| {
            let transport: Arc<dyn BroadcastTransport> = Arc::new(hub.transport(&channel));
            let keys = match group_key {
                Some(key) => KeyStore::shared(key.clone()),
                None => KeyStore::new(),
            };
            Node::with_id(*id, transport, config.clone(), keys)
                .with_context(|| format!("Failed to create node {id}"))
        })
        .collect()
}

async fn start_group(nodes: &[Node]) -> Result<()> {
    let results = join_all(nodes.iter().map(|n| n.start())).await;
    for (node, result) in nodes.iter().zip(results) {
        let leader = result.with_context(|| format!("Node {} failed to start", node.id()))?;
        match leader {
            Some(leader) => info!("Node {} settled on leader {}", node.id(), leader),
            None => warn!("Node {} has no leader yet", node.id()),
        }
    }
    Ok(())
}

/// Poll until the group agrees on its highest id, or `patience` runs out.
async fn await_convergence(channel: &str, nodes: &[&Node], patience: Duration) -> GroupReport {
    let deadline = tokio::time::Instant::now() + patience;
    loop {
        let report = GroupReport::new(
            channel.to_string(),
            nodes.iter().map(|n| NodeReport::capture(n)).collect(),
        );
        if report.converged() || tokio::time::Instant::now() >= deadline {
            return report;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn print_report(report: &GroupReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
    println!("{json}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,tabmesh_core=debug"
    } else {
        "info,tabmesh_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = settings::resolve(args.config.as_deref(), &args.overrides())?;
    let ids = args.node_ids();
    anyhow::ensure!(!ids.is_empty(), "at least one node is required");

    let channel = config.channel();
    info!("Starting {} node(s) on channel {}", ids.len(), channel);

    let hub = MemoryHub::new();
    let group_key = args.shared_key.then(SecretKey::generate);
    let nodes = spawn_group(&hub, &config, &ids, group_key.as_ref())?;

    start_group(&nodes).await?;

    let patience = config.leadership_timeout();
    let all: Vec<&Node> = nodes.iter().collect();
    let report = await_convergence(&channel, &all, patience).await;
    print_report(&report)?;
    let mut converged = report.converged();

    if args.failover && converged {
        if let Some(leader) = nodes.iter().find(|n| n.is_leader()) {
            info!("Shutting down leader {} to force a re-election", leader.id());
            leader.shutdown().await;

            let survivors: Vec<&Node> = nodes.iter().filter(|n| n.id() != leader.id()).collect();
            if !survivors.is_empty() {
                let report = await_convergence(&channel, &survivors, patience).await;
                print_report(&report)?;
                converged = report.converged();
            }
        }
    }

    for node in &nodes {
        node.shutdown().await;
    }

    anyhow::ensure!(converged, "nodes did not converge on a single leader");
    info!("Done");
    Ok(())
}
