use anyhow::{bail, Result};
use clap::Parser;
use lockd::config::{LeaseConfig, NodeConfig, RegionPeer};
use lockd::service::start_node;
use lockd::{RAFT_PORT_OFFSET, REGION_PORT_OFFSET};
use log::info;

#[derive(Parser)]
#[command(version, about = "Distributed lock manager node", long_about = None)]
struct Cli {
    /// Client-facing port. Raft listens on port + 1000, the cross-region
    /// surface on port + 2000.
    #[arg(short, long)]
    port: u16,

    /// Unique id of this node within its region
    #[arg(short, long)]
    node_id: String,

    /// Region this node belongs to
    #[arg(long, default_value = "default")]
    region_id: String,

    /// Client address (host:port) of a same-region peer; repeatable
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Another regional leader as region_id=host:port (its client address);
    /// repeatable
    #[arg(long = "region-peer")]
    region_peers: Vec<String>,

    /// Base election timeout E; the timer fires in [E, 2E]
    #[arg(long, default_value = "150")]
    election_timeout_ms: u64,

    #[arg(long, default_value = "50")]
    heartbeat_interval_ms: u64,

    /// Lease granted when a client passes no timeout
    #[arg(long, default_value = "30000")]
    default_lease_ms: u64,

    #[arg(long, default_value = "1000")]
    min_lease_ms: u64,

    #[arg(long, default_value = "300000")]
    max_lease_ms: u64,
}

/// Peers are configured by their client address; derive the listener the
/// traffic actually goes to.
fn offset_addr(client_addr: &str, offset: u16) -> Result<String> {
    let Some((host, port)) = client_addr.rsplit_once(':') else {
        bail!("'{}' is not host:port", client_addr);
    };
    let port: u16 = port.parse()?;
    Ok(format!("{}:{}", host, port + offset))
}

fn parse_region_peer(raw: &str) -> Result<RegionPeer> {
    let Some((region_id, addr)) = raw.split_once('=') else {
        bail!("'{}' is not region_id=host:port", raw);
    };
    Ok(RegionPeer {
        region_id: region_id.to_string(),
        addr: offset_addr(addr, REGION_PORT_OFFSET)?,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let peers = cli
        .peers
        .iter()
        .map(|p| offset_addr(p, RAFT_PORT_OFFSET))
        .collect::<Result<Vec<_>>>()?;
    let region_peers = cli
        .region_peers
        .iter()
        .map(|p| parse_region_peer(p))
        .collect::<Result<Vec<_>>>()?;

    info!(
        "Starting node {} (region {}) on port {}",
        cli.node_id, cli.region_id, cli.port
    );
    info!("Raft peers: {:?}", peers);
    if !region_peers.is_empty() {
        info!("Region peers: {:?}", region_peers);
    }

    let config = NodeConfig {
        node_id: cli.node_id,
        region_id: cli.region_id,
        peers,
        region_peers,
        election_timeout_ms: cli.election_timeout_ms,
        heartbeat_interval_ms: cli.heartbeat_interval_ms,
        lease: LeaseConfig {
            default_timeout_ms: cli.default_lease_ms,
            min_timeout_ms: cli.min_lease_ms,
            max_timeout_ms: cli.max_lease_ms,
        },
    };

    let handle = start_node(config, cli.port).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    handle.raft.shutdown();
    Ok(())
}
