//! Flock storage node daemon (flockd).
//!
//! Runs the cluster membership and coordination core of one storage
//! node: it joins the group through a cluster driver, serializes every
//! membership transition and control operation through one event queue,
//! and keeps the node's epoch log in step with the cluster.
//!
//! The object-store backend, the gateway pools, and the client RPC
//! surface plug in through the collaborator traits in `store`,
//! `serializer`, and `vdi`.

mod cluster;
mod config;
mod core;
mod epoch;
mod group;
#[cfg(test)]
mod group_tests;
mod ring;
mod serializer;
mod store;
mod vdi;

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use flock_proto::constants::{SD_DEFAULT_VNODES, SD_LISTEN_PORT};
use flock_proto::node::{ClusterStatus, NodeEntry};

use crate::cluster::local::{LocalBus, LocalDriver};
use crate::cluster::ClusterDriver;
use crate::core::Core;
use crate::epoch::EpochLog;
use crate::group::TcpProbe;
use crate::serializer::{Serializer, SerializerParts, UnwiredPool};
use crate::store::NullStore;
use crate::vdi::MemVdiLayer;

/// Flock storage node daemon
#[derive(Parser, Debug)]
#[command(name = "flockd", version, about = "Flock storage node daemon")]
struct Args {
    /// Data directory for the epoch log and cluster config
    #[arg(value_name = "DIR")]
    dir: PathBuf,

    /// Listen address
    #[arg(short = 'b', long, default_value = "0.0.0.0")]
    bind_addr: String,

    /// Listen port
    #[arg(short = 'p', long, default_value_t = SD_LISTEN_PORT)]
    port: u16,

    /// Fault zone ID (derived from the address when omitted)
    #[arg(short = 'z', long)]
    zone: Option<u32>,

    /// Number of virtual nodes
    #[arg(short = 'v', long, default_value_t = SD_DEFAULT_VNODES)]
    vnodes: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("flockd v{} starting", env!("CARGO_PKG_VERSION"));

    let bind_addr: IpAddr = args
        .bind_addr
        .parse()
        .unwrap_or_else(|_| IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    let mut this_entry = NodeEntry::new(bind_addr, args.port);
    this_entry.nr_vnodes = args.vnodes;
    this_entry.zone = args.zone.unwrap_or_else(|| this_entry.derived_zone());

    let epoch_dir = args.dir.join("epoch");
    if let Err(e) = tokio::fs::create_dir_all(&epoch_dir).await {
        error!("cannot create {}: {}", epoch_dir.display(), e);
        std::process::exit(1);
    }

    let cluster_config = match config::load_config(&args.dir).await {
        Ok(c) => c,
        Err(e) => {
            error!("cannot load cluster config: {}", e);
            std::process::exit(1);
        }
    };

    let driver: Arc<dyn ClusterDriver> = Arc::new(LocalDriver::new(LocalBus::new()));
    let this_id = match driver.init(&this_entry).await {
        Ok(id) => id,
        Err(e) => {
            error!("cluster driver init failed: {}", e);
            std::process::exit(1);
        }
    };
    info!("node identity: {} ({})", this_id, this_entry);

    let (serializer, handle) = Serializer::new(SerializerParts {
        core: Core::new(this_id, this_entry),
        config: cluster_config,
        dir: args.dir.clone(),
        epoch_log: EpochLog::new(&epoch_dir),
        driver,
        store: Arc::new(NullStore::default()),
        vdi: Arc::new(MemVdiLayer::default()),
        io_pool: Arc::new(UnwiredPool),
        gateway: Arc::new(UnwiredPool),
        probe: Arc::new(TcpProbe::default()),
    });

    let mut worker = tokio::spawn(serializer.run());
    let mut snapshots = handle.watch();

    let outcome = loop {
        tokio::select! {
            res = &mut worker => break res,
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, leaving the cluster");
                handle.leave();
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break (&mut worker).await;
                }
                if snapshots.borrow().status == ClusterStatus::Shutdown {
                    info!("cluster shutdown committed, exiting");
                    handle.leave();
                }
            }
        }
    };

    match outcome {
        Ok(Ok(())) => info!("flockd stopped"),
        Ok(Err(e)) => {
            error!("flockd terminated: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            error!("cluster worker failed: {}", e);
            std::process::exit(1);
        }
    }
}
