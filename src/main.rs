//! blockrepl daemon: receive-side of a synchronous block-device
//! replication pair.
//!
//! Runs one resource over a memory-backed volume; useful for protocol
//! testing against a real peer without touching block devices.

use blockrepl::backing::{MemoryBackend, NullActivityLog, NullHelper};
use blockrepl::config::{AfterSbPolicy, NetConfig, WireProtocol};
use blockrepl::meta::MetaStore;
use blockrepl::net::{Connection, ListenerSet, run_connection};
use blockrepl::repl::resource::{Device, Resource};
use blockrepl::types::{ConnectionId, DeviceId};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "blockrepl", version, about = "Block-device replication receiver")]
struct Args {
    /// Resource name
    #[arg(long, default_value = "r0")]
    resource: String,

    /// This node's id within the resource
    #[arg(long, default_value = "0")]
    node_id: u32,

    /// Local bind address for both sockets of the pair
    #[arg(short, long, default_value = "127.0.0.1:7788")]
    bind: SocketAddr,

    /// Peer address
    #[arg(short, long)]
    peer: SocketAddr,

    /// Peer's node id
    #[arg(long, default_value = "1")]
    peer_node_id: u32,

    /// Metadata directory
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Volume size in MiB (memory backed)
    #[arg(long, default_value = "64")]
    size_mib: u64,

    /// Replication protocol: A, B or C
    #[arg(long, default_value = "C")]
    protocol: String,

    /// Allow concurrent writes from both sides
    #[arg(long)]
    two_primaries: bool,

    /// Shared secret for peer authentication
    #[arg(long)]
    secret: Option<String>,

    /// Digest every data payload
    #[arg(long)]
    integrity: bool,

    /// Split-brain recovery policy with zero primaries
    #[arg(long, default_value = "disconnect")]
    after_sb_0p: String,
}

fn parse_policy(name: &str) -> Option<AfterSbPolicy> {
    Some(match name {
        "disconnect" => AfterSbPolicy::Disconnect,
        "discard-younger-primary" | "discard-younger" => AfterSbPolicy::DiscardYounger,
        "discard-older-primary" | "discard-older" => AfterSbPolicy::DiscardOlder,
        "discard-zero-changes" => AfterSbPolicy::DiscardZeroChanges,
        "discard-least-changes" => AfterSbPolicy::DiscardLeastChanges,
        "discard-local" => AfterSbPolicy::DiscardLocal,
        "discard-remote" => AfterSbPolicy::DiscardRemote,
        "consensus" => AfterSbPolicy::Consensus,
        "violently" => AfterSbPolicy::Violently,
        "call-helper" => AfterSbPolicy::CallHelper,
        "discard-secondary" => AfterSbPolicy::DiscardSecondary,
        _ => return None,
    })
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("blockrepl {VERSION} starting, resource {}", args.resource);

    let Some(after_sb_0p) = parse_policy(&args.after_sb_0p) else {
        error!("unknown after-sb policy {:?}", args.after_sb_0p);
        std::process::exit(1);
    };
    let protocol = match args.protocol.as_str() {
        "A" | "a" => WireProtocol::A,
        "B" | "b" => WireProtocol::B,
        "C" | "c" => WireProtocol::C,
        other => {
            error!("unknown protocol {other:?}");
            std::process::exit(1);
        }
    };

    if let Err(e) = std::fs::create_dir_all(&args.data_dir) {
        error!("cannot create {:?}: {e}", args.data_dir);
        std::process::exit(1);
    }
    let meta = match MetaStore::open(args.data_dir.join("meta")) {
        Ok(m) => m,
        Err(e) => {
            error!("metadata store: {e}");
            std::process::exit(1);
        }
    };

    let sectors = args.size_mib * 2048;
    let backend = Arc::new(MemoryBackend::new());
    backend.add_device(DeviceId(0), sectors);

    let mut cfg = NetConfig::new(args.bind, args.peer);
    cfg.protocol = protocol;
    cfg.two_primaries = args.two_primaries;
    cfg.cram_hmac_secret = args.secret;
    cfg.after_sb_0p = after_sb_0p;
    if args.integrity {
        cfg.integrity_alg = Some("sha3-256".to_string());
    }

    let device = Device::new(DeviceId(0), sectors, cfg.max_buffers);
    match meta.load_uuids(DeviceId(0)) {
        Ok(uuids) => {
            info!(current = format_args!("{:#018x}", uuids.current), "loaded generation uuids");
            device.core.lock().unwrap().uuids = uuids;
        }
        Err(e) => {
            error!("loading uuids: {e}");
            std::process::exit(1);
        }
    }

    let resource = Resource::new(
        args.resource.clone(),
        args.node_id,
        backend,
        Arc::new(NullActivityLog),
        Arc::new(NullHelper),
        vec![Arc::clone(&device)],
    );

    let listeners = ListenerSet::new();
    let conn = Connection::new(
        Arc::clone(&resource),
        ConnectionId(0),
        args.peer_node_id,
        cfg,
    );

    let runner = tokio::spawn(run_connection(Arc::clone(&conn), listeners));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            conn.set_conn_state(blockrepl::repl::state::ConnState::Disconnecting);
        }
        _ = runner => {
            info!("connection ended");
        }
    }

    // persist what the handshake needs next time
    let uuids = device.core.lock().unwrap().uuids.clone();
    if let Err(e) = meta.save_uuids(DeviceId(0), &uuids) {
        error!("saving uuids: {e}");
    }
    let bitmap = device.core.lock().unwrap().bitmap.clone();
    if let Err(e) = meta.save_bitmap(DeviceId(0), &bitmap) {
        error!("saving bitmap: {e}");
    }
}
