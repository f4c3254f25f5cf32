//! Demo binary (SPEC_FULL §2 crate layout): loads a static peer config, boots an
//! `Engine` against an in-memory packet source, and runs the packet-handling and
//! periodic-housekeeping loop.

mod channel;
mod config;

use std::path::PathBuf;
use std::sync::mpsc::channel as mpsc_channel;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use tracing::{error, info, warn};

use p3_core::{Decision, Engine, Hook, PacketHandler, PacketSource};

use crate::channel::{ChannelPacketSource, LoopbackLink, StaticMtu};
use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "p3-tunneld", about = "Point-to-point tunnel data-plane demo")]
struct Args {
    /// Path to the peer configuration (SPEC_FULL §5 "Ambient config").
    #[arg(long, default_value = "p3-tunneld.toml")]
    config: PathBuf,

    /// How long to run before exiting, in seconds. 0 means run until killed.
    #[arg(long, default_value_t = 0)]
    run_seconds: u64,
}

fn now_ticks() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

fn usec_entropy() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.subsec_micros()).unwrap_or(0)
}

fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!(path = %args.config.display(), error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let local_addr = match config.local_addr() {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, "invalid local_address");
            std::process::exit(1);
        }
    };

    let engine = Arc::new(Engine::new(config.role.into(), local_addr, config.listener_port, Arc::new(StaticMtu(1500))));

    for peer_cfg in &config.peers {
        let peer = match peer_cfg.to_peer() {
            Ok(p) => p,
            Err(e) => {
                error!(peer_id = peer_cfg.id, error = %e, "skipping malformed peer entry");
                continue;
            }
        };
        let peer_id = peer.id;
        let (data_key, control_key) = match peer_cfg.keys() {
            Ok(k) => k,
            Err(e) => {
                error!(peer_id = peer_cfg.id, error = %e, "skipping peer with bad key material");
                continue;
            }
        };
        if let Err(e) = engine.import_peer(peer, data_key, control_key) {
            error!(peer_id = peer_cfg.id, error = %e, "failed to import peer");
            continue;
        }
        let subnets = match peer_cfg.subnets() {
            Ok(s) => s,
            Err(e) => {
                error!(peer_id = peer_cfg.id, error = %e, "skipping malformed subnet list");
                continue;
            }
        };
        for (network, prefix_len) in subnets {
            if let Err(e) = engine.import_subnet(peer_id, network, prefix_len) {
                error!(peer_id = peer_cfg.id, error = %e, "failed to import subnet");
            }
        }

        let (wire_tx, _wire_rx) = mpsc_channel::<Vec<u8>>();
        engine.register_link(peer_id, Arc::new(LoopbackLink::new(peer_id, wire_tx)));
        info!(peer_id = peer_id.get(), "peer configured");
    }

    let (_hook_tx, hook_rx) = mpsc_channel::<(Hook, Vec<u8>)>();
    let source = ChannelPacketSource::new(hook_rx, Duration::from_millis(200));

    info!(role = ?config.role, peers = config.peers.len(), "engine started");

    let deadline = (args.run_seconds > 0).then(|| std::time::Instant::now() + Duration::from_secs(args.run_seconds));
    loop {
        if let Some(d) = deadline {
            if std::time::Instant::now() >= d {
                break;
            }
        }

        if let Some((hook, bytes)) = source.recv() {
            match PacketHandler::on_packet(&engine, hook, &bytes, usec_entropy()) {
                Decision::Dropped(e) => warn!(error = %e, "packet dropped"),
                Decision::Unmodified | Decision::HeaderAdded(_) | Decision::HeaderRemoved { .. } | Decision::ControlConsumed | Decision::RawBootstrap => {}
            }
        }

        engine.tick(now_ticks());
    }

    info!("shutting down");
}
