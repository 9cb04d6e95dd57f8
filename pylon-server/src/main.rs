//! The pylon proxy daemon.
//!
//! Wires the session store, datacenter registry, abuse gate, and connection
//! bridge together, then accepts client sockets until interrupted.

#![deny(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use pylon_bridge::{
    AbuseGate, Bridge, BridgeConfig, DcRegistry, FixedWindow, PermitAll, TcpConnector, TracingSink,
};
use pylon_session::{MemoryKv, SessionStore};
use tokio::net::TcpListener;

#[derive(Debug, Parser)]
#[command(name = "pylon", about = "Transparent MTProto proxy", version)]
struct Args {
    /// Address to accept client connections on.
    #[arg(long, default_value = "0.0.0.0:8443")]
    listen: SocketAddr,

    /// Datacenter new sessions are routed to.
    #[arg(long, default_value_t = 2)]
    default_dc: u8,

    /// Override a datacenter endpoint, as `id=host:port`. Repeatable.
    #[arg(long = "dc", value_parser = parse_dc)]
    dc_overrides: Vec<(u8, String)>,

    /// Sessions idle longer than this are expired.
    #[arg(long, default_value_t = 600)]
    idle_timeout_secs: u64,

    /// How often expired sessions are swept.
    #[arg(long, default_value_t = 60)]
    sweep_interval_secs: u64,

    /// New connections allowed per client IP per minute. 0 disables the
    /// limit.
    #[arg(long, default_value_t = 0)]
    max_conns_per_minute: u32,

    /// Largest accepted frame, in bytes.
    #[arg(long, default_value_t = 1 << 20)]
    max_frame_len: usize,
}

fn parse_dc(s: &str) -> Result<(u8, String), String> {
    let (id, addr) = s.split_once('=').ok_or("expected id=host:port")?;
    let id: u8 = id.parse().map_err(|_| "datacenter id must be 1-255")?;
    if addr.is_empty() {
        return Err("empty endpoint address".into());
    }
    Ok((id, addr.to_owned()))
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let mut registry = DcRegistry::default();
    for (id, addr) in &args.dc_overrides {
        registry.set_endpoint(*id, addr.clone());
    }

    let gate: Arc<dyn AbuseGate> = if args.max_conns_per_minute > 0 {
        Arc::new(FixedWindow::new(args.max_conns_per_minute, Duration::from_secs(60)))
    } else {
        Arc::new(PermitAll)
    };

    let store = Arc::new(SessionStore::new(
        Arc::new(MemoryKv::new()),
        Duration::from_secs(args.idle_timeout_secs),
    ));

    let config = BridgeConfig {
        default_dc: args.default_dc,
        max_frame_len: args.max_frame_len,
        ..BridgeConfig::default()
    };
    let bridge = Bridge::new(
        config,
        store.clone(),
        registry,
        gate,
        Arc::new(TracingSink),
        TcpConnector,
    );

    let sweep_interval = Duration::from_secs(args.sweep_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = store.sweep_expired() {
                tracing::warn!(error = %e, "sweep failed");
            }
        }
    });

    let listener = TcpListener::bind(args.listen).await?;
    tracing::info!(listen = %args.listen, default_dc = args.default_dc, "pylon listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                socket.set_nodelay(true).ok();
                let bridge = bridge.clone();
                tokio::spawn(async move {
                    bridge.serve_connection(socket, peer.ip(), None).await;
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }
    Ok(())
}
