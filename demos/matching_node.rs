use std::io::Read;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use adhoc_matching::matching::matching_config::{MatchingMode, SessionConfig};
use adhoc_matching::matching::matching_events::{EventKind, Notification};
use adhoc_matching::matching::session::MatchingSession;
use anyhow::anyhow;
use clap::Parser;
use clap_derive::Parser;
use tracing::{info, warn, Level};

#[derive(Parser)]
struct Args {
    /// parent, child or p2p
    mode: String,
    port: u16,

    #[clap(long, default_value_t = 4)]
    max_peers: usize,

    #[clap(long)]
    hello_opt: Option<String>,

    #[clap(long)]
    local_address: Option<Ipv4Addr>,

    #[clap(long)]
    broadcast_address: Option<Ipv4Addr>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

fn parse_mode(s: &str) -> anyhow::Result<MatchingMode> {
    match s {
        "parent" => Ok(MatchingMode::Parent),
        "child" => Ok(MatchingMode::Child),
        "p2p" => Ok(MatchingMode::PeerToPeer),
        other => Err(anyhow!("unknown mode {:?} - expected parent, child or p2p", other)),
    }
}

fn on_notification(session: &MatchingSession, n: &Notification) {
    info!("{:?} from {}: {:?}", n.kind, n.peer, String::from_utf8_lossy(&n.opt));

    let result = match n.kind {
        EventKind::Hello | EventKind::Request => session.select_peer(n.peer, b"let's play"),
        EventKind::Established => session.send_data(n.peer, b"ping"),
        EventKind::Data if n.opt.as_slice() == b"ping" => session.send_data(n.peer, b"pong"),
        _ => Ok(()),
    };
    if let Err(e) = result {
        warn!("reacting to {:?} from {} failed: {}", n.kind, n.peer, e);
    }
}

pub fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut config = SessionConfig::new(parse_mode(&args.mode)?, args.port);
    config.max_peers = args.max_peers;
    if let Some(addr) = args.local_address {
        config.local_address = addr;
    }
    if let Some(addr) = args.broadcast_address {
        config.broadcast_address = addr;
    }

    // notifications are drained by the main loop rather than a handler
    let session = MatchingSession::new(config, None)?;
    session.start(args.hello_opt.as_deref().map(str::as_bytes))?;
    info!("running - press Ctrl-D to stop");

    let eof = Arc::new(AtomicBool::new(false));
    thread::Builder::new()
        .name("stdin".into())
        .spawn({
            let eof = eof.clone();
            move || {
                let mut buf = [0u8; 256];
                while let Ok(n) = std::io::stdin().read(&mut buf) {
                    if n == 0 {
                        break;
                    }
                }
                eof.store(true, Ordering::Release);
            }
        })?;

    while !eof.load(Ordering::Acquire) {
        for n in session.drain_notifications() {
            on_notification(&session, &n);
        }
        thread::sleep(Duration::from_millis(10));
    }

    session.stop()?;
    info!("stopped");
    Ok(())
}
