//! # Ripple Node
//!
//! Small standalone peer for poking at the transport: binds a socket,
//! optionally connects to another node, logs every event and can echo
//! received data back on the channel it arrived on.
//!
//! ## Usage
//!
//! ```bash
//! # Listen and echo
//! ripple-node --bind 0.0.0.0:7777 --echo
//!
//! # Connect and send a greeting every second
//! ripple-node --bind 0.0.0.0:0 --connect 192.0.2.10:7777
//!
//! # Tune everything from a file
//! ripple-node --config node.toml --connect 192.0.2.10:7777
//! ```
//!
//! `RIPPLE_BIND` and `RIPPLE_CONFIG` stand in for `--bind` and `--config`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use ripple_transport::{NetworkEvent, RippleSocket, SocketConfig};

/// Ripple transport test peer.
#[derive(Parser, Debug)]
#[command(name = "ripple-node", about = "Ripple transport test peer")]
struct Cli {
    /// UDP bind address (default from config: 0.0.0.0:0).
    #[arg(long, short = 'b', env = "RIPPLE_BIND")]
    bind: Option<SocketAddr>,

    /// Connect to a peer and send a greeting every second.
    #[arg(long, short = 'c')]
    connect: Option<SocketAddr>,

    /// TOML socket configuration.
    #[arg(long, short = 'f', env = "RIPPLE_CONFIG")]
    config: Option<PathBuf>,

    /// Echo received data back to the sender.
    #[arg(long, short = 'e', default_value_t = false)]
    echo: bool,
}

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Parse CLI ───────────────────────────────────────────────
    let args = Cli::parse();

    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("failed to read config '{}': {e}", path.display()))?;
            SocketConfig::from_toml_str(&text)?
        }
        None => SocketConfig::default(),
    };
    if let Some(bind) = args.bind {
        match bind {
            SocketAddr::V4(_) => config.ipv4_bind = Some(bind),
            SocketAddr::V6(_) => config.ipv6_bind = Some(bind),
        }
    }

    tracing::info!(
        bind = ?args.bind,
        connect = ?args.connect,
        echo = args.echo,
        channels = config.channel_types.len(),
        "ripple-node starting"
    );

    // ── Socket ──────────────────────────────────────────────────
    let socket = RippleSocket::new(config)?;
    socket.start()?;
    for addr in socket.local_addrs() {
        tracing::info!(%addr, "listening");
    }

    let peer = match args.connect {
        Some(endpoint) => Some(socket.connect(endpoint)?),
        None => None,
    };

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        })?;
    }

    // ── Event loop ──────────────────────────────────────────────
    let mut connected = false;
    let mut sent: u64 = 0;
    let mut last_send = Instant::now();
    let mut last_stats_log = Instant::now();
    let stats_interval = Duration::from_secs(5);

    while running.load(Ordering::Relaxed) {
        if let Some(event) = socket.poll_timeout(Duration::from_millis(100)) {
            match event {
                NetworkEvent::Connect { handle, endpoint } => {
                    tracing::info!(%handle, %endpoint, "connected");
                    if Some(handle) == peer {
                        connected = true;
                    }
                }
                NetworkEvent::Disconnect { handle, endpoint } => {
                    tracing::info!(%handle, %endpoint, "disconnected");
                    if Some(handle) == peer {
                        break;
                    }
                }
                NetworkEvent::Timeout { handle, endpoint } => {
                    tracing::warn!(%handle, %endpoint, "timed out");
                    if Some(handle) == peer {
                        break;
                    }
                }
                NetworkEvent::Data {
                    handle,
                    channel_id,
                    data,
                } => {
                    tracing::info!(
                        %handle,
                        channel_id,
                        len = data.len(),
                        text = %String::from_utf8_lossy(&data),
                        "data"
                    );
                    if args.echo && Some(handle) != peer {
                        if let Err(e) = socket.send(handle, channel_id, &data) {
                            tracing::warn!(%handle, error = %e, "echo failed");
                        }
                    }
                }
                NetworkEvent::AckNotification {
                    handle,
                    notification_key,
                } => {
                    tracing::debug!(%handle, notification_key, "acknowledged");
                }
                NetworkEvent::UnconnectedData { endpoint, data }
                | NetworkEvent::BroadcastData { endpoint, data } => {
                    tracing::info!(%endpoint, len = data.len(), "connectionless data");
                }
            }
        }

        if let (true, Some(handle)) = (connected, peer) {
            if last_send.elapsed() >= Duration::from_secs(1) {
                sent += 1;
                let message = format!("hello #{sent}");
                if let Err(e) = socket.send(handle, 0, message.as_bytes()) {
                    tracing::warn!(%handle, error = %e, "send failed");
                }
                last_send = Instant::now();
            }
        }

        if last_stats_log.elapsed() >= stats_interval {
            let stats = socket.stats();
            tracing::info!(
                connections = stats.connections,
                datagrams_in = stats.datagrams_in,
                datagrams_out = stats.datagrams_out,
                dropped = stats.dropped_datagrams,
                rejected = stats.rejected_handshakes,
                live_blocks = stats.memory.live_blocks,
                "socket stats"
            );
            last_stats_log = Instant::now();
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────
    socket.shutdown();
    tracing::info!(sent, "ripple-node stopped");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_and_long_flags() {
        let cli = Cli::try_parse_from([
            "ripple-node",
            "-b",
            "127.0.0.1:7777",
            "--connect",
            "192.0.2.10:7777",
            "-f",
            "node.toml",
            "--echo",
        ])
        .unwrap();
        assert_eq!(cli.bind, Some("127.0.0.1:7777".parse().unwrap()));
        assert_eq!(cli.connect, Some("192.0.2.10:7777".parse().unwrap()));
        assert_eq!(cli.config, Some(PathBuf::from("node.toml")));
        assert!(cli.echo);
    }

    #[test]
    fn rejects_malformed_address() {
        assert!(Cli::try_parse_from(["ripple-node", "--connect", "not-an-address"]).is_err());
    }
}
