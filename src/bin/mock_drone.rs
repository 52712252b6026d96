//! Stand-in vehicle for bench runs: answers commands on the command port and
//! streams telemetry back to whoever sent the first command.
//!
//! Pair it with `RUST_ENV=bench ecodrone`, whose command socket binds an
//! ephemeral local port instead of the vehicle's 8889.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use ecodrone::drone::FlightState;
use ecodrone::util::{setup_logging, strip_noise};
use tokio::net::UdpSocket;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

const KNOWN_VERBS: &[&str] = &[
    "command", "takeoff", "land", "emergency", "up", "down", "left", "right", "forward", "back",
    "cw", "ccw", "speed",
];

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("invalid {}: {}", key, value)),
        Err(_) => Ok(default),
    }
}

fn reply_for(command: &str) -> &'static str {
    let verb = command.split_whitespace().next().unwrap_or("");
    if KNOWN_VERBS.contains(&verb) {
        "ok"
    } else {
        "error"
    }
}

/// Slowly climbing, slowly draining vehicle.
fn frame(tick: i32) -> String {
    let state = FlightState {
        templ: 20,
        temph: 22,
        tof: 10 + tick.min(65),
        h: tick.min(75),
        bat: (100 - tick / 10).max(0),
        baro: 101_325.0 - tick.min(75) as f32 * 12.0,
        time: tick / 10,
        agz: 1.0,
        ..Default::default()
    };
    format!("{}\r\n", state)
}

async fn stream_telemetry(
    socket: UdpSocket,
    target: SocketAddr,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    info!("Streaming telemetry to {}", target);
    let mut interval = tokio::time::interval(Duration::from_millis(100));
    let mut tick = 0;
    loop {
        tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            _ = interval.tick() => {
                socket.send_to(frame(tick).as_bytes(), target).await?;
                tick += 1;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging("debug")?;

    let bind: SocketAddr = env_or("MOCK_DRONE_BIND", SocketAddr::from(([127, 0, 0, 1], 8889)))?;
    let telemetry_port: u16 = env_or("MOCK_DRONE_TELEMETRY_PORT", 8890)?;

    let socket = UdpSocket::bind(bind).await?;
    info!("Mock drone listening on {}", socket.local_addr()?);

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut streaming = false;
    let mut buf = [0u8; 1518];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (len, from) = result?;
                let command = strip_noise(&buf[..len]);
                let reply = reply_for(&command);
                debug!("{} -> {:?}: {}", from, command, reply);

                if !streaming {
                    streaming = true;
                    let target = SocketAddr::new(from.ip(), telemetry_port);
                    let telemetry = UdpSocket::bind(SocketAddr::new(bind.ip(), 0)).await?;
                    let shutdown_rx = shutdown_tx.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) = stream_telemetry(telemetry, target, shutdown_rx).await {
                            error!("Telemetry stream error: {:#}", e);
                        }
                    });
                }

                socket.send_to(reply.as_bytes(), from).await?;
            }
            result = signal::ctrl_c() => {
                if let Err(err) = result {
                    error!("Failed to listen for shutdown signal: {}", err);
                }
                info!("Mock drone shutting down");
                let _ = shutdown_tx.send(());
                return Ok(());
            }
        }
    }
}
