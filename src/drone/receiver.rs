use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace};

use super::state::SharedFlightState;
use super::telemetry;
use crate::util::strip_noise;

const SUMMARY_EVERY: u64 = 500;

#[derive(Debug, Default)]
pub struct ReceiverStats {
    pub accepted: AtomicU64,
    pub dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TelemetryCounts {
    pub accepted: u64,
    pub dropped: u64,
}

impl ReceiverStats {
    pub fn counts(&self) -> TelemetryCounts {
        TelemetryCounts {
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Keeps the shared flight state in step with the vehicle's status stream.
pub struct TelemetryReceiver {
    socket: UdpSocket,
    state: SharedFlightState,
    poll_interval: Duration,
    buffer_size: usize,
    stats: Arc<ReceiverStats>,
}

impl TelemetryReceiver {
    pub async fn bind(
        addr: std::net::SocketAddr,
        state: SharedFlightState,
        poll_interval: Duration,
        buffer_size: usize,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("Telemetry receiver listening on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            state,
            poll_interval,
            buffer_size,
            stats: Arc::new(ReceiverStats::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.socket.local_addr()
    }

    pub fn stats(&self) -> Arc<ReceiverStats> {
        self.stats.clone()
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let busy = match self.poll_once(&mut buf) {
                Ok(received) => received,
                Err(e) => {
                    error!("Telemetry socket error: {}", e);
                    false
                }
            };

            // Yield between frames so a flooded socket still sees shutdown.
            tokio::select! {
                _ = shutdown.recv() => {
                    let counts = self.stats.counts();
                    info!(
                        "Telemetry receiver stopping ({} frames accepted, {} dropped)",
                        counts.accepted, counts.dropped
                    );
                    return Ok(());
                }
                _ = tokio::task::yield_now(), if busy => {}
                _ = tokio::time::sleep(self.poll_interval), if !busy => {}
            }
        }
    }

    /// Handle at most one pending datagram. Returns whether one was there.
    pub fn poll_once(&self, buf: &mut [u8]) -> io::Result<bool> {
        let len = match self.socket.try_recv_from(buf) {
            Ok((len, _)) => len,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(e),
        };

        let frame = strip_noise(&buf[..len]);
        match telemetry::decode(&frame) {
            Ok(state) => match self.state.publish(state) {
                Ok(sequence) => {
                    let accepted = self.stats.accepted.fetch_add(1, Ordering::Relaxed) + 1;
                    trace!("Telemetry frame {} published", sequence);
                    if accepted % SUMMARY_EVERY == 0 {
                        info!(
                            "Telemetry: {} frames accepted, {} dropped, battery {}%",
                            accepted,
                            self.stats.dropped.load(Ordering::Relaxed),
                            state.bat
                        );
                    }
                }
                Err(e) => error!("Failed to publish telemetry: {}", e),
            },
            Err(e) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Dropping telemetry frame: {}", e);
            }
        }
        Ok(true)
    }
}
