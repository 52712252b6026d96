use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::UdpSocket;

use super::*;
use crate::config::{DroneConfig, FlightConfig, ManeuverConfig};
use crate::flight::{AbortCause, TracingIndicator};
use crate::sensor_logger::LOG_HEADER;
use crate::sensors::Detached;
use crate::storage::FileLogStore;
use crate::transfer::Connection;

const FRAME: &str = "pitch:0;roll:0;yaw:0;vgx:0;vgy:0;vgz:0;templ:20;temph:22;tof:30;h:50;bat:87;baro:101325.00;time:12;agx:0.00;agy:0.00;agz:1.00;\r\n";

/// Link whose client is already connected.
#[derive(Clone, Default)]
struct ConnectedLink {
    received: Arc<Mutex<Vec<u8>>>,
}

#[async_trait]
impl TransferLink for ConnectedLink {
    async fn advertise(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn wait_connected(&mut self) -> anyhow::Result<Connection> {
        Ok(Connection::Subscribed)
    }

    async fn notify(&mut self, chunk: &[u8]) -> anyhow::Result<bool> {
        self.received.lock().unwrap().extend_from_slice(chunk);
        Ok(true)
    }

    fn max_payload(&self) -> usize {
        64
    }
}

async fn free_udp_port() -> Result<u16> {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    Ok(socket.local_addr()?.port())
}

/// Fake vehicle: answers commands and, once airborne, streams telemetry.
async fn vehicle(
    control_reply: &'static str,
    telemetry_port: u16,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let addr = socket.local_addr()?;
    let telemetry_to = SocketAddr::from((Ipv4Addr::LOCALHOST, telemetry_port));

    let handle = tokio::spawn(async move {
        let mut buf = [0u8; 256];
        while let Ok(Ok((len, from))) =
            tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf)).await
        {
            let command = String::from_utf8_lossy(&buf[..len]).to_string();
            if command == "takeoff" {
                socket.send_to(FRAME.as_bytes(), telemetry_to).await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            let reply = if command == "command" { control_reply } else { "ok" };
            socket.send_to(reply.as_bytes(), from).await.unwrap();
        }
    });
    Ok((addr, handle))
}

fn config(vehicle: SocketAddr, telemetry_port: u16, log_dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.drone = DroneConfig {
        address: vehicle.ip(),
        command_port: vehicle.port(),
        telemetry_port,
        command_bind: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        command_timeout_ms: 500,
    };
    config.flight = FlightConfig {
        require_ack: false,
        arm_blinks: 1,
        blink_ms: 0,
        maneuvers: vec![ManeuverConfig {
            command: "up 75".to_string(),
            settle_ms: 30,
        }],
    };
    config.logger.directory = log_dir.to_path_buf();
    config.logger.period_ms = 10;
    config
}

/// A shutdown channel nobody will ever fire.
fn idle_shutdown() -> broadcast::Receiver<()> {
    broadcast::channel(1).1
}

fn session(config: Config, log: &std::path::Path) -> Session {
    crate::util::init_test_logging();
    Session::new(
        config,
        Arc::new(FileLogStore::new(log)),
        Arc::new(TracingIndicator),
    )
}

#[tokio::test]
async fn test_full_session_flies_logs_and_transfers() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = dir.path().join("survey.csv");
    let telemetry_port = free_udp_port().await?;
    let (addr, _vehicle) = vehicle("ok", telemetry_port).await?;

    let session = session(config(addr, telemetry_port, dir.path()), &log);
    let link = ConnectedLink::default();
    let report = session
        .run(
            Detached::<GasSample>::new("gas"),
            Detached::<BaroSample>::new("baro"),
            link.clone(),
            idle_shutdown(),
        )
        .await?;

    assert_eq!(report.control_mode, Acknowledgement::Accepted);
    assert!(report.flight.landed);
    assert_eq!(report.flight.exchanges.len(), 3);
    assert!(report.telemetry.accepted >= 1);
    assert_eq!(report.telemetry.dropped, 0);

    // Telemetry from the climb made it into the shared state and the log.
    assert_eq!(session.state().state()?.bat, 87);
    let contents = std::fs::read_to_string(&log)?;
    assert!(contents.starts_with(LOG_HEADER));
    assert!(contents.lines().skip(1).any(|line| line.starts_with("12,87,30,")));

    // Everything on disk went over the link.
    assert_eq!(report.transfer.bytes, contents.len());
    assert_eq!(*link.received.lock().unwrap(), contents.as_bytes());
    Ok(())
}

#[tokio::test]
async fn test_rejected_control_mode_aborts_when_required() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = dir.path().join("survey.csv");
    let telemetry_port = free_udp_port().await?;
    let (addr, _vehicle) = vehicle("error", telemetry_port).await?;

    let mut config = config(addr, telemetry_port, dir.path());
    config.flight.require_ack = true;
    let link = ConnectedLink::default();
    let result = session(config, &log)
        .run(
            Detached::<GasSample>::new("gas"),
            Detached::<BaroSample>::new("baro"),
            link.clone(),
            idle_shutdown(),
        )
        .await;

    assert!(matches!(result, Err(SessionError::ControlModeRejected(ref r)) if r == "error"));
    assert!(link.received.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_rejected_control_mode_flies_when_tolerated() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = dir.path().join("survey.csv");
    let telemetry_port = free_udp_port().await?;
    let (addr, _vehicle) = vehicle("error", telemetry_port).await?;

    let report = session(config(addr, telemetry_port, dir.path()), &log)
        .run(
            Detached::<GasSample>::new("gas"),
            Detached::<BaroSample>::new("baro"),
            ConnectedLink::default(),
            idle_shutdown(),
        )
        .await?;

    assert_eq!(report.control_mode, Acknowledgement::Rejected("error".to_string()));
    assert!(report.flight.landed);
    Ok(())
}

#[tokio::test]
async fn test_silent_vehicle_is_reported_unresponsive() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = dir.path().join("survey.csv");
    let telemetry_port = free_udp_port().await?;
    // Bound but never answers.
    let silent = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;

    let mut config = config(silent.local_addr()?, telemetry_port, dir.path());
    config.drone.command_timeout_ms = 50;
    let result = session(config, &log)
        .run(
            Detached::<GasSample>::new("gas"),
            Detached::<BaroSample>::new("baro"),
            ConnectedLink::default(),
            idle_shutdown(),
        )
        .await;

    assert!(matches!(
        result,
        Err(SessionError::Unresponsive(CommandError::Timeout { .. }))
    ));
    // Logging had started before the flight and was shut down cleanly.
    assert!(std::fs::read_to_string(&log)?.starts_with(LOG_HEADER));
    Ok(())
}

#[tokio::test]
async fn test_shutdown_mid_flight_lands_and_stops_tasks() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = dir.path().join("survey.csv");
    let telemetry_port = free_udp_port().await?;
    let (addr, _vehicle) = vehicle("ok", telemetry_port).await?;

    let mut config = config(addr, telemetry_port, dir.path());
    config.flight.maneuvers[0].settle_ms = 10_000;
    let session = session(config, &log);
    let link = ConnectedLink::default();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let started = std::time::Instant::now();
    let (result, sent) = tokio::join!(
        session.run(
            Detached::<GasSample>::new("gas"),
            Detached::<BaroSample>::new("baro"),
            link.clone(),
            shutdown_rx,
        ),
        async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            shutdown_tx.send(())
        }
    );
    sent?;

    match result {
        Err(SessionError::Flight(aborted)) => {
            assert!(matches!(aborted.cause, AbortCause::Shutdown));
            assert!(aborted.report.landed);
            assert_eq!(
                aborted.report.exchanges.last().map(|e| e.command.as_str()),
                Some("land")
            );
        }
        other => panic!("expected a shutdown abort, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(link.received.lock().unwrap().is_empty());
    assert!(std::fs::read_to_string(&log)?.starts_with(LOG_HEADER));

    // Both background tasks released their sockets.
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, telemetry_port)).await?;
    Ok(())
}
