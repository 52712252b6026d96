use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::drone::{
    Acknowledgement, CommandChannel, CommandError, ReceiverStats, SharedFlightState,
    TelemetryCounts, TelemetryReceiver,
};
use crate::flight::{FlightAborted, FlightController, FlightReport, Indicator, IndicatorState};
use crate::sensor_logger::SensorLogger;
use crate::sensors::{BaroSample, GasSample, Sensor};
use crate::storage::LogStore;
use crate::transfer::{TransferCoordinator, TransferError, TransferLink, TransferReport};
use crate::util::shutdown_requested;

#[derive(Debug, Serialize)]
pub struct SessionReport {
    pub control_mode: Acknowledgement,
    pub flight: FlightReport,
    pub telemetry: TelemetryCounts,
    pub transfer: TransferReport,
}

type Tasks = Vec<(&'static str, JoinHandle<anyhow::Result<()>>)>;

#[derive(Debug)]
pub enum SessionError {
    /// Sockets, log file or tasks could not be set up.
    Setup(anyhow::Error),
    /// The vehicle refused control mode and the config requires it.
    ControlModeRejected(String),
    /// The vehicle never answered the control mode request.
    Unresponsive(CommandError),
    Flight(FlightAborted),
    Transfer(TransferError),
    /// Shutdown was requested outside the flight itself.
    Cancelled,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Setup(e) => write!(f, "session setup failed: {:#}", e),
            SessionError::ControlModeRejected(reply) => {
                write!(f, "vehicle refused control mode: {}", reply)
            }
            SessionError::Unresponsive(e) => write!(f, "vehicle unresponsive: {}", e),
            SessionError::Flight(e) => write!(f, "{}", e),
            SessionError::Transfer(e) => write!(f, "{}", e),
            SessionError::Cancelled => write!(f, "session cancelled by shutdown"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<anyhow::Error> for SessionError {
    fn from(e: anyhow::Error) -> Self {
        SessionError::Setup(e)
    }
}

/// Everything one survey run shares between its tasks.
pub struct Session {
    config: Config,
    state: SharedFlightState,
    store: Arc<dyn LogStore>,
    indicator: Arc<dyn Indicator>,
}

impl Session {
    pub fn new(config: Config, store: Arc<dyn LogStore>, indicator: Arc<dyn Indicator>) -> Self {
        Self {
            config,
            state: SharedFlightState::new(),
            store,
            indicator,
        }
    }

    pub fn state(&self) -> SharedFlightState {
        self.state.clone()
    }

    /// Fly the survey, then hand the log off over `link`.
    ///
    /// Telemetry and sensor logging run in the background from the start and
    /// are stopped once the vehicle is down, before the transfer begins, so
    /// the transferred log is final. A broadcast on `shutdown` lands the
    /// vehicle if airborne and ends the session early.
    pub async fn run<G, B, L>(
        &self,
        gas: G,
        baro: B,
        link: L,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<SessionReport, SessionError>
    where
        G: Sensor<Sample = GasSample> + 'static,
        B: Sensor<Sample = BaroSample> + 'static,
        L: TransferLink,
    {
        let (tasks_tx, _) = broadcast::channel(1);
        let (tasks, receiver_stats) = self.spawn_background(gas, baro, &tasks_tx).await?;

        let flown = self.fly(&mut shutdown).await;

        info!("Stopping telemetry and sensor logging...");
        let _ = tasks_tx.send(());
        join_all(tasks).await;

        let telemetry = receiver_stats.counts();
        if self.state.sequence()? == 0 {
            warn!("No telemetry received during the session");
        }

        let (control_mode, flight) = flown?;

        let mut coordinator = TransferCoordinator::new(
            link,
            self.store.clone(),
            self.indicator.clone(),
            self.config.transfer.connect_timeout(),
        );
        let transfer = tokio::select! {
            result = coordinator.run() => result.map_err(SessionError::Transfer)?,
            _ = shutdown_requested(&mut shutdown) => {
                warn!("Shutdown requested, abandoning transfer");
                self.indicator.set(IndicatorState::Off);
                return Err(SessionError::Cancelled);
            }
        };

        Ok(SessionReport {
            control_mode,
            flight,
            telemetry,
            transfer,
        })
    }

    async fn spawn_background<G, B>(
        &self,
        gas: G,
        baro: B,
        shutdown: &broadcast::Sender<()>,
    ) -> anyhow::Result<(Tasks, Arc<ReceiverStats>)>
    where
        G: Sensor<Sample = GasSample> + 'static,
        B: Sensor<Sample = BaroSample> + 'static,
    {
        let receiver = TelemetryReceiver::bind(
            self.config.drone.telemetry_bind(),
            self.state.clone(),
            self.config.telemetry.poll_interval(),
            self.config.telemetry.buffer_size,
        )
        .await?;
        let stats = receiver.stats();

        let mut logger = SensorLogger::new(
            gas,
            baro,
            self.state.clone(),
            self.store.clone(),
            self.config.logger.period(),
            self.config.logger.sea_level_hpa,
        );
        logger.prepare().await?;

        let telemetry_rx = shutdown.subscribe();
        let logger_rx = shutdown.subscribe();
        let tasks: Tasks = vec![
            (
                "Telemetry receiver",
                tokio::spawn(async move { receiver.run(telemetry_rx).await }),
            ),
            (
                "Sensor logger",
                tokio::spawn(async move { logger.run(logger_rx).await }),
            ),
        ];
        Ok((tasks, stats))
    }

    async fn fly(
        &self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(Acknowledgement, FlightReport), SessionError> {
        let drone = &self.config.drone;
        let channel = CommandChannel::open(
            drone.command_bind,
            drone.command_endpoint(),
            drone.command_timeout(),
        )
        .await
        .map_err(|e| SessionError::Setup(e.into()))?;

        let mut controller =
            FlightController::new(channel, self.indicator.clone(), &self.config.flight);

        let control_mode = tokio::select! {
            result = controller.enter_control_mode() => result.map_err(SessionError::Unresponsive)?,
            _ = shutdown_requested(shutdown) => return Err(SessionError::Cancelled),
        };
        if let Acknowledgement::Rejected(reply) = &control_mode {
            if self.config.flight.require_ack {
                return Err(SessionError::ControlModeRejected(reply.clone()));
            }
            warn!("Flying without a control mode acknowledgement");
        }

        let flight = controller.fly(shutdown).await.map_err(SessionError::Flight)?;
        Ok((control_mode, flight))
    }
}

async fn join_all(tasks: Tasks) {
    for (name, handle) in tasks {
        match handle.await {
            Ok(Ok(())) => info!("{} stopped", name),
            Ok(Err(e)) => error!("{} error: {:#}", name, e),
            Err(e) => error!("{} join error: {}", name, e),
        }
    }
}

#[cfg(test)]
mod tests;
