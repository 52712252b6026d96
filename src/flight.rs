use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::{FlightConfig, ManeuverConfig};
use crate::drone::command::{CONTROL_MODE, LAND, TAKEOFF};
use crate::drone::{Acknowledgement, CommandChannel, CommandError};
use crate::util::shutdown_requested;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IndicatorState {
    Off,
    Armed,
    Transferring,
}

/// Status light visible to the operator.
pub trait Indicator: Send + Sync {
    fn set(&self, state: IndicatorState);
}

/// Indicator that reports through the log only.
#[derive(Debug, Default)]
pub struct TracingIndicator;

impl Indicator for TracingIndicator {
    fn set(&self, state: IndicatorState) {
        info!("Indicator: {:?}", state);
    }
}

/// One command of the scripted flight and the pause that follows it.
#[derive(Debug, Clone, PartialEq)]
pub struct Maneuver {
    pub command: String,
    pub settle: Duration,
}

impl From<&ManeuverConfig> for Maneuver {
    fn from(config: &ManeuverConfig) -> Self {
        Self {
            command: config.command.clone(),
            settle: Duration::from_millis(config.settle_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Exchange {
    pub command: String,
    pub response: String,
    pub ack: Acknowledgement,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlightReport {
    pub exchanges: Vec<Exchange>,
    pub landed: bool,
}

#[derive(Debug)]
pub enum AbortCause {
    /// The vehicle stopped answering part way through the script.
    Unresponsive(CommandError),
    /// Shutdown was requested while the script was running.
    Shutdown,
}

impl fmt::Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortCause::Unresponsive(e) => write!(f, "{}", e),
            AbortCause::Shutdown => write!(f, "shutdown requested"),
        }
    }
}

#[derive(Debug)]
pub struct FlightAborted {
    pub cause: AbortCause,
    /// What happened up to the abort, including the emergency landing attempt.
    pub report: FlightReport,
}

impl fmt::Display for FlightAborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "flight aborted after {} exchanges (landed: {}): {}",
            self.report.exchanges.len(),
            self.report.landed,
            self.cause
        )
    }
}

impl std::error::Error for FlightAborted {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.cause {
            AbortCause::Unresponsive(e) => Some(e),
            AbortCause::Shutdown => None,
        }
    }
}

/// Flies the fixed survey script: takeoff, maneuvers, land.
pub struct FlightController {
    channel: CommandChannel,
    indicator: Arc<dyn Indicator>,
    maneuvers: Vec<Maneuver>,
    arm_blinks: u32,
    blink: Duration,
}

impl FlightController {
    pub fn new(
        channel: CommandChannel,
        indicator: Arc<dyn Indicator>,
        config: &FlightConfig,
    ) -> Self {
        Self {
            channel,
            indicator,
            maneuvers: config.maneuvers.iter().map(Maneuver::from).collect(),
            arm_blinks: config.arm_blinks,
            blink: config.blink(),
        }
    }

    /// Ask the vehicle to accept SDK commands. A refusal is returned, not
    /// acted on; the caller decides whether to fly anyway.
    pub async fn enter_control_mode(&mut self) -> Result<Acknowledgement, CommandError> {
        let ack = self.channel.request(CONTROL_MODE).await?;
        match &ack {
            Acknowledgement::Accepted => info!("Successfully entered control mode"),
            Acknowledgement::Rejected(reply) => warn!("Error entering control mode: {}", reply),
        }
        Ok(ack)
    }

    /// Arm, take off, run the maneuvers and land.
    ///
    /// Shutdown before takeoff stops without flying; once airborne, it cuts
    /// the script short and lands.
    pub async fn fly(
        &mut self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<FlightReport, FlightAborted> {
        let mut report = FlightReport::default();

        let armed = tokio::select! {
            _ = self.arm() => true,
            _ = shutdown_requested(shutdown) => false,
        };
        if !armed {
            warn!("Shutdown requested before takeoff");
            self.indicator.set(IndicatorState::Off);
            return Err(FlightAborted {
                cause: AbortCause::Shutdown,
                report,
            });
        }

        let script = std::iter::once(Maneuver {
            command: TAKEOFF.to_string(),
            settle: Duration::ZERO,
        })
        .chain(self.maneuvers.clone());

        for maneuver in script {
            let outcome = tokio::select! {
                result = self.step(&maneuver, &mut report) => {
                    result.map_err(AbortCause::Unresponsive)
                }
                _ = shutdown_requested(shutdown) => Err(AbortCause::Shutdown),
            };
            if let Err(cause) = outcome {
                match &cause {
                    AbortCause::Unresponsive(_) => {
                        error!("Vehicle stopped responding during \"{}\"", maneuver.command)
                    }
                    AbortCause::Shutdown => {
                        warn!("Shutdown requested during \"{}\", landing", maneuver.command)
                    }
                }
                report.landed = self.emergency_land(&mut report).await;
                self.indicator.set(IndicatorState::Off);
                return Err(FlightAborted { cause, report });
            }
        }

        let landed = self.exchange(LAND, &mut report).await;
        self.indicator.set(IndicatorState::Off);
        match landed {
            Ok(ack) => {
                report.landed = ack.is_accepted();
                Ok(report)
            }
            Err(e) => Err(FlightAborted {
                cause: AbortCause::Unresponsive(e),
                report,
            }),
        }
    }

    async fn arm(&self) {
        for _ in 0..self.arm_blinks {
            self.indicator.set(IndicatorState::Armed);
            sleep(self.blink).await;
            self.indicator.set(IndicatorState::Off);
            sleep(self.blink).await;
        }
        sleep(self.blink).await;
        self.indicator.set(IndicatorState::Armed);
    }

    async fn step(
        &mut self,
        maneuver: &Maneuver,
        report: &mut FlightReport,
    ) -> Result<(), CommandError> {
        self.exchange(&maneuver.command, report).await?;
        if !maneuver.settle.is_zero() {
            sleep(maneuver.settle).await;
        }
        Ok(())
    }

    async fn exchange(
        &mut self,
        command: &str,
        report: &mut FlightReport,
    ) -> Result<Acknowledgement, CommandError> {
        let response = self.channel.send(command).await?;
        let ack = Acknowledgement::classify(&response);
        if !ack.is_accepted() {
            warn!("Vehicle answered \"{}\" with {}", command, response);
        }
        report.exchanges.push(Exchange {
            command: command.to_string(),
            response,
            ack: ack.clone(),
        });
        Ok(ack)
    }

    async fn emergency_land(&mut self, report: &mut FlightReport) -> bool {
        match self.exchange(LAND, report).await {
            Ok(ack) => ack.is_accepted(),
            Err(e) => {
                error!("Emergency landing got no answer: {}", e);
                false
            }
        }
    }
}
