use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::drone::SharedFlightState;
use crate::sensors::{BaroSample, FaultLatch, GasSample, Reading, Sensor};
use crate::storage::LogStore;

pub const LOG_HEADER: &str = "Motor Time (s),Battery (%),TOF Height (cm),CO2 (ppm),\
Gas Sensor Temperature (C),Barometer Temperature (C),Relative Humidity (%),\
Pressure (hPa),Approx. Altitude (m)";

/// One row of the survey log. Unavailable readings are logged as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LogRecord {
    pub motor_time: i32,
    pub battery: i32,
    pub tof_height: i32,
    pub co2_ppm: u16,
    pub gas_temp_c: f32,
    pub baro_temp_c: f32,
    pub humidity_pct: f32,
    pub pressure_hpa: f32,
    pub altitude_m: f32,
}

impl LogRecord {
    /// The record as a log line, including its leading newline.
    pub fn to_line(&self) -> String {
        format!(
            "\n{},{},{},{},{:.2},{:.2},{:.2},{:.2},{:.2}",
            self.motor_time,
            self.battery,
            self.tof_height,
            self.co2_ppm,
            self.gas_temp_c,
            self.baro_temp_c,
            self.humidity_pct,
            self.pressure_hpa,
            self.altitude_m
        )
    }
}

/// Samples the environmental sensors next to the vehicle's own state and
/// appends one row per period to the log.
pub struct SensorLogger<G, B> {
    gas: G,
    baro: B,
    state: SharedFlightState,
    store: Arc<dyn LogStore>,
    period: Duration,
    sea_level_hpa: f32,
    gas_fault: FaultLatch,
    baro_fault: FaultLatch,
}

impl<G, B> SensorLogger<G, B>
where
    G: Sensor<Sample = GasSample>,
    B: Sensor<Sample = BaroSample>,
{
    pub fn new(
        gas: G,
        baro: B,
        state: SharedFlightState,
        store: Arc<dyn LogStore>,
        period: Duration,
        sea_level_hpa: f32,
    ) -> Self {
        Self {
            gas,
            baro,
            state,
            store,
            period,
            sea_level_hpa,
            gas_fault: FaultLatch::default(),
            baro_fault: FaultLatch::default(),
        }
    }

    /// Write the header if the log is new or empty.
    pub async fn prepare(&self) -> Result<()> {
        if self.store.len().await? == 0 {
            self.store.create(LOG_HEADER).await?;
        } else {
            info!("Appending to existing log");
        }
        Ok(())
    }

    /// Append a record every period until shutdown. Call [`Self::prepare`] first.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Sensor logger stopping");
                    return Ok(());
                }
                _ = interval.tick() => {
                    if let Err(e) = self.log_once().await {
                        error!("Failed to append log record: {:#}", e);
                    }
                }
            }
        }
    }

    /// Take one sample of every source and append it.
    pub async fn log_once(&mut self) -> Result<LogRecord> {
        let record = self.sample().await?;
        self.store.append(&record.to_line()).await?;
        debug!("Logged {:?}", record);
        Ok(record)
    }

    pub async fn sample(&mut self) -> Result<LogRecord> {
        let gas = self.read_gas().await;
        let baro = self.read_baro().await;
        let flight = self.state.state()?;

        let mut record = LogRecord {
            motor_time: flight.time,
            battery: flight.bat,
            tof_height: flight.tof,
            ..Default::default()
        };
        if let Some(gas) = gas {
            record.co2_ppm = gas.co2_ppm;
            record.gas_temp_c = gas.temperature_c;
            record.humidity_pct = gas.humidity_pct;
        }
        if let Some(baro) = baro {
            record.baro_temp_c = baro.temperature_c;
            record.pressure_hpa = baro.pressure_hpa();
            record.altitude_m = baro.altitude_m(self.sea_level_hpa);
        }
        Ok(record)
    }

    async fn read_gas(&mut self) -> Option<GasSample> {
        match self.gas.read().await {
            Ok(Reading::Ready(sample)) if sample.co2_ppm == 0 => {
                debug!("{}: invalid sample, skipping", self.gas.name());
                None
            }
            Ok(Reading::Ready(sample)) => {
                self.gas_fault.clear(self.gas.name());
                Some(sample)
            }
            Ok(Reading::NotReady) => None,
            Err(e) => {
                self.gas_fault.fault(self.gas.name(), &e);
                None
            }
        }
    }

    async fn read_baro(&mut self) -> Option<BaroSample> {
        match self.baro.read().await {
            Ok(Reading::Ready(sample)) => {
                self.baro_fault.clear(self.baro.name());
                Some(sample)
            }
            Ok(Reading::NotReady) => None,
            Err(e) => {
                self.baro_fault.fault(self.baro.name(), &e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests;
