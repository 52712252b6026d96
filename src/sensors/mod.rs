//! Environmental sensor interface.
//!
//! Drivers live outside this crate; the logger only needs something that can
//! be asked for a sample and may answer "not yet".

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

/// Outcome of asking a sensor for a sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading<T> {
    Ready(T),
    /// Conversion still in progress, e.g. the first seconds after power-up.
    NotReady,
}

#[async_trait]
pub trait Sensor: Send {
    type Sample: Send;

    fn name(&self) -> &str;

    async fn read(&mut self) -> Result<Reading<Self::Sample>>;
}

/// CO2 / humidity sensor sample.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GasSample {
    pub co2_ppm: u16,
    pub temperature_c: f32,
    pub humidity_pct: f32,
}

/// Barometer sample.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BaroSample {
    pub temperature_c: f32,
    pub pressure_pa: f32,
}

impl BaroSample {
    pub fn pressure_hpa(&self) -> f32 {
        self.pressure_pa / 100.0
    }

    pub fn altitude_m(&self, sea_level_hpa: f32) -> f32 {
        pressure_altitude(self.pressure_hpa(), sea_level_hpa)
    }
}

/// International barometric formula, metres above the given sea level pressure.
pub fn pressure_altitude(pressure_hpa: f32, sea_level_hpa: f32) -> f32 {
    44330.0 * (1.0 - (pressure_hpa / sea_level_hpa).powf(0.1903))
}

/// Stand-in for a sensor with no driver attached; never has data.
pub struct Detached<T> {
    name: String,
    _sample: std::marker::PhantomData<fn() -> T>,
}

impl<T> Detached<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _sample: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Sensor for Detached<T> {
    type Sample = T;

    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&mut self) -> Result<Reading<T>> {
        Ok(Reading::NotReady)
    }
}

/// Logs a sensor fault once when it starts and once when it clears.
#[derive(Debug, Default)]
pub struct FaultLatch {
    failing: bool,
}

impl FaultLatch {
    pub fn fault(&mut self, sensor: &str, error: &anyhow::Error) {
        if !self.failing {
            warn!("{} read failed, logging placeholder values: {:#}", sensor, error);
            self.failing = true;
        }
    }

    pub fn clear(&mut self, sensor: &str) {
        if self.failing {
            info!("{} readings recovered", sensor);
            self.failing = false;
        }
    }

    pub fn is_failing(&self) -> bool {
        self.failing
    }
}
