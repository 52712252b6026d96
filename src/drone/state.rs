use std::fmt;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use serde::Serialize;

/// Latest status report of the vehicle, one value per telemetry key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FlightState {
    // Attitude, degrees
    pub pitch: i32,
    pub roll: i32,
    pub yaw: i32,
    // Ground speed, cm/s
    pub vgx: i32,
    pub vgy: i32,
    pub vgz: i32,
    // Board temperature range, C
    pub templ: i32,
    pub temph: i32,
    /// Time-of-flight distance below the vehicle, cm
    pub tof: i32,
    /// Height relative to takeoff, cm
    pub h: i32,
    /// Battery, percent
    pub bat: i32,
    /// Barometric altitude, cm
    pub baro: f32,
    /// Motor-on time, s
    pub time: i32,
    pub agx: f32,
    pub agy: f32,
    pub agz: f32,
}

impl FlightState {
    /// Number of keys carried by one telemetry frame.
    pub const FIELD_COUNT: usize = 16;

    /// Build a state from values ordered as [`super::telemetry::FIELD_KEYS`].
    ///
    /// Integer fields are truncated toward zero, as the vehicle reports them
    /// as whole numbers anyway.
    pub fn from_values(v: [f64; Self::FIELD_COUNT]) -> Self {
        Self {
            pitch: v[0] as i32,
            roll: v[1] as i32,
            yaw: v[2] as i32,
            vgx: v[3] as i32,
            vgy: v[4] as i32,
            vgz: v[5] as i32,
            templ: v[6] as i32,
            temph: v[7] as i32,
            tof: v[8] as i32,
            h: v[9] as i32,
            bat: v[10] as i32,
            baro: v[11] as f32,
            time: v[12] as i32,
            agx: v[13] as f32,
            agy: v[14] as f32,
            agz: v[15] as f32,
        }
    }
}

/// Encodes the state in the vehicle's own wire format.
impl fmt::Display for FlightState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pitch:{};roll:{};yaw:{};vgx:{};vgy:{};vgz:{};templ:{};temph:{};tof:{};h:{};bat:{};\
             baro:{:.2};time:{};agx:{:.2};agy:{:.2};agz:{:.2};",
            self.pitch,
            self.roll,
            self.yaw,
            self.vgx,
            self.vgy,
            self.vgz,
            self.templ,
            self.temph,
            self.tof,
            self.h,
            self.bat,
            self.baro,
            self.time,
            self.agx,
            self.agy,
            self.agz
        )
    }
}

/// A state together with where it sits in the telemetry stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct Snapshot {
    pub state: FlightState,
    /// Number of frames published so far; 0 means nothing received yet.
    pub sequence: u64,
}

/// Cloneable handle to the session's flight state.
///
/// Writers replace the whole record under the lock, so a reader never sees
/// fields from two different frames.
#[derive(Debug, Clone, Default)]
pub struct SharedFlightState {
    inner: Arc<RwLock<Snapshot>>,
}

impl SharedFlightState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, state: FlightState) -> Result<u64> {
        let mut snapshot = self
            .inner
            .write()
            .map_err(|e| anyhow!("Lock error: {}", e))?;
        *snapshot = Snapshot {
            state,
            sequence: snapshot.sequence + 1,
        };
        Ok(snapshot.sequence)
    }

    pub fn snapshot(&self) -> Result<Snapshot> {
        let snapshot = self
            .inner
            .read()
            .map_err(|e| anyhow!("Lock error: {}", e))?;
        Ok(*snapshot)
    }

    pub fn state(&self) -> Result<FlightState> {
        Ok(self.snapshot()?.state)
    }

    /// Frames published so far; 0 until the first frame arrives.
    pub fn sequence(&self) -> Result<u64> {
        Ok(self.snapshot()?.sequence)
    }
}
