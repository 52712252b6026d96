use std::collections::VecDeque;

use anyhow::anyhow;
use async_trait::async_trait;

use super::*;
use crate::drone::FlightState;
use crate::storage::FileLogStore;

/// Replays a fixed list of readings, then reports not-ready.
struct Scripted<T> {
    name: &'static str,
    readings: VecDeque<Result<Reading<T>>>,
}

impl<T> Scripted<T> {
    fn new(name: &'static str, readings: Vec<Result<Reading<T>>>) -> Self {
        Self {
            name,
            readings: readings.into(),
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Sensor for Scripted<T> {
    type Sample = T;

    fn name(&self) -> &str {
        self.name
    }

    async fn read(&mut self) -> Result<Reading<T>> {
        self.readings.pop_front().unwrap_or(Ok(Reading::NotReady))
    }
}

const GAS: GasSample = GasSample {
    co2_ppm: 612,
    temperature_c: 24.5,
    humidity_pct: 41.25,
};

const BARO: BaroSample = BaroSample {
    temperature_c: 23.75,
    pressure_pa: 101_325.0,
};

fn logger(
    gas: Vec<Result<Reading<GasSample>>>,
    baro: Vec<Result<Reading<BaroSample>>>,
    store: Arc<dyn LogStore>,
) -> (SensorLogger<Scripted<GasSample>, Scripted<BaroSample>>, SharedFlightState) {
    let state = SharedFlightState::new();
    let logger = SensorLogger::new(
        Scripted::new("gas", gas),
        Scripted::new("baro", baro),
        state.clone(),
        store,
        Duration::from_millis(5),
        1013.25,
    );
    (logger, state)
}

#[test]
fn test_record_line_format() {
    let record = LogRecord {
        motor_time: 12,
        battery: 87,
        tof_height: 30,
        co2_ppm: 612,
        gas_temp_c: 24.5,
        baro_temp_c: 23.75,
        humidity_pct: 41.25,
        pressure_hpa: 1013.25,
        altitude_m: 0.0,
    };
    assert_eq!(record.to_line(), "\n12,87,30,612,24.50,23.75,41.25,1013.25,0.00");
    assert_eq!(LOG_HEADER.split(',').count(), 9);
}

#[tokio::test]
async fn test_first_sample_on_empty_log() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("survey.csv");
    std::fs::write(&path, "")?;
    let store: Arc<dyn LogStore> = Arc::new(FileLogStore::new(&path));

    let (mut logger, state) = logger(
        vec![Ok(Reading::Ready(GAS))],
        vec![Ok(Reading::Ready(BARO))],
        store.clone(),
    );
    state.publish(FlightState {
        time: 12,
        bat: 87,
        tof: 30,
        ..Default::default()
    })?;

    logger.prepare().await?;
    logger.log_once().await?;

    let contents = store.read_all().await?;
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], LOG_HEADER);
    assert_eq!(lines[1], "12,87,30,612,24.50,23.75,41.25,1013.25,0.00");
    Ok(())
}

#[tokio::test]
async fn test_existing_log_keeps_single_header() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store: Arc<dyn LogStore> = Arc::new(FileLogStore::new(dir.path().join("survey.csv")));

    let (mut first, _) = logger(vec![], vec![], store.clone());
    first.prepare().await?;
    first.log_once().await?;

    let (mut second, _) = logger(vec![], vec![], store.clone());
    second.prepare().await?;
    second.log_once().await?;

    let contents = store.read_all().await?;
    assert_eq!(contents.matches(LOG_HEADER).count(), 1);
    assert_eq!(contents.lines().count(), 3);
    Ok(())
}

#[tokio::test]
async fn test_unavailable_sensors_use_placeholders() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store: Arc<dyn LogStore> = Arc::new(FileLogStore::new(dir.path().join("survey.csv")));

    let (mut logger, state) = logger(
        vec![Ok(Reading::NotReady), Err(anyhow!("crc mismatch"))],
        vec![Err(anyhow!("i2c nack")), Ok(Reading::Ready(BARO))],
        store,
    );
    state.publish(FlightState {
        bat: 64,
        ..Default::default()
    })?;

    // Gas not ready, barometer faulted: flight fields still come through.
    let record = logger.sample().await?;
    assert_eq!(record.battery, 64);
    assert_eq!(record.co2_ppm, 0);
    assert_eq!(record.pressure_hpa, 0.0);
    assert!(logger.baro_fault.is_failing());

    // Gas faulted, barometer back.
    let record = logger.sample().await?;
    assert_eq!(record.co2_ppm, 0);
    assert_eq!(record.gas_temp_c, 0.0);
    assert!((record.pressure_hpa - 1013.25).abs() < 0.01);
    assert!(record.altitude_m.abs() < 0.01);
    assert!(logger.gas_fault.is_failing());
    assert!(!logger.baro_fault.is_failing());
    Ok(())
}

#[tokio::test]
async fn test_zero_co2_sample_is_discarded() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store: Arc<dyn LogStore> = Arc::new(FileLogStore::new(dir.path().join("survey.csv")));
    let invalid = GasSample {
        co2_ppm: 0,
        temperature_c: 30.0,
        humidity_pct: 90.0,
    };

    let (mut logger, _) = logger(vec![Ok(Reading::Ready(invalid))], vec![], store);
    let record = logger.sample().await?;
    assert_eq!(record.gas_temp_c, 0.0);
    assert_eq!(record.humidity_pct, 0.0);
    Ok(())
}

#[tokio::test]
async fn test_run_appends_until_shutdown() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store: Arc<dyn LogStore> = Arc::new(FileLogStore::new(dir.path().join("survey.csv")));
    let (mut logger, _) = logger(vec![], vec![], store.clone());
    logger.prepare().await?;
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let handle = tokio::spawn(async move { logger.run(shutdown_rx).await });
    tokio::time::sleep(Duration::from_millis(60)).await;
    shutdown_tx.send(())?;
    tokio::time::timeout(Duration::from_secs(2), handle).await???;

    let contents = store.read_all().await?;
    assert!(contents.starts_with(LOG_HEADER));
    assert!(contents.lines().count() >= 2);
    Ok(())
}
