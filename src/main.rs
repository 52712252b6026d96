use std::sync::Arc;

use anyhow::Result;
use ecodrone::config::Config;
use ecodrone::flight::TracingIndicator;
use ecodrone::sensors::{BaroSample, Detached, GasSample};
use ecodrone::session::Session;
use ecodrone::storage::FileLogStore;
use ecodrone::util::setup_logging;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    setup_logging(&config.general.log_level)?;
    info!("Application starting...");

    let store = Arc::new(FileLogStore::new(config.logger.log_path(chrono::Local::now())));
    info!("Logging survey to {:?}", store.path());

    // Sensor drivers are wired in by the board support package; without one
    // the log still carries the vehicle's own readings.
    warn!("No sensor drivers attached, environmental columns will read zero");
    let gas = Detached::<GasSample>::new("gas sensor");
    let baro = Detached::<BaroSample>::new("barometer");

    let link = link::open(&config).await?;
    let session = Session::new(config, store.clone(), Arc::new(TracingIndicator));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let run = session.run(gas, baro, link, shutdown_rx);
    tokio::pin!(run);

    let result = tokio::select! {
        result = &mut run => result,
        signal = signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    warn!("Shutdown signal received, winding the session down...");
                    let _ = shutdown_tx.send(());
                }
                Err(err) => error!("Failed to listen for shutdown signal: {}", err),
            }
            run.await
        }
    };

    info!("Log kept at {:?}", store.path());
    match result {
        Ok(report) => {
            info!("Session complete: {}", serde_json::to_string(&report)?);
            Ok(())
        }
        Err(e) => {
            error!("Session failed: {}", e);
            Err(e.into())
        }
    }
}

#[cfg(feature = "bluetooth")]
mod link {
    use anyhow::Result;
    use ecodrone::config::Config;
    use ecodrone::transfer::ble::BleLink;

    pub async fn open(config: &Config) -> Result<BleLink> {
        BleLink::new(&config.transfer.device_name, config.transfer.chunk_size).await
    }
}

#[cfg(not(feature = "bluetooth"))]
mod link {
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use ecodrone::config::Config;
    use ecodrone::transfer::{Connection, TransferLink};

    /// Stands in for the BLE link in builds without Bluetooth support.
    pub struct Unsupported;

    pub async fn open(_config: &Config) -> Result<Unsupported> {
        Ok(Unsupported)
    }

    #[async_trait]
    impl TransferLink for Unsupported {
        async fn advertise(&mut self) -> Result<()> {
            bail!("built without the `bluetooth` feature")
        }

        async fn wait_connected(&mut self) -> Result<Connection> {
            bail!("built without the `bluetooth` feature")
        }

        async fn notify(&mut self, _chunk: &[u8]) -> Result<bool> {
            Ok(false)
        }

        fn max_payload(&self) -> usize {
            0
        }
    }
}
