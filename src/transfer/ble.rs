//! BLE GATT peripheral serving the survey log.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bluer::adv::{Advertisement, AdvertisementHandle};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicReadRequest, Service,
};
use bluer::Adapter;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::{Connection, TransferLink, LOG_CHARACTERISTIC_UUID, SERVICE_UUID};

/// A reader that makes no progress for this long is treated as gone.
const READ_IDLE: Duration = Duration::from_secs(10);

/// Time given to BlueZ to deliver the last read response before we return.
const READ_LINGER: Duration = Duration::from_millis(500);

/// What a client did first on the log characteristic.
enum LinkEvent {
    Subscribed(CharacteristicNotifier),
    Read,
}

pub struct BleLink {
    adapter: Adapter,
    device_name: String,
    max_payload: usize,
    value: Arc<Mutex<Vec<u8>>>,
    events_tx: mpsc::Sender<LinkEvent>,
    events_rx: mpsc::Receiver<LinkEvent>,
    served_tx: Arc<watch::Sender<usize>>,
    served_rx: watch::Receiver<usize>,
    notifier: Option<CharacteristicNotifier>,
    _app_handle: Option<ApplicationHandle>,
    _adv_handle: Option<AdvertisementHandle>,
}

impl BleLink {
    pub async fn new(device_name: &str, max_payload: usize) -> Result<Self> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }
        adapter.set_alias(device_name.to_string()).await?;

        let (events_tx, events_rx) = mpsc::channel(4);
        let (served_tx, served_rx) = watch::channel(0);
        Ok(Self {
            adapter,
            device_name: device_name.to_string(),
            max_payload,
            value: Arc::new(Mutex::new(Vec::new())),
            events_tx,
            events_rx,
            served_tx: Arc::new(served_tx),
            served_rx,
            notifier: None,
            _app_handle: None,
            _adv_handle: None,
        })
    }

    fn log_characteristic(&self) -> Characteristic {
        let value = self.value.clone();
        let read_events = self.events_tx.clone();
        let served = self.served_tx.clone();
        let notify_events = self.events_tx.clone();

        Characteristic {
            uuid: LOG_CHARACTERISTIC_UUID,
            read: Some(CharacteristicRead {
                read: true,
                fun: Box::new(move |req: CharacteristicReadRequest| {
                    let value = value.clone();
                    let events = read_events.clone();
                    let served = served.clone();
                    Box::pin(async move {
                        let value = value.lock().await;
                        let offset = usize::from(req.offset).min(value.len());
                        // One ATT response carries at most MTU - 1 bytes.
                        let window = usize::from(req.mtu).saturating_sub(1).max(1);
                        let end = (offset + window).min(value.len());
                        served.send_modify(|served| *served = (*served).max(end));
                        debug!(
                            "Log read {}..{} of {} by {}",
                            offset,
                            end,
                            value.len(),
                            req.device_address
                        );
                        let _ = events.try_send(LinkEvent::Read);
                        Ok(value[offset..].to_vec())
                    })
                }),
                ..Default::default()
            }),
            notify: Some(CharacteristicNotify {
                notify: true,
                method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                    let events = notify_events.clone();
                    Box::pin(async move {
                        debug!("Client subscribed to log notifications");
                        if events.send(LinkEvent::Subscribed(notifier)).await.is_err() {
                            warn!("Log link dropped before client subscribed");
                        }
                    })
                })),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl TransferLink for BleLink {
    async fn advertise(&mut self) -> Result<()> {
        let app = Application {
            services: vec![Service {
                uuid: SERVICE_UUID,
                primary: true,
                characteristics: vec![self.log_characteristic()],
                ..Default::default()
            }],
            ..Default::default()
        };
        self._app_handle = Some(self.adapter.serve_gatt_application(app).await?);

        let adv = Advertisement {
            service_uuids: vec![SERVICE_UUID].into_iter().collect(),
            discoverable: Some(true),
            local_name: Some(self.device_name.clone()),
            ..Default::default()
        };
        self._adv_handle = Some(self.adapter.advertise(adv).await?);

        info!("Advertising as {}", self.device_name);
        Ok(())
    }

    async fn wait_connected(&mut self) -> Result<Connection> {
        let event = self
            .events_rx
            .recv()
            .await
            .ok_or_else(|| anyhow!("GATT application closed"))?;
        match event {
            LinkEvent::Subscribed(notifier) => {
                self.notifier = Some(notifier);
                Ok(Connection::Subscribed)
            }
            LinkEvent::Read => Ok(Connection::Reader),
        }
    }

    async fn stage(&mut self, payload: &[u8]) -> Result<()> {
        *self.value.lock().await = payload.to_vec();
        self.served_tx.send_replace(0);
        Ok(())
    }

    async fn wait_read(&mut self, total: usize) -> Result<bool> {
        loop {
            let served = *self.served_rx.borrow_and_update();
            if served >= total {
                sleep(READ_LINGER).await;
                return Ok(true);
            }
            match timeout(READ_IDLE, self.served_rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Ok(false),
                Err(_) => {
                    warn!("Reader stalled after {} of {} bytes", served, total);
                    return Ok(false);
                }
            }
        }
    }

    async fn notify(&mut self, chunk: &[u8]) -> Result<bool> {
        let Some(notifier) = self.notifier.as_mut() else {
            return Ok(false);
        };
        if notifier.is_stopped() {
            return Ok(false);
        }
        match notifier.notify(chunk.to_vec()).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Notification failed: {}", e);
                Ok(false)
            }
        }
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }
}
