//! Hand-off of the survey log to a nearby device.
//!
//! The coordinator stages the finished log, advertises, and waits for a
//! client. A subscriber gets the log pushed as notifications; a client that
//! only reads is served the staged value. Either outcome is final; nothing is
//! retried.

#[cfg(feature = "bluetooth")]
pub mod ble;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::flight::{Indicator, IndicatorState};
use crate::storage::LogStore;

/// GATT service carrying the survey log.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Read + notify characteristic the log is published on.
pub const LOG_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// How the connected client takes the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Connection {
    /// Listening for notifications.
    Subscribed,
    /// Reading the staged value without subscribing.
    Reader,
}

/// Publish/notify channel to a paired device.
#[async_trait]
pub trait TransferLink: Send {
    /// Start advertising so a client can find and connect to us.
    async fn advertise(&mut self) -> Result<()>;

    /// Resolve once a client has connected, either by subscribing or by
    /// issuing its first read.
    async fn wait_connected(&mut self) -> Result<Connection>;

    /// Make the full payload available to clients that read instead of subscribe.
    async fn stage(&mut self, _payload: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Resolve once a reading client has fetched all `total` staged bytes.
    /// `Ok(false)` means it went away first.
    async fn wait_read(&mut self, _total: usize) -> Result<bool> {
        Ok(true)
    }

    /// Push one chunk. `Ok(false)` means the client has gone away.
    async fn notify(&mut self, chunk: &[u8]) -> Result<bool>;

    /// Largest chunk a single notification can carry.
    fn max_payload(&self) -> usize;
}

#[derive(Debug)]
pub enum TransferError {
    /// The log is empty or missing.
    NoData,
    /// No client connected within the configured wait.
    ConnectTimeout(Duration),
    /// The client disconnected part way through.
    Interrupted { sent: usize, total: usize },
    /// Advertising, reading the log or the link itself failed.
    Link(anyhow::Error),
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::NoData => write!(f, "no data to transfer"),
            TransferError::ConnectTimeout(after) => {
                write!(f, "no client connected within {:?}", after)
            }
            TransferError::Interrupted { sent, total } => {
                write!(f, "transfer interrupted after {} of {} bytes", sent, total)
            }
            TransferError::Link(e) => write!(f, "transfer link error: {:#}", e),
        }
    }
}

impl std::error::Error for TransferError {}

impl From<anyhow::Error> for TransferError {
    fn from(e: anyhow::Error) -> Self {
        TransferError::Link(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    pub bytes: usize,
    pub chunks: usize,
}

pub struct TransferCoordinator<L> {
    link: L,
    store: Arc<dyn LogStore>,
    indicator: Arc<dyn Indicator>,
    connect_timeout: Option<Duration>,
}

impl<L: TransferLink> TransferCoordinator<L> {
    pub fn new(
        link: L,
        store: Arc<dyn LogStore>,
        indicator: Arc<dyn Indicator>,
        connect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            link,
            store,
            indicator,
            connect_timeout,
        }
    }

    pub async fn run(&mut self) -> Result<TransferReport, TransferError> {
        self.indicator.set(IndicatorState::Transferring);
        let result = self.transfer().await;
        self.indicator.set(IndicatorState::Off);

        match &result {
            Ok(report) => info!(
                "Log transferred: {} bytes in {} notifications",
                report.bytes, report.chunks
            ),
            Err(e) => error!("Log transfer failed: {}", e),
        }
        result
    }

    async fn transfer(&mut self) -> Result<TransferReport, TransferError> {
        let payload = self.store.read_all().await?;
        if payload.is_empty() {
            return Err(TransferError::NoData);
        }
        let payload = payload.into_bytes();
        self.link.stage(&payload).await?;

        self.link.advertise().await?;
        info!("Waiting for a client to connect...");

        let connection = match self.connect_timeout {
            Some(limit) => timeout(limit, self.link.wait_connected())
                .await
                .map_err(|_| TransferError::ConnectTimeout(limit))??,
            None => self.link.wait_connected().await?,
        };

        match connection {
            Connection::Subscribed => {
                info!("Client subscribed, sending log");
                self.push(&payload).await
            }
            Connection::Reader => {
                info!("Client is reading the log");
                if !self.link.wait_read(payload.len()).await? {
                    return Err(TransferError::Interrupted {
                        sent: 0,
                        total: payload.len(),
                    });
                }
                Ok(TransferReport {
                    bytes: payload.len(),
                    chunks: 0,
                })
            }
        }
    }

    async fn push(&mut self, payload: &[u8]) -> Result<TransferReport, TransferError> {
        let chunk_size = self.link.max_payload().max(1);
        let mut sent = 0;
        let mut chunks = 0;
        for chunk in payload.chunks(chunk_size) {
            if !self.link.notify(chunk).await? {
                return Err(TransferError::Interrupted {
                    sent,
                    total: payload.len(),
                });
            }
            sent += chunk.len();
            chunks += 1;
            debug!("Sent {}/{} bytes", sent, payload.len());
        }

        Ok(TransferReport {
            bytes: sent,
            chunks,
        })
    }
}
