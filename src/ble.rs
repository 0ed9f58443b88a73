//! btleplug-backed [`DeviceLink`] implementation.
//!
//! Handles scanning, device identification, connection, characteristic
//! discovery and the notification pump. The session core only ever sees the
//! [`DeviceLink`] trait, so everything in here can be swapped for a mock.

use btleplug::{
    api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType},
    platform::{Manager, Peripheral},
};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, TrainerError},
    link::{ConnectionState, DeviceLink},
    TRAINER_MANUFACTURER_ID, TRAINER_RX_CHAR_UUID, TRAINER_SERVICE_UUID, TRAINER_TX_CHAR_UUID,
};

/// Scan/connection tuning
#[derive(Debug, Clone)]
pub struct ScanParams {
    /// How long to scan before giving up, in milliseconds
    pub scan_timeout_ms: u64,
    /// Connection attempt timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            connect_timeout_ms: 30_000,
        }
    }
}

/// Discovers trainers and establishes [`BleLink`] connections
pub struct BleManager {
    manager: Manager,
}

impl BleManager {
    /// Create a new BLE manager
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::Ble`] if the Bluetooth adapter cannot be
    /// initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        Ok(Self { manager })
    }

    /// Connect to the first trainer found with default scan parameters
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::DeviceNotFound`] if no trainer is discovered
    /// within the scan window, or connection errors from the underlying
    /// stack.
    pub async fn connect_first() -> Result<BleLink> {
        let manager = Self::new().await?;
        manager.connect_first_with_params(&ScanParams::default()).await
    }

    /// Connect to the first trainer found with custom scan parameters
    ///
    /// When several trainers are in range, the strongest signal wins.
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::DeviceNotFound`] if no trainer is discovered,
    /// [`TrainerError::Timeout`] if the connection attempt times out, or
    /// [`TrainerError::Ble`] for adapter errors.
    pub async fn connect_first_with_params(&self, params: &ScanParams) -> Result<BleLink> {
        let adapters = self.manager.adapters().await?;
        let central = adapters.first().ok_or(TrainerError::DeviceNotFound)?;

        let service_uuid = Uuid::parse_str(TRAINER_SERVICE_UUID)
            .map_err(|e| TrainerError::Other(format!("invalid service UUID: {e}")))?;

        info!("scanning for cable trainers");
        central
            .start_scan(ScanFilter {
                services: vec![service_uuid],
            })
            .await?;
        tokio::time::sleep(Duration::from_millis(params.scan_timeout_ms)).await;
        central.stop_scan().await?;

        let mut best: Option<(Peripheral, i16)> = None;
        for peripheral in central.peripherals().await? {
            if let Some(rssi) = Self::trainer_rssi(&peripheral).await {
                debug!("candidate trainer at rssi {rssi}");
                if best.as_ref().is_none_or(|(_, r)| rssi > *r) {
                    best = Some((peripheral, rssi));
                }
            }
        }

        let (peripheral, rssi) = best.ok_or(TrainerError::DeviceNotFound)?;
        info!("connecting to trainer (rssi {rssi})");
        BleLink::establish(peripheral, params).await
    }

    /// Identify a trainer by its advertised manufacturer data, returning its
    /// signal strength
    async fn trainer_rssi(peripheral: &Peripheral) -> Option<i16> {
        let properties = peripheral.properties().await.ok()??;
        if properties
            .manufacturer_data
            .contains_key(&TRAINER_MANUFACTURER_ID)
        {
            return Some(properties.rssi.unwrap_or(i16::MIN));
        }
        None
    }
}

/// An active BLE connection to a trainer
///
/// Writes go to the command characteristic without response; inbound frames
/// from the telemetry characteristic are fanned out on a broadcast channel;
/// connection state is published on a watch channel by a monitor task.
pub struct BleLink {
    peripheral: Peripheral,
    rx_char: Characteristic,
    notify_tx: broadcast::Sender<Bytes>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl BleLink {
    async fn establish(peripheral: Peripheral, params: &ScanParams) -> Result<Self> {
        let connect = peripheral.connect();
        tokio::time::timeout(Duration::from_millis(params.connect_timeout_ms), connect)
            .await
            .map_err(|_| TrainerError::Timeout {
                timeout_ms: params.connect_timeout_ms,
            })?
            .map_err(|e| TrainerError::ConnectionFailed(e.to_string()))?;

        peripheral.discover_services().await?;

        let tx_char = Self::find_characteristic(&peripheral, TRAINER_TX_CHAR_UUID)?;
        let rx_char = Self::find_characteristic(&peripheral, TRAINER_RX_CHAR_UUID)?;

        peripheral.subscribe(&tx_char).await?;

        let (notify_tx, _) = broadcast::channel(256);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);

        Self::spawn_notification_pump(peripheral.clone(), tx_char, notify_tx.clone());
        Self::spawn_state_monitor(peripheral.clone(), state_tx);

        info!("trainer link established");
        Ok(Self {
            peripheral,
            rx_char,
            notify_tx,
            state_rx,
        })
    }

    fn find_characteristic(peripheral: &Peripheral, uuid: &str) -> Result<Characteristic> {
        let wanted = Uuid::parse_str(uuid)
            .map_err(|e| TrainerError::Other(format!("invalid characteristic UUID: {e}")))?;
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == wanted)
            .ok_or_else(|| TrainerError::ConnectionFailed(format!("characteristic {uuid} not found")))
    }

    /// Forward raw notification frames onto the broadcast channel
    fn spawn_notification_pump(
        peripheral: Peripheral,
        tx_char: Characteristic,
        sender: broadcast::Sender<Bytes>,
    ) {
        tokio::spawn(async move {
            let mut stream = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("failed to open notification stream: {e}");
                    return;
                }
            };
            while let Some(data) = stream.next().await {
                if data.uuid == tx_char.uuid {
                    // Receivers lagging or gone is not our problem here
                    let _ = sender.send(Bytes::from(data.value));
                }
            }
            debug!("notification stream ended");
        });
    }

    /// Publish connection state transitions on the watch channel
    fn spawn_state_monitor(peripheral: Peripheral, state_tx: watch::Sender<ConnectionState>) {
        tokio::spawn(async move {
            const POLL_INTERVAL: Duration = Duration::from_millis(500);
            loop {
                let connected = peripheral.is_connected().await.unwrap_or(false);
                let state = if connected {
                    ConnectionState::Connected
                } else {
                    ConnectionState::Disconnected
                };
                if *state_tx.borrow() != state {
                    warn!("trainer link state changed: {state}");
                    if state_tx.send(state).is_err() {
                        break;
                    }
                    if state == ConnectionState::Disconnected {
                        break;
                    }
                } else if state_tx.is_closed() {
                    break;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        });
    }

    /// Disconnect from the trainer
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::Ble`] if disconnection fails.
    pub async fn disconnect(&self) -> Result<()> {
        info!("disconnecting trainer link");
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl DeviceLink for BleLink {
    async fn send(&self, bytes: &[u8]) -> Result<()> {
        debug!("tx {:02X?}", bytes);
        self.peripheral
            .write(&self.rx_char, bytes, WriteType::WithoutResponse)
            .await
            .map_err(|e| TrainerError::Link(e.to_string()))
    }

    fn notifications(&self) -> broadcast::Receiver<Bytes> {
        self.notify_tx.subscribe()
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_constants_parse() {
        assert!(Uuid::parse_str(TRAINER_SERVICE_UUID).is_ok());
        assert!(Uuid::parse_str(TRAINER_TX_CHAR_UUID).is_ok());
        assert!(Uuid::parse_str(TRAINER_RX_CHAR_UUID).is_ok());
    }

    #[test]
    fn test_scan_params_defaults() {
        let params = ScanParams::default();
        assert_eq!(params.scan_timeout_ms, 10_000);
        assert_eq!(params.connect_timeout_ms, 30_000);
    }
}
