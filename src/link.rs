//! Transport abstraction between the session core and the trainer.
//!
//! The core never manages pairing or GATT discovery itself; it talks to a
//! [`DeviceLink`]: a write path for command packets, a broadcast stream of
//! raw notification frames, and a watch stream of connection state. The
//! btleplug implementation lives in [`crate::ble`]; tests substitute a
//! recording link.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{broadcast, watch};

use crate::error::Result;

/// Connection state reported by the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Link is up and writable
    Connected,
    /// Link is down; writes will fail
    Disconnected,
    /// Link is attempting to re-establish itself
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "Connected"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

/// The trainer transport consumed by the session core
///
/// All writers are funneled through the session's throttle layer, so an
/// implementation only needs to support one in-flight write at a time.
/// Reconnection policy belongs to the implementation, not the core: a failed
/// write is surfaced, never retried by the caller.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Write one command packet to the trainer
    ///
    /// # Errors
    ///
    /// Returns [`crate::TrainerError::Link`] (or a BLE error) if the write
    /// fails; the caller treats this as a session-level fault.
    async fn send(&self, bytes: &[u8]) -> Result<()>;

    /// Subscribe to raw inbound notification frames
    fn notifications(&self) -> broadcast::Receiver<Bytes>;

    /// Subscribe to connection-state changes
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{broadcast, watch, Bytes, ConnectionState, DeviceLink, Result};
    use crate::error::TrainerError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Test link that records every frame written to it
    pub struct RecordingLink {
        sent: Mutex<Vec<Bytes>>,
        fail_sends: AtomicBool,
        notify_tx: broadcast::Sender<Bytes>,
        state_tx: watch::Sender<ConnectionState>,
    }

    impl Default for RecordingLink {
        fn default() -> Self {
            let (notify_tx, _) = broadcast::channel(64);
            let (state_tx, _) = watch::channel(ConnectionState::Connected);
            Self {
                sent: Mutex::new(Vec::new()),
                fail_sends: AtomicBool::new(false),
                notify_tx,
                state_tx,
            }
        }
    }

    impl RecordingLink {
        pub fn sent_frames(&self) -> Vec<Bytes> {
            self.sent.lock().unwrap().clone()
        }

        /// Frames whose first byte matches `opcode`
        pub fn frames_with_opcode(&self, opcode: u8) -> Vec<Bytes> {
            self.sent_frames()
                .into_iter()
                .filter(|f| f.first() == Some(&opcode))
                .collect()
        }

        pub fn set_fail_sends(&self, fail: bool) {
            self.fail_sends.store(fail, Ordering::SeqCst);
        }

        pub fn inject_notification(&self, frame: Bytes) {
            let _ = self.notify_tx.send(frame);
        }

        pub fn set_connection_state(&self, state: ConnectionState) {
            let _ = self.state_tx.send(state);
        }
    }

    #[async_trait]
    impl DeviceLink for RecordingLink {
        async fn send(&self, bytes: &[u8]) -> Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(TrainerError::Link("simulated write failure".to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push(Bytes::copy_from_slice(bytes));
            Ok(())
        }

        fn notifications(&self) -> broadcast::Receiver<Bytes> {
            self.notify_tx.subscribe()
        }

        fn connection_state(&self) -> watch::Receiver<ConnectionState> {
            self.state_tx.subscribe()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingLink;
    use super::*;

    #[tokio::test]
    async fn test_recording_link_captures_frames() {
        let link = RecordingLink::default();
        link.send(&[0x05, 0, 0, 0]).await.unwrap();
        link.send(&[0x03, 0x90, 0x01, 0x0A]).await.unwrap();

        assert_eq!(link.sent_frames().len(), 2);
        assert_eq!(link.frames_with_opcode(0x05).len(), 1);
    }

    #[tokio::test]
    async fn test_recording_link_simulated_failure() {
        let link = RecordingLink::default();
        link.set_fail_sends(true);
        let err = link.send(&[0x05, 0, 0, 0]).await.unwrap_err();
        assert!(err.is_connection_error());
        assert!(link.sent_frames().is_empty());
    }
}
