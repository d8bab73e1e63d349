//! Radio boundary.
//!
//! The link supervisor talks to a [`Radio`] and receives [`RadioEvent`]s on
//! a channel handed out when the radio is created. Requests return once they
//! have been issued; their outcome (link up, services found, link down)
//! arrives as an event, in order, like the callbacks of a BLE stack.
//!
//! ```text
//!   LinkSupervisor ──requests──► Radio (Emulator | BleRadio)
//!         ▲                          │
//!         └────── RadioEvent ────────┘  (mpsc, ordered)
//! ```

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use obs_core::{DeviceId, DeviceIdentity};

pub type RadioEvents = mpsc::UnboundedReceiver<RadioEvent>;
pub type RadioEventSender = mpsc::UnboundedSender<RadioEvent>;

#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    PoweredOn,
    PoweredOff,
    /// Scan result
    Discovered {
        device: DeviceIdentity,
        connectable: bool,
    },
    Connected(DeviceId),
    ConnectFailed {
        id: DeviceId,
        error: String,
    },
    ServicesDiscovered {
        id: DeviceId,
        services: Vec<String>,
    },
    Notification {
        characteristic: String,
        data: Vec<u8>,
    },
    Disconnected(DeviceId),
}

#[derive(Error, Debug)]
pub enum RadioError {
    #[error("Radio unavailable: {0}")]
    Unavailable(String),
    #[error("Unknown device {0}")]
    UnknownDevice(DeviceId),
    #[error("Not connected")]
    NotConnected,
    #[error("Characteristic {0} not found")]
    MissingCharacteristic(String),
    #[error("Radio error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait Radio: Send + Sync {
    async fn start_scan(&mut self) -> Result<(), RadioError>;

    async fn stop_scan(&mut self) -> Result<(), RadioError>;

    /// Issue a connect request. Success is reported as [`RadioEvent::Connected`].
    async fn connect(&mut self, id: &DeviceId) -> Result<(), RadioError>;

    /// Reported as [`RadioEvent::ServicesDiscovered`].
    async fn discover_services(&mut self, id: &DeviceId) -> Result<(), RadioError>;

    /// Enable notifications on a characteristic of the connected device.
    async fn subscribe(&mut self, characteristic: &str) -> Result<(), RadioError>;

    /// Read a characteristic of the connected device once.
    async fn read(&mut self, characteristic: &str) -> Result<Vec<u8>, RadioError>;

    async fn disconnect(&mut self, id: &DeviceId) -> Result<(), RadioError>;

    /// The radio's own view of the link, polled by the watchdog.
    async fn is_connected(&self, id: &DeviceId) -> bool;
}

/// Send an event, ignoring a supervisor that has already gone away.
pub(crate) fn emit(tx: &RadioEventSender, event: RadioEvent) {
    if tx.send(event).is_err() {
        log::debug!("Radio event dropped, supervisor gone");
    }
}
