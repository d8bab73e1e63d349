//! Bluetooth LE radio backed by btleplug.
//!
//! Uses the first adapter the platform reports. Central events are pumped
//! into [`RadioEvent`]s by a background task; notifications of the connected
//! peripheral by a second one, started with the first subscription.

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use obs_core::device::uuid_eq;
use obs_core::{DeviceId, DeviceIdentity};

use crate::radio::{emit, Radio, RadioError, RadioEvent, RadioEventSender, RadioEvents};

impl From<btleplug::Error> for RadioError {
    fn from(e: btleplug::Error) -> Self {
        RadioError::Backend(e.to_string())
    }
}

pub struct BleRadio {
    adapter: Adapter,
    events: RadioEventSender,
    peripheral: Option<Peripheral>,
    central_pump: JoinHandle<()>,
    notification_pump: Option<JoinHandle<()>>,
}

impl BleRadio {
    pub async fn new() -> Result<(Self, RadioEvents), RadioError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RadioError::Unavailable("no Bluetooth adapter found".into()))?;
        match adapter.adapter_info().await {
            Ok(name) => info!("Using Bluetooth adapter {}", name),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let central_events = adapter.events().await?;
        let central_pump = tokio::spawn(pump_central_events(
            adapter.clone(),
            central_events,
            tx.clone(),
        ));
        emit(&tx, RadioEvent::PoweredOn);

        let radio = BleRadio {
            adapter,
            events: tx,
            peripheral: None,
            central_pump,
            notification_pump: None,
        };
        Ok((radio, rx))
    }

    async fn find_peripheral(&self, id: &DeviceId) -> Result<Peripheral, RadioError> {
        self.adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == id.0)
            .ok_or_else(|| RadioError::UnknownDevice(id.clone()))
    }

    fn connected(&self) -> Result<&Peripheral, RadioError> {
        self.peripheral.as_ref().ok_or(RadioError::NotConnected)
    }

    fn characteristic(&self, uuid: &str) -> Result<(Peripheral, Characteristic), RadioError> {
        let peripheral = self.connected()?;
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| uuid_eq(&c.uuid.to_string(), uuid))
            .map(|c| (peripheral.clone(), c))
            .ok_or_else(|| RadioError::MissingCharacteristic(uuid.to_string()))
    }

    fn stop_notifications(&mut self) {
        if let Some(handle) = self.notification_pump.take() {
            handle.abort();
        }
    }
}

impl Drop for BleRadio {
    fn drop(&mut self) {
        self.stop_notifications();
        self.central_pump.abort();
    }
}

async fn pump_central_events(
    adapter: Adapter,
    mut central_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    tx: RadioEventSender,
) {
    while let Some(event) = central_events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let peripheral = match adapter.peripheral(&id).await {
                    Ok(p) => p,
                    Err(e) => {
                        debug!("Peripheral {} vanished: {}", id, e);
                        continue;
                    }
                };
                let properties = match peripheral.properties().await {
                    Ok(Some(properties)) => properties,
                    Ok(None) => continue,
                    Err(e) => {
                        debug!("No properties for {}: {}", id, e);
                        continue;
                    }
                };
                let device = DeviceIdentity {
                    id: DeviceId(id.to_string()),
                    name: None,
                    advertised_name: properties.local_name,
                    rssi: properties.rssi,
                };
                emit(
                    &tx,
                    RadioEvent::Discovered {
                        device,
                        connectable: true,
                    },
                );
            }
            CentralEvent::DeviceDisconnected(id) => {
                emit(&tx, RadioEvent::Disconnected(DeviceId(id.to_string())));
            }
            _ => {}
        }
    }
    warn!("Bluetooth event stream ended");
    emit(&tx, RadioEvent::PoweredOff);
}

#[async_trait]
impl Radio for BleRadio {
    async fn start_scan(&mut self) -> Result<(), RadioError> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<(), RadioError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&mut self, id: &DeviceId) -> Result<(), RadioError> {
        let peripheral = self.find_peripheral(id).await?;
        peripheral.connect().await?;
        self.peripheral = Some(peripheral);
        emit(&self.events, RadioEvent::Connected(id.clone()));
        Ok(())
    }

    async fn discover_services(&mut self, id: &DeviceId) -> Result<(), RadioError> {
        let peripheral = self.connected()?;
        peripheral.discover_services().await?;
        let services = peripheral
            .services()
            .iter()
            .map(|s| s.uuid.to_string())
            .collect();
        emit(
            &self.events,
            RadioEvent::ServicesDiscovered {
                id: id.clone(),
                services,
            },
        );
        Ok(())
    }

    async fn subscribe(&mut self, characteristic: &str) -> Result<(), RadioError> {
        let (peripheral, c) = self.characteristic(characteristic)?;
        peripheral.subscribe(&c).await?;

        if self.notification_pump.is_none() {
            let mut notifications = peripheral.notifications().await?;
            let tx = self.events.clone();
            self.notification_pump = Some(tokio::spawn(async move {
                while let Some(n) = notifications.next().await {
                    emit(
                        &tx,
                        RadioEvent::Notification {
                            characteristic: n.uuid.to_string(),
                            data: n.value,
                        },
                    );
                }
                debug!("Notification stream ended");
            }));
        }
        Ok(())
    }

    async fn read(&mut self, characteristic: &str) -> Result<Vec<u8>, RadioError> {
        let (peripheral, c) = self.characteristic(characteristic)?;
        Ok(peripheral.read(&c).await?)
    }

    async fn disconnect(&mut self, id: &DeviceId) -> Result<(), RadioError> {
        self.stop_notifications();
        let peripheral = match self.peripheral.take() {
            Some(p) => p,
            None => self.find_peripheral(id).await?,
        };
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn is_connected(&self, id: &DeviceId) -> bool {
        match &self.peripheral {
            Some(p) if p.id().to_string() == id.0 => p.is_connected().await.unwrap_or(false),
            _ => false,
        }
    }
}
