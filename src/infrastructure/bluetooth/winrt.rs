//! WinRT Transport
//!
//! [`GattTransport`] over `Windows.Devices.Bluetooth`. WinRT operations are
//! awaited on local tasks of the worker runtime and reported back as
//! [`TransportEvent`]s, so the worker must drive this transport inside a
//! `tokio::task::LocalSet`.

use crate::domain::models::PeripheralIdentity;
use crate::infrastructure::bluetooth::transport::{
    Advertisement, CharProperties, CharacteristicRef, DiscoveredService, GattStatus,
    GattTransport, TransportError, TransportEvent,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEAdvertisementWatcherStoppedEventArgs, BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattSession, GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{
    BluetoothCacheMode, BluetoothConnectionStatus, BluetoothError, BluetoothLEDevice,
};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

impl From<windows::core::Error> for TransportError {
    fn from(e: windows::core::Error) -> Self {
        TransportError::Rejected(e.message().to_string())
    }
}

fn to_guid(uuid: Uuid) -> GUID {
    GUID::from_u128(uuid.as_u128())
}

fn to_uuid(guid: GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

fn buffer_to_vec(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

/// `ValueChanged` registration tokens, at most one per characteristic
#[derive(Debug, Default)]
struct NotifyTokens(HashMap<Uuid, i64>);

impl NotifyTokens {
    fn is_registered(&self, uuid: Uuid) -> bool {
        self.0.contains_key(&uuid)
    }

    fn insert(&mut self, uuid: Uuid, token: i64) {
        self.0.insert(uuid, token);
    }

    fn take_all(&mut self) -> Vec<(Uuid, i64)> {
        self.0.drain().collect()
    }
}

/// Handles that only exist while a device link is open
#[derive(Default)]
struct LinkHandles {
    device: Option<BluetoothLEDevice>,
    session: Option<GattSession>,
    characteristics: HashMap<Uuid, GattCharacteristic>,
    notify_tokens: NotifyTokens,
}

impl LinkHandles {
    /// Drop every notification handler registered on this link's characteristics
    fn unsubscribe_all(&mut self) {
        for (uuid, token) in self.notify_tokens.take_all() {
            if let Some(characteristic) = self.characteristics.get(&uuid) {
                if let Err(e) = characteristic.RemoveValueChanged(token) {
                    debug!("Failed to remove notification handler for {}: {}", uuid, e);
                }
            }
        }
    }
}

pub struct WinRtTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    watcher: Option<BluetoothLEAdvertisementWatcher>,
    link: Arc<Mutex<LinkHandles>>,
    /// Incremented on close so callbacks from an old link go quiet
    link_epoch: Arc<AtomicU64>,
}

impl WinRtTransport {
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            events,
            watcher: None,
            link: Arc::default(),
            link_epoch: Arc::default(),
        }
    }

    fn characteristic(&self, uuid: Uuid) -> Result<GattCharacteristic, TransportError> {
        let link = self
            .link
            .lock()
            .map_err(|_| TransportError::Rejected("link lock poisoned".to_string()))?;
        link.characteristics
            .get(&uuid)
            .cloned()
            .ok_or(TransportError::NotConnected)
    }

    fn device(&self) -> Result<BluetoothLEDevice, TransportError> {
        let link = self
            .link
            .lock()
            .map_err(|_| TransportError::Rejected("link lock poisoned".to_string()))?;
        link.device.clone().ok_or(TransportError::NotConnected)
    }

    /// Sender that drops events once the link it was created for is closed
    fn link_scoped_sender(&self) -> impl Fn(TransportEvent) + Clone + Send + 'static {
        let events = self.events.clone();
        let epoch = self.link_epoch.clone();
        let created = epoch.load(Ordering::SeqCst);
        move |event| {
            if epoch.load(Ordering::SeqCst) == created {
                let _ = events.send(event);
            }
        }
    }
}

impl GattTransport for WinRtTransport {
    fn start_scan(&mut self, service: Uuid) -> Result<(), TransportError> {
        self.stop_scan();

        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;
        watcher
            .AdvertisementFilter()?
            .Advertisement()?
            .ServiceUuids()?
            .Append(to_guid(service))?;

        let sender = self.events.clone();
        let received = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let adv = args.Advertisement()?;
                    let uuids = adv.ServiceUuids()?;
                    let mut service_uuids = Vec::with_capacity(uuids.Size()? as usize);
                    for i in 0..uuids.Size()? {
                        service_uuids.push(to_uuid(uuids.GetAt(i)?));
                    }
                    let name = adv.LocalName()?.to_string();
                    let _ = sender.send(TransportEvent::Advertisement(Advertisement {
                        address: args.BluetoothAddress()?,
                        local_name: (!name.is_empty()).then_some(name),
                        service_uuids,
                        rssi: args.RawSignalStrengthInDBm()?,
                    }));
                }
                Ok(())
            },
        );
        watcher.Received(&received)?;

        let sender = self.events.clone();
        let stopped = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementWatcherStoppedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let error = args.Error()?;
                    if error != BluetoothError::Success {
                        let _ = sender.send(TransportEvent::ScanFailed { code: error.0 });
                    }
                }
                Ok(())
            },
        );
        watcher.Stopped(&stopped)?;

        info!("Starting WinRT advertisement watcher for {}", service);
        watcher.Start()?;
        self.watcher = Some(watcher);
        Ok(())
    }

    fn stop_scan(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            if let Err(e) = watcher.Stop() {
                warn!("Failed to stop advertisement watcher: {}", e);
            }
        }
    }

    fn connect(
        &mut self,
        peripheral: &PeripheralIdentity,
        auto_connect: bool,
    ) -> Result<(), TransportError> {
        let address = peripheral.address;
        let link = self.link.clone();
        let emit = self.link_scoped_sender();

        tokio::task::spawn_local(async move {
            match open_link(address, auto_connect, &emit).await {
                Ok((device, session)) => {
                    if let Ok(mut handles) = link.lock() {
                        handles.device = Some(device);
                        handles.session = Some(session);
                    }
                    emit(TransportEvent::ConnectionStateChanged {
                        status: GattStatus::SUCCESS,
                        connected: true,
                    });
                }
                Err(e) => {
                    warn!("Failed to open device {:#X}: {}", address, e);
                    emit(TransportEvent::ConnectionStateChanged {
                        status: GattStatus::LINK_TIMEOUT,
                        connected: false,
                    });
                }
            }
        });
        Ok(())
    }

    fn request_mtu(&mut self, mtu: u16) -> Result<(), TransportError> {
        // Windows negotiates the MTU itself; report what the session ended up with
        let session = self
            .link
            .lock()
            .map_err(|_| TransportError::Rejected("link lock poisoned".to_string()))?
            .session
            .clone()
            .ok_or(TransportError::NotConnected)?;
        let negotiated = session.MaxPduSize()?;
        debug!("Requested MTU {}, session reports {}", mtu, negotiated);
        let _ = self.events.send(TransportEvent::MtuChanged {
            mtu: negotiated,
            success: true,
        });
        Ok(())
    }

    fn discover_services(&mut self) -> Result<(), TransportError> {
        let device = self.device()?;
        let link = self.link.clone();
        let emit = self.link_scoped_sender();

        tokio::task::spawn_local(async move {
            match discover(&device).await {
                Ok((services, handles)) => {
                    if let Ok(mut link) = link.lock() {
                        link.unsubscribe_all();
                        link.characteristics = handles;
                    }
                    emit(TransportEvent::ServicesDiscovered {
                        success: true,
                        services,
                    });
                }
                Err(e) => {
                    warn!("Service discovery failed: {}", e);
                    emit(TransportEvent::ServicesDiscovered {
                        success: false,
                        services: Vec::new(),
                    });
                }
            }
        });
        Ok(())
    }

    fn enable_notifications(
        &mut self,
        characteristic: &CharacteristicRef,
    ) -> Result<(), TransportError> {
        let gatt_char = self.characteristic(characteristic.uuid)?;
        let uuid = characteristic.uuid;
        let emit = self.link_scoped_sender();

        {
            let mut link = self
                .link
                .lock()
                .map_err(|_| TransportError::Rejected("link lock poisoned".to_string()))?;
            // A retried CCCD write reuses the handler from the first attempt
            if !link.notify_tokens.is_registered(uuid) {
                let notify = emit.clone();
                let handler = TypedEventHandler::new(
                    move |_: windows::core::Ref<GattCharacteristic>,
                          args: windows::core::Ref<GattValueChangedEventArgs>| {
                        if let Some(args) = args.as_ref() {
                            let value = buffer_to_vec(&args.CharacteristicValue()?)?;
                            notify(TransportEvent::Notification {
                                characteristic: uuid,
                                value,
                            });
                        }
                        Ok(())
                    },
                );
                let token = gatt_char.ValueChanged(&handler)?;
                link.notify_tokens.insert(uuid, token);
            }
        }

        tokio::task::spawn_local(async move {
            let success = match gatt_char
                .WriteClientCharacteristicConfigurationDescriptorAsync(
                    GattClientCharacteristicConfigurationDescriptorValue::Notify,
                ) {
                Ok(op) => matches!(op.await, Ok(GattCommunicationStatus::Success)),
                Err(e) => {
                    warn!("CCCD write not started: {}", e);
                    false
                }
            };
            emit(TransportEvent::DescriptorWritten {
                characteristic: uuid,
                success,
            });
        });
        Ok(())
    }

    fn read_characteristic(
        &mut self,
        characteristic: &CharacteristicRef,
    ) -> Result<(), TransportError> {
        let gatt_char = self.characteristic(characteristic.uuid)?;
        let uuid = characteristic.uuid;
        let emit = self.link_scoped_sender();

        tokio::task::spawn_local(async move {
            let result: windows::core::Result<Option<Vec<u8>>> = async {
                let read = gatt_char
                    .ReadValueWithCacheModeAsync(BluetoothCacheMode::Uncached)?
                    .await?;
                if read.Status()? != GattCommunicationStatus::Success {
                    return Ok(None);
                }
                Ok(Some(buffer_to_vec(&read.Value()?)?))
            }
            .await;

            let (success, value) = match result {
                Ok(Some(value)) => (true, value),
                Ok(None) => (false, Vec::new()),
                Err(e) => {
                    warn!("Characteristic read error: {}", e);
                    (false, Vec::new())
                }
            };
            emit(TransportEvent::CharacteristicRead {
                characteristic: uuid,
                success,
                value,
            });
        });
        Ok(())
    }

    fn write_characteristic(
        &mut self,
        characteristic: &CharacteristicRef,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let gatt_char = self.characteristic(characteristic.uuid)?;
        let uuid = characteristic.uuid;
        let emit = self.link_scoped_sender();

        let writer = DataWriter::new()?;
        writer.WriteBytes(value)?;
        let buffer = writer.DetachBuffer()?;

        tokio::task::spawn_local(async move {
            let success = match gatt_char.WriteValueAsync(&buffer) {
                Ok(op) => matches!(op.await, Ok(GattCommunicationStatus::Success)),
                Err(e) => {
                    warn!("Characteristic write not started: {}", e);
                    false
                }
            };
            emit(TransportEvent::CharacteristicWritten {
                characteristic: uuid,
                success,
            });
        });
        Ok(())
    }

    fn close(&mut self) {
        self.link_epoch.fetch_add(1, Ordering::SeqCst);
        let handles = match self.link.lock() {
            Ok(mut link) => {
                link.unsubscribe_all();
                std::mem::take(&mut *link)
            }
            Err(_) => return,
        };
        if let Some(session) = handles.session {
            let _ = session.Close();
        }
        if let Some(device) = handles.device {
            let _ = device.Close();
        }
    }
}

impl Drop for WinRtTransport {
    fn drop(&mut self) {
        self.stop_scan();
        self.close();
    }
}

/// Open the device and a GATT session, and watch its connection status
async fn open_link(
    address: u64,
    auto_connect: bool,
    emit: &(impl Fn(TransportEvent) + Clone + Send + 'static),
) -> windows::core::Result<(BluetoothLEDevice, GattSession)> {
    info!("Connecting to Bluetooth device: {:#X}", address);
    let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)?.await?;

    let session = GattSession::FromDeviceIdAsync(&device.BluetoothDeviceId()?)?.await?;
    session.SetMaintainConnection(auto_connect)?;

    let emit = emit.clone();
    device.ConnectionStatusChanged(&TypedEventHandler::new(
        move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
            if let Some(dev) = dev.as_ref() {
                let connected = dev.ConnectionStatus()? == BluetoothConnectionStatus::Connected;
                emit(TransportEvent::ConnectionStateChanged {
                    status: GattStatus::SUCCESS,
                    connected,
                });
            }
            Ok(())
        },
    ))?;

    Ok((device, session))
}

async fn discover(
    device: &BluetoothLEDevice,
) -> windows::core::Result<(Vec<DiscoveredService>, HashMap<Uuid, GattCharacteristic>)> {
    let services_result = device
        .GetGattServicesWithCacheModeAsync(BluetoothCacheMode::Uncached)?
        .await?;
    if services_result.Status()? != GattCommunicationStatus::Success {
        return Err(windows::core::Error::new(
            windows::core::HRESULT(0x8000_4005u32 as i32),
            format!("GATT services status {:?}", services_result.Status()?),
        ));
    }

    let mut discovered = Vec::new();
    let mut handles = HashMap::new();
    let services = services_result.Services()?;
    for i in 0..services.Size()? {
        let service = services.GetAt(i)?;
        let service_uuid = to_uuid(service.Uuid()?);

        let chars_result = service
            .GetCharacteristicsWithCacheModeAsync(BluetoothCacheMode::Uncached)?
            .await?;
        let mut characteristics = Vec::new();
        if chars_result.Status()? == GattCommunicationStatus::Success {
            let chars = chars_result.Characteristics()?;
            for j in 0..chars.Size()? {
                let c = chars.GetAt(j)?;
                let uuid = to_uuid(c.Uuid()?);
                let properties = CharProperties((c.CharacteristicProperties()?.0 & 0xFF) as u8);
                characteristics.push(CharacteristicRef {
                    service: service_uuid,
                    uuid,
                    properties,
                });
                handles.insert(uuid, c);
            }
        } else {
            debug!("Characteristics of {} unavailable", service_uuid);
        }

        discovered.push(DiscoveredService {
            uuid: service_uuid,
            characteristics,
        });
    }
    info!("Discovered {} services", discovered.len());
    Ok((discovered, handles))
}
