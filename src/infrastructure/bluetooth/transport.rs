//! GATT Transport Seam
//!
//! Requests are submitted synchronously and complete later as
//! [`TransportEvent`]s on the channel handed to the transport at
//! construction. A transport must deliver those events in the order the
//! radio produced them.

use crate::domain::models::PeripheralIdentity;
use thiserror::Error;
use uuid::Uuid;

/// Raw GATT status code reported with connection changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattStatus(pub u8);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0);
    /// Link-layer connection timeout ("GATT_ERROR" 133)
    pub const LINK_TIMEOUT: GattStatus = GattStatus(133);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

/// Characteristic property bits (Bluetooth Core Vol 3, Part G, 3.3.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharProperties(pub u8);

impl CharProperties {
    pub const READ: u8 = 0x02;
    pub const WRITE_WITHOUT_RESPONSE: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;

    pub fn can_read(self) -> bool {
        self.0 & Self::READ != 0
    }

    pub fn can_write(self) -> bool {
        self.0 & (Self::WRITE | Self::WRITE_WITHOUT_RESPONSE) != 0
    }

    pub fn can_notify(self) -> bool {
        self.0 & Self::NOTIFY != 0
    }
}

/// A characteristic located during service discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub uuid: Uuid,
    pub properties: CharProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: u64,
    pub local_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub rssi: i16,
}

/// Completion and unsolicited events from the radio
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Advertisement(Advertisement),
    ScanFailed { code: i32 },
    ConnectionStateChanged { status: GattStatus, connected: bool },
    MtuChanged { mtu: u16, success: bool },
    ServicesDiscovered { success: bool, services: Vec<DiscoveredService> },
    DescriptorWritten { characteristic: Uuid, success: bool },
    CharacteristicRead { characteristic: Uuid, success: bool, value: Vec<u8> },
    CharacteristicWritten { characteristic: Uuid, success: bool },
    Notification { characteristic: Uuid, value: Vec<u8> },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("bluetooth adapter unavailable")]
    AdapterUnavailable,

    #[error("no link to the peripheral")]
    NotConnected,

    #[error("request rejected by the radio: {0}")]
    Rejected(String),
}

/// Radio access used by the scanner and the connection supervisor
pub trait GattTransport: Send {
    fn start_scan(&mut self, service: Uuid) -> Result<(), TransportError>;

    /// Must be harmless when no scan is running
    fn stop_scan(&mut self);

    /// `auto_connect` is always false: reconnect policy lives above the transport
    fn connect(
        &mut self,
        peripheral: &PeripheralIdentity,
        auto_connect: bool,
    ) -> Result<(), TransportError>;

    fn request_mtu(&mut self, mtu: u16) -> Result<(), TransportError>;

    fn discover_services(&mut self) -> Result<(), TransportError>;

    /// Subscribe locally and write the CCCD of `characteristic`
    fn enable_notifications(
        &mut self,
        characteristic: &CharacteristicRef,
    ) -> Result<(), TransportError>;

    fn read_characteristic(&mut self, characteristic: &CharacteristicRef)
        -> Result<(), TransportError>;

    fn write_characteristic(
        &mut self,
        characteristic: &CharacteristicRef,
        value: &[u8],
    ) -> Result<(), TransportError>;

    /// Drop the link and release every handle tied to it
    fn close(&mut self);
}
