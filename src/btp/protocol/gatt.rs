//! GATT service (ID 2) protocol definitions.
//!
//! Covers the client procedures WID handlers drive against a peer and the
//! server-side value update used to trigger notifications.

use super::{Command, Cursor};
use crate::btp::error::Error;
use crate::btp::types::{Address, Opcode, ServiceId};

/// GATT service opcodes.
pub mod opcodes {
    use crate::btp::types::Opcode;

    pub const READ_SUPPORTED_COMMANDS: Opcode = Opcode(0x01);
    pub const SET_VALUE: Opcode = Opcode(0x06);

    // Client Commands - Discovery
    pub const EXCHANGE_MTU: Opcode = Opcode(0x0a);
    pub const DISCOVER_ALL_PRIMARY: Opcode = Opcode(0x0b);

    // Client Commands - Read / Write
    pub const READ: Opcode = Opcode(0x11);
    pub const WRITE_WITHOUT_RSP: Opcode = Opcode(0x15);
    pub const WRITE: Opcode = Opcode(0x17);

    // Client Commands - Notifications
    pub const CFG_NOTIFY: Opcode = Opcode(0x1a);
    pub const CFG_INDICATE: Opcode = Opcode(0x1b);

    // Events
    pub const EVENT_NOTIFICATION_RECEIVED: Opcode = Opcode(0x80);
    pub const EVENT_ATTR_VALUE_CHANGED: Opcode = Opcode(0x81);
}

/// Notification type for event 0x80.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NotificationType {
    Notification = 0x01,
    Indication = 0x02,
}

impl TryFrom<u8> for NotificationType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Notification),
            0x02 => Ok(Self::Indication),
            _ => Err(Error::InvalidPacket),
        }
    }
}

/// Raw UUID bytes (2 or 16, little-endian) as carried by BTP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uuid(pub Vec<u8>);

impl Uuid {
    /// 16-bit UUID.
    pub fn new_short(value: u16) -> Self {
        Self(value.to_le_bytes().to_vec())
    }

    /// The 16-bit value, if this is a short UUID.
    pub fn as_short(&self) -> Option<u16> {
        match self.0.as_slice() {
            [lo, hi] => Some(u16::from_le_bytes([*lo, *hi])),
            _ => None,
        }
    }
}

/// Parse a UUID from a cursor (1-byte length prefix followed by that many UUID bytes).
fn parse_uuid(cursor: &mut Cursor<'_>) -> Result<Uuid, Error> {
    let raw = cursor.read_u8_prefixed()?;
    if raw.len() != 2 && raw.len() != 16 {
        return Err(Error::InvalidPacket);
    }
    Ok(Uuid(raw.to_vec()))
}

/// Service discovery result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub start_handle: u16,
    pub end_handle: u16,
    pub uuid: Uuid,
}

/// GATT service command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattCommand {
    /// Read supported commands (0x01).
    ReadSupportedCommands,
    /// Set a local attribute value (0x06).
    SetValue { attr_id: u16, value: Vec<u8> },
    /// Exchange MTU with a peer (0x0a).
    ExchangeMtu(Address),
    /// Discover all primary services (0x0b).
    DiscoverAllPrimary(Address),
    /// Read characteristic value (0x11).
    Read { address: Address, handle: u16 },
    /// Write without response (0x15).
    WriteWithoutRsp { address: Address, handle: u16, data: Vec<u8> },
    /// Write with response (0x17).
    Write { address: Address, handle: u16, data: Vec<u8> },
    /// Configure notifications (0x1a).
    CfgNotify { address: Address, enable: bool, ccc_handle: u16 },
    /// Configure indications (0x1b).
    CfgIndicate { address: Address, enable: bool, ccc_handle: u16 },
}

impl Command for GattCommand {
    fn service(&self) -> ServiceId {
        ServiceId::GATT
    }

    fn opcode(&self) -> Opcode {
        match self {
            GattCommand::ReadSupportedCommands => opcodes::READ_SUPPORTED_COMMANDS,
            GattCommand::SetValue { .. } => opcodes::SET_VALUE,
            GattCommand::ExchangeMtu(_) => opcodes::EXCHANGE_MTU,
            GattCommand::DiscoverAllPrimary(_) => opcodes::DISCOVER_ALL_PRIMARY,
            GattCommand::Read { .. } => opcodes::READ,
            GattCommand::WriteWithoutRsp { .. } => opcodes::WRITE_WITHOUT_RSP,
            GattCommand::Write { .. } => opcodes::WRITE,
            GattCommand::CfgNotify { .. } => opcodes::CFG_NOTIFY,
            GattCommand::CfgIndicate { .. } => opcodes::CFG_INDICATE,
        }
    }

    fn index(&self) -> Option<u8> {
        match self {
            GattCommand::ReadSupportedCommands => None,
            _ => Some(0),
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            GattCommand::ReadSupportedCommands => {}
            GattCommand::SetValue { attr_id, value } => {
                buf.extend_from_slice(&attr_id.to_le_bytes());
                buf.extend_from_slice(&(value.len() as u16).to_le_bytes());
                buf.extend_from_slice(value);
            }
            GattCommand::ExchangeMtu(address) | GattCommand::DiscoverAllPrimary(address) => address.encode(buf),
            GattCommand::Read { address, handle } => {
                address.encode(buf);
                buf.extend_from_slice(&handle.to_le_bytes());
            }
            GattCommand::WriteWithoutRsp { address, handle, data } | GattCommand::Write { address, handle, data } => {
                address.encode(buf);
                buf.extend_from_slice(&handle.to_le_bytes());
                buf.extend_from_slice(&(data.len() as u16).to_le_bytes());
                buf.extend_from_slice(data);
            }
            GattCommand::CfgNotify {
                address,
                enable,
                ccc_handle,
            }
            | GattCommand::CfgIndicate {
                address,
                enable,
                ccc_handle,
            } => {
                address.encode(buf);
                buf.push(u8::from(*enable));
                buf.extend_from_slice(&ccc_handle.to_le_bytes());
            }
        }
    }
}

/// Read data response: `att_response:u8, len:u16, data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadDataResponse {
    pub att_response: u8,
    pub data: Vec<u8>,
}

impl ReadDataResponse {
    /// Parse a READ response.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let mut cursor = Cursor::new(data);
        let att_response = cursor.read_u8()?;
        let data = cursor.read_u16_prefixed()?.to_vec();
        Ok(Self { att_response, data })
    }

    /// The peer answered without an ATT error.
    pub fn is_success(&self) -> bool {
        self.att_response == 0
    }
}

/// Parse a WRITE response into its ATT status.
pub fn parse_write_response(data: &[u8]) -> Result<u8, Error> {
    Cursor::new(data).read_u8()
}

/// Parse a DISCOVER_ALL_PRIMARY response.
pub fn parse_services(data: &[u8]) -> Result<Vec<ServiceInfo>, Error> {
    let mut cursor = Cursor::new(data);
    let count = cursor.read_u8()?;
    let mut services = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let start_handle = cursor.read_u16_le()?;
        let end_handle = cursor.read_u16_le()?;
        let uuid = parse_uuid(&mut cursor)?;
        services.push(ServiceInfo {
            start_handle,
            end_handle,
            uuid,
        });
    }
    Ok(services)
}

/// Notification or indication received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationReceivedEvent {
    pub address: Address,
    pub notification_type: NotificationType,
    pub handle: u16,
    pub data: Vec<u8>,
}

/// A local attribute was written by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrValueChangedEvent {
    pub attr_id: u16,
    pub data: Vec<u8>,
}

/// GATT service event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    /// Notification/Indication received (0x80).
    NotificationReceived(NotificationReceivedEvent),
    /// Attribute value changed (0x81).
    AttrValueChanged(AttrValueChangedEvent),
}

impl GattEvent {
    /// Parse a GATT event.
    pub fn parse(opcode: Opcode, cursor: &mut Cursor<'_>) -> Result<Self, Error> {
        match opcode {
            opcodes::EVENT_NOTIFICATION_RECEIVED => {
                let address = cursor.read_address()?;
                let notification_type = NotificationType::try_from(cursor.read_u8()?)?;
                let handle = cursor.read_u16_le()?;
                let data = cursor.read_u16_prefixed()?.to_vec();
                Ok(GattEvent::NotificationReceived(NotificationReceivedEvent {
                    address,
                    notification_type,
                    handle,
                    data,
                }))
            }
            opcodes::EVENT_ATTR_VALUE_CHANGED => {
                let attr_id = cursor.read_u16_le()?;
                let data = cursor.read_u16_prefixed()?.to_vec();
                Ok(GattEvent::AttrValueChanged(AttrValueChangedEvent { attr_id, data }))
            }
            _ => Err(Error::UnexpectedEvent {
                service: ServiceId::GATT,
                opcode,
            }),
        }
    }
}
