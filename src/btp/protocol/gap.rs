//! GAP service (ID 1) protocol definitions.

use super::{Command, Cursor};
use crate::btp::error::Error;
use crate::btp::types::{AddrKind, Address, BdAddr, Opcode, ServiceId};

/// GAP service opcodes.
pub mod opcodes {
    use crate::btp::types::Opcode;

    // Commands
    pub const READ_SUPPORTED_COMMANDS: Opcode = Opcode(0x01);
    pub const READ_CONTROLLER_INDEX_LIST: Opcode = Opcode(0x02);
    pub const READ_CONTROLLER_INFO: Opcode = Opcode(0x03);
    pub const SET_CONNECTABLE: Opcode = Opcode(0x06);
    pub const SET_DISCOVERABLE: Opcode = Opcode(0x08);
    pub const SET_BONDABLE: Opcode = Opcode(0x09);
    pub const START_ADVERTISING: Opcode = Opcode(0x0a);
    pub const STOP_ADVERTISING: Opcode = Opcode(0x0b);
    pub const START_DISCOVERY: Opcode = Opcode(0x0c);
    pub const STOP_DISCOVERY: Opcode = Opcode(0x0d);
    pub const CONNECT: Opcode = Opcode(0x0e);
    pub const DISCONNECT: Opcode = Opcode(0x0f);
    pub const SET_IO_CAPABILITY: Opcode = Opcode(0x10);
    pub const PAIR: Opcode = Opcode(0x11);
    pub const UNPAIR: Opcode = Opcode(0x12);
    pub const PASSKEY_ENTRY: Opcode = Opcode(0x13);
    pub const PASSKEY_CONFIRM: Opcode = Opcode(0x14);
    pub const CONN_PARAM_UPDATE: Opcode = Opcode(0x16);

    // Events
    pub const EVENT_NEW_SETTINGS: Opcode = Opcode(0x80);
    pub const EVENT_DEVICE_FOUND: Opcode = Opcode(0x81);
    pub const EVENT_DEVICE_CONNECTED: Opcode = Opcode(0x82);
    pub const EVENT_DEVICE_DISCONNECTED: Opcode = Opcode(0x83);
    pub const EVENT_PASSKEY_DISPLAY: Opcode = Opcode(0x84);
    pub const EVENT_PASSKEY_ENTRY_REQUEST: Opcode = Opcode(0x85);
    pub const EVENT_PASSKEY_CONFIRM_REQUEST: Opcode = Opcode(0x86);
    pub const EVENT_CONN_PARAM_UPDATE: Opcode = Opcode(0x88);
    pub const EVENT_SEC_LEVEL_CHANGED: Opcode = Opcode(0x89);
    pub const EVENT_PAIRING_FAILED: Opcode = Opcode(0x8c);
}

/// GAP settings flags (bitfield). Bits 0-18 are defined by BTP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GapSettings(u32);

bitflags::bitflags! {
    impl GapSettings: u32 {
        const POWERED = 1 << 0;
        const CONNECTABLE = 1 << 1;
        const FAST_CONNECTABLE = 1 << 2;
        const DISCOVERABLE = 1 << 3;
        const BONDABLE = 1 << 4;
        const LINK_LEVEL_SECURITY = 1 << 5;
        const SSP = 1 << 6;
        const BR_EDR = 1 << 7;
        const HIGH_SPEED = 1 << 8;
        const LE = 1 << 9;
        const ADVERTISING = 1 << 10;
        const SECURE_CONNECTIONS = 1 << 11;
        const DEBUG_KEYS = 1 << 12;
        const PRIVACY = 1 << 13;
        const CONTROLLER_CONFIG = 1 << 14;
        const STATIC_ADDRESS = 1 << 15;
        const SC_ONLY = 1 << 16;
        const EXTENDED_ADVERTISING = 1 << 17;
        const PERIODIC_ADVERTISING = 1 << 18;
    }
}

/// Discoverable mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DiscoverableMode {
    #[default]
    Off = 0x00,
    General = 0x01,
    Limited = 0x02,
}

/// Discovery flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryFlags(u8);

bitflags::bitflags! {
    impl DiscoveryFlags: u8 {
        const LE_SCAN = 1 << 0;
        const BR_EDR_SCAN = 1 << 1;
        const LIMITED = 1 << 2;
        const ACTIVE = 1 << 3;
        const OBSERVATION = 1 << 4;
        const OWN_ID_ADDR = 1 << 5;
        const FILTER_ACCEPT_LIST = 1 << 6;
    }
}

/// Device found event flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFoundFlags(u8);

bitflags::bitflags! {
    impl DeviceFoundFlags: u8 {
        const RSSI_VALID = 1 << 0;
        const ADV_DATA = 1 << 1;
        const SCAN_RSP = 1 << 2;
    }
}

/// SMP IO capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IoCapability {
    DisplayOnly = 0x00,
    DisplayYesNo = 0x01,
    KeyboardOnly = 0x02,
    NoInputNoOutput = 0x03,
    KeyboardDisplay = 0x04,
}

/// Maximum device name length.
pub const MAX_NAME_LEN: usize = 249;
/// Maximum short name length.
pub const MAX_SHORT_NAME_LEN: usize = 11;

/// Requested connection parameters, in controller units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnParams {
    /// Minimum interval (1.25 ms units).
    pub interval_min: u16,
    /// Maximum interval (1.25 ms units).
    pub interval_max: u16,
    pub latency: u16,
    /// Supervision timeout (10 ms units).
    pub timeout: u16,
}

/// GAP service command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GapCommand {
    /// Read supported commands (0x01).
    ReadSupportedCommands,
    /// Read controller index list (0x02).
    ReadControllerIndexList,
    /// Read controller information (0x03).
    ReadControllerInfo,
    /// Set connectable state (0x06).
    SetConnectable(bool),
    /// Set discoverable mode (0x08).
    SetDiscoverable(DiscoverableMode),
    /// Set bondable state (0x09).
    SetBondable(bool),
    /// Start advertising (0x0a).
    StartAdvertising {
        adv_data: Vec<u8>,
        scan_data: Vec<u8>,
        duration: u32,
        own_addr_type: AddrKind,
    },
    /// Stop advertising (0x0b).
    StopAdvertising,
    /// Start discovery (0x0c).
    StartDiscovery(DiscoveryFlags),
    /// Stop discovery (0x0d).
    StopDiscovery,
    /// Connect to device (0x0e).
    Connect { address: Address, own_addr_type: AddrKind },
    /// Disconnect from device (0x0f).
    Disconnect(Address),
    /// Set IO capability (0x10).
    SetIoCapability(IoCapability),
    /// Pair with device (0x11).
    Pair(Address),
    /// Unpair device (0x12).
    Unpair(Address),
    /// Passkey entry response (0x13).
    PasskeyEntry { address: Address, passkey: u32 },
    /// Passkey confirmation response (0x14).
    PasskeyConfirm { address: Address, confirmed: bool },
    /// Connection parameter update (0x16).
    ConnParamUpdate { address: Address, params: ConnParams },
}

impl Command for GapCommand {
    fn service(&self) -> ServiceId {
        ServiceId::GAP
    }

    fn opcode(&self) -> Opcode {
        match self {
            GapCommand::ReadSupportedCommands => opcodes::READ_SUPPORTED_COMMANDS,
            GapCommand::ReadControllerIndexList => opcodes::READ_CONTROLLER_INDEX_LIST,
            GapCommand::ReadControllerInfo => opcodes::READ_CONTROLLER_INFO,
            GapCommand::SetConnectable(_) => opcodes::SET_CONNECTABLE,
            GapCommand::SetDiscoverable(_) => opcodes::SET_DISCOVERABLE,
            GapCommand::SetBondable(_) => opcodes::SET_BONDABLE,
            GapCommand::StartAdvertising { .. } => opcodes::START_ADVERTISING,
            GapCommand::StopAdvertising => opcodes::STOP_ADVERTISING,
            GapCommand::StartDiscovery(_) => opcodes::START_DISCOVERY,
            GapCommand::StopDiscovery => opcodes::STOP_DISCOVERY,
            GapCommand::Connect { .. } => opcodes::CONNECT,
            GapCommand::Disconnect(_) => opcodes::DISCONNECT,
            GapCommand::SetIoCapability(_) => opcodes::SET_IO_CAPABILITY,
            GapCommand::Pair(_) => opcodes::PAIR,
            GapCommand::Unpair(_) => opcodes::UNPAIR,
            GapCommand::PasskeyEntry { .. } => opcodes::PASSKEY_ENTRY,
            GapCommand::PasskeyConfirm { .. } => opcodes::PASSKEY_CONFIRM,
            GapCommand::ConnParamUpdate { .. } => opcodes::CONN_PARAM_UPDATE,
        }
    }

    fn index(&self) -> Option<u8> {
        match self {
            GapCommand::ReadSupportedCommands | GapCommand::ReadControllerIndexList => None,
            _ => Some(0),
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            GapCommand::ReadSupportedCommands
            | GapCommand::ReadControllerIndexList
            | GapCommand::ReadControllerInfo
            | GapCommand::StopAdvertising
            | GapCommand::StopDiscovery => {}
            GapCommand::SetConnectable(on) | GapCommand::SetBondable(on) => buf.push(u8::from(*on)),
            GapCommand::SetDiscoverable(mode) => buf.push(*mode as u8),
            GapCommand::StartAdvertising {
                adv_data,
                scan_data,
                duration,
                own_addr_type,
            } => {
                // Both lengths are u8 on the wire; AD payloads never exceed 251 bytes.
                buf.push(adv_data.len() as u8);
                buf.push(scan_data.len() as u8);
                buf.extend_from_slice(adv_data);
                buf.extend_from_slice(scan_data);
                buf.extend_from_slice(&duration.to_le_bytes());
                buf.push(own_addr_type.as_raw());
            }
            GapCommand::StartDiscovery(flags) => buf.push(flags.bits()),
            GapCommand::Connect { address, own_addr_type } => {
                address.encode(buf);
                buf.push(own_addr_type.as_raw());
            }
            GapCommand::Disconnect(address) | GapCommand::Pair(address) | GapCommand::Unpair(address) => {
                address.encode(buf)
            }
            GapCommand::SetIoCapability(cap) => buf.push(*cap as u8),
            GapCommand::PasskeyEntry { address, passkey } => {
                address.encode(buf);
                buf.extend_from_slice(&passkey.to_le_bytes());
            }
            GapCommand::PasskeyConfirm { address, confirmed } => {
                address.encode(buf);
                buf.push(u8::from(*confirmed));
            }
            GapCommand::ConnParamUpdate { address, params } => {
                address.encode(buf);
                buf.extend_from_slice(&params.interval_min.to_le_bytes());
                buf.extend_from_slice(&params.interval_max.to_le_bytes());
                buf.extend_from_slice(&params.latency.to_le_bytes());
                buf.extend_from_slice(&params.timeout.to_le_bytes());
            }
        }
    }
}

/// Controller info response data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerInfo {
    pub address: BdAddr,
    pub supported_settings: GapSettings,
    pub current_settings: GapSettings,
    pub class_of_device: [u8; 3],
    pub name: String,
    pub short_name: String,
}

impl ControllerInfo {
    /// Wire length: 6 + 4 + 4 + 3 + 249 + 11 = 277
    pub const LEN: usize = 6 + 4 + 4 + 3 + MAX_NAME_LEN + MAX_SHORT_NAME_LEN;

    /// Parse the READ_CONTROLLER_INFO response.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let mut cursor = Cursor::new(data);
        let raw = cursor.read_exact(6)?;
        let address = BdAddr::new([raw[0], raw[1], raw[2], raw[3], raw[4], raw[5]]);
        let supported_settings = GapSettings::from_bits_retain(cursor.read_u32_le()?);
        let current_settings = GapSettings::from_bits_retain(cursor.read_u32_le()?);
        let cod = cursor.read_exact(3)?;
        let name = padded_str(cursor.read_exact(MAX_NAME_LEN)?);
        let short_name = padded_str(cursor.read_exact(MAX_SHORT_NAME_LEN)?);
        Ok(Self {
            address,
            supported_settings,
            current_settings,
            class_of_device: [cod[0], cod[1], cod[2]],
            name,
            short_name,
        })
    }
}

fn padded_str(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Parse a current-settings response (set connectable, discoverable, ...).
pub fn parse_current_settings(data: &[u8]) -> Result<GapSettings, Error> {
    Cursor::new(data).read_u32_le().map(GapSettings::from_bits_retain)
}

/// Parse the READ_CONTROLLER_INDEX_LIST response.
pub fn parse_controller_index_list(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut cursor = Cursor::new(data);
    Ok(cursor.read_u8_prefixed()?.to_vec())
}

/// Device found event data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFoundEvent {
    pub address: Address,
    pub rssi: i8,
    pub flags: DeviceFoundFlags,
    pub adv_data: Vec<u8>,
}

/// Device connected event data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConnectedEvent {
    pub address: Address,
    pub interval: u16,
    pub latency: u16,
    pub timeout: u16,
}

/// Passkey display, entry or confirm request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasskeyEvent {
    pub address: Address,
    pub passkey: u32,
}

/// Security level changed event data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecLevelChangedEvent {
    pub address: Address,
    pub sec_level: u8,
}

/// Pairing failed event data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingFailedEvent {
    pub address: Address,
    pub reason: u8,
}

/// GAP service event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GapEvent {
    /// New settings (0x80).
    NewSettings(GapSettings),
    /// Device found (0x81).
    DeviceFound(DeviceFoundEvent),
    /// Device connected (0x82).
    DeviceConnected(DeviceConnectedEvent),
    /// Device disconnected (0x83).
    DeviceDisconnected(Address),
    /// Passkey display (0x84).
    PasskeyDisplay(PasskeyEvent),
    /// Passkey entry request (0x85).
    PasskeyEntryRequest(Address),
    /// Passkey confirm request (0x86).
    PasskeyConfirmRequest(PasskeyEvent),
    /// Connection parameters updated (0x88).
    ConnParamUpdate(DeviceConnectedEvent),
    /// Security level changed (0x89).
    SecLevelChanged(SecLevelChangedEvent),
    /// Pairing failed (0x8c).
    PairingFailed(PairingFailedEvent),
}

impl GapEvent {
    /// Parse a GAP event.
    pub fn parse(opcode: Opcode, cursor: &mut Cursor<'_>) -> Result<Self, Error> {
        match opcode {
            opcodes::EVENT_NEW_SETTINGS => Ok(GapEvent::NewSettings(GapSettings::from_bits_retain(
                cursor.read_u32_le()?,
            ))),
            opcodes::EVENT_DEVICE_FOUND => {
                let address = cursor.read_address()?;
                let rssi = cursor.read_i8()?;
                let flags = DeviceFoundFlags::from_bits_truncate(cursor.read_u8()?);
                let adv_data = cursor.read_u16_prefixed()?.to_vec();
                Ok(GapEvent::DeviceFound(DeviceFoundEvent {
                    address,
                    rssi,
                    flags,
                    adv_data,
                }))
            }
            opcodes::EVENT_DEVICE_CONNECTED => Ok(GapEvent::DeviceConnected(Self::parse_conn(cursor)?)),
            opcodes::EVENT_DEVICE_DISCONNECTED => Ok(GapEvent::DeviceDisconnected(cursor.read_address()?)),
            opcodes::EVENT_PASSKEY_DISPLAY => Ok(GapEvent::PasskeyDisplay(Self::parse_passkey(cursor)?)),
            opcodes::EVENT_PASSKEY_ENTRY_REQUEST => Ok(GapEvent::PasskeyEntryRequest(cursor.read_address()?)),
            opcodes::EVENT_PASSKEY_CONFIRM_REQUEST => {
                Ok(GapEvent::PasskeyConfirmRequest(Self::parse_passkey(cursor)?))
            }
            opcodes::EVENT_CONN_PARAM_UPDATE => Ok(GapEvent::ConnParamUpdate(Self::parse_conn(cursor)?)),
            opcodes::EVENT_SEC_LEVEL_CHANGED => {
                let address = cursor.read_address()?;
                let sec_level = cursor.read_u8()?;
                Ok(GapEvent::SecLevelChanged(SecLevelChangedEvent { address, sec_level }))
            }
            opcodes::EVENT_PAIRING_FAILED => {
                let address = cursor.read_address()?;
                let reason = cursor.read_u8()?;
                Ok(GapEvent::PairingFailed(PairingFailedEvent { address, reason }))
            }
            _ => Err(Error::UnexpectedEvent {
                service: ServiceId::GAP,
                opcode,
            }),
        }
    }

    fn parse_conn(cursor: &mut Cursor<'_>) -> Result<DeviceConnectedEvent, Error> {
        Ok(DeviceConnectedEvent {
            address: cursor.read_address()?,
            interval: cursor.read_u16_le()?,
            latency: cursor.read_u16_le()?,
            timeout: cursor.read_u16_le()?,
        })
    }

    fn parse_passkey(cursor: &mut Cursor<'_>) -> Result<PasskeyEvent, Error> {
        Ok(PasskeyEvent {
            address: cursor.read_address()?,
            passkey: cursor.read_u32_le()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: [u8; 6] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];

    #[test]
    fn test_connect_encoding() {
        let cmd = GapCommand::Connect {
            address: Address::random(PEER),
            own_addr_type: AddrKind::PUBLIC,
        };
        let frame = cmd.to_frame().unwrap();
        assert_eq!(frame.header.opcode, opcodes::CONNECT);
        assert_eq!(frame.header.controller_index, Some(0));
        assert_eq!(frame.payload, [0x01, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x00]);
    }

    #[test]
    fn test_index_list_is_non_controller() {
        let frame = GapCommand::ReadControllerIndexList.to_frame().unwrap();
        assert_eq!(frame.header.controller_index, None);
    }

    #[test]
    fn test_start_advertising_encoding() {
        let cmd = GapCommand::StartAdvertising {
            adv_data: vec![0x02, 0x01, 0x06],
            scan_data: vec![],
            duration: 0,
            own_addr_type: AddrKind::PUBLIC,
        };
        let mut buf = Vec::new();
        cmd.encode(&mut buf);
        assert_eq!(buf, [3, 0, 0x02, 0x01, 0x06, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_passkey_entry_encoding() {
        let mut buf = Vec::new();
        GapCommand::PasskeyEntry {
            address: Address::public(PEER),
            passkey: 123456,
        }
        .encode(&mut buf);
        assert_eq!(&buf[7..], &123456u32.to_le_bytes());
    }

    #[test]
    fn test_controller_info_parse() {
        let mut data = Vec::new();
        data.extend_from_slice(&PEER);
        data.extend_from_slice(&GapSettings::POWERED.bits().to_le_bytes());
        data.extend_from_slice(&(GapSettings::POWERED | GapSettings::LE).bits().to_le_bytes());
        data.extend_from_slice(&[0, 0, 0]);
        let mut name = b"trouble".to_vec();
        name.resize(MAX_NAME_LEN, 0);
        data.extend_from_slice(&name);
        data.extend_from_slice(&[0u8; MAX_SHORT_NAME_LEN]);
        assert_eq!(data.len(), ControllerInfo::LEN);

        let info = ControllerInfo::parse(&data).unwrap();
        assert_eq!(info.address.raw(), &PEER);
        assert!(info.current_settings.contains(GapSettings::LE));
        assert_eq!(info.name, "trouble");
        assert_eq!(info.short_name, "");
    }

    #[test]
    fn test_device_found_event() {
        let data = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0xC4, 0x03, 0x02, 0x00, 0xAA, 0xBB];
        let mut cursor = Cursor::new(&data);
        let evt = GapEvent::parse(opcodes::EVENT_DEVICE_FOUND, &mut cursor).unwrap();
        match evt {
            GapEvent::DeviceFound(evt) => {
                assert_eq!(evt.address, Address::public(PEER));
                assert_eq!(evt.rssi, -60);
                assert!(evt.flags.contains(DeviceFoundFlags::RSSI_VALID | DeviceFoundFlags::ADV_DATA));
                assert_eq!(evt.adv_data, [0xAA, 0xBB]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(cursor.remaining_len(), 0);
    }

    #[test]
    fn test_pairing_failed_event() {
        let data = [0x01, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x05];
        let evt = GapEvent::parse(opcodes::EVENT_PAIRING_FAILED, &mut Cursor::new(&data)).unwrap();
        assert_eq!(
            evt,
            GapEvent::PairingFailed(PairingFailedEvent {
                address: Address::random(PEER),
                reason: 0x05
            })
        );
    }

    #[test]
    fn test_truncated_event() {
        let data = [0x01, 0x11, 0x22];
        assert_eq!(
            GapEvent::parse(opcodes::EVENT_DEVICE_DISCONNECTED, &mut Cursor::new(&data)),
            Err(Error::BufferTooShort)
        );
    }

    #[test]
    fn test_unknown_event_opcode() {
        assert!(matches!(
            GapEvent::parse(Opcode(0xfe), &mut Cursor::new(&[])),
            Err(Error::UnexpectedEvent { .. })
        ));
    }
}
