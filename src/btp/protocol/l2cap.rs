//! L2CAP service (ID 3) protocol definitions.

use super::{Command, Cursor};
use crate::btp::error::Error;
use crate::btp::types::{Address, Opcode, ServiceId};

/// L2CAP service opcodes.
pub mod opcodes {
    use crate::btp::types::Opcode;

    pub const READ_SUPPORTED_COMMANDS: Opcode = Opcode(0x01);
    pub const CONNECT: Opcode = Opcode(0x02);
    pub const DISCONNECT: Opcode = Opcode(0x03);
    pub const SEND_DATA: Opcode = Opcode(0x04);
    pub const LISTEN: Opcode = Opcode(0x05);

    pub const EVENT_CONNECTION_REQUEST: Opcode = Opcode(0x80);
    pub const EVENT_CONNECTED: Opcode = Opcode(0x81);
    pub const EVENT_DISCONNECTED: Opcode = Opcode(0x82);
    pub const EVENT_DATA_RECEIVED: Opcode = Opcode(0x83);
    pub const EVENT_RECONFIGURED: Opcode = Opcode(0x84);
}

/// L2CAP transport type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Transport {
    /// BR/EDR transport.
    BrEdr = 0x00,
    /// LE transport.
    #[default]
    Le = 0x01,
}

/// L2CAP connection options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions(u8);

bitflags::bitflags! {
    impl ConnectOptions: u8 {
        /// Use Enhanced Credit-Based Flow Control (ECFC).
        const ECFC = 1 << 0;
        /// Hold at least 1 credit until Credits command is received.
        const HOLD_CREDIT = 1 << 1;
    }
}

/// L2CAP listen security response values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum ListenResponse {
    /// Success - accept connection.
    #[default]
    Success = 0x0000,
    InsufficientAuthentication = 0x0001,
    InsufficientAuthorization = 0x0002,
    InsufficientEncryptionKeySize = 0x0003,
    InsufficientEncryption = 0x0004,
    InsufficientSecureAuthentication = 0x0005,
}

/// L2CAP service command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum L2capCommand {
    /// Read supported commands (0x01).
    ReadSupportedCommands,
    /// Open one or more credit based channels (0x02).
    Connect {
        address: Address,
        psm: u16,
        mtu: u16,
        num: u8,
        options: ConnectOptions,
    },
    /// Disconnect a channel (0x03).
    Disconnect(u8),
    /// Send an SDU on a channel (0x04).
    SendData { chan_id: u8, data: Vec<u8> },
    /// Register a PSM server (0x05).
    Listen {
        psm: u16,
        transport: Transport,
        mtu: u16,
        response: ListenResponse,
    },
}

impl Command for L2capCommand {
    fn service(&self) -> ServiceId {
        ServiceId::L2CAP
    }

    fn opcode(&self) -> Opcode {
        match self {
            L2capCommand::ReadSupportedCommands => opcodes::READ_SUPPORTED_COMMANDS,
            L2capCommand::Connect { .. } => opcodes::CONNECT,
            L2capCommand::Disconnect(_) => opcodes::DISCONNECT,
            L2capCommand::SendData { .. } => opcodes::SEND_DATA,
            L2capCommand::Listen { .. } => opcodes::LISTEN,
        }
    }

    fn index(&self) -> Option<u8> {
        match self {
            L2capCommand::ReadSupportedCommands => None,
            _ => Some(0),
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            L2capCommand::ReadSupportedCommands => {}
            L2capCommand::Connect {
                address,
                psm,
                mtu,
                num,
                options,
            } => {
                address.encode(buf);
                buf.extend_from_slice(&psm.to_le_bytes());
                buf.extend_from_slice(&mtu.to_le_bytes());
                buf.push(*num);
                buf.push(options.bits());
            }
            L2capCommand::Disconnect(chan_id) => buf.push(*chan_id),
            L2capCommand::SendData { chan_id, data } => {
                buf.push(*chan_id);
                buf.extend_from_slice(&(data.len() as u16).to_le_bytes());
                buf.extend_from_slice(data);
            }
            L2capCommand::Listen {
                psm,
                transport,
                mtu,
                response,
            } => {
                buf.extend_from_slice(&psm.to_le_bytes());
                buf.push(*transport as u8);
                buf.extend_from_slice(&mtu.to_le_bytes());
                // security type and key size: no requirement
                buf.push(0);
                buf.push(0);
                buf.extend_from_slice(&(*response as u16).to_le_bytes());
            }
        }
    }
}

/// Parse the CONNECT response into the allocated channel ids.
pub fn parse_connected_response(data: &[u8]) -> Result<Vec<u8>, Error> {
    Ok(Cursor::new(data).read_u8_prefixed()?.to_vec())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRequestEvent {
    pub chan_id: u8,
    pub psm: u16,
    pub address: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectedEvent {
    pub chan_id: u8,
    pub psm: u16,
    pub peer_mtu: u16,
    pub peer_mps: u16,
    pub our_mtu: u16,
    pub our_mps: u16,
    pub address: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectedEvent {
    pub result: u16,
    pub chan_id: u8,
    pub psm: u16,
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataReceivedEvent {
    pub chan_id: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconfiguredEvent {
    pub chan_id: u8,
    pub peer_mtu: u16,
    pub peer_mps: u16,
    pub our_mtu: u16,
    pub our_mps: u16,
}

/// L2CAP service event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum L2capEvent {
    /// Connection request event (0x80).
    ConnectionRequest(ConnectionRequestEvent),
    /// Connected event (0x81).
    Connected(ConnectedEvent),
    /// Disconnected event (0x82).
    Disconnected(DisconnectedEvent),
    /// Data received event (0x83).
    DataReceived(DataReceivedEvent),
    /// Reconfigured event (0x84).
    Reconfigured(ReconfiguredEvent),
}

impl L2capEvent {
    /// Parse an L2CAP event.
    pub fn parse(opcode: Opcode, cursor: &mut Cursor<'_>) -> Result<Self, Error> {
        match opcode {
            opcodes::EVENT_CONNECTION_REQUEST => Ok(L2capEvent::ConnectionRequest(ConnectionRequestEvent {
                chan_id: cursor.read_u8()?,
                psm: cursor.read_u16_le()?,
                address: cursor.read_address()?,
            })),
            opcodes::EVENT_CONNECTED => Ok(L2capEvent::Connected(ConnectedEvent {
                chan_id: cursor.read_u8()?,
                psm: cursor.read_u16_le()?,
                peer_mtu: cursor.read_u16_le()?,
                peer_mps: cursor.read_u16_le()?,
                our_mtu: cursor.read_u16_le()?,
                our_mps: cursor.read_u16_le()?,
                address: cursor.read_address()?,
            })),
            opcodes::EVENT_DISCONNECTED => Ok(L2capEvent::Disconnected(DisconnectedEvent {
                result: cursor.read_u16_le()?,
                chan_id: cursor.read_u8()?,
                psm: cursor.read_u16_le()?,
                address: cursor.read_address()?,
            })),
            opcodes::EVENT_DATA_RECEIVED => {
                let chan_id = cursor.read_u8()?;
                let data = cursor.read_u16_prefixed()?.to_vec();
                Ok(L2capEvent::DataReceived(DataReceivedEvent { chan_id, data }))
            }
            opcodes::EVENT_RECONFIGURED => Ok(L2capEvent::Reconfigured(ReconfiguredEvent {
                chan_id: cursor.read_u8()?,
                peer_mtu: cursor.read_u16_le()?,
                peer_mps: cursor.read_u16_le()?,
                our_mtu: cursor.read_u16_le()?,
                our_mps: cursor.read_u16_le()?,
            })),
            _ => Err(Error::UnexpectedEvent {
                service: ServiceId::L2CAP,
                opcode,
            }),
        }
    }
}
