//! Mesh node service (ID 4) protocol definitions.

use super::{Command, Cursor};
use crate::btp::error::Error;
use crate::btp::types::{Opcode, ServiceId};

/// Mesh service opcodes.
pub mod opcodes {
    use crate::btp::types::Opcode;

    pub const READ_SUPPORTED_COMMANDS: Opcode = Opcode(0x01);
    pub const INIT: Opcode = Opcode(0x04);
    pub const RESET: Opcode = Opcode(0x05);
    pub const INPUT_NUMBER: Opcode = Opcode(0x06);
    pub const INPUT_STRING: Opcode = Opcode(0x07);
    pub const IVU_TEST_MODE: Opcode = Opcode(0x08);
    pub const IVU_TOGGLE_STATE: Opcode = Opcode(0x09);
    pub const NET_SEND: Opcode = Opcode(0x0a);
    pub const LPN: Opcode = Opcode(0x0d);
    pub const LPN_POLL: Opcode = Opcode(0x0e);

    pub const EVENT_OUT_NUMBER_ACTION: Opcode = Opcode(0x80);
    pub const EVENT_OUT_STRING_ACTION: Opcode = Opcode(0x81);
    pub const EVENT_IN_ACTION: Opcode = Opcode(0x82);
    pub const EVENT_PROVISIONED: Opcode = Opcode(0x83);
    pub const EVENT_PROV_LINK_OPEN: Opcode = Opcode(0x84);
    pub const EVENT_PROV_LINK_CLOSED: Opcode = Opcode(0x85);
    pub const EVENT_NET_RECV: Opcode = Opcode(0x86);
    pub const EVENT_INVALID_BEARER: Opcode = Opcode(0x87);
    pub const EVENT_INCOMP_TIMER_EXP: Opcode = Opcode(0x88);
    pub const EVENT_FRND_ESTABLISHED: Opcode = Opcode(0x89);
    pub const EVENT_FRND_TERMINATED: Opcode = Opcode(0x8a);
    pub const EVENT_LPN_ESTABLISHED: Opcode = Opcode(0x8b);
    pub const EVENT_LPN_TERMINATED: Opcode = Opcode(0x8c);
    pub const EVENT_LPN_POLLED: Opcode = Opcode(0x8d);
}

/// Provisioning bearer reported by link open/close events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bearer {
    Adv,
    Gatt,
    Other(u8),
}

impl From<u8> for Bearer {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Bearer::Adv,
            0x02 => Bearer::Gatt,
            v => Bearer::Other(v),
        }
    }
}

/// Mesh service command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshCommand {
    /// Read supported commands (0x01).
    ReadSupportedCommands,
    /// Initialize the mesh stack (0x04).
    Init,
    /// Reset the node, dropping provisioning data (0x05).
    Reset,
    /// Enter an OOB number (0x06).
    InputNumber(u32),
    /// Enter an OOB string (0x07).
    InputString(String),
    /// Enable or disable IV update test mode (0x08).
    IvUpdateTestMode(bool),
    /// Toggle IV update state (0x09).
    IvUpdateToggle,
    /// Send a raw network PDU (0x0a).
    NetSend { ttl: u8, src: u16, dst: u16, payload: Vec<u8> },
    /// Enable or disable Low Power Node mode (0x0d).
    Lpn(bool),
    /// Poll the friend (0x0e).
    LpnPoll,
}

impl Command for MeshCommand {
    fn service(&self) -> ServiceId {
        ServiceId::MESH
    }

    fn opcode(&self) -> Opcode {
        match self {
            MeshCommand::ReadSupportedCommands => opcodes::READ_SUPPORTED_COMMANDS,
            MeshCommand::Init => opcodes::INIT,
            MeshCommand::Reset => opcodes::RESET,
            MeshCommand::InputNumber(_) => opcodes::INPUT_NUMBER,
            MeshCommand::InputString(_) => opcodes::INPUT_STRING,
            MeshCommand::IvUpdateTestMode(_) => opcodes::IVU_TEST_MODE,
            MeshCommand::IvUpdateToggle => opcodes::IVU_TOGGLE_STATE,
            MeshCommand::NetSend { .. } => opcodes::NET_SEND,
            MeshCommand::Lpn(_) => opcodes::LPN,
            MeshCommand::LpnPoll => opcodes::LPN_POLL,
        }
    }

    fn index(&self) -> Option<u8> {
        match self {
            MeshCommand::ReadSupportedCommands => None,
            _ => Some(0),
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            MeshCommand::ReadSupportedCommands
            | MeshCommand::Init
            | MeshCommand::Reset
            | MeshCommand::IvUpdateToggle
            | MeshCommand::LpnPoll => {}
            MeshCommand::InputNumber(number) => buf.extend_from_slice(&number.to_le_bytes()),
            MeshCommand::InputString(s) => {
                // OOB strings are at most 8 characters.
                buf.push(s.len() as u8);
                buf.extend_from_slice(s.as_bytes());
            }
            MeshCommand::IvUpdateTestMode(on) | MeshCommand::Lpn(on) => buf.push(u8::from(*on)),
            MeshCommand::NetSend { ttl, src, dst, payload } => {
                buf.push(*ttl);
                buf.extend_from_slice(&src.to_le_bytes());
                buf.extend_from_slice(&dst.to_le_bytes());
                buf.push(payload.len() as u8);
                buf.extend_from_slice(payload);
            }
        }
    }
}

/// Network PDU delivered to the upper tester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetRecvEvent {
    pub ttl: u8,
    pub ctl: u8,
    pub src: u16,
    pub dst: u16,
    pub payload: Vec<u8>,
}

/// Friendship established, seen from the friend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FriendEstablishedEvent {
    pub net_idx: u16,
    pub lpn_addr: u16,
    pub recv_delay: u8,
    pub poll_timeout: u32,
}

/// Friendship established, seen from the low power node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LpnEstablishedEvent {
    pub net_idx: u16,
    pub friend_addr: u16,
    pub queue_size: u8,
    pub recv_win: u8,
}

/// Mesh service event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// Output OOB number (0x80).
    OutNumberAction { action: u16, number: u32 },
    /// Output OOB string (0x81).
    OutStringAction(String),
    /// Input OOB requested (0x82).
    InAction { action: u16, size: u8 },
    /// Node provisioned (0x83).
    Provisioned,
    /// Provisioning link opened (0x84).
    ProvLinkOpen(Bearer),
    /// Provisioning link closed (0x85).
    ProvLinkClosed(Bearer),
    /// Network PDU received (0x86).
    NetRecv(NetRecvEvent),
    /// Invalid bearer (0x87).
    InvalidBearer(u8),
    /// Incomplete timer expired (0x88).
    IncompTimerExpired,
    /// Friendship established (0x89).
    FriendEstablished(FriendEstablishedEvent),
    /// Friendship terminated (0x8a).
    FriendTerminated { net_idx: u16, lpn_addr: u16 },
    /// LPN friendship established (0x8b).
    LpnEstablished(LpnEstablishedEvent),
    /// LPN friendship terminated (0x8c).
    LpnTerminated { net_idx: u16, friend_addr: u16 },
    /// LPN poll sent (0x8d).
    LpnPolled { net_idx: u16, friend_addr: u16, retry: u8 },
}

impl MeshEvent {
    /// Parse a Mesh event.
    pub fn parse(opcode: Opcode, cursor: &mut Cursor<'_>) -> Result<Self, Error> {
        let evt = match opcode {
            opcodes::EVENT_OUT_NUMBER_ACTION => MeshEvent::OutNumberAction {
                action: cursor.read_u16_le()?,
                number: cursor.read_u32_le()?,
            },
            opcodes::EVENT_OUT_STRING_ACTION => {
                let raw = cursor.read_u8_prefixed()?;
                MeshEvent::OutStringAction(String::from_utf8_lossy(raw).into_owned())
            }
            opcodes::EVENT_IN_ACTION => MeshEvent::InAction {
                action: cursor.read_u16_le()?,
                size: cursor.read_u8()?,
            },
            opcodes::EVENT_PROVISIONED => MeshEvent::Provisioned,
            opcodes::EVENT_PROV_LINK_OPEN => MeshEvent::ProvLinkOpen(Bearer::from(cursor.read_u8()?)),
            opcodes::EVENT_PROV_LINK_CLOSED => MeshEvent::ProvLinkClosed(Bearer::from(cursor.read_u8()?)),
            opcodes::EVENT_NET_RECV => MeshEvent::NetRecv(NetRecvEvent {
                ttl: cursor.read_u8()?,
                ctl: cursor.read_u8()?,
                src: cursor.read_u16_le()?,
                dst: cursor.read_u16_le()?,
                payload: cursor.read_u8_prefixed()?.to_vec(),
            }),
            opcodes::EVENT_INVALID_BEARER => MeshEvent::InvalidBearer(cursor.read_u8()?),
            opcodes::EVENT_INCOMP_TIMER_EXP => MeshEvent::IncompTimerExpired,
            opcodes::EVENT_FRND_ESTABLISHED => MeshEvent::FriendEstablished(FriendEstablishedEvent {
                net_idx: cursor.read_u16_le()?,
                lpn_addr: cursor.read_u16_le()?,
                recv_delay: cursor.read_u8()?,
                poll_timeout: cursor.read_u32_le()?,
            }),
            opcodes::EVENT_FRND_TERMINATED => MeshEvent::FriendTerminated {
                net_idx: cursor.read_u16_le()?,
                lpn_addr: cursor.read_u16_le()?,
            },
            opcodes::EVENT_LPN_ESTABLISHED => MeshEvent::LpnEstablished(LpnEstablishedEvent {
                net_idx: cursor.read_u16_le()?,
                friend_addr: cursor.read_u16_le()?,
                queue_size: cursor.read_u8()?,
                recv_win: cursor.read_u8()?,
            }),
            opcodes::EVENT_LPN_TERMINATED => MeshEvent::LpnTerminated {
                net_idx: cursor.read_u16_le()?,
                friend_addr: cursor.read_u16_le()?,
            },
            opcodes::EVENT_LPN_POLLED => MeshEvent::LpnPolled {
                net_idx: cursor.read_u16_le()?,
                friend_addr: cursor.read_u16_le()?,
                retry: cursor.read_u8()?,
            },
            _ => {
                return Err(Error::UnexpectedEvent {
                    service: ServiceId::MESH,
                    opcode,
                });
            }
        };
        Ok(evt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_send_encoding() {
        let mut buf = Vec::new();
        MeshCommand::NetSend {
            ttl: 7,
            src: 0x0001,
            dst: 0xffff,
            payload: vec![0xAA, 0xBB],
        }
        .encode(&mut buf);
        assert_eq!(buf, [7, 0x01, 0x00, 0xff, 0xff, 2, 0xAA, 0xBB]);
    }

    #[test]
    fn test_input_string_encoding() {
        let mut buf = Vec::new();
        MeshCommand::InputString("A1B2".into()).encode(&mut buf);
        assert_eq!(buf, [4, b'A', b'1', b'B', b'2']);
    }

    #[test]
    fn test_out_number_event() {
        let data = [0x08, 0x00, 0x39, 0x30, 0x00, 0x00];
        let evt = MeshEvent::parse(opcodes::EVENT_OUT_NUMBER_ACTION, &mut Cursor::new(&data)).unwrap();
        assert_eq!(
            evt,
            MeshEvent::OutNumberAction {
                action: 0x0008,
                number: 12345
            }
        );
    }

    #[test]
    fn test_net_recv_event() {
        let data = [0x05, 0x00, 0x01, 0x00, 0x02, 0x00, 0x03, 0x10, 0x20, 0x30];
        let evt = MeshEvent::parse(opcodes::EVENT_NET_RECV, &mut Cursor::new(&data)).unwrap();
        assert_eq!(
            evt,
            MeshEvent::NetRecv(NetRecvEvent {
                ttl: 5,
                ctl: 0,
                src: 1,
                dst: 2,
                payload: vec![0x10, 0x20, 0x30],
            })
        );
    }

    #[test]
    fn test_link_events() {
        let evt = MeshEvent::parse(opcodes::EVENT_PROV_LINK_OPEN, &mut Cursor::new(&[0x02])).unwrap();
        assert_eq!(evt, MeshEvent::ProvLinkOpen(Bearer::Gatt));
        let evt = MeshEvent::parse(opcodes::EVENT_PROV_LINK_CLOSED, &mut Cursor::new(&[0x09])).unwrap();
        assert_eq!(evt, MeshEvent::ProvLinkClosed(Bearer::Other(9)));
    }
}
