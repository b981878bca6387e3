//! Common BTP types.

use core::fmt;

// Re-export standard Bluetooth types from bt_hci
pub use bt_hci::param::{AddrKind, BdAddr};

use super::error::Error;

/// BTP opcode.
///
/// Commands use opcodes 0x01-0x7F, events use 0x80-0xFF, error response is 0x00.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Opcode(pub u8);

impl Opcode {
    /// Error response opcode.
    pub const ERROR: Self = Self(0x00);

    /// Check if this is a command opcode (0x01-0x7F).
    pub const fn is_command(&self) -> bool {
        self.0 >= 0x01 && self.0 <= 0x7F
    }

    /// Check if this is an event opcode (0x80-0xFF).
    pub const fn is_event(&self) -> bool {
        self.0 >= 0x80
    }
}

impl From<u8> for Opcode {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

/// BTP Service ID newtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ServiceId(pub u8);

impl ServiceId {
    /// Core Service (mandatory).
    pub const CORE: Self = Self(0x00);
    /// GAP Service.
    pub const GAP: Self = Self(0x01);
    /// GATT Server Service.
    pub const GATT: Self = Self(0x02);
    /// L2CAP Service.
    pub const L2CAP: Self = Self(0x03);
    /// Mesh Node Service.
    pub const MESH: Self = Self(0x04);
    /// Mesh Model Service.
    pub const MESH_MODEL: Self = Self(0x05);
    /// GATT Client Service.
    pub const GATT_CLIENT: Self = Self(0x06);

    const NAMES: [(ServiceId, &'static str); 7] = [
        (Self::CORE, "CORE"),
        (Self::GAP, "GAP"),
        (Self::GATT, "GATT"),
        (Self::L2CAP, "L2CAP"),
        (Self::MESH, "MESH"),
        (Self::MESH_MODEL, "MMDL"),
        (Self::GATT_CLIENT, "GATTC"),
    ];

    /// Short name used in logs and on the command line, if the service is known.
    pub fn name(&self) -> Option<&'static str> {
        Self::NAMES.iter().find(|(id, _)| id == self).map(|(_, name)| *name)
    }

    /// Look up a service by its short name (case-insensitive) or numeric id.
    pub fn from_name(name: &str) -> Option<Self> {
        if let Some((id, _)) = Self::NAMES.iter().find(|(_, n)| n.eq_ignore_ascii_case(name)) {
            return Some(*id);
        }
        name.parse::<u8>().ok().map(Self)
    }
}

impl From<u8> for ServiceId {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "0x{:02x}", self.0),
        }
    }
}

/// A Bluetooth device address with its type, as carried in BTP payloads.
///
/// On the wire this is 7 bytes: the address type followed by the 6 address
/// bytes in little-endian order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub kind: AddrKind,
    pub addr: BdAddr,
}

impl Address {
    /// Wire size of an address (type + 6 bytes).
    pub const SIZE: usize = 7;

    /// Public device address from little-endian bytes.
    pub fn public(addr: [u8; 6]) -> Self {
        Self {
            kind: AddrKind::PUBLIC,
            addr: BdAddr::new(addr),
        }
    }

    /// Random device address from little-endian bytes.
    pub fn random(addr: [u8; 6]) -> Self {
        Self {
            kind: AddrKind::RANDOM,
            addr: BdAddr::new(addr),
        }
    }

    /// Append the 7-byte wire form to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.kind.as_raw());
        buf.extend_from_slice(self.addr.raw());
    }

    /// Parse a textual address as printed by the PTS or in PIXIT values.
    ///
    /// Accepts `AA:BB:CC:DD:EE:FF` and the bare `AABBCCDDEEFF` form, both most
    /// significant byte first.
    pub fn parse(kind: AddrKind, text: &str) -> Result<Self, Error> {
        let hex: String = text.chars().filter(|c| *c != ':' && *c != '-').collect();
        if hex.len() != 12 || !hex.is_ascii() {
            return Err(Error::Handler(format!("invalid address {text:?}")));
        }
        let mut bytes = [0u8; 6];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = &hex[i * 2..i * 2 + 2];
            *byte = u8::from_str_radix(pair, 16).map_err(|_| Error::Handler(format!("invalid address {text:?}")))?;
        }
        bytes.reverse();
        Ok(Self {
            kind,
            addr: BdAddr::new(bytes),
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw = self.addr.raw();
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            raw[5], raw[4], raw[3], raw[2], raw[1], raw[0]
        )?;
        if self.kind == AddrKind::PUBLIC {
            Ok(())
        } else {
            write!(f, " (type {})", self.kind.as_raw())
        }
    }
}
