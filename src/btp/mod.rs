//! Bluetooth Test Protocol: wire format, typed commands and events, and the
//! transport client that talks to the IUT.

pub mod client;
pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod types;

pub use self::client::{BtpClient, BtpIo, DisconnectHandle, EventSink};
pub use self::endpoint::Endpoint;
pub use self::error::Error;
pub use self::protocol::{BtpHeader, BtpStatus, Command, Frame};
pub use self::types::{AddrKind, Address, BdAddr, Opcode, ServiceId};
