//! Core service (ID 0) protocol definitions.

use super::{Command, Cursor, bitmask_bits};
use crate::btp::error::Error;
use crate::btp::types::{Opcode, ServiceId};

/// Core service opcodes.
pub mod opcodes {
    use crate::btp::types::Opcode;

    pub const READ_SUPPORTED_COMMANDS: Opcode = Opcode(0x01);
    pub const READ_SUPPORTED_SERVICES: Opcode = Opcode(0x02);
    pub const REGISTER_SERVICE: Opcode = Opcode(0x03);
    pub const UNREGISTER_SERVICE: Opcode = Opcode(0x04);

    pub const EVENT_IUT_READY: Opcode = Opcode(0x80);
}

/// Core service command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreCommand {
    /// Read supported commands (0x01).
    ReadSupportedCommands,
    /// Read supported services (0x02).
    ReadSupportedServices,
    /// Register a service (0x03).
    RegisterService(ServiceId),
    /// Unregister a service (0x04).
    UnregisterService(ServiceId),
}

impl Command for CoreCommand {
    fn service(&self) -> ServiceId {
        ServiceId::CORE
    }

    fn opcode(&self) -> Opcode {
        match self {
            CoreCommand::ReadSupportedCommands => opcodes::READ_SUPPORTED_COMMANDS,
            CoreCommand::ReadSupportedServices => opcodes::READ_SUPPORTED_SERVICES,
            CoreCommand::RegisterService(_) => opcodes::REGISTER_SERVICE,
            CoreCommand::UnregisterService(_) => opcodes::UNREGISTER_SERVICE,
        }
    }

    fn index(&self) -> Option<u8> {
        None
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            CoreCommand::ReadSupportedCommands | CoreCommand::ReadSupportedServices => {}
            CoreCommand::RegisterService(id) | CoreCommand::UnregisterService(id) => buf.push(id.0),
        }
    }
}

/// Parse the READ_SUPPORTED_SERVICES response into service ids.
pub fn parse_supported_services(data: &[u8]) -> Vec<ServiceId> {
    bitmask_bits(data).into_iter().map(ServiceId).collect()
}

/// Parse a READ_SUPPORTED_COMMANDS response (any service) into opcodes.
pub fn parse_supported_commands(data: &[u8]) -> Vec<Opcode> {
    bitmask_bits(data).into_iter().map(Opcode).collect()
}

/// Core service event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreEvent {
    /// IUT Ready event (0x80).
    IutReady,
}

impl CoreEvent {
    /// Parse a Core event.
    pub fn parse(opcode: Opcode, _cursor: &mut Cursor<'_>) -> Result<Self, Error> {
        match opcode {
            opcodes::EVENT_IUT_READY => Ok(CoreEvent::IutReady),
            _ => Err(Error::UnexpectedEvent {
                service: ServiceId::CORE,
                opcode,
            }),
        }
    }
}
