//! BTP error types.

use core::fmt;

use super::protocol::BtpStatus;
use super::types::{Opcode, ServiceId};

/// Errors that can occur while talking BTP to the IUT or handling a WID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Transport I/O error.
    Transport(embedded_io::ErrorKind),
    /// The transport was closed or torn down.
    Disconnected,
    /// Invalid packet format.
    InvalidPacket,
    /// Packet data too short for expected content.
    BufferTooShort,
    /// Payload does not fit the 16-bit length field.
    PayloadTooLarge(usize),
    /// No response to a command within the allotted time.
    Timeout {
        /// The service of the command.
        service: ServiceId,
        /// The command opcode.
        opcode: Opcode,
    },
    /// The IUT answered a command with an error response.
    Status {
        /// The service of the command.
        service: ServiceId,
        /// The command opcode.
        opcode: Opcode,
        /// Status reported by the IUT.
        status: BtpStatus,
    },
    /// Unknown service ID.
    UnknownService(ServiceId),
    /// Event opcode not understood by the service parser.
    UnexpectedEvent {
        /// The service ID.
        service: ServiceId,
        /// The opcode.
        opcode: Opcode,
    },
    /// A second consumer tried to take from a single-consumer event queue.
    QueueBusy(&'static str),
    /// A WID handler could not complete its dialog.
    Handler(String),
    /// Endpoint specification could not be parsed.
    InvalidEndpoint(String),
}

impl Error {
    /// The link to the IUT is gone; the current test case cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Disconnected | Error::Transport(_))
    }

    /// Malformed frame or a command rejected by the IUT.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::InvalidPacket | Error::BufferTooShort | Error::PayloadTooLarge(_) | Error::Status { .. }
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(kind) => write!(f, "transport error: {:?}", kind),
            Error::Disconnected => write!(f, "transport disconnected"),
            Error::InvalidPacket => write!(f, "invalid packet format"),
            Error::BufferTooShort => write!(f, "buffer too short"),
            Error::PayloadTooLarge(len) => write!(f, "payload of {} bytes exceeds 65535", len),
            Error::Timeout { service, opcode } => {
                write!(f, "timeout waiting for response: service={} opcode={}", service, opcode)
            }
            Error::Status {
                service,
                opcode,
                status,
            } => write!(f, "command failed: service={} opcode={} status={:?}", service, opcode, status),
            Error::UnknownService(id) => write!(f, "unknown service: 0x{:02x}", id.0),
            Error::UnexpectedEvent { service, opcode } => {
                write!(f, "unexpected event: service={} opcode={}", service, opcode)
            }
            Error::QueueBusy(name) => write!(f, "event queue {} already has a consumer", name),
            Error::Handler(msg) => write!(f, "handler failed: {}", msg),
            Error::InvalidEndpoint(s) => write!(f, "invalid endpoint: {}", s),
        }
    }
}

impl std::error::Error for Error {}

impl<E: embedded_io::Error> From<E> for Error {
    fn from(value: E) -> Self {
        Error::Transport(value.kind())
    }
}

/// Convert a ReadExactError to Error.
///
/// End of stream means the peer closed the link, which is reported as
/// [`Error::Disconnected`] rather than a generic transport failure.
pub fn from_read_exact_error<E: embedded_io::Error>(e: embedded_io::ReadExactError<E>) -> Error {
    match e {
        embedded_io::ReadExactError::UnexpectedEof => Error::Disconnected,
        embedded_io::ReadExactError::Other(e) => Error::Transport(e.kind()),
    }
}
