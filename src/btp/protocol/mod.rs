//! BTP protocol definitions and parsing.
//!
//! This module contains the frame codec shared by every service, the
//! [`Command`] trait implemented by typed command builders, and the
//! per-service response and event parsers. Nothing in here performs I/O
//! beyond reading or writing a single frame.

pub mod core;
pub mod gap;
pub mod gatt;
pub mod header;
pub mod l2cap;
pub mod mesh;

use embedded_io_async::{Read, Write};
pub use header::{BtpHeader, HEADER_SIZE};

use crate::btp::error::{Error, from_read_exact_error};
use crate::btp::types::{AddrKind, Address, BdAddr, Opcode, ServiceId};

/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Decode a supported-commands or supported-services bitmask into the set
/// bit positions.
///
/// Bit `n` lives in bit `n % 8` of byte `n / 8`.
pub fn bitmask_bits(mask: &[u8]) -> Vec<u8> {
    let mut bits = Vec::new();
    for (byte_idx, byte) in mask.iter().enumerate() {
        for bit_idx in 0..8 {
            if byte & (1 << bit_idx) != 0 {
                let bit = byte_idx * 8 + bit_idx;
                if let Ok(bit) = u8::try_from(bit) {
                    bits.push(bit);
                }
            }
        }
    }
    bits
}

/// A synchronous, bounds-checked cursor for parsing borrowed data from a byte slice.
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Create a new cursor over the given data.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Read exactly `n` bytes, returning a borrowed sub-slice.
    pub fn read_exact(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.pos + n > self.data.len() {
            return Err(Error::BufferTooShort);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Result<u8, Error> {
        let slice = self.read_exact(1)?;
        Ok(slice[0])
    }

    /// Read a single signed byte.
    pub fn read_i8(&mut self) -> Result<i8, Error> {
        Ok(self.read_u8()? as i8)
    }

    /// Read a little-endian u16.
    pub fn read_u16_le(&mut self) -> Result<u16, Error> {
        let slice = self.read_exact(2)?;
        Ok(u16::from_le_bytes([slice[0], slice[1]]))
    }

    /// Read a little-endian u32.
    pub fn read_u32_le(&mut self) -> Result<u32, Error> {
        let slice = self.read_exact(4)?;
        Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
    }

    /// Read a 7-byte address (1 byte addr_type + 6 bytes BdAddr).
    pub fn read_address(&mut self) -> Result<Address, Error> {
        let slice = self.read_exact(Address::SIZE)?;
        Ok(Address {
            kind: AddrKind::new(slice[0]),
            addr: BdAddr::new([slice[1], slice[2], slice[3], slice[4], slice[5], slice[6]]),
        })
    }

    /// Read a u8 length prefix followed by that many bytes.
    pub fn read_u8_prefixed(&mut self) -> Result<&'a [u8], Error> {
        let len = self.read_u8()? as usize;
        self.read_exact(len)
    }

    /// Read a little-endian u16 length prefix followed by that many bytes.
    pub fn read_u16_prefixed(&mut self) -> Result<&'a [u8], Error> {
        let len = self.read_u16_le()? as usize;
        self.read_exact(len)
    }

    /// Consume everything that is left.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }

    /// Return the number of remaining unconsumed bytes.
    pub fn remaining_len(&self) -> usize {
        self.data.len() - self.pos
    }
}

/// BTP protocol status codes returned in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BtpStatus {
    /// Command failed.
    Fail = 0x01,
    /// Unknown command opcode.
    UnknownCommand = 0x02,
    /// IUT not ready to receive commands.
    NotReady = 0x03,
    /// Invalid controller index.
    InvalidIndex = 0x04,
}

impl TryFrom<u8> for BtpStatus {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Fail),
            0x02 => Ok(Self::UnknownCommand),
            0x03 => Ok(Self::NotReady),
            0x04 => Ok(Self::InvalidIndex),
            _ => Err(Error::InvalidPacket),
        }
    }
}

impl BtpStatus {
    /// Parse the payload of an error response (opcode 0x00).
    ///
    /// Status bytes this crate does not know are reported as [`BtpStatus::Fail`].
    pub fn from_error_payload(data: &[u8]) -> Result<Self, Error> {
        let mut cursor = Cursor::new(data);
        let raw = cursor.read_u8()?;
        Ok(Self::try_from(raw).unwrap_or(Self::Fail))
    }
}

/// One BTP frame: header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The frame header. `header.data_len` always equals `payload.len()`.
    pub header: BtpHeader,
    /// The payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame, checking that the payload fits the 16-bit length field.
    pub fn new(service_id: ServiceId, opcode: Opcode, index: Option<u8>, payload: Vec<u8>) -> Result<Self, Error> {
        let len = u16::try_from(payload.len()).map_err(|_| Error::PayloadTooLarge(payload.len()))?;
        Ok(Self {
            header: BtpHeader::new(service_id, opcode, index, len),
            payload,
        })
    }

    /// Serialize to header bytes followed by the payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode one complete frame.
    ///
    /// The buffer must hold exactly the header and the announced payload.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let header = BtpHeader::decode(buf)?;
        let payload = &buf[HEADER_SIZE..];
        if payload.len() != header.data_len as usize {
            return Err(Error::InvalidPacket);
        }
        Ok(Self {
            header,
            payload: payload.to_vec(),
        })
    }

    /// Read one frame from the reader.
    pub async fn read<R: Read>(mut reader: R) -> Result<Self, Error> {
        let header = BtpHeader::read(&mut reader).await?;
        let mut payload = vec![0u8; header.data_len as usize];
        if !payload.is_empty() {
            reader.read_exact(&mut payload).await.map_err(from_read_exact_error)?;
        }
        Ok(Self { header, payload })
    }

    /// Write the complete frame (header + payload) and flush.
    pub async fn write<W: Write>(&self, mut writer: W) -> Result<(), W::Error> {
        self.header.write(&mut writer).await?;
        writer.write_all(&self.payload).await?;
        writer.flush().await
    }
}

/// A typed BTP command that knows its own addressing and payload layout.
pub trait Command {
    /// Service the command belongs to.
    fn service(&self) -> ServiceId;

    /// Command opcode.
    fn opcode(&self) -> Opcode;

    /// Controller index. Most services address controller 0.
    fn index(&self) -> Option<u8> {
        Some(0)
    }

    /// Append the payload to `buf`.
    fn encode(&self, buf: &mut Vec<u8>);

    /// Build the frame for this command.
    fn to_frame(&self) -> Result<Frame, Error> {
        let mut payload = Vec::new();
        self.encode(&mut payload);
        Frame::new(self.service(), self.opcode(), self.index(), payload)
    }
}

/// A parsed BTP event from one of the modelled services.
#[derive(Debug, Clone, PartialEq)]
pub enum BtpEvent {
    /// Core service event.
    Core(core::CoreEvent),
    /// GAP service event.
    Gap(gap::GapEvent),
    /// GATT service event.
    Gatt(gatt::GattEvent),
    /// L2CAP service event.
    L2cap(l2cap::L2capEvent),
    /// Mesh node service event.
    Mesh(mesh::MeshEvent),
}

impl BtpEvent {
    /// Parse an event from header and payload.
    ///
    /// Services without a typed parser fail with [`Error::UnknownService`].
    pub fn parse(header: &BtpHeader, data: &[u8]) -> Result<Self, Error> {
        if !header.opcode.is_event() {
            return Err(Error::InvalidPacket);
        }

        let mut cursor = Cursor::new(data);
        let evt = match header.service_id {
            ServiceId::CORE => BtpEvent::Core(core::CoreEvent::parse(header.opcode, &mut cursor)?),
            ServiceId::GAP => BtpEvent::Gap(gap::GapEvent::parse(header.opcode, &mut cursor)?),
            ServiceId::GATT => BtpEvent::Gatt(gatt::GattEvent::parse(header.opcode, &mut cursor)?),
            ServiceId::L2CAP => BtpEvent::L2cap(l2cap::L2capEvent::parse(header.opcode, &mut cursor)?),
            ServiceId::MESH => BtpEvent::Mesh(mesh::MeshEvent::parse(header.opcode, &mut cursor)?),
            _ => return Err(Error::UnknownService(header.service_id)),
        };
        let remaining = cursor.remaining_len();
        if remaining > 0 {
            log::warn!(
                "Event {} {} has {} unconsumed trailing byte(s)",
                header.service_id,
                header.opcode,
                remaining
            );
        }
        Ok(evt)
    }
}

#[cfg(test)]
mod tests {
    use futures_executor::block_on;

    use super::*;

    // --- Cursor tests ---

    #[test]
    fn cursor_empty_data() {
        let cursor = Cursor::new(&[]);
        assert_eq!(cursor.remaining_len(), 0);
    }

    #[test]
    fn cursor_read_exact_overflow() {
        let mut cursor = Cursor::new(&[1, 2]);
        let result = cursor.read_exact(3);
        assert_eq!(result, Err(Error::BufferTooShort));
    }

    #[test]
    fn cursor_read_u16_le_value() {
        let mut cursor = Cursor::new(&[0x34, 0x12]);
        assert_eq!(cursor.read_u16_le().unwrap(), 0x1234);
        assert_eq!(cursor.remaining_len(), 0);
    }

    #[test]
    fn cursor_read_u32_le_value() {
        let mut cursor = Cursor::new(&[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(cursor.read_u32_le().unwrap(), 0x12345678);
    }

    #[test]
    fn cursor_read_address() {
        let mut cursor = Cursor::new(&[0x01, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        let addr = cursor.read_address().unwrap();
        assert_eq!(addr.kind, AddrKind::RANDOM);
        assert_eq!(addr.addr.raw(), &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        assert_eq!(cursor.remaining_len(), 0);
    }

    #[test]
    fn cursor_prefixed_and_rest() {
        let mut cursor = Cursor::new(&[0x02, 0xAA, 0xBB, 0x01, 0x00, 0xCC, 0xDD, 0xEE]);
        assert_eq!(cursor.read_u8_prefixed().unwrap(), &[0xAA, 0xBB]);
        assert_eq!(cursor.read_u16_prefixed().unwrap(), &[0xCC]);
        assert_eq!(cursor.read_rest(), &[0xDD, 0xEE]);
        assert_eq!(cursor.remaining_len(), 0);
    }

    // --- Frame codec ---

    #[test]
    fn frame_encode_layout() {
        let frame = Frame::new(ServiceId::CORE, Opcode(0x03), None, vec![0x01]).unwrap();
        assert_eq!(frame.encode(), [0x00, 0x03, 0xFF, 0x01, 0x00, 0x01]);
    }

    #[test]
    fn frame_decode_preserves_fields() {
        let bytes = [0x04, 0x86, 0x00, 0x03, 0x00, 0xDE, 0xAD, 0x01];
        let frame = Frame::decode(&bytes).unwrap();
        assert_eq!(frame.header.service_id, ServiceId::MESH);
        assert_eq!(frame.header.opcode, Opcode(0x86));
        assert_eq!(frame.header.controller_index, Some(0));
        assert_eq!(frame.payload, [0xDE, 0xAD, 0x01]);
        assert_eq!(frame.encode(), bytes);
    }

    #[test]
    fn frame_decode_length_mismatch() {
        assert_eq!(Frame::decode(&[0x01, 0x02, 0x00, 0x02, 0x00, 0xAA]), Err(Error::InvalidPacket));
        assert_eq!(Frame::decode(&[0x01, 0x02, 0x00, 0x00, 0x00, 0xAA]), Err(Error::InvalidPacket));
        assert_eq!(Frame::decode(&[0x01, 0x02]), Err(Error::BufferTooShort));
    }

    #[test]
    fn frame_payload_limit() {
        assert!(Frame::new(ServiceId::GATT, Opcode(0x01), Some(0), vec![0; MAX_PAYLOAD_LEN]).is_ok());
        assert_eq!(
            Frame::new(ServiceId::GATT, Opcode(0x01), Some(0), vec![0; MAX_PAYLOAD_LEN + 1]),
            Err(Error::PayloadTooLarge(MAX_PAYLOAD_LEN + 1))
        );
    }

    #[test]
    fn frame_stream_read_write() {
        let frame = Frame::new(ServiceId::GAP, Opcode(0x0f), Some(0), vec![1, 2, 3, 4, 5, 6, 7]).unwrap();
        let mut buf = [0u8; 12];
        block_on(frame.write(&mut buf.as_mut_slice())).unwrap();

        let mut reader = buf.as_slice();
        let read = block_on(Frame::read(&mut reader)).unwrap();
        assert_eq!(read, frame);
    }

    #[test]
    fn frame_read_truncated_payload() {
        let mut reader = [0x01, 0x0f, 0x00, 0x07, 0x00, 0x01].as_slice();
        assert_eq!(block_on(Frame::read(&mut reader)), Err(Error::Disconnected));
    }

    // --- Status and bitmasks ---

    #[test]
    fn status_from_error_payload() {
        assert_eq!(BtpStatus::from_error_payload(&[0x03]), Ok(BtpStatus::NotReady));
        assert_eq!(BtpStatus::from_error_payload(&[0x7f]), Ok(BtpStatus::Fail));
        assert_eq!(BtpStatus::from_error_payload(&[]), Err(Error::BufferTooShort));
    }

    #[test]
    fn bitmask_decoding() {
        assert_eq!(bitmask_bits(&[0x07]), vec![0, 1, 2]);
        assert_eq!(bitmask_bits(&[0x00, 0x81]), vec![8, 15]);
        assert!(bitmask_bits(&[]).is_empty());
    }

    #[test]
    fn event_parse_rejects_command_opcode() {
        let header = BtpHeader::new(ServiceId::CORE, Opcode(0x01), None, 0);
        assert_eq!(BtpEvent::parse(&header, &[]), Err(Error::InvalidPacket));
    }

    #[test]
    fn event_parse_unmodelled_service() {
        let header = BtpHeader::new(ServiceId(0x1b), Opcode(0x80), Some(0), 0);
        assert_eq!(BtpEvent::parse(&header, &[]), Err(Error::UnknownService(ServiceId(0x1b))));
    }
}
