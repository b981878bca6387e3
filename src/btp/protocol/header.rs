//! BTP packet header parsing and serialization.

use embedded_io_async::{Read, Write};

use crate::btp::error::{Error, from_read_exact_error};
use crate::btp::types::{Opcode, ServiceId};

/// BTP packet header size in bytes.
pub const HEADER_SIZE: usize = 5;

/// Wire value for non-controller index.
const NON_CONTROLLER: u8 = 0xFF;

/// BTP packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BtpHeader {
    /// Service ID (0-255).
    pub service_id: ServiceId,
    /// Opcode (0x00 = error, 0x01-0x7F = commands, 0x80-0xFF = events).
    pub opcode: Opcode,
    /// Controller index (None = non-controller, Some(i) = controller i).
    pub controller_index: Option<u8>,
    /// Data length (little-endian).
    pub data_len: u16,
}

impl BtpHeader {
    /// Create a new header.
    pub const fn new(service_id: ServiceId, opcode: Opcode, controller_index: Option<u8>, data_len: u16) -> Self {
        Self {
            service_id,
            opcode,
            controller_index,
            data_len,
        }
    }

    /// Raw index byte as sent on the wire.
    pub const fn index_byte(&self) -> u8 {
        match self.controller_index {
            Some(i) => i,
            None => NON_CONTROLLER,
        }
    }

    /// Serialize this header into its 5-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let len = self.data_len.to_le_bytes();
        [self.service_id.0, self.opcode.0, self.index_byte(), len[0], len[1]]
    }

    /// Decode a header from the first 5 bytes of `buf`.
    ///
    /// Fails with [`Error::BufferTooShort`] when fewer than 5 bytes are supplied.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::BufferTooShort);
        }

        let controller_index = match buf[2] {
            NON_CONTROLLER => None,
            i => Some(i),
        };

        Ok(Self {
            service_id: ServiceId(buf[0]),
            opcode: Opcode(buf[1]),
            controller_index,
            data_len: u16::from_le_bytes([buf[3], buf[4]]),
        })
    }

    /// Read a 5-byte BTP header from the reader.
    pub async fn read<R: Read>(mut reader: R) -> Result<Self, Error> {
        let mut buf = [0; HEADER_SIZE];
        reader.read_exact(&mut buf).await.map_err(from_read_exact_error)?;
        Self::decode(&buf)
    }

    /// Serialize this header as 5 bytes and write to the writer.
    pub async fn write<W: Write>(&self, mut writer: W) -> Result<(), W::Error> {
        writer.write_all(&self.encode()).await
    }
}

#[cfg(test)]
mod tests {
    use futures_executor::block_on;

    use super::*;

    #[test]
    fn test_header_parse_non_controller() {
        let mut buf = [0x01, 0x03, 0xFF, 0x04, 0x00].as_slice();
        let header = block_on(BtpHeader::read(&mut buf)).unwrap();

        assert_eq!(header.service_id, ServiceId(0x01));
        assert_eq!(header.opcode, Opcode(0x03));
        assert_eq!(header.controller_index, None);
        assert_eq!(header.data_len, 4);
    }

    #[test]
    fn test_header_parse_with_controller() {
        let header = BtpHeader::decode(&[0x01, 0x03, 0x02, 0x04, 0x01]).unwrap();

        assert_eq!(header.controller_index, Some(2));
        assert_eq!(header.data_len, 0x0104);
    }

    #[test]
    fn test_header_serialize() {
        let header = BtpHeader::new(ServiceId(0x01), Opcode(0x03), None, 4);

        let mut buf = [0u8; HEADER_SIZE];
        block_on(header.write(&mut buf.as_mut_slice())).unwrap();

        assert_eq!(buf, [0x01, 0x03, 0xFF, 0x04, 0x00]);
    }

    #[test]
    fn test_header_length_is_little_endian() {
        let header = BtpHeader::new(ServiceId::GATT, Opcode(0x11), Some(0), 0x1234);
        assert_eq!(header.encode(), [0x02, 0x11, 0x00, 0x34, 0x12]);
    }

    #[test]
    fn test_short_header_rejected() {
        for len in 0..HEADER_SIZE {
            let buf = [0u8; HEADER_SIZE];
            assert_eq!(BtpHeader::decode(&buf[..len]), Err(Error::BufferTooShort));
        }
    }

    #[test]
    fn test_truncated_stream_is_disconnect() {
        let mut buf = [0x01, 0x03].as_slice();
        let result = block_on(BtpHeader::read(&mut buf));
        assert_eq!(result, Err(Error::Disconnected));
    }
}
