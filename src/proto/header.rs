//! Frame header codec.
//!
//! Three legacy header shapes, distinguished by magic at offset 0. The
//! negotiated protocol version fixes which shape a connection reads; the
//! decoder still validates the magic of every frame.

use super::command::Command;
use crate::error::ReplError;
use byteorder::{BigEndian, ByteOrder};

/// v80 header: `[u32 magic][u16 command][u16 length]`.
pub const MAGIC_80: u32 = 0x8374_0267;
/// v95 "big" header: `[u16 magic][u16 command][u32 length]`.
pub const MAGIC_95: u16 = 0x5BE4;
/// v100 header: `[u32 magic][u16 command][u32 length][s16 volume][u16 pad]`.
pub const MAGIC_100: u32 = 0xD0E9_A33B;

pub const HEADER_SIZE_80: usize = 8;
pub const HEADER_SIZE_95: usize = 8;
pub const HEADER_SIZE_100: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderVersion {
    V80,
    V95,
    V100,
}

impl HeaderVersion {
    /// Header shape used by a negotiated protocol version.
    pub fn for_protocol(version: u32) -> Self {
        if version >= super::PROTOCOL_VOLUMES {
            HeaderVersion::V100
        } else if version >= 95 {
            HeaderVersion::V95
        } else {
            HeaderVersion::V80
        }
    }

    pub fn size(self) -> usize {
        match self {
            HeaderVersion::V80 => HEADER_SIZE_80,
            HeaderVersion::V95 => HEADER_SIZE_95,
            HeaderVersion::V100 => HEADER_SIZE_100,
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub command: Command,
    /// Payload length following the header.
    pub size: u32,
    /// Volume index, or -1 for headers without one.
    pub volume: i16,
}

/// Decode a header buffer, auto-detecting the shape by magic.
pub fn decode_header(buf: &[u8]) -> Result<PacketInfo, ReplError> {
    if buf.len() >= HEADER_SIZE_100 && BigEndian::read_u32(&buf[0..4]) == MAGIC_100 {
        let command = BigEndian::read_u16(&buf[4..6]);
        let size = BigEndian::read_u32(&buf[6..10]);
        let volume = BigEndian::read_i16(&buf[10..12]);
        let pad = BigEndian::read_u16(&buf[12..14]);
        if pad != 0 {
            return Err(ReplError::malformed(format!("v100 pad {pad:#x}")));
        }
        let command = Command::from_u16(command)
            .ok_or_else(|| ReplError::malformed(format!("unknown command {command:#x}")))?;
        return Ok(PacketInfo {
            command,
            size,
            volume,
        });
    }

    if buf.len() >= HEADER_SIZE_80 {
        if BigEndian::read_u32(&buf[0..4]) == MAGIC_80 {
            let command = BigEndian::read_u16(&buf[4..6]);
            let size = BigEndian::read_u16(&buf[6..8]) as u32;
            let command = Command::from_u16(command)
                .ok_or_else(|| ReplError::malformed(format!("unknown command {command:#x}")))?;
            return Ok(PacketInfo {
                command,
                size,
                volume: -1,
            });
        }
        if BigEndian::read_u16(&buf[0..2]) == MAGIC_95 {
            let command = BigEndian::read_u16(&buf[2..4]);
            let size = BigEndian::read_u32(&buf[4..8]);
            let command = Command::from_u16(command)
                .ok_or_else(|| ReplError::malformed(format!("unknown command {command:#x}")))?;
            return Ok(PacketInfo {
                command,
                size,
                volume: -1,
            });
        }
    }

    Err(ReplError::malformed("bad magic"))
}

/// Encode a header in the given shape. The volume is dropped for shapes
/// that cannot carry one.
pub fn encode_header(version: HeaderVersion, command: Command, size: u32, volume: i16) -> Vec<u8> {
    match version {
        HeaderVersion::V80 => {
            let mut buf = vec![0u8; HEADER_SIZE_80];
            BigEndian::write_u32(&mut buf[0..4], MAGIC_80);
            BigEndian::write_u16(&mut buf[4..6], command.as_u16());
            BigEndian::write_u16(&mut buf[6..8], size as u16);
            buf
        }
        HeaderVersion::V95 => {
            let mut buf = vec![0u8; HEADER_SIZE_95];
            BigEndian::write_u16(&mut buf[0..2], MAGIC_95);
            BigEndian::write_u16(&mut buf[2..4], command.as_u16());
            BigEndian::write_u32(&mut buf[4..8], size);
            buf
        }
        HeaderVersion::V100 => {
            let mut buf = vec![0u8; HEADER_SIZE_100];
            BigEndian::write_u32(&mut buf[0..4], MAGIC_100);
            BigEndian::write_u16(&mut buf[4..6], command.as_u16());
            BigEndian::write_u32(&mut buf[6..10], size);
            BigEndian::write_i16(&mut buf[10..12], volume);
            BigEndian::write_u16(&mut buf[12..14], 0);
            buf
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_v80() {
        let buf = encode_header(HeaderVersion::V80, Command::Barrier, 8, 3);
        let info = decode_header(&buf).unwrap();
        assert_eq!(info.command, Command::Barrier);
        assert_eq!(info.size, 8);
        assert_eq!(info.volume, -1);
    }

    #[test]
    fn roundtrip_v95() {
        let buf = encode_header(HeaderVersion::V95, Command::Data, 70000, 0);
        let info = decode_header(&buf).unwrap();
        assert_eq!(info.command, Command::Data);
        assert_eq!(info.size, 70000);
        assert_eq!(info.volume, -1);
    }

    #[test]
    fn roundtrip_v100() {
        let buf = encode_header(HeaderVersion::V100, Command::WriteAck, 24, 2);
        let info = decode_header(&buf).unwrap();
        assert_eq!(info.command, Command::WriteAck);
        assert_eq!(info.size, 24);
        assert_eq!(info.volume, 2);
    }

    #[test]
    fn v100_pad_must_be_zero() {
        let mut buf = encode_header(HeaderVersion::V100, Command::Data, 4096, 0);
        buf[13] = 1;
        assert!(decode_header(&buf).is_err());
    }

    #[test]
    fn bad_magic_rejected() {
        let buf = vec![0xAAu8; 14];
        assert!(decode_header(&buf).is_err());
    }

    #[test]
    fn header_version_selection() {
        assert_eq!(HeaderVersion::for_protocol(86), HeaderVersion::V80);
        assert_eq!(HeaderVersion::for_protocol(95), HeaderVersion::V95);
        assert_eq!(HeaderVersion::for_protocol(99), HeaderVersion::V95);
        assert_eq!(HeaderVersion::for_protocol(110), HeaderVersion::V100);
    }
}
