//! Packet framing and codec utilities.

use std::io::{Read, Write};

use crate::error::{PoolError, Result};
use crate::packet::Packet;
use crate::types::{HEADER_SIZE, MAX_PACKET_SIZE};

/// Read a complete packet from a stream.
///
/// This function handles TCP framing by first reading the header,
/// then reading the payload based on the length field. The payload is
/// consumed even when the header is rejected, so a caller may skip an
/// [`PoolError::UnknownPacketType`] and keep reading. A length field above
/// [`MAX_PACKET_SIZE`] is rejected before anything is allocated.
pub fn read_packet<R: Read>(reader: &mut R) -> Result<Packet> {
    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf)?;

    let payload_len =
        u32::from_be_bytes([header_buf[8], header_buf[9], header_buf[10], header_buf[11]]) as usize;
    if payload_len > MAX_PACKET_SIZE {
        return Err(PoolError::invalid_packet(format!(
            "payload of {payload_len} bytes exceeds {MAX_PACKET_SIZE}"
        )));
    }

    let mut payload = vec![0u8; payload_len];
    if payload_len > 0 {
        reader.read_exact(&mut payload)?;
    }

    let (magic, packet_type, _) = Packet::parse_header(&header_buf)?;
    Packet::from_parts(magic, packet_type, &payload)
}

/// Write a complete packet to a stream.
pub fn write_packet<W: Write>(writer: &mut W, packet: &Packet) -> Result<()> {
    writer.write_all(&packet.to_bytes())?;
    Ok(())
}
