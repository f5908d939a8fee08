//! Binary control packets.
//!
//! ```text
//! +--------+--------+--------+--------+
//! |  Magic ("\0REQ" or "\0RES")       |  (4 bytes)
//! +--------+--------+--------+--------+
//! |  Packet type                      |  (4 bytes, big-endian)
//! +--------+--------+--------+--------+
//! |  Payload length                   |  (4 bytes, big-endian)
//! +--------+--------+--------+--------+
//! |  arg0 \0 arg1 \0 ... argN         |  (variable)
//! +--------+--------+--------+--------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{PoolError, Result};
use crate::types::{Magic, PacketType, HEADER_SIZE};

/// A decoded binary packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Direction marker.
    pub magic: Magic,
    /// Packet type.
    pub packet_type: PacketType,
    /// Arguments, without separators.
    pub args: Vec<Bytes>,
}

/// Parsed body of a `STATUS_RES` packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReply {
    /// Job handle the reply refers to.
    pub job_handle: Bytes,
    /// Whether the server knows the job.
    pub known: bool,
    /// Whether the job is currently running.
    pub running: bool,
    /// Completion numerator.
    pub numerator: u64,
    /// Completion denominator.
    pub denominator: u64,
}

impl Packet {
    /// Create a new packet.
    pub fn new(magic: Magic, packet_type: PacketType, args: Vec<Bytes>) -> Self {
        Self {
            magic,
            packet_type,
            args,
        }
    }

    /// `SET_CLIENT_ID` request.
    pub fn set_client_id(id: &str) -> Self {
        Self::new(
            Magic::Req,
            PacketType::SetClientId,
            vec![Bytes::copy_from_slice(id.as_bytes())],
        )
    }

    /// `GET_STATUS` request for a job handle.
    pub fn get_status(job_handle: impl Into<Bytes>) -> Self {
        Self::new(Magic::Req, PacketType::GetStatus, vec![job_handle.into()])
    }

    /// `CAN_DO` request announcing a function.
    pub fn can_do(function: &str) -> Self {
        Self::new(
            Magic::Req,
            PacketType::CanDo,
            vec![Bytes::copy_from_slice(function.as_bytes())],
        )
    }

    /// `CANT_DO` request withdrawing a function.
    pub fn cant_do(function: &str) -> Self {
        Self::new(
            Magic::Req,
            PacketType::CantDo,
            vec![Bytes::copy_from_slice(function.as_bytes())],
        )
    }

    /// `NOOP` response.
    pub fn noop() -> Self {
        Self::new(Magic::Res, PacketType::Noop, Vec::new())
    }

    /// `STATUS_RES` response.
    pub fn status_res(
        job_handle: impl Into<Bytes>,
        known: bool,
        running: bool,
        numerator: u64,
        denominator: u64,
    ) -> Self {
        let flag = |b: bool| Bytes::from_static(if b { b"1" } else { b"0" });
        Self::new(
            Magic::Res,
            PacketType::StatusRes,
            vec![
                job_handle.into(),
                flag(known),
                flag(running),
                Bytes::from(numerator.to_string()),
                Bytes::from(denominator.to_string()),
            ],
        )
    }

    /// Get an argument by index.
    pub fn arg(&self, index: usize) -> Option<&Bytes> {
        self.args.get(index)
    }

    /// Length of the payload (arguments plus separators).
    pub fn payload_len(&self) -> usize {
        let args: usize = self.args.iter().map(Bytes::len).sum();
        args + self.args.len().saturating_sub(1)
    }

    /// Total encoded size (header + payload).
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.payload_len()
    }

    /// Serialize the packet to bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.total_size());
        buf.put_u32(self.magic.as_u32());
        buf.put_u32(self.packet_type as u32);
        buf.put_u32(self.payload_len() as u32);
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                buf.put_u8(0);
            }
            buf.put_slice(arg);
        }
        buf.freeze()
    }

    /// Parse the 12-byte header, returning magic, type and payload length.
    pub fn parse_header(data: &[u8]) -> Result<(Magic, PacketType, usize)> {
        if data.len() < HEADER_SIZE {
            return Err(PoolError::PacketTooShort {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }

        let word = |i: usize| u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);

        let raw_magic = word(0);
        let magic = Magic::from_u32(raw_magic).ok_or(PoolError::WrongMagic(raw_magic))?;
        let raw_type = word(4);
        let packet_type =
            PacketType::from_u32(raw_type).ok_or(PoolError::UnknownPacketType(raw_type))?;

        Ok((magic, packet_type, word(8) as usize))
    }

    /// Build a packet from a parsed header and its payload.
    pub fn from_parts(magic: Magic, packet_type: PacketType, payload: &[u8]) -> Result<Self> {
        let count = packet_type.arg_count();
        if count == 0 {
            if !payload.is_empty() {
                return Err(PoolError::invalid_packet(format!(
                    "{packet_type:?} carries no arguments, got {} bytes",
                    payload.len()
                )));
            }
            return Ok(Self::new(magic, packet_type, Vec::new()));
        }

        // The last argument keeps any remaining separators.
        let args: Vec<Bytes> = payload
            .splitn(count, |b| *b == 0)
            .map(Bytes::copy_from_slice)
            .collect();

        if args.len() != count {
            return Err(PoolError::invalid_packet(format!(
                "{packet_type:?} expects {count} arguments, got {}",
                args.len()
            )));
        }

        Ok(Self::new(magic, packet_type, args))
    }

    /// Parse a packet from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (magic, packet_type, payload_len) = Self::parse_header(data)?;
        let expected_total = HEADER_SIZE + payload_len;

        if data.len() < expected_total {
            return Err(PoolError::invalid_packet(format!(
                "header says {payload_len} payload bytes, got {}",
                data.len() - HEADER_SIZE
            )));
        }

        Self::from_parts(magic, packet_type, &data[HEADER_SIZE..expected_total])
    }

    /// Interpret this packet as a status reply.
    ///
    /// Returns `None` for any other packet type or when the numeric fields
    /// do not parse.
    pub fn status_reply(&self) -> Option<StatusReply> {
        if self.packet_type != PacketType::StatusRes {
            return None;
        }

        let number = |i: usize| -> Option<u64> {
            std::str::from_utf8(self.arg(i)?).ok()?.trim().parse().ok()
        };
        let flag = |i: usize| self.arg(i).is_some_and(|a| a.as_ref() == b"1");

        Some(StatusReply {
            job_handle: self.arg(0)?.clone(),
            known: flag(1),
            running: flag(2),
            numerator: number(3)?,
            denominator: number(4)?,
        })
    }
}
