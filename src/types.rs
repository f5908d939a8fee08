//! Core protocol types and constants.

/// Size of a binary packet header: magic, type and payload length.
pub const HEADER_SIZE: usize = 12;

/// Largest payload accepted from a job server.
pub const MAX_PACKET_SIZE: usize = 64 * 1024 * 1024;

/// Magic code that starts every binary packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Magic {
    /// Sent by clients and workers.
    Req,
    /// Sent by job servers.
    Res,
}

impl Magic {
    const REQ: u32 = 0x0052_4551; // "\0REQ"
    const RES: u32 = 0x0052_4553; // "\0RES"

    /// Create a Magic from its raw big-endian value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            Self::REQ => Some(Self::Req),
            Self::RES => Some(Self::Res),
            _ => None,
        }
    }

    /// Raw wire value.
    pub fn as_u32(&self) -> u32 {
        match self {
            Self::Req => Self::REQ,
            Self::Res => Self::RES,
        }
    }
}

/// Packet types this crate sends or understands.
///
/// Only the control packets needed for connection management are modelled;
/// job submission and work dispatch packets belong to higher layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketType {
    /// Worker announces it can perform a function.
    CanDo = 1,
    /// Worker withdraws a function.
    CantDo = 2,
    /// Server wakes up a sleeping worker.
    Noop = 6,
    /// Poll the status of a job.
    GetStatus = 15,
    /// Reply to `GetStatus`.
    StatusRes = 20,
    /// Identify this connection to the server.
    SetClientId = 22,
}

impl PacketType {
    /// Create a PacketType from a raw value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::CanDo),
            2 => Some(Self::CantDo),
            6 => Some(Self::Noop),
            15 => Some(Self::GetStatus),
            20 => Some(Self::StatusRes),
            22 => Some(Self::SetClientId),
            _ => None,
        }
    }

    /// Number of NUL-separated arguments carried by this packet type.
    pub fn arg_count(&self) -> usize {
        match self {
            Self::Noop => 0,
            Self::CanDo | Self::CantDo | Self::GetStatus | Self::SetClientId => 1,
            Self::StatusRes => 5,
        }
    }
}

/// Result of a job status poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationResult {
    /// The server answered the poll.
    Success,
    /// The poll could not be delivered to the server.
    RequestFailed,
    /// The server was dropped from the pool before answering.
    ServerDropped,
}

impl OperationResult {
    /// Check if this result indicates success.
    pub fn is_successful(&self) -> bool {
        *self == Self::Success
    }
}
