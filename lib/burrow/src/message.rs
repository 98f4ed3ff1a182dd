use std::fmt;
use std::net::Ipv4Addr;

use hashbrown::HashMap;

pub const HEADER_SIZE: usize = 12;

/// Wire overhead of one endpoint entry in an acknowledgement payload:
/// 8 bytes of endpoint hash plus the one-byte id count.
pub const ACK_ENDPOINT_SIZE: usize = 9;

const INITIAL_ACK_IDS: usize = 10;

/// The protocol commands. Any other value on the wire is rejected.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageType {
    Authentication = 1,
    Handshake = 2,
    Data = 3,
    Keepalive = 4,
    Reset = 5,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<MessageType> {
        match value {
            1 => Some(MessageType::Authentication),
            2 => Some(MessageType::Handshake),
            3 => Some(MessageType::Data),
            4 => Some(MessageType::Keepalive),
            5 => Some(MessageType::Reset),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Authentication => "auth",
            MessageType::Handshake => "handshake",
            MessageType::Data => "data",
            MessageType::Keepalive => "keepalive",
            MessageType::Reset => "reset",
        }
    }
}

/// Selective payload compression. The three methods are mutually exclusive
/// on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Compression {
    None = 0,
    Lz4 = 1,
    Lzo = 2,
    Zstd = 3,
}

impl Compression {
    pub fn from_name(name: &str) -> Compression {
        match name {
            "lz4" => Compression::Lz4,
            "lzo" => Compression::Lzo,
            "zstd" => Compression::Zstd,
            _ => Compression::None,
        }
    }

    pub fn from_u8(value: u8) -> Compression {
        match value {
            1 => Compression::Lz4,
            2 => Compression::Lzo,
            3 => Compression::Zstd,
            _ => Compression::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lz4 => "lz4",
            Compression::Lzo => "lzo",
            Compression::Zstd => "zstd",
        }
    }
}

/// A hashed identifier of a logical flow inside the tunnel, derived from
/// the inner IP addresses. Opaque; never persisted across runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint(pub u64);

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the packet decoder learned about an inner IP packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PacketInfo {
    pub endpoint: Endpoint,
    pub protocol: u8,
}

#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub client_id: String,
    pub name: String,
    pub password: String,
    pub compression: Compression,
    pub compression_level: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub session_id: u32,
    pub local_ip: Ipv4Addr,
    pub remote_ip: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub key: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum Payload {
    Empty,
    Raw(Vec<u8>),
    Auth(AuthRequest),
    AuthReply(AuthResponse),
    Handshake(Handshake),
    Ack(Acknowledgement),
}

impl Payload {
    #[inline]
    pub fn raw(&self) -> Option<&[u8]> {
        match self {
            Payload::Raw(data) => Some(data),
            _ => None,
        }
    }

    #[inline]
    pub fn take_raw(&mut self) -> Option<Vec<u8>> {
        match std::mem::replace(self, Payload::Empty) {
            Payload::Raw(data) => Some(data),
            other => {
                *self = other;
                None
            }
        }
    }
}

/// The protocol PDU.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: u32,
    pub session_id: u32,
    pub kind: MessageType,
    pub compression: Compression,
    pub compression_level: u8,
    pub error: u8,
    pub payload_length: u16,
    pub is_error: bool,
    pub is_request: bool,
    pub is_ack: bool,
    pub payload: Payload,
    pub packet: Option<PacketInfo>,
}

impl Message {
    pub fn new(kind: MessageType) -> Message {
        Message {
            id: 0,
            session_id: 0,
            kind,
            compression: Compression::None,
            compression_level: 0,
            error: 0,
            payload_length: 0,
            is_error: false,
            is_request: false,
            is_ack: false,
            payload: Payload::Empty,
            packet: None,
        }
    }

    /// True for frames encrypted with the session key rather than the
    /// primary key: user data after a successful handshake.
    #[inline]
    pub fn is_user_data(&self) -> bool {
        self.kind == MessageType::Data && !self.is_ack
    }

    /// True for frames that pass through the stream merger.
    #[inline]
    pub fn is_stream_merge(&self) -> bool {
        self.kind == MessageType::Data && self.session_id != 0
    }

    /// True for frames whose receipt must be acknowledged.
    #[inline]
    pub fn wants_ack(&self) -> bool {
        self.kind == MessageType::Data && !self.is_ack
    }

    /// True for frames that carry a payload at all.
    #[inline]
    pub fn has_payload(&self) -> bool {
        !(self.kind == MessageType::Reset || self.kind == MessageType::Keepalive)
    }

    #[inline]
    pub fn endpoint(&self) -> Endpoint {
        match &self.packet {
            Some(info) => info.endpoint,
            None => Endpoint(0),
        }
    }
}

/// Coalesced per-endpoint message ids awaiting acknowledgement. The size
/// accounting mirrors the wire encoding so a batch never exceeds one frame.
#[derive(Debug, Clone, Default)]
pub struct Acknowledgement {
    data: HashMap<Endpoint, Vec<u32>>,
    max_size: usize,
    size: usize,
}

impl Acknowledgement {
    pub fn new() -> Acknowledgement {
        Acknowledgement::default()
    }

    pub fn with_max_size(max_size: usize) -> Acknowledgement {
        Acknowledgement {
            data: HashMap::new(),
            max_size,
            size: 0,
        }
    }

    /// Builds an acknowledgement from decoded wire data.
    pub fn from_map(data: HashMap<Endpoint, Vec<u32>>) -> Acknowledgement {
        let size = data
            .values()
            .map(|ids| ACK_ENDPOINT_SIZE + ids.len() * 4)
            .sum();
        Acknowledgement {
            data,
            max_size: 0,
            size,
        }
    }

    /// Registers an id for acknowledgement. Returns false when the batch is
    /// full: either the byte bound would be exceeded or the endpoint already
    /// carries 255 ids (the count is one byte on the wire).
    pub fn push(&mut self, endpoint: Endpoint, id: u32) -> bool {
        let max_size = self.max_size;
        let size = self.size;

        if let Some(ids) = self.data.get_mut(&endpoint) {
            if (max_size > 0 && size + 4 > max_size) || ids.len() + 1 > u8::MAX as usize {
                return false;
            }
            ids.push(id);
            self.size += 4;
            return true;
        }

        if max_size > 0 && size + ACK_ENDPOINT_SIZE + 4 > max_size {
            return false;
        }
        let mut ids = Vec::with_capacity(INITIAL_ACK_IDS);
        ids.push(id);
        self.data.insert(endpoint, ids);
        self.size += ACK_ENDPOINT_SIZE + 4;
        true
    }

    /// The serialized size of the batch in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Total number of acknowledged ids across all endpoints.
    pub fn message_count(&self) -> usize {
        self.data.values().map(Vec::len).sum()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (&Endpoint, &Vec<u32>)> {
        self.data.iter()
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.size = 0;
    }
}

impl PartialEq for Acknowledgement {
    /// Batches compare by their (endpoint, ids) content; the bookkeeping
    /// fields are irrelevant for equality.
    fn eq(&self, other: &Acknowledgement) -> bool {
        self.data == other.data
    }
}
