use crate::error::{Error, Result};
use crate::message::{Endpoint, PacketInfo};

pub const IP_PACKET_MIN_LENGTH: usize = 20;

const FNV_BASIS: u64 = 14695981039346656037;
const FNV_PRIME: u64 = 1099511628211;

const ENDPOINT_TYPE_IPV4: u64 = 1;
const ENDPOINT_TYPE_IPV6: u64 = 2;

/// Which addresses of the inner packet feed the endpoint hash. Hashing the
/// source keeps all flows from one host on one stream; hashing both sides
/// gives per-flow streams.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HashSource {
    Source = 1,
    Destination = 2,
    Full = 3,
}

impl HashSource {
    pub fn from_name(name: &str) -> Option<HashSource> {
        match name {
            "source" => Some(HashSource::Source),
            "destination" => Some(HashSource::Destination),
            "full" => Some(HashSource::Full),
            _ => None,
        }
    }
}

/// Classifies inner IP packets and derives their 64-bit endpoint hash.
pub struct Decoder {
    source: HashSource,
}

impl Decoder {
    pub fn new(source: HashSource) -> Decoder {
        Decoder { source }
    }

    pub fn decode(&self, data: &[u8]) -> Result<PacketInfo> {
        if data.len() < IP_PACKET_MIN_LENGTH {
            return Err(Error::WrongPacketLength);
        }

        match data[0] >> 4 {
            4 => self.decode_ipv4(data),
            6 => self.decode_ipv6(data),
            _ => Err(Error::WrongPacketData),
        }
    }

    fn decode_ipv4(&self, data: &[u8]) -> Result<PacketInfo> {
        let ihl = data[0] & 0x0f;
        if !(5..=15).contains(&ihl) {
            return Err(Error::WrongPacketData);
        }

        let length = u16::from_be_bytes([data[2], data[3]]);
        if u16::from(ihl) * 4 > length {
            return Err(Error::WrongPacketData);
        }

        let endpoint = match self.source {
            HashSource::Source => fast_hash(&[&data[12..16]], ENDPOINT_TYPE_IPV4),
            HashSource::Destination => fast_hash(&[&data[16..20]], ENDPOINT_TYPE_IPV4),
            HashSource::Full => fast_hash(&[&data[12..16], &data[16..20]], ENDPOINT_TYPE_IPV4),
        };

        Ok(PacketInfo {
            endpoint: Endpoint(endpoint),
            protocol: data[9],
        })
    }

    fn decode_ipv6(&self, data: &[u8]) -> Result<PacketInfo> {
        if data.len() < 40 {
            return Err(Error::WrongPacketLength);
        }

        let endpoint = match self.source {
            HashSource::Source => fast_hash(&[&data[8..24]], ENDPOINT_TYPE_IPV6),
            HashSource::Destination => fast_hash(&[&data[24..40]], ENDPOINT_TYPE_IPV6),
            HashSource::Full => fast_hash(&[&data[8..24], &data[24..40]], ENDPOINT_TYPE_IPV6),
        };

        Ok(PacketInfo {
            endpoint: Endpoint(endpoint),
            protocol: data[6],
        })
    }
}

/// FNV-1a over the concatenation of `parts`.
fn fnv_hash(parts: &[&[u8]]) -> u64 {
    let mut h = FNV_BASIS;
    for part in parts {
        for byte in *part {
            h ^= u64::from(*byte);
            h = h.wrapping_mul(FNV_PRIME);
        }
    }
    h
}

/// Endpoint hash: FNV-1a xored with the IP-version discriminator and run
/// through one further prime multiplication. Not stable across releases;
/// must never key persistent storage.
fn fast_hash(parts: &[&[u8]], typ: u64) -> u64 {
    let mut h = fnv_hash(parts);
    h ^= typ;
    h.wrapping_mul(FNV_PRIME)
}
