use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};
use hashbrown::HashMap;
use rand::Rng;

use loam::logging::{self, Logger};

use crate::compress::Compressor;
use crate::error::{Error, Result};
use crate::message::{
    Acknowledgement, AuthRequest, AuthResponse, Compression, Endpoint, Handshake, Message,
    MessageType, Payload, ACK_ENDPOINT_SIZE, HEADER_SIZE,
};

const FLAG_ERROR: u8 = 1 << 0;
const FLAG_REQUEST: u8 = 1 << 1;
const FLAG_ACK: u8 = 1 << 2;
const FLAG_LZ4: u8 = 1 << 3;
const FLAG_LZO: u8 = 1 << 4;
const FLAG_ZSTD: u8 = 1 << 5;

const POS_TYPE: usize = 0;
const POS_FLAGS: usize = 1;
const POS_ID: usize = 2;
const POS_SESSION_ID: usize = 6;
const POS_LENGTH: usize = 10;

const ERROR_SIZE: usize = 1;
const AUTH_REQUEST_FIELDS: usize = 5;
const AUTH_RESPONSE_FIELDS: usize = 2;
const HANDSHAKE_FIELDS: usize = 1;
const AUTH_RESPONSE_MIN_SIZE: usize = 14;

/// Length of the ciphertext for a given plaintext length. Supplied by the
/// configured encryptor so the codec can account for frame sizes without
/// owning key material.
pub type GetLengthFn = Box<dyn Fn(usize) -> usize + Send + Sync>;

pub struct CodecConfig {
    /// Inner packet cap; also the upper bound for obfuscation padding.
    pub mtu: usize,
    /// Pad authentication/handshake payloads with random bytes so their
    /// encrypted lengths are indistinguishable from data frames.
    pub obfuscate: bool,
}

/// Marshals and parses the fixed 12-byte header and the per-type payload
/// encodings. All multi-byte integers are big-endian.
pub struct Codec {
    log: Logger,
    cfg: CodecConfig,
    cmp: Compressor,
    get_length: GetLengthFn,
    max_encrypted_payload: u16,
}

impl Codec {
    pub fn new(log: &Logger, cfg: CodecConfig, get_length: GetLengthFn) -> Codec {
        let max_encrypted_payload = get_length(cfg.mtu) as u16;
        Codec {
            log: log.new(logging::o!("layer" => "codec")),
            cmp: Compressor::new(cfg.mtu),
            cfg,
            get_length,
            max_encrypted_payload,
        }
    }

    /// Serializes a message into its plaintext header and plaintext payload.
    /// The header's length field already accounts for payload encryption.
    /// Compression mutates `m` so the sender knows which flag went out.
    pub fn marshal(&self, m: &mut Message) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut header = vec![0u8; HEADER_SIZE];
        let mut payload: Vec<u8> = Vec::new();
        let mut flags: u8 = 0;
        let mut compression_skipped = false;

        header[POS_TYPE] = m.kind as u8;
        BigEndian::write_u32(&mut header[POS_ID..POS_ID + 4], m.id);
        BigEndian::write_u32(&mut header[POS_SESSION_ID..POS_SESSION_ID + 4], m.session_id);

        if m.error > 0 {
            flags |= FLAG_ERROR;
            payload = vec![m.error];
            self.write_length(&mut header, ERROR_SIZE);
        }
        if m.is_ack {
            flags |= FLAG_ACK;
        }

        if m.error == 0 {
            match (m.kind, &m.payload) {
                (MessageType::Authentication, Payload::Auth(req)) => {
                    payload = marshal_fields(&[
                        req.client_id.as_bytes(),
                        req.name.as_bytes(),
                        req.password.as_bytes(),
                        &[req.compression as u8],
                        &[req.compression_level],
                    ])?;
                    flags |= FLAG_REQUEST;
                    payload = self.obfuscate(payload);
                    self.write_length(&mut header, payload.len());
                }
                (MessageType::Authentication, Payload::AuthReply(resp)) => {
                    payload = Vec::with_capacity(32);
                    let mut session_id = [0u8; 4];
                    BigEndian::write_u32(&mut session_id, resp.session_id);
                    payload.extend_from_slice(&session_id);
                    let ips = marshal_fields(&[
                        &resp.local_ip.octets(),
                        &resp.remote_ip.octets(),
                    ])?;
                    payload.extend_from_slice(&ips);
                    payload = self.obfuscate(payload);
                    self.write_length(&mut header, payload.len());
                }
                (MessageType::Handshake, Payload::Handshake(req)) => {
                    payload = marshal_fields(&[&req.key])?;
                    payload = self.obfuscate(payload);
                    self.write_length(&mut header, payload.len());
                }
                (MessageType::Data, Payload::Raw(data)) if !m.is_ack => {
                    match self.cmp.compress(m.compression, m.compression_level, data) {
                        Some(packed) => {
                            flags |= match m.compression {
                                Compression::Lz4 => FLAG_LZ4,
                                Compression::Lzo => FLAG_LZO,
                                Compression::Zstd => FLAG_ZSTD,
                                Compression::None => 0,
                            };
                            payload = packed;
                        }
                        None => {
                            compression_skipped = true;
                            payload = data.clone();
                        }
                    }
                    self.write_length(&mut header, payload.len());
                }
                (MessageType::Data, Payload::Ack(ack)) if m.is_ack => {
                    payload = marshal_ack(ack);
                    self.write_length(&mut header, payload.len());
                }
                (MessageType::Keepalive, _) | (MessageType::Reset, _) => {}
                _ => return Err(Error::WrongPayload),
            }
        }

        if compression_skipped {
            m.compression = Compression::None;
        }
        header[POS_FLAGS] = flags;

        Ok((header, payload))
    }

    /// Parses a decrypted 12-byte header. The payload length is validated
    /// against the encrypted capacity of one MTU-sized frame.
    pub fn unmarshal_header(&self, data: &[u8]) -> Result<Message> {
        if data.len() != HEADER_SIZE {
            return Err(Error::WrongHeaderSize);
        }

        let kind = MessageType::from_u8(data[POS_TYPE]).ok_or(Error::UnknownCommand)?;
        let mut m = Message::new(kind);

        let flags = data[POS_FLAGS];
        if flags != 0 {
            m.is_error = flags & FLAG_ERROR != 0;
            m.is_request = flags & FLAG_REQUEST != 0;
            m.is_ack = flags & FLAG_ACK != 0;
            if flags & FLAG_LZ4 != 0 {
                m.compression = Compression::Lz4;
            } else if flags & FLAG_LZO != 0 {
                m.compression = Compression::Lzo;
            } else if flags & FLAG_ZSTD != 0 {
                m.compression = Compression::Zstd;
            }
        }

        m.id = BigEndian::read_u32(&data[POS_ID..POS_ID + 4]);
        m.session_id = BigEndian::read_u32(&data[POS_SESSION_ID..POS_SESSION_ID + 4]);
        m.payload_length = BigEndian::read_u16(&data[POS_LENGTH..POS_LENGTH + 2]);

        if m.payload_length > self.max_encrypted_payload {
            logging::error!(self.log, "wrong message payload size";
                            "size" => m.payload_length,
                            "max_size" => self.max_encrypted_payload);
            return Err(Error::WrongPayloadSize);
        }

        Ok(m)
    }

    /// Parses the decrypted payload bytes in `m.payload` into the typed
    /// representation for the message's kind.
    pub fn unmarshal_payload(&self, m: &mut Message) -> Result<()> {
        if m.payload_length == 0 {
            return Ok(());
        }

        let data = m.payload.take_raw().ok_or(Error::WrongPayload)?;

        if m.is_error {
            if data.len() < ERROR_SIZE {
                return Err(Error::WrongPayload);
            }
            m.error = data[0];
            return Ok(());
        }

        match m.kind {
            MessageType::Authentication => {
                if m.is_request {
                    let fields = unmarshal_fields(&data, AUTH_REQUEST_FIELDS)?;
                    if fields.len() != AUTH_REQUEST_FIELDS {
                        return Err(Error::WrongPayload);
                    }
                    m.payload = Payload::Auth(AuthRequest {
                        client_id: field_string(fields[0])?,
                        name: field_string(fields[1])?,
                        password: field_string(fields[2])?,
                        compression: Compression::from_u8(field_byte(fields[3])?),
                        compression_level: field_byte(fields[4])?,
                    });
                } else {
                    if data.len() < AUTH_RESPONSE_MIN_SIZE {
                        return Err(Error::WrongPayload);
                    }
                    let fields = unmarshal_fields(&data[4..], AUTH_RESPONSE_FIELDS)?;
                    if fields.len() != AUTH_RESPONSE_FIELDS {
                        return Err(Error::WrongPayload);
                    }
                    m.payload = Payload::AuthReply(AuthResponse {
                        session_id: BigEndian::read_u32(&data[..4]),
                        local_ip: field_ipv4(fields[0])?,
                        remote_ip: field_ipv4(fields[1])?,
                    });
                }
            }
            MessageType::Handshake => {
                let fields = unmarshal_fields(&data, HANDSHAKE_FIELDS)?;
                if fields.len() != HANDSHAKE_FIELDS {
                    return Err(Error::WrongPayload);
                }
                m.payload = Payload::Handshake(Handshake {
                    key: fields[0].to_vec(),
                });
            }
            MessageType::Data => {
                if m.is_ack {
                    m.payload = Payload::Ack(unmarshal_ack(&data)?);
                } else {
                    let out = self.cmp.decompress(m.compression, &data)?;
                    m.payload = Payload::Raw(out);
                }
            }
            MessageType::Keepalive | MessageType::Reset => {
                m.payload = Payload::Raw(data);
            }
        }

        Ok(())
    }

    #[inline]
    fn write_length(&self, header: &mut [u8], plain_len: usize) {
        let encrypted = (self.get_length)(plain_len) as u16;
        BigEndian::write_u16(&mut header[POS_LENGTH..POS_LENGTH + 2], encrypted);
    }

    /// Extends auth/handshake payloads with random trailing bytes so their
    /// encrypted lengths cannot be told apart from data frames.
    fn obfuscate(&self, mut data: Vec<u8>) -> Vec<u8> {
        if !self.cfg.obfuscate || data.len() >= self.cfg.mtu {
            return data;
        }

        let count = rand::thread_rng().gen_range(0..self.cfg.mtu - data.len());
        let start = data.len();
        data.resize(start + count, 0);
        loam::crypto::random_bytes(&mut data[start..]);
        data
    }
}

/// Encodes a sequence of u8-length-prefixed byte fields.
fn marshal_fields(fields: &[&[u8]]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(u8::MAX as usize);
    for field in fields {
        if field.len() + 1 > u8::MAX as usize {
            return Err(Error::MaxFieldLen);
        }
        out.push(field.len() as u8);
        out.extend_from_slice(field);
    }
    Ok(out)
}

/// Decodes up to `n` u8-length-prefixed fields, ignoring any trailing
/// obfuscation padding once `n` fields were read.
fn unmarshal_fields(data: &[u8], n: usize) -> Result<Vec<&[u8]>> {
    let mut out = Vec::with_capacity(8);
    let mut rest = data;
    while !rest.is_empty() {
        let len = rest[0] as usize;
        if len > rest.len() - 1 {
            return Err(Error::WrongFieldLen);
        }
        out.push(&rest[1..=len]);
        if out.len() == n {
            return Ok(out);
        }
        rest = &rest[len + 1..];
    }
    Ok(out)
}

fn field_string(field: &[u8]) -> Result<String> {
    String::from_utf8(field.to_vec()).map_err(|_| Error::WrongPayload)
}

fn field_byte(field: &[u8]) -> Result<u8> {
    if field.len() != 1 {
        return Err(Error::WrongPayload);
    }
    Ok(field[0])
}

fn field_ipv4(field: &[u8]) -> Result<Ipv4Addr> {
    if field.len() != 4 {
        return Err(Error::WrongPayload);
    }
    Ok(Ipv4Addr::new(field[0], field[1], field[2], field[3]))
}

/// Assembles one wire frame: the header encrypted with the primary key,
/// followed by the payload encrypted with the session key for established
/// user data, or the primary key otherwise.
pub fn encode_frame(
    codec: &Codec,
    primary: &std::sync::Arc<dyn loam::crypto::Encryptor>,
    user: Option<&std::sync::Arc<dyn loam::crypto::Encryptor>>,
    msg: &mut Message,
) -> crate::error::Result<Vec<u8>> {
    let (header, payload) = codec.marshal(msg)?;

    let mut frame = primary.encrypt(&header)?;
    if !payload.is_empty() {
        let enc = user.unwrap_or(primary);
        frame.extend_from_slice(&enc.encrypt(&payload)?);
    }

    Ok(frame)
}

/// Serializes an acknowledgement batch: repeated
/// `{endpoint:u64, count:u8, count x id:u32}`.
pub fn marshal_ack(ack: &Acknowledgement) -> Vec<u8> {
    let mut out = vec![0u8; ack.size()];
    let mut i = 0;
    for (endpoint, ids) in ack.iter() {
        BigEndian::write_u64(&mut out[i..i + 8], endpoint.0);
        out[i + 8] = ids.len() as u8;
        i += ACK_ENDPOINT_SIZE;
        for id in ids {
            BigEndian::write_u32(&mut out[i..i + 4], *id);
            i += 4;
        }
    }
    out
}

pub fn unmarshal_ack(data: &[u8]) -> Result<Acknowledgement> {
    let total = data.len();
    if total < ACK_ENDPOINT_SIZE + 4 {
        return Err(Error::WrongAcknowledgement);
    }

    let mut out: HashMap<Endpoint, Vec<u32>> = HashMap::new();
    let mut i = 0;
    while i < total {
        if i + ACK_ENDPOINT_SIZE >= total {
            return Err(Error::WrongAcknowledgement);
        }
        let endpoint = Endpoint(BigEndian::read_u64(&data[i..i + 8]));
        let count = data[i + 8] as usize;
        i += ACK_ENDPOINT_SIZE;

        let end = i + count * 4;
        if end > total {
            return Err(Error::WrongAcknowledgement);
        }

        let mut ids = Vec::with_capacity(count);
        while i < end {
            ids.push(BigEndian::read_u32(&data[i..i + 4]));
            i += 4;
        }
        out.insert(endpoint, ids);
    }

    Ok(Acknowledgement::from_map(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use loam::crypto::{self, Method};
    use loam::logging;
    use std::sync::Arc;

    const MTU: usize = 1400;

    fn codec_with(method: Method, obfuscate: bool) -> (Codec, Arc<dyn crypto::Encryptor>) {
        let key = crypto::generate_key();
        let enc = crypto::create(method, &key[..method.key_size()]).unwrap();
        let len_enc = enc.clone();
        let codec = Codec::new(
            &logging::null(),
            CodecConfig { mtu: MTU, obfuscate },
            Box::new(move |n| len_enc.cipher_len(n)),
        );
        (codec, enc)
    }

    fn codec() -> Codec {
        codec_with(Method::None, false).0
    }

    #[test]
    fn test_header_roundtrip() {
        let c = codec();

        let mut m = Message::new(MessageType::Data);
        m.id = 0xdeadbeef;
        m.session_id = 77;
        m.payload = Payload::Raw(vec![1, 2, 3, 4, 5]);

        let (header, payload) = c.marshal(&mut m).unwrap();
        assert_eq!(header.len(), HEADER_SIZE);

        let out = c.unmarshal_header(&header).unwrap();
        assert_eq!(out.kind, MessageType::Data);
        assert_eq!(out.id, 0xdeadbeef);
        assert_eq!(out.session_id, 77);
        assert_eq!(out.payload_length as usize, payload.len());
        assert!(!out.is_ack);
        assert!(!out.is_error);
    }

    #[test]
    fn test_header_flags_roundtrip() {
        let c = codec();

        let mut m = Message::new(MessageType::Data);
        m.is_ack = true;
        m.session_id = 3;
        let mut ack = Acknowledgement::new();
        ack.push(Endpoint(5), 10);
        m.payload = Payload::Ack(ack);

        let (header, _) = c.marshal(&mut m).unwrap();
        let out = c.unmarshal_header(&header).unwrap();
        assert!(out.is_ack);
    }

    #[test]
    fn test_header_rejects_unknown_type() {
        let c = codec();
        let mut header = vec![0u8; HEADER_SIZE];
        header[0] = 0x66;
        assert_eq!(c.unmarshal_header(&header).unwrap_err(), Error::UnknownCommand);
    }

    #[test]
    fn test_header_rejects_wrong_size() {
        let c = codec();
        assert_eq!(
            c.unmarshal_header(&[0u8; HEADER_SIZE - 1]).unwrap_err(),
            Error::WrongHeaderSize
        );
    }

    #[test]
    fn test_header_rejects_oversized_payload() {
        let c = codec();
        let mut header = vec![0u8; HEADER_SIZE];
        header[0] = MessageType::Data as u8;
        BigEndian::write_u16(&mut header[POS_LENGTH..], (MTU + 1) as u16);
        assert_eq!(c.unmarshal_header(&header).unwrap_err(), Error::WrongPayloadSize);
    }

    #[test]
    fn test_auth_request_roundtrip() {
        let c = codec();

        let mut m = Message::new(MessageType::Authentication);
        m.payload = Payload::Auth(AuthRequest {
            client_id: "client-1234".into(),
            name: "alice".into(),
            password: "hunter2".into(),
            compression: Compression::Lz4,
            compression_level: 3,
        });

        let (header, payload) = c.marshal(&mut m).unwrap();
        let mut out = c.unmarshal_header(&header).unwrap();
        assert!(out.is_request);
        out.payload = Payload::Raw(payload);
        c.unmarshal_payload(&mut out).unwrap();

        match out.payload {
            Payload::Auth(req) => {
                assert_eq!(req.client_id, "client-1234");
                assert_eq!(req.name, "alice");
                assert_eq!(req.password, "hunter2");
                assert_eq!(req.compression, Compression::Lz4);
                assert_eq!(req.compression_level, 3);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_auth_request_rejects_long_field() {
        let c = codec();

        let mut m = Message::new(MessageType::Authentication);
        m.payload = Payload::Auth(AuthRequest {
            client_id: "x".repeat(256),
            name: "alice".into(),
            password: "pw".into(),
            compression: Compression::None,
            compression_level: 0,
        });

        assert_eq!(c.marshal(&mut m).unwrap_err(), Error::MaxFieldLen);
    }

    #[test]
    fn test_auth_response_roundtrip() {
        let c = codec();

        let mut m = Message::new(MessageType::Authentication);
        m.session_id = 42;
        m.payload = Payload::AuthReply(AuthResponse {
            session_id: 42,
            local_ip: Ipv4Addr::new(192, 168, 30, 2),
            remote_ip: Ipv4Addr::new(192, 168, 30, 3),
        });

        let (header, payload) = c.marshal(&mut m).unwrap();
        let mut out = c.unmarshal_header(&header).unwrap();
        out.payload = Payload::Raw(payload);
        c.unmarshal_payload(&mut out).unwrap();

        match out.payload {
            Payload::AuthReply(resp) => {
                assert_eq!(resp.session_id, 42);
                assert_eq!(resp.local_ip, Ipv4Addr::new(192, 168, 30, 2));
                assert_eq!(resp.remote_ip, Ipv4Addr::new(192, 168, 30, 3));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_handshake_roundtrip() {
        let c = codec();

        let key = vec![9u8; 32];
        let mut m = Message::new(MessageType::Handshake);
        m.payload = Payload::Handshake(Handshake { key: key.clone() });

        let (header, payload) = c.marshal(&mut m).unwrap();
        let mut out = c.unmarshal_header(&header).unwrap();
        out.payload = Payload::Raw(payload);
        c.unmarshal_payload(&mut out).unwrap();

        match out.payload {
            Payload::Handshake(h) => assert_eq!(h.key, key),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_obfuscated_handshake_still_parses() {
        let (c, _) = codec_with(Method::None, true);

        for _ in 0..16 {
            let key = vec![7u8; 32];
            let mut m = Message::new(MessageType::Handshake);
            m.payload = Payload::Handshake(Handshake { key: key.clone() });

            let (header, payload) = c.marshal(&mut m).unwrap();
            let mut out = c.unmarshal_header(&header).unwrap();
            assert!(out.payload_length as usize <= MTU);
            out.payload = Payload::Raw(payload);
            c.unmarshal_payload(&mut out).unwrap();

            match out.payload {
                Payload::Handshake(h) => assert_eq!(h.key, key),
                other => panic!("unexpected payload {:?}", other),
            }
        }
    }

    #[test]
    fn test_data_compression_roundtrip() {
        let c = codec();

        let data = b"yada yada yada yada yada yada yada yada yada yada".to_vec();
        let mut m = Message::new(MessageType::Data);
        m.compression = Compression::Lz4;
        m.payload = Payload::Raw(data.clone());

        let (header, payload) = c.marshal(&mut m).unwrap();
        assert!(payload.len() < data.len());

        let mut out = c.unmarshal_header(&header).unwrap();
        assert_eq!(out.compression, Compression::Lz4);
        out.payload = Payload::Raw(payload);
        c.unmarshal_payload(&mut out).unwrap();
        assert_eq!(out.payload.raw().unwrap(), &data[..]);
    }

    #[test]
    fn test_data_incompressible_clears_flag() {
        let c = codec();

        let mut data = vec![0u8; 64];
        crypto::random_bytes(&mut data);
        let mut m = Message::new(MessageType::Data);
        m.compression = Compression::Zstd;
        m.compression_level = 3;
        m.payload = Payload::Raw(data.clone());

        let (header, payload) = c.marshal(&mut m).unwrap();
        assert_eq!(payload, data);
        assert_eq!(m.compression, Compression::None);

        let out = c.unmarshal_header(&header).unwrap();
        assert_eq!(out.compression, Compression::None);
    }

    #[test]
    fn test_error_frame_roundtrip() {
        let c = codec();

        let mut m = Message::new(MessageType::Authentication);
        m.error = Error::Unauthorized.wire_code();

        let (header, payload) = c.marshal(&mut m).unwrap();
        let mut out = c.unmarshal_header(&header).unwrap();
        assert!(out.is_error);
        out.payload = Payload::Raw(payload);
        c.unmarshal_payload(&mut out).unwrap();
        assert_eq!(Error::from_wire_code(out.error), Error::Unauthorized);
    }

    #[test]
    fn test_keepalive_has_no_payload() {
        let c = codec();
        let mut m = Message::new(MessageType::Keepalive);
        let (header, payload) = c.marshal(&mut m).unwrap();
        assert!(payload.is_empty());
        let out = c.unmarshal_header(&header).unwrap();
        assert_eq!(out.payload_length, 0);
    }

    #[test]
    fn test_payload_length_accounts_for_encryption() {
        let (c, enc) = codec_with(Method::Aes256Ecb, false);

        let mut m = Message::new(MessageType::Data);
        m.payload = Payload::Raw(vec![1, 2, 3]);

        let (header, payload) = c.marshal(&mut m).unwrap();
        let out = c.unmarshal_header(&header).unwrap();
        assert_eq!(out.payload_length as usize, enc.cipher_len(payload.len()));
    }

    #[test]
    fn test_ack_roundtrip_multiset() {
        let mut ack = Acknowledgement::new();
        for id in &[100u32, 200, 300] {
            ack.push(Endpoint(1), *id);
        }
        for id in &[123u32, 678, 2342, 905] {
            ack.push(Endpoint(u64::MAX), *id);
        }
        for id in &[1u32, 2, 3, 4, 5] {
            ack.push(Endpoint(0), *id);
        }

        let data = marshal_ack(&ack);
        assert_eq!(data.len(), ack.size());

        let out = unmarshal_ack(&data).unwrap();
        assert_eq!(out, ack);
        assert_eq!(out.message_count(), 12);
    }

    #[test]
    fn test_ack_rejects_truncated_input() {
        let mut ack = Acknowledgement::new();
        ack.push(Endpoint(1), 1);
        ack.push(Endpoint(1), 2);

        let data = marshal_ack(&ack);
        assert!(unmarshal_ack(&data[..data.len() - 1]).is_err());
        assert!(unmarshal_ack(&data[..5]).is_err());
    }

    #[test]
    fn test_fields_roundtrip() {
        let fields = marshal_fields(&[b"one", b"", b"three"]).unwrap();
        let out = unmarshal_fields(&fields, 3).unwrap();
        assert_eq!(out, vec![&b"one"[..], &b""[..], &b"three"[..]]);
    }

    #[test]
    fn test_fields_reject_bad_length() {
        assert_eq!(
            unmarshal_fields(&[5, 1, 2], 1).unwrap_err(),
            Error::WrongFieldLen
        );
    }
}
