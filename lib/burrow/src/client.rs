use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;

use loam::crypto::Encryptor;
use loam::logging::{self, Logger};

use crate::ack::{AckAccumulator, AckConfig, AckSink};
use crate::cancel::CancelToken;
use crate::codec::{encode_frame, Codec};
use crate::conn::{ConnControl, Connection, Protocol, TransportHooks};
use crate::error::{is_interrupting_io, Error, Result};
use crate::message::{Message, MessageType, Payload, HEADER_SIZE};
use crate::packet::Decoder;
use crate::retry::{Retry, RetryConfig, RetrySink};
use crate::stat::StatDelta;

const RECV_POLL: Duration = Duration::from_millis(500);

pub struct ClientNetConfig {
    pub codec: Arc<Codec>,
    pub primary: Arc<dyn Encryptor>,
    pub mtu: usize,
    pub retry: RetryConfig,
    pub ack: AckConfig,
    pub tracing: bool,
}

struct ClientInner {
    log: Logger,
    cfg: ClientNetConfig,
    decoder: Arc<Decoder>,
    hooks: RwLock<Option<Arc<dyn TransportHooks>>>,
    cancel: CancelToken,
}

impl ClientInner {
    fn hooks(&self) -> Result<Arc<dyn TransportHooks>> {
        self.hooks.read().clone().ok_or(Error::HandlerNotSet)
    }
}

/// The transport client: dials one connection per (port, protocol), runs
/// the synchronous authentication/handshake exchanges and then the
/// receiver loop with retry/ack attached.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(
        log: &Logger,
        cfg: ClientNetConfig,
        decoder: Arc<Decoder>,
        cancel: CancelToken,
    ) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                log: log.new(logging::o!("layer" => "cli")),
                cfg,
                decoder,
                hooks: RwLock::new(None),
                cancel,
            }),
        }
    }

    pub fn set_hooks(&self, hooks: Arc<dyn TransportHooks>) {
        *self.inner.hooks.write() = Some(hooks);
    }

    /// The transport's codec, shared with the session layer for decoding
    /// synchronous replies.
    pub fn codec(&self) -> Arc<Codec> {
        self.inner.cfg.codec.clone()
    }

    /// Dials one transport flow to the server.
    pub fn connect(&self, host: &str, port: u16, proto: Protocol) -> Result<Arc<Connection>> {
        match proto {
            Protocol::Tcp => {
                let addr = resolve(host, port)?;
                let stream = TcpStream::connect(addr)?;
                let peer = stream.peer_addr()?;

                logging::info!(self.inner.log, "connection established";
                               "addr" => %peer, "protocol" => proto.as_str());

                Ok(Arc::new(Connection::tcp(stream, peer, port)))
            }
            Protocol::Udp => {
                let addr = resolve(host, port)?;
                let socket = UdpSocket::bind("0.0.0.0:0")?;
                socket.connect(addr)?;

                Ok(Arc::new(Connection::udp_client(socket, addr, port)))
            }
        }
    }

    /// Asynchronous send through the normal path; `Data` frames that expect
    /// acknowledgement are registered with the connection's retry engine.
    pub fn send(&self, msg: &mut Message, conn: &Arc<Connection>) -> Result<()> {
        send_message(&self.inner, msg, conn)
    }

    /// One synchronous request/response exchange with a deadline, used by
    /// authentication and handshake. The reply payload is returned still
    /// encrypted; the caller owns the decryption keys.
    pub fn send_sync(
        &self,
        msg: &mut Message,
        conn: &Arc<Connection>,
        timeout: Duration,
    ) -> Result<Message> {
        let inner = &self.inner;
        let frame = encode_frame(&inner.cfg.codec, &inner.cfg.primary, None, msg)?;
        let header_len = inner.cfg.primary.cipher_len(HEADER_SIZE);

        match conn.proto {
            Protocol::Udp => {
                let socket = conn.udp_socket().ok_or(Error::ConnectionNotExists)?;
                socket.set_write_timeout(Some(timeout))?;
                conn.send(&frame)?;
                socket.set_write_timeout(None)?;

                socket.set_read_timeout(Some(timeout))?;
                let mut buf = vec![0u8; inner.cfg.primary.cipher_len(inner.cfg.mtu) + header_len];
                let n = socket.recv(&mut buf)?;
                socket.set_read_timeout(None)?;

                parse_reply(inner, &buf[..n], header_len)
            }
            Protocol::Tcp => {
                let stream = conn.tcp_stream().ok_or(Error::ConnectionNotExists)?;
                stream.set_write_timeout(Some(timeout))?;
                conn.send(&frame)?;
                stream.set_write_timeout(None)?;

                stream.set_read_timeout(Some(timeout))?;
                let mut reader = stream;
                let mut header = vec![0u8; header_len];
                reader.read_exact(&mut header)?;

                let mut reply = inner
                    .cfg
                    .codec
                    .unmarshal_header(&inner.cfg.primary.decrypt(&header)?)?;
                if reply.payload_length > 0 {
                    let mut payload = vec![0u8; reply.payload_length as usize];
                    reader.read_exact(&mut payload)?;
                    reply.payload = Payload::Raw(payload);
                }
                stream.set_read_timeout(None)?;

                Ok(reply)
            }
        }
    }

    /// Attaches retry/ack to the connection and spawns its receiver loop.
    pub fn start_receiver(&self, conn: Arc<Connection>, session_id: u32) {
        conn.set_session_id(session_id);

        let control = new_control(&self.inner, &conn, session_id);
        conn.set_control(control.clone());

        logging::info!(self.inner.log, "connection started";
                       "session_id" => session_id,
                       "port" => conn.port,
                       "protocol" => conn.proto.as_str());

        let inner = self.inner.clone();
        match conn.proto {
            Protocol::Udp => {
                thread::spawn(move || udp_receiver(inner, conn, control));
            }
            Protocol::Tcp => {
                thread::spawn(move || tcp_receiver(inner, conn, control));
            }
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<std::net::SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::Validation(format!("failed to resolve {}", host)))
}

fn send_message(inner: &Arc<ClientInner>, msg: &mut Message, conn: &Arc<Connection>) -> Result<()> {
    let user = if msg.is_user_data() {
        inner.hooks()?.user_encryptor(conn)?
    } else {
        None
    };

    let frame = encode_frame(&inner.cfg.codec, &inner.cfg.primary, user.as_ref(), msg)?;
    conn.send(&frame)?;

    if inner.cfg.tracing {
        logging::debug!(inner.log, "sent to socket";
                        "type" => msg.kind.as_str(),
                        "id" => msg.id,
                        "session_id" => msg.session_id,
                        "size" => frame.len());
    }

    if msg.wants_ack() && conn.proto == Protocol::Udp {
        if let Some(control) = conn.control() {
            control.retry.push(msg, frame);
        }
    }

    Ok(())
}

fn send_keepalive(inner: &Arc<ClientInner>, conn: &Arc<Connection>, ack: bool) {
    let mut msg = Message::new(MessageType::Keepalive);
    msg.session_id = conn.session_id();
    msg.is_ack = ack;

    if let Err(err) = send_message(inner, &mut msg, conn) {
        logging::error!(inner.log, "failed to send keepalive"; "error" => %err);
    }
}

struct ClientSink {
    inner: Arc<ClientInner>,
}

impl RetrySink for ClientSink {
    fn retransmit(&self, frame: &[u8], conn: &Arc<Connection>) -> Result<()> {
        conn.send(frame)?;
        Ok(())
    }

    fn keepalive(&self, conn: &Arc<Connection>, ack: bool) {
        send_keepalive(&self.inner, conn, ack);
    }

    fn disconnect(&self, conn: &Arc<Connection>, err: Error) {
        if let Ok(hooks) = self.inner.hooks() {
            hooks.disconnect(conn, Some(err));
        }
    }
}

impl AckSink for ClientSink {
    fn send_ack(&self, mut msg: Message, conn: &Arc<Connection>) -> Result<()> {
        send_message(&self.inner, &mut msg, conn)
    }
}

fn new_control(inner: &Arc<ClientInner>, conn: &Arc<Connection>, session_id: u32) -> ConnControl {
    let sink = Arc::new(ClientSink {
        inner: inner.clone(),
    });

    let retry = Retry::new(
        &inner.log,
        inner.cfg.retry.clone(),
        sink.clone(),
        conn.clone(),
        inner.cancel.clone(),
    );
    let ack = AckAccumulator::new(
        &inner.log,
        inner.cfg.ack.clone(),
        sink,
        conn.clone(),
        session_id,
        retry.rto_handle(),
        inner.cancel.clone(),
    );

    ConnControl { retry, ack }
}

fn parse_reply(inner: &Arc<ClientInner>, datagram: &[u8], header_len: usize) -> Result<Message> {
    if datagram.len() < header_len {
        return Err(Error::WrongHeaderSize);
    }

    let header = inner.cfg.primary.decrypt(&datagram[..header_len])?;
    let mut msg = inner.cfg.codec.unmarshal_header(&header)?;

    if header_len + msg.payload_length as usize != datagram.len() {
        return Err(Error::WrongPayloadSize);
    }
    if msg.payload_length > 0 {
        msg.payload = Payload::Raw(datagram[header_len..].to_vec());
    }

    Ok(msg)
}

/// Decrypts and decodes the payload of a received frame. False means the
/// frame is skipped; one bad frame never ends the loop.
fn process_payload(
    inner: &Arc<ClientInner>,
    hooks: &Arc<dyn TransportHooks>,
    msg: &mut Message,
    conn: &Arc<Connection>,
) -> bool {
    let enc = if msg.is_user_data() {
        match hooks.user_encryptor(conn) {
            Ok(Some(enc)) => enc,
            Ok(None) => return false,
            Err(err) => {
                logging::error!(inner.log, "failed to get connection encryptor";
                                "error" => %err, "session_id" => msg.session_id);
                return false;
            }
        }
    } else {
        inner.cfg.primary.clone()
    };

    if msg.has_payload() && msg.payload_length > 0 {
        let raw = match msg.payload.take_raw() {
            Some(raw) => raw,
            None => return false,
        };

        let plain = match enc.decrypt(&raw) {
            Ok(plain) => plain,
            Err(err) => {
                logging::error!(inner.log, "failed to decrypt payload"; "error" => %err);
                return false;
            }
        };
        msg.payload = Payload::Raw(plain);

        if let Err(err) = inner.cfg.codec.unmarshal_payload(msg) {
            logging::error!(inner.log, "failed to unmarshal payload"; "error" => %err);
            return false;
        }

        if msg.is_user_data() {
            let packet = match msg.payload.raw() {
                Some(data) => inner.decoder.decode(data),
                None => return false,
            };
            match packet {
                Ok(info) => msg.packet = Some(info),
                Err(_) => return false,
            }
        }
    }

    true
}

fn udp_receiver(inner: Arc<ClientInner>, conn: Arc<Connection>, control: ConnControl) {
    let header_len = inner.cfg.primary.cipher_len(HEADER_SIZE);
    let mut buf = vec![0u8; inner.cfg.primary.cipher_len(inner.cfg.mtu) + header_len];

    let socket = match conn.udp_socket() {
        Some(socket) => socket,
        None => return,
    };
    if socket.set_read_timeout(Some(RECV_POLL)).is_err() {
        return;
    }

    loop {
        if inner.cancel.is_cancelled() || conn.is_closed() {
            break;
        }

        let n = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(err) => {
                if is_interrupting_io(&err) {
                    break;
                }
                continue;
            }
        };

        if n < header_len {
            continue;
        }

        let hooks = match inner.hooks() {
            Ok(hooks) => hooks,
            Err(_) => break,
        };

        let mut msg = match parse_reply(&inner, &buf[..n], header_len) {
            Ok(msg) => msg,
            Err(err) => {
                logging::error!(inner.log, "failed to read frame"; "error" => %err);
                continue;
            }
        };

        hooks.add_stat(
            msg.session_id,
            StatDelta {
                incoming_bytes: n as u64,
                incoming_frames: 1,
                ..Default::default()
            },
        );

        if msg.kind == MessageType::Keepalive {
            if msg.is_ack {
                control.retry.ack(None);
            } else {
                control.retry.keepalive();
            }
            continue;
        }

        if !process_payload(&inner, &hooks, &mut msg, &conn) {
            continue;
        }

        if msg.is_ack {
            if let Payload::Ack(ack) = &msg.payload {
                control.retry.ack(Some(ack));
            }
            continue;
        }
        if msg.wants_ack() {
            control.ack.push(msg.endpoint(), msg.id);
        }

        let kind = msg.kind;
        if let Err(err) = hooks.receive(msg, conn.clone()) {
            if kind != MessageType::Data {
                logging::error!(inner.log, "incoming message error";
                                "error" => %err, "type" => kind.as_str());
                break;
            }
        }
    }

    control.retry.stop();
    control.ack.stop();
    logging::info!(inner.log, "connection finished";
                   "session_id" => conn.session_id(), "port" => conn.port);
}

fn tcp_receiver(inner: Arc<ClientInner>, conn: Arc<Connection>, control: ConnControl) {
    let header_len = inner.cfg.primary.cipher_len(HEADER_SIZE);
    let mut disconnect_err: Option<Error> = None;

    loop {
        if inner.cancel.is_cancelled() || conn.is_closed() {
            break;
        }

        let mut reader = match conn.tcp_stream() {
            Some(stream) => stream,
            None => break,
        };

        let mut header = vec![0u8; header_len];
        if let Err(err) = reader.read_exact(&mut header) {
            disconnect_err = Some(err.into());
            break;
        }

        let hooks = match inner.hooks() {
            Ok(hooks) => hooks,
            Err(_) => break,
        };

        let mut msg = match inner.cfg.primary.decrypt(&header) {
            Ok(plain) => match inner.cfg.codec.unmarshal_header(&plain) {
                Ok(msg) => msg,
                Err(err) => {
                    disconnect_err = Some(err);
                    break;
                }
            },
            Err(err) => {
                disconnect_err = Some(err.into());
                break;
            }
        };

        if msg.payload_length > 0 {
            let mut payload = vec![0u8; msg.payload_length as usize];
            if let Err(err) = reader.read_exact(&mut payload) {
                disconnect_err = Some(err.into());
                break;
            }
            msg.payload = Payload::Raw(payload);
        }

        hooks.add_stat(
            msg.session_id,
            StatDelta {
                incoming_bytes: (header_len + msg.payload_length as usize) as u64,
                incoming_frames: 1,
                ..Default::default()
            },
        );

        if msg.kind == MessageType::Keepalive {
            if msg.is_ack {
                control.retry.ack(None);
            } else {
                control.retry.keepalive();
            }
            continue;
        }

        if !process_payload(&inner, &hooks, &mut msg, &conn) {
            continue;
        }

        if msg.is_ack {
            if let Payload::Ack(ack) = &msg.payload {
                control.retry.ack(Some(ack));
            }
            continue;
        }
        if msg.wants_ack() {
            control.ack.push(msg.endpoint(), msg.id);
        }

        let kind = msg.kind;
        if let Err(err) = hooks.receive(msg, conn.clone()) {
            if kind != MessageType::Data {
                disconnect_err = Some(err);
                break;
            }
        }
    }

    control.retry.stop();
    control.ack.stop();
    logging::info!(inner.log, "connection finished";
                   "session_id" => conn.session_id(), "port" => conn.port);

    // A broken stream triggers the session layer's reconnect of this flow.
    if disconnect_err.is_some() {
        if let Ok(hooks) = inner.hooks() {
            hooks.disconnect(&conn, disconnect_err);
        }
    }
}
