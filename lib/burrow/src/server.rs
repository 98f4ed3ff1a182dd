use std::io::Read;
use std::net::{TcpListener, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};

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

const ACCEPT_POLL: Duration = Duration::from_millis(100);
const RECV_POLL: Duration = Duration::from_millis(500);

pub struct ServerNetConfig {
    pub codec: Arc<Codec>,
    pub primary: Arc<dyn Encryptor>,
    pub mtu: usize,
    pub retry: RetryConfig,
    pub ack: AckConfig,
    pub max_sessions: usize,
    /// TCP is reliable by itself; retry/ack on top of it stays optional
    /// and disabled in production.
    pub tcp_control: bool,
    pub tracing: bool,
}

struct ServerInner {
    log: Logger,
    cfg: ServerNetConfig,
    decoder: Arc<Decoder>,
    hooks: RwLock<Option<Arc<dyn TransportHooks>>>,
    dropped: Mutex<HashSet<u32>>,
    cancel: CancelToken,
}

impl ServerInner {
    fn hooks(&self) -> Result<Arc<dyn TransportHooks>> {
        self.hooks.read().clone().ok_or(Error::HandlerNotSet)
    }
}

/// The transport server: accepts TCP flows and binds UDP sockets across
/// the configured port range, decodes frames and feeds them to the session
/// layer. Per-session retry/ack pairs are instantiated on the first frame
/// carrying a session id.
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(
        log: &Logger,
        cfg: ServerNetConfig,
        decoder: Arc<Decoder>,
        cancel: CancelToken,
    ) -> Server {
        Server {
            inner: Arc::new(ServerInner {
                log: log.new(logging::o!("layer" => "srv")),
                cfg,
                decoder,
                hooks: RwLock::new(None),
                dropped: Mutex::new(HashSet::new()),
                cancel,
            }),
        }
    }

    pub fn set_hooks(&self, hooks: Arc<dyn TransportHooks>) {
        *self.inner.hooks.write() = Some(hooks);
    }

    /// Binds one listener. A bind failure is fatal to startup.
    pub fn run(&self, host: &str, port: u16, proto: Protocol) -> Result<()> {
        let host = if host.is_empty() { "0.0.0.0" } else { host };

        match proto {
            Protocol::Udp => {
                let socket = UdpSocket::bind((host, port))?;
                socket.set_read_timeout(Some(RECV_POLL))?;
                let inner = self.inner.clone();
                let socket = Arc::new(socket);
                thread::spawn(move || udp_listener(inner, socket, port));
            }
            Protocol::Tcp => {
                let listener = TcpListener::bind((host, port))?;
                listener.set_nonblocking(true)?;
                let inner = self.inner.clone();
                thread::spawn(move || tcp_listener(inner, listener, port));
            }
        }

        logging::debug!(self.inner.log, "listener started";
                        "host" => host, "port" => port, "protocol" => proto.as_str());

        Ok(())
    }

    /// Sends a message through a connection's normal path and registers it
    /// with the retry engine when it expects acknowledgement.
    pub fn send(&self, msg: &mut Message, conn: &Arc<Connection>) -> Result<()> {
        send_message(&self.inner, msg, conn)
    }

    /// Marks a session for removal from the per-socket control tables; the
    /// actual drain happens in the receive loops' soft-cap pass.
    pub fn drop_session(&self, session_id: u32) {
        self.inner.dropped.lock().insert(session_id);
    }
}

fn send_message(inner: &Arc<ServerInner>, msg: &mut Message, conn: &Arc<Connection>) -> Result<()> {
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

fn send_keepalive(inner: &Arc<ServerInner>, conn: &Arc<Connection>, ack: bool) {
    let mut msg = Message::new(MessageType::Keepalive);
    msg.session_id = conn.session_id();
    msg.is_ack = ack;

    if let Err(err) = send_message(inner, &mut msg, conn) {
        logging::error!(inner.log, "failed to send keepalive"; "error" => %err);
    }
}

struct ServerSink {
    inner: Arc<ServerInner>,
}

impl RetrySink for ServerSink {
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

impl AckSink for ServerSink {
    fn send_ack(&self, mut msg: Message, conn: &Arc<Connection>) -> Result<()> {
        send_message(&self.inner, &mut msg, conn)
    }
}

fn new_control(inner: &Arc<ServerInner>, conn: &Arc<Connection>, session_id: u32) -> ConnControl {
    let sink = Arc::new(ServerSink {
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

/// Decrypts and decodes the payload in place. Returns false when the frame
/// should be skipped; receive loops log and continue, they never die from
/// one bad frame.
fn process_payload(
    inner: &Arc<ServerInner>,
    hooks: &Arc<dyn TransportHooks>,
    msg: &mut Message,
    conn: &Arc<Connection>,
) -> bool {
    let enc = if msg.is_user_data() {
        match hooks.user_encryptor(conn) {
            Ok(Some(enc)) => enc,
            // Data before the handshake completed is undecryptable.
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

fn decode_header(inner: &Arc<ServerInner>, cipher: &[u8]) -> Option<Message> {
    let header = match inner.cfg.primary.decrypt(cipher) {
        Ok(header) => header,
        Err(err) => {
            logging::error!(inner.log, "failed to decrypt header";
                            "error" => %err, "header_size" => cipher.len());
            return None;
        }
    };

    match inner.cfg.codec.unmarshal_header(&header) {
        Ok(msg) => Some(msg),
        Err(err) => {
            logging::error!(inner.log, "failed to unmarshal header"; "error" => %err);
            None
        }
    }
}

fn udp_listener(inner: Arc<ServerInner>, socket: Arc<UdpSocket>, port: u16) {
    let header_len = inner.cfg.primary.cipher_len(HEADER_SIZE);
    let mut buf = vec![0u8; inner.cfg.primary.cipher_len(inner.cfg.mtu) + header_len];

    // Per-socket control tables; only this thread touches them.
    let mut control: HashMap<u32, ConnControl> = HashMap::new();
    let mut cur_sessions = 0usize;
    let mut max_sessions = inner.cfg.max_sessions;

    loop {
        if inner.cancel.is_cancelled() {
            return;
        }

        let (n, addr) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(err) => {
                if is_interrupting_io(&err) {
                    return;
                }
                logging::error!(inner.log, "failed to read from socket"; "error" => %err);
                continue;
            }
        };

        if n < header_len {
            continue;
        }

        let hooks = match inner.hooks() {
            Ok(hooks) => hooks,
            Err(_) => continue,
        };

        let mut msg = match decode_header(&inner, &buf[..header_len]) {
            Some(msg) => msg,
            None => continue,
        };

        // One frame per datagram, nothing more and nothing less.
        if header_len + msg.payload_length as usize != n {
            logging::error!(inner.log, "wrong message length";
                            "payload_size" => msg.payload_length, "datagram_size" => n);
            continue;
        }
        if msg.payload_length > 0 {
            msg.payload = Payload::Raw(buf[header_len..n].to_vec());
        }

        let conn = Arc::new(Connection::udp_server(socket.clone(), addr, port));
        conn.set_session_id(msg.session_id);

        hooks.add_stat(
            msg.session_id,
            StatDelta {
                outgoing_bytes: n as u64,
                outgoing_frames: 1,
                ..Default::default()
            },
        );

        if !process_payload(&inner, &hooks, &mut msg, &conn) {
            continue;
        }

        let ctrl = if msg.session_id != 0 {
            let entry = control.entry(msg.session_id).or_insert_with(|| {
                cur_sessions += 1;
                new_control(&inner, &conn, msg.session_id)
            });
            let ctrl = entry.clone();
            conn.set_control(ctrl.clone());
            Some(ctrl)
        } else {
            None
        };

        dispatch(&inner, &hooks, msg, conn, ctrl.as_ref());

        // Soft session cap: drain sessions dropped by the session layer;
        // if the socket is still over, grow the cap rather than cutting
        // live traffic.
        if cur_sessions > max_sessions {
            for session_id in inner.dropped.lock().drain() {
                if control.remove(&session_id).is_some() {
                    cur_sessions -= 1;
                }
            }
            if cur_sessions > max_sessions {
                max_sessions += 1;
                logging::debug!(inner.log, "increasing max sessions count";
                                "max_sessions_count" => max_sessions);
            }
        }
    }
}

/// Routes one decoded frame. Keepalives and acknowledgements terminate in
/// the retry engine; everything else reaches the session layer.
fn dispatch(
    inner: &Arc<ServerInner>,
    hooks: &Arc<dyn TransportHooks>,
    msg: Message,
    conn: Arc<Connection>,
    ctrl: Option<&ConnControl>,
) {
    if msg.kind == MessageType::Keepalive {
        if let Some(ctrl) = ctrl {
            if msg.is_ack {
                ctrl.retry.ack(None);
            } else {
                ctrl.retry.keepalive();
            }
        }
        return;
    }

    if msg.is_ack {
        if let (Some(ctrl), Payload::Ack(ack)) = (ctrl, &msg.payload) {
            ctrl.retry.ack(Some(ack));
        }
        return;
    }

    if msg.wants_ack() {
        if let Some(ctrl) = ctrl {
            ctrl.ack.push(msg.endpoint(), msg.id);
        }
    }

    let kind = msg.kind;
    if let Err(err) = hooks.receive(msg, conn) {
        logging::error!(inner.log, "incoming message error";
                        "error" => %err, "type" => kind.as_str());
    }
}

fn tcp_listener(inner: Arc<ServerInner>, listener: TcpListener, port: u16) {
    loop {
        if inner.cancel.is_cancelled() {
            return;
        }

        match listener.accept() {
            Ok((stream, addr)) => {
                if let Err(err) = stream.set_nonblocking(false) {
                    logging::error!(inner.log, "failed to configure stream"; "error" => %err);
                    continue;
                }
                let conn = Arc::new(Connection::tcp(stream, addr, port));
                let inner = inner.clone();
                thread::spawn(move || tcp_receiver(inner, conn));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                logging::error!(inner.log, "failed to accept connection"; "error" => %err);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn tcp_receiver(inner: Arc<ServerInner>, conn: Arc<Connection>) {
    let header_len = inner.cfg.primary.cipher_len(HEADER_SIZE);
    let mut disconnect_err: Option<Error> = None;
    let mut ctrl: Option<ConnControl> = None;

    loop {
        if inner.cancel.is_cancelled() {
            break;
        }

        let mut header = vec![0u8; header_len];
        let mut reader = match conn.tcp_stream() {
            Some(stream) => stream,
            None => break,
        };
        if let Err(err) = reader.read_exact(&mut header) {
            if !matches!(err.kind(), std::io::ErrorKind::UnexpectedEof) {
                disconnect_err = Some(err.into());
            }
            break;
        }

        let hooks = match inner.hooks() {
            Ok(hooks) => hooks,
            Err(_) => break,
        };

        // A header that fails to decrypt or parse desynchronizes the
        // stream; the connection cannot be salvaged.
        let mut msg = match decode_header(&inner, &header) {
            Some(msg) => msg,
            None => {
                disconnect_err = Some(Error::WrongPayload);
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

        conn.set_session_id(msg.session_id);

        hooks.add_stat(
            msg.session_id,
            StatDelta {
                outgoing_bytes: (header_len + msg.payload_length as usize) as u64,
                outgoing_frames: 1,
                ..Default::default()
            },
        );

        if !process_payload(&inner, &hooks, &mut msg, &conn) {
            continue;
        }

        if inner.cfg.tcp_control && msg.session_id != 0 && ctrl.is_none() {
            let control = new_control(&inner, &conn, msg.session_id);
            conn.set_control(control.clone());
            ctrl = Some(control);
        }

        let kind = msg.kind;
        if msg.kind == MessageType::Keepalive || msg.is_ack {
            dispatch(&inner, &hooks, msg, conn.clone(), ctrl.as_ref());
            continue;
        }
        if msg.wants_ack() {
            if let Some(ctrl) = &ctrl {
                ctrl.ack.push(msg.endpoint(), msg.id);
            }
        }
        if let Err(err) = hooks.receive(msg, conn.clone()) {
            logging::error!(inner.log, "incoming message error";
                            "error" => %err, "type" => kind.as_str());
            if kind != MessageType::Data {
                disconnect_err = Some(err);
                break;
            }
        }
    }

    if let Some(ctrl) = ctrl {
        ctrl.retry.stop();
        ctrl.ack.stop();
    }
    conn.close();
    if let Ok(hooks) = inner.hooks() {
        hooks.disconnect(&conn, disconnect_err);
    }
}
