use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;

use loam::crypto::{self, Encryptor, Method};
use loam::logging::{self, Logger};

use crate::cancel::{cancel_pair, CancelToken, Canceller};
use crate::client::{Client, ClientNetConfig};
use crate::config::{ClientConfig, PortStrategy};
use crate::conn::{Connection, ConnectionKey, Protocol, TransportHooks};
use crate::error::{Error, Result};
use crate::iface::{Interface, IfaceAdapter};
use crate::merger::{self, MergeSink, StreamMerger};
use crate::message::{
    AuthRequest, Compression, Handshake, Message, MessageType, Payload,
};
use crate::packet::Decoder;
use crate::stat::{StatDelta, Statistic};
use crate::tun::{CommandExecutor, DeviceFactory, IfIp};
use crate::usecase::{build_codec, ecdh_keypair, ecdh_shared, max_ack_size};

struct ClientConn {
    conn: Arc<Connection>,
    encryptor: Arc<dyn Encryptor>,
}

#[derive(Default)]
struct ClientState {
    connections: IndexMap<ConnectionKey, ClientConn>,
    interface: Option<Arc<Interface>>,
}

/// The client side of the session machinery: opens one connection per
/// (port, protocol), authenticates and handshakes each, then shuttles
/// packets between the local tunnel interface and the connections.
pub struct ClientUseCase {
    log: Logger,
    cfg: ClientConfig,
    method: Method,
    primary: Arc<dyn Encryptor>,
    merger: Arc<dyn StreamMerger>,
    client: Client,
    iface: IfaceAdapter,
    state: RwLock<ClientState>,
    if_create: Mutex<()>,
    session_id: AtomicU32,
    is_connected: AtomicBool,
    is_exit: AtomicBool,
    strategy: PortStrategy,
    compression: Compression,
    compression_level: u8,
    stat: Arc<Statistic>,
    cancel: CancelToken,
    canceller: Mutex<Option<Canceller>>,
}

struct ClientHandlers(Arc<ClientUseCase>);

impl ClientUseCase {
    pub fn new(
        log: &Logger,
        cfg: ClientConfig,
        factory: Arc<dyn DeviceFactory>,
        cmd: Arc<dyn CommandExecutor>,
    ) -> Result<Arc<ClientUseCase>> {
        cfg.validate()?;

        let method = cfg.connection.tunnel.method()?;
        let primary: Arc<dyn Encryptor> =
            crypto::create(method, &cfg.connection.authentication.key_bytes()?)?;
        let codec = build_codec(
            log,
            cfg.connection.tunnel.mtu,
            method,
            cfg.connection.server.obfuscate_data,
        )?;
        let decoder = Arc::new(Decoder::new(cfg.connection.server.endpoint_hash_source()?));

        let (canceller, cancel) = cancel_pair();

        let merger = merger::create(
            log,
            cfg.stream_merger.merger_config(cfg.tracing.stream_merger)?,
            cancel.clone(),
        );

        let client = Client::new(
            log,
            ClientNetConfig {
                codec,
                primary: primary.clone(),
                mtu: cfg.connection.tunnel.mtu,
                retry: cfg
                    .retry
                    .retry_config(&cfg.connection.server, cfg.tracing.retry),
                ack: cfg.ack.ack_config(
                    max_ack_size(cfg.connection.tunnel.mtu, &primary),
                    cfg.tracing.ack,
                ),
                tracing: cfg.tracing.socket,
            },
            decoder.clone(),
            cancel.clone(),
        );

        let iface = IfaceAdapter::new(log, cfg.iface_config(), cmd, factory, decoder);
        let strategy = cfg.connection.server.strategy()?;
        let compression = cfg.connection.server.compression();
        let compression_level = cfg.connection.server.compression_level;

        Ok(Arc::new(ClientUseCase {
            log: log.new(logging::o!("layer" => "uccli", "conn" => cfg.connection.name.clone())),
            cfg,
            method,
            primary,
            merger,
            client,
            iface,
            state: RwLock::new(ClientState::default()),
            if_create: Mutex::new(()),
            session_id: AtomicU32::new(0),
            is_connected: AtomicBool::new(false),
            is_exit: AtomicBool::new(false),
            strategy,
            compression,
            compression_level,
            stat: Arc::new(Statistic::new()),
            cancel,
            canceller: Mutex::new(Some(canceller)),
        }))
    }

    /// Connects every (port, protocol) of the configured range. A port that
    /// exhausts its attempts fails the whole start.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.wire();

        let server = &self.cfg.connection.server;
        logging::info!(self.log, "client started";
                       "host" => server.host.clone(),
                       "portMin" => server.port_min,
                       "portMax" => server.port_max,
                       "tcp" => server.use_tcp,
                       "udp" => server.use_udp);

        self.connect_all()
    }

    fn connect_all(self: &Arc<Self>) -> Result<()> {
        let server = self.cfg.connection.server.clone();
        for port in server.port_min..=server.port_max {
            if server.use_tcp {
                self.create_connection(port, Protocol::Tcp)?;
            }
            if server.use_udp {
                self.create_connection(port, Protocol::Udp)?;
            }
        }
        Ok(())
    }

    fn wire(self: &Arc<Self>) {
        let handlers = Arc::new(ClientHandlers(self.clone()));
        self.merger.set_sink(handlers.clone());
        self.client.set_hooks(handlers);
    }

    #[inline]
    pub fn session_id(&self) -> u32 {
        self.session_id.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    pub fn stat(&self) -> StatDelta {
        self.stat.snapshot()
    }

    fn create_connection(self: &Arc<Self>, port: u16, proto: Protocol) -> Result<()> {
        let server = self.cfg.connection.server.clone();

        for attempt in 0..server.max_connection_attempts {
            logging::debug!(self.log, "connecting to server...";
                            "host" => server.host.clone(),
                            "port" => port,
                            "protocol" => proto.as_str(),
                            "attempt" => attempt + 1);

            let conn = match self.client.connect(&server.host, port, proto) {
                Ok(conn) => conn,
                Err(err) => {
                    logging::error!(self.log, "server connection error";
                                    "error" => %err, "port" => port);
                    thread::sleep(Duration::from_secs(1));
                    continue;
                }
            };

            self.add_connection(&conn);

            if let Err(err) = self.command_authentication(&conn) {
                if err == Error::Unauthorized {
                    return Err(err);
                }
                self.remove_connection_entry(&conn);
                logging::error!(self.log, "server authentication error";
                                "error" => %err, "port" => port);
                thread::sleep(Duration::from_secs(1));
                continue;
            }

            if let Err(err) = self.command_handshake(&conn) {
                self.remove_connection_entry(&conn);
                logging::error!(self.log, "server handshake error";
                                "error" => %err, "port" => port);
                thread::sleep(Duration::from_secs(1));
                continue;
            }

            self.client.start_receiver(conn, self.session_id());
            return Ok(());
        }

        Err(Error::MaxConnectionAttempts)
    }

    fn command_authentication(self: &Arc<Self>, conn: &Arc<Connection>) -> Result<()> {
        let mut req = Message::new(MessageType::Authentication);
        req.session_id = self.session_id();
        req.is_request = true;
        req.payload = Payload::Auth(AuthRequest {
            client_id: self.cfg.system.client_id.clone(),
            name: self.cfg.connection.user.name.clone(),
            password: self.cfg.connection.user.password.clone(),
            compression: self.compression,
            compression_level: self.compression_level,
        });

        let timeout = Duration::from_secs(self.cfg.connection.server.authentication_timeout);
        let mut reply = self.client.send_sync(&mut req, conn, timeout)?;
        self.decode_reply(&mut reply)?;

        if reply.is_error {
            return Err(Error::from_wire_code(reply.error));
        }

        let resp = match reply.payload {
            Payload::AuthReply(resp) => resp,
            _ => return Err(Error::WrongPayload),
        };

        if let Err(err) = self.merger.create_stream(resp.session_id) {
            logging::error!(self.log, "failed to create stream"; "error" => %err);
            return Err(Error::Internal);
        }

        self.create_interface(resp.local_ip, resp.remote_ip)?;
        self.session_id.store(resp.session_id, Ordering::Release);

        logging::info!(self.log, "authentication successful";
                       "session_id" => resp.session_id,
                       "addr" => %conn.peer());

        Ok(())
    }

    fn command_handshake(self: &Arc<Self>, conn: &Arc<Connection>) -> Result<()> {
        let (secret, public) = ecdh_keypair();

        let mut req = Message::new(MessageType::Handshake);
        req.session_id = self.session_id();
        req.payload = Payload::Handshake(Handshake {
            key: public.as_bytes().to_vec(),
        });

        let timeout = Duration::from_secs(self.cfg.connection.server.handshake_timeout);
        let mut reply = self.client.send_sync(&mut req, conn, timeout)?;
        self.decode_reply(&mut reply)?;

        if reply.is_error {
            return Err(Error::from_wire_code(reply.error));
        }

        let resp = match reply.payload {
            Payload::Handshake(resp) => resp,
            _ => return Err(Error::WrongPayload),
        };

        let shared = ecdh_shared(secret, &resp.key)?;
        let encryptor = crypto::create(self.method, &shared[..self.method.key_size()])?;
        self.set_connection_encryptor(conn, encryptor);

        self.is_connected.store(true, Ordering::Release);

        logging::info!(self.log, "handshake successful";
                       "session_id" => self.session_id(),
                       "addr" => %conn.peer(),
                       "proto" => conn.proto.as_str());

        Ok(())
    }

    /// Replies of the sync phase arrive with the payload still encrypted
    /// under the primary key.
    fn decode_reply(&self, reply: &mut Message) -> Result<()> {
        if reply.payload_length > 0 {
            let raw = reply.payload.take_raw().ok_or(Error::WrongPayload)?;
            reply.payload = Payload::Raw(self.primary.decrypt(&raw)?);
        }
        self.client.codec().unmarshal_payload(reply)
    }

    fn create_interface(self: &Arc<Self>, local: std::net::Ipv4Addr, remote: std::net::Ipv4Addr) -> Result<()> {
        let _guard = self.if_create.lock();

        if self.state.read().interface.is_some() {
            return Ok(());
        }

        let ip = IfIp {
            server_local: std::net::Ipv4Addr::UNSPECIFIED,
            server_remote: std::net::Ipv4Addr::UNSPECIFIED,
            client_local: local,
            client_remote: remote,
        };

        let threads = self.cfg.connection.tunnel.number_of_handler_threads;
        let (tx, rx) = bounded(threads * 10);
        let ifc = self.iface.create(0, ip, tx, self.cancel.clone())?;

        for _ in 0..threads {
            let uc = self.clone();
            let rx: Receiver<Message> = rx.clone();
            thread::spawn(move || tunnel_handler(uc, rx));
        }

        self.state.write().interface = Some(ifc);
        Ok(())
    }

    fn close_interface(&self) {
        let ifc = self.state.write().interface.take();
        if let Some(ifc) = ifc {
            if let Err(err) = self.iface.close(&ifc) {
                logging::error!(self.log, "failed to close network interface"; "error" => %err);
            }
        }
    }

    fn add_connection(&self, conn: &Arc<Connection>) {
        let mut state = self.state.write();
        if !state.connections.contains_key(&conn.key()) {
            state.connections.insert(
                conn.key(),
                ClientConn {
                    conn: conn.clone(),
                    encryptor: self.primary.clone(),
                },
            );
        }
    }

    fn remove_connection_entry(&self, conn: &Arc<Connection>) {
        self.state.write().connections.shift_remove(&conn.key());
    }

    fn set_connection_encryptor(&self, conn: &Arc<Connection>, encryptor: Arc<dyn Encryptor>) {
        let mut state = self.state.write();
        if let Some(entry) = state.connections.get_mut(&conn.key()) {
            entry.encryptor = encryptor;
        }
    }

    /// Picks a connection for an outbound packet by the configured
    /// strategy. Hashing keeps one flow on one five-tuple.
    fn pick_connection(&self, endpoint: u64) -> Result<Arc<Connection>> {
        let state = self.state.read();
        let count = state.connections.len();
        if count == 0 {
            return Err(Error::ConnectionNotExists);
        }

        let index = match self.strategy {
            PortStrategy::Random => rand::thread_rng().gen_range(0..count),
            PortStrategy::Hash => (endpoint % count as u64) as usize,
        };

        Ok(state.connections[index].conn.clone())
    }

    fn connection_encryptor(&self, conn: &Arc<Connection>) -> Result<Option<Arc<dyn Encryptor>>> {
        match self.state.read().connections.get(&conn.key()) {
            Some(entry) => Ok(Some(entry.encryptor.clone())),
            None => Err(Error::ConnectionNotExists),
        }
    }

    fn socket_receiver(self: &Arc<Self>, msg: Message, _conn: &Arc<Connection>) -> Result<()> {
        if msg.session_id != self.session_id() {
            logging::error!(self.log, "wrong session ID received";
                            "message_session_id" => msg.session_id,
                            "client_session_id" => self.session_id());
            return Ok(());
        }

        match msg.kind {
            MessageType::Data => self.command_data(msg),
            MessageType::Reset => {
                self.command_reset();
                Ok(())
            }
            _ => Err(Error::UnknownCommand),
        }
    }

    fn command_data(&self, msg: Message) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }

        let ifc = match self.state.read().interface.clone() {
            Some(ifc) => ifc,
            None => return Err(Error::InterfaceNotExists),
        };

        let data = msg.payload.raw().ok_or(Error::WrongPayload)?;
        if let Err(err) = self.iface.write(&ifc, data) {
            logging::error!(self.log, "failed to write to interface";
                            "error" => %err,
                            "id" => msg.id,
                            "session_id" => msg.session_id);
            return Err(err);
        }

        Ok(())
    }

    fn command_reset(self: &Arc<Self>) {
        if self.is_exit.load(Ordering::Acquire) {
            return;
        }

        logging::info!(self.log, "received reset command, reconnecting...");
        self.merger.delete_stream(self.session_id());
        self.reset_state();
        self.close_all_connections();
        self.close_interface();

        let uc = self.clone();
        thread::spawn(move || {
            if uc.connect_all().is_err() {
                logging::error!(uc.log, "reconnect after reset failed");
            }
        });
    }

    fn send_reset(&self) {
        if !self.is_connected() {
            return;
        }

        let conn = match self.pick_connection(0) {
            Ok(conn) => conn,
            Err(err) => {
                logging::error!(self.log, "no connection"; "error" => %err);
                return;
            }
        };

        let mut msg = Message::new(MessageType::Reset);
        msg.session_id = self.session_id();
        if let Err(err) = self.client.send(&mut msg, &conn) {
            logging::error!(self.log, "failed to send reset message"; "error" => %err);
        }
    }

    fn reset_state(&self) {
        self.session_id.store(0, Ordering::Release);
        self.is_connected.store(false, Ordering::Release);
    }

    fn close_all_connections(&self) {
        let mut state = self.state.write();
        for (_, entry) in state.connections.drain(..) {
            if let Some(control) = entry.conn.control() {
                control.retry.stop();
                control.ack.stop();
            }
            entry.conn.close();
        }
    }

    /// Ends the current session but leaves the use case reusable.
    pub fn stop(&self) {
        if !self.is_connected() {
            return;
        }
        self.merger.delete_stream(self.session_id());
        self.close_interface();
        self.send_reset();
        self.reset_state();
        self.close_all_connections();
    }

    /// Final shutdown: informs the server and cancels every worker.
    pub fn exit(&self) {
        if self.is_exit.swap(true, Ordering::AcqRel) {
            return;
        }
        self.send_reset();
        self.merger.delete_stream(self.session_id());
        self.close_all_connections();
        self.close_interface();
        self.reset_state();
        if let Some(canceller) = self.canceller.lock().take() {
            canceller.cancel();
        }
    }

    fn disconnect(self: &Arc<Self>, conn: &Arc<Connection>, err: Option<Error>) {
        match &err {
            Some(err) => logging::error!(self.log, "disconnected";
                                         "error" => %err,
                                         "session_id" => conn.session_id(),
                                         "addr" => %conn.peer()),
            None => logging::info!(self.log, "disconnected";
                                   "session_id" => conn.session_id(),
                                   "addr" => %conn.peer()),
        }

        self.remove_connection_entry(conn);
        conn.close();

        if self.state.read().connections.is_empty() {
            self.stop();
        }

        // A broken flow reconnects just itself; a failed reconnect stops
        // the whole client.
        if err.is_some() && !self.is_exit.load(Ordering::Acquire) {
            let uc = self.clone();
            let port = conn.port;
            let proto = conn.proto;
            thread::spawn(move || {
                if uc.create_connection(port, proto).is_err() {
                    logging::error!(uc.log, "reconnect failed, stopping client"; "port" => port);
                    uc.stop();
                }
            });
        }
    }
}

/// Moves packets read from the tunnel to a connection of the session.
fn tunnel_handler(uc: Arc<ClientUseCase>, rx: Receiver<Message>) {
    loop {
        select! {
            recv(rx) -> msg => match msg {
                Ok(msg) => uc.tunnel_receiver(msg),
                Err(_) => return,
            },
            recv(uc.cancel.channel()) -> _ => return,
        }
    }
}

impl ClientUseCase {
    fn tunnel_receiver(&self, mut msg: Message) {
        if !self.is_connected() {
            return;
        }

        let conn = match self.pick_connection(msg.endpoint().0) {
            Ok(conn) => conn,
            Err(err) => {
                logging::warn!(self.log, "failed to get connection"; "error" => %err);
                return;
            }
        };

        msg.session_id = self.session_id();
        msg.compression = self.compression;
        msg.compression_level = self.compression_level;

        let payload_length = msg.payload_length;
        if let Err(err) = self.client.send(&mut msg, &conn) {
            logging::error!(self.log, "failed to send data frame";
                            "error" => %err, "id" => msg.id);
        }

        self.stat.add(&StatDelta {
            outgoing_bytes: u64::from(payload_length),
            outgoing_frames: 1,
            ..Default::default()
        });
    }
}

impl TransportHooks for ClientHandlers {
    fn receive(&self, msg: Message, conn: Arc<Connection>) -> Result<()> {
        self.0.merger.push(msg, conn)
    }

    fn disconnect(&self, conn: &Arc<Connection>, err: Option<Error>) {
        self.0.disconnect(conn, err);
    }

    fn user_encryptor(&self, conn: &Arc<Connection>) -> Result<Option<Arc<dyn Encryptor>>> {
        self.0.connection_encryptor(conn)
    }

    fn add_stat(&self, _session_id: u32, delta: StatDelta) {
        self.0.stat.add(&delta);
    }
}

impl MergeSink for ClientHandlers {
    fn deliver(&self, msg: Message, conn: &Arc<Connection>) -> Result<()> {
        self.0.socket_receiver(msg, conn)
    }

    fn reset(&self, _session_id: u32, _conn: &Arc<Connection>) {}
}
