use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, select, Receiver};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;

use loam::crypto::{self, Encryptor, Method};
use loam::logging::{self, Logger};

use crate::cancel::{cancel_pair, CancelToken, Canceller};
use crate::codec::Codec;
use crate::config::{PortStrategy, ServerConfig, User};
use crate::conn::{Connection, ConnectionKey, Protocol, TransportHooks};
use crate::error::{Error, Result};
use crate::iface::{Interface, IfaceAdapter};
use crate::merger::{self, MergeSink, StreamMerger};
use crate::message::{AuthResponse, Compression, Handshake, Message, MessageType, Payload};
use crate::packet::Decoder;
use crate::server::{Server, ServerNetConfig};
use crate::stat::{StatDelta, Statistic};
use crate::tun::{CommandExecutor, DeviceFactory, IfIp};
use crate::usecase::{build_codec, ecdh_keypair, ecdh_shared, max_ack_size};

/// One authenticated session as reported to operator surfaces.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: u32,
    pub client_id: String,
    pub user_name: String,
    pub if_name: String,
    pub stat: StatDelta,
}

#[derive(Debug, Clone)]
pub struct InterfaceSummary {
    pub name: String,
    pub session_id: u32,
    pub connections: usize,
}

struct SessionInfo {
    if_name: String,
    user_name: String,
    client_id: String,
    stat: Arc<Statistic>,
}

#[derive(Clone)]
struct ServerConn {
    if_name: String,
    encryptor: Option<Arc<dyn Encryptor>>,
    session_id: u32,
    port: u16,
    proto: Protocol,
    compression: Compression,
    compression_level: u8,
}

struct InterfaceInfo {
    ifc: Arc<Interface>,
    connections: Vec<Arc<Connection>>,
    session_id: u32,
}

#[derive(Default)]
struct SessState {
    sessions: HashMap<u32, SessionInfo>,
    client2session: HashMap<String, u32>,
}

#[derive(Default)]
struct ConnState {
    connections: HashMap<ConnectionKey, ServerConn>,
    interfaces: HashMap<String, InterfaceInfo>,
}

/// The server side of the session machinery: validates users, assigns
/// session ids, creates one tunnel interface per session and dispatches
/// the per-type protocol commands.
///
/// Lock discipline: the session table and the connection/interface tables
/// are each behind one reader-writer lock, always acquired in that order,
/// and no blocking I/O happens under either.
pub struct ServerUseCase {
    log: Logger,
    cfg: ServerConfig,
    method: Method,
    merger: Arc<dyn StreamMerger>,
    srv: Server,
    iface: IfaceAdapter,
    users: RwLock<HashMap<String, User>>,
    sess: RwLock<SessState>,
    conns: RwLock<ConnState>,
    // Serializes interface creation so address allocation stays unique
    // without holding the table locks across device setup.
    if_create: Mutex<()>,
    if_index: AtomicUsize,
    strategy: PortStrategy,
    cancel: CancelToken,
    canceller: Mutex<Option<Canceller>>,
}

struct ServerHandlers(Arc<ServerUseCase>);

impl ServerUseCase {
    pub fn new(
        log: &Logger,
        cfg: ServerConfig,
        factory: Arc<dyn DeviceFactory>,
        cmd: Arc<dyn CommandExecutor>,
    ) -> Result<Arc<ServerUseCase>> {
        cfg.validate()?;

        let method = cfg.tunnel.method()?;
        let primary: Arc<dyn Encryptor> =
            crypto::create(method, &cfg.authentication.key_bytes()?)?;
        let codec: Arc<Codec> = build_codec(
            log,
            cfg.tunnel.mtu,
            method,
            cfg.network.obfuscate_data,
        )?;
        let decoder = Arc::new(Decoder::new(cfg.network.endpoint_hash_source()?));

        let (canceller, cancel) = cancel_pair();

        let merger = merger::create(
            log,
            cfg.stream_merger.merger_config(cfg.tracing.stream_merger)?,
            cancel.clone(),
        );

        let srv = Server::new(
            log,
            ServerNetConfig {
                codec,
                primary: primary.clone(),
                mtu: cfg.tunnel.mtu,
                retry: cfg.retry.retry_config(&cfg.network, cfg.tracing.retry),
                ack: cfg
                    .ack
                    .ack_config(max_ack_size(cfg.tunnel.mtu, &primary), cfg.tracing.ack),
                max_sessions: cfg.max_sessions_count,
                tcp_control: false,
                tracing: cfg.tracing.socket,
            },
            decoder.clone(),
            cancel.clone(),
        );

        let iface = IfaceAdapter::new(log, cfg.iface_config(), cmd, factory, decoder);
        let strategy = cfg.network.strategy()?;

        Ok(Arc::new(ServerUseCase {
            log: log.new(logging::o!("layer" => "ucsrv")),
            cfg,
            method,
            merger,
            srv,
            iface,
            users: RwLock::new(HashMap::new()),
            sess: RwLock::new(SessState::default()),
            conns: RwLock::new(ConnState::default()),
            if_create: Mutex::new(()),
            if_index: AtomicUsize::new(0),
            strategy,
            cancel,
            canceller: Mutex::new(Some(canceller)),
        }))
    }

    /// Wires the handler chain and binds every configured listener. Bind
    /// failures abort startup.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.cfg.validate()?;
        self.wire();

        for port in self.cfg.network.port_min..=self.cfg.network.port_max {
            if self.cfg.network.use_tcp {
                self.srv.run(&self.cfg.network.host, port, Protocol::Tcp)?;
            }
            if self.cfg.network.use_udp {
                self.srv.run(&self.cfg.network.host, port, Protocol::Udp)?;
            }
        }

        logging::info!(self.log, "server started";
                       "portMin" => self.cfg.network.port_min,
                       "portMax" => self.cfg.network.port_max,
                       "tcp" => self.cfg.network.use_tcp,
                       "udp" => self.cfg.network.use_udp,
                       "mtu" => self.cfg.tunnel.mtu);

        Ok(())
    }

    /// Tears down every session and cancels all workers.
    pub fn stop(self: &Arc<Self>) {
        let session_ids: Vec<u32> = self.sess.read().sessions.keys().copied().collect();
        for session_id in session_ids {
            let _ = self.drop_session_by_id(session_id);
        }
        if let Some(canceller) = self.canceller.lock().take() {
            canceller.cancel();
        }
    }

    fn wire(self: &Arc<Self>) {
        {
            let mut users = self.users.write();
            users.clear();
            for user in &self.cfg.users {
                users.insert(user.name.clone(), user.clone());
            }
        }

        let handlers = Arc::new(ServerHandlers(self.clone()));
        self.merger.set_sink(handlers.clone());
        self.srv.set_hooks(handlers);
    }

    /// Live sessions for the operator state surface.
    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.sess
            .read()
            .sessions
            .iter()
            .map(|(session_id, info)| SessionSummary {
                session_id: *session_id,
                client_id: info.client_id.clone(),
                user_name: info.user_name.clone(),
                if_name: info.if_name.clone(),
                stat: info.stat.snapshot(),
            })
            .collect()
    }

    pub fn interfaces(&self) -> Vec<InterfaceSummary> {
        self.conns
            .read()
            .interfaces
            .iter()
            .map(|(name, info)| InterfaceSummary {
                name: name.clone(),
                session_id: info.session_id,
                connections: info.connections.len(),
            })
            .collect()
    }

    fn socket_receiver(self: &Arc<Self>, msg: Message, conn: &Arc<Connection>) -> Result<()> {
        match self.command(msg, conn) {
            Some(mut resp) => self.srv.send(&mut resp, conn),
            None => Ok(()),
        }
    }

    /// Dispatches one command and renders failures of non-data commands as
    /// error frames for the peer.
    fn command(self: &Arc<Self>, msg: Message, conn: &Arc<Connection>) -> Option<Message> {
        let kind = msg.kind;

        let result = match kind {
            MessageType::Authentication => self.command_authentication(msg, conn),
            MessageType::Handshake => self.command_handshake(msg, conn),
            MessageType::Data => self.command_data(msg, conn).map(|_| None),
            MessageType::Reset => self.command_reset(conn).map(|_| None),
            MessageType::Keepalive => Err(Error::UnknownCommand),
        };

        match result {
            Ok(resp) => resp,
            Err(err) => {
                logging::error!(self.log, "incoming message error";
                                "error" => %err,
                                "session_id" => conn.session_id(),
                                "protocol" => conn.proto.as_str());
                if kind != MessageType::Data {
                    let mut resp = Message::new(kind);
                    resp.session_id = conn.session_id();
                    resp.error = err.wire_code();
                    Some(resp)
                } else {
                    None
                }
            }
        }
    }

    fn command_authentication(
        self: &Arc<Self>,
        msg: Message,
        conn: &Arc<Connection>,
    ) -> Result<Option<Message>> {
        let req = match msg.payload {
            Payload::Auth(ref req) => req.clone(),
            _ => return Err(Error::WrongPayload),
        };

        match self.users.read().get(&req.name) {
            Some(user) if user.password == req.password => {}
            _ => {
                logging::error!(self.log, "incorrect name or password"; "name" => req.name);
                return Err(Error::Unauthorized);
            }
        }

        let session_id = if msg.session_id == 0 {
            // A fresh login evicts any prior session of the same install.
            if let Ok(Some(ifc)) = self.drop_session_by_client(&req.client_id) {
                self.close_interface(&ifc);
            }
            self.create_session(&req.client_id, &req.name)
        } else {
            // Re-attaching a new connection to a live session is allowed
            // only for the same client and user.
            if let Err(err) = self.check_session(msg.session_id, &req.client_id, &req.name) {
                logging::error!(self.log, "incorrect session ID";
                                "error" => %err,
                                "session_id" => msg.session_id,
                                "client_id" => req.client_id);
                return Err(Error::Unauthorized);
            }
            msg.session_id
        };
        conn.set_session_id(session_id);

        if let Err(err) = self.merger.create_stream(session_id) {
            logging::error!(self.log, "failed to create stream"; "error" => %err);
            return Err(Error::Internal);
        }

        let (if_name, ip) = match self.create_interface(session_id) {
            Ok(created) => created,
            Err(err) => {
                logging::error!(self.log, "failed to create network interface";
                                "error" => %err,
                                "name" => req.name,
                                "client_id" => req.client_id,
                                "session_id" => session_id);
                return Err(Error::Internal);
            }
        };

        self.add_connection(
            conn,
            ServerConn {
                if_name,
                encryptor: None,
                session_id,
                port: conn.port,
                proto: conn.proto,
                compression: req.compression,
                compression_level: req.compression_level,
            },
        );

        logging::info!(self.log, "authentication successful";
                       "session_id" => session_id,
                       "client_id" => req.client_id,
                       "name" => req.name,
                       "addr" => %conn.peer());

        let mut resp = Message::new(MessageType::Authentication);
        resp.session_id = session_id;
        resp.payload = Payload::AuthReply(AuthResponse {
            session_id,
            local_ip: ip.client_local,
            remote_ip: ip.client_remote,
        });
        Ok(Some(resp))
    }

    fn command_handshake(
        self: &Arc<Self>,
        msg: Message,
        conn: &Arc<Connection>,
    ) -> Result<Option<Message>> {
        let peer_key = match msg.payload {
            Payload::Handshake(ref req) => req.key.clone(),
            _ => return Err(Error::WrongPayload),
        };

        let sc = self
            .get_connection(conn)
            .ok_or(Error::ConnectionNotExists)?;

        let (secret, public) = ecdh_keypair();
        let shared = ecdh_shared(secret, &peer_key)?;
        let encryptor = crypto::create(self.method, &shared[..self.method.key_size()])?;

        self.set_connection_encryptor(conn, encryptor)?;
        self.add_interface_connection(&sc, conn)?;

        logging::info!(self.log, "handshake successful";
                       "session_id" => conn.session_id(),
                       "addr" => %conn.peer(),
                       "proto" => conn.proto.as_str());

        let mut resp = Message::new(MessageType::Handshake);
        resp.session_id = conn.session_id();
        resp.payload = Payload::Handshake(Handshake {
            key: public.as_bytes().to_vec(),
        });
        Ok(Some(resp))
    }

    fn command_data(&self, msg: Message, conn: &Arc<Connection>) -> Result<()> {
        let sc = match self.get_connection(conn) {
            Some(sc) => sc,
            None => {
                logging::error!(self.log, "connection not exists";
                                "session_id" => msg.session_id, "addr" => %conn.peer());
                return Err(Error::ConnectionNotExists);
            }
        };

        let device = {
            let conns = self.conns.read();
            match conns.interfaces.get(&sc.if_name) {
                Some(info) => info.ifc.clone(),
                None => {
                    logging::error!(self.log, "interface not exists"; "if" => sc.if_name);
                    return Err(Error::InterfaceNotExists);
                }
            }
        };

        let data = msg.payload.raw().ok_or(Error::WrongPayload)?;
        if let Err(err) = self.iface.write(&device, data) {
            logging::error!(self.log, "failed to write to interface";
                            "error" => %err,
                            "id" => msg.id,
                            "session_id" => msg.session_id);
        }

        Ok(())
    }

    fn command_reset(self: &Arc<Self>, conn: &Arc<Connection>) -> Result<()> {
        let sc = match self.get_connection(conn) {
            Some(sc) => sc,
            None => {
                logging::error!(self.log, "connection not exists";
                                "session_id" => conn.session_id(), "addr" => %conn.peer());
                return Err(Error::ConnectionNotExists);
            }
        };

        self.drop_session_by_id(sc.session_id)
    }

    /// The merger met a session it does not know; ask the peer to restart.
    fn send_reset(&self, session_id: u32, conn: &Arc<Connection>) {
        let mut msg = Message::new(MessageType::Reset);
        msg.session_id = session_id;

        if let Err(err) = self.srv.send(&mut msg, conn) {
            logging::error!(self.log, "failed to send reset";
                            "error" => %err, "session_id" => session_id);
        }
    }

    fn create_session(&self, client_id: &str, user_name: &str) -> u32 {
        let mut sess = self.sess.write();

        if let Some(existing) = sess.client2session.get(client_id) {
            return *existing;
        }

        let mut rng = rand::thread_rng();
        let session_id = loop {
            let candidate: u32 = rng.gen_range(1..u32::MAX);
            if !sess.sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        sess.sessions.insert(
            session_id,
            SessionInfo {
                if_name: String::new(),
                user_name: user_name.to_string(),
                client_id: client_id.to_string(),
                stat: Arc::new(Statistic::new()),
            },
        );
        sess.client2session.insert(client_id.to_string(), session_id);

        session_id
    }

    fn check_session(&self, session_id: u32, client_id: &str, user_name: &str) -> Result<()> {
        let sess = self.sess.read();
        match sess.sessions.get(&session_id) {
            None => Err(Error::SessionNotExists),
            Some(info) if info.client_id != client_id || info.user_name != user_name => {
                Err(Error::Unauthorized)
            }
            Some(_) => Ok(()),
        }
    }

    fn drop_session_by_id(self: &Arc<Self>, session_id: u32) -> Result<()> {
        let ifc = {
            let mut sess = self.sess.write();
            if !sess.sessions.contains_key(&session_id) {
                return Err(Error::SessionNotExists);
            }
            logging::info!(self.log, "dropping session"; "session_id" => session_id);
            self.drop_session_locked(&mut sess, session_id)
        };

        if let Some(ifc) = ifc {
            self.close_interface(&ifc);
        }
        Ok(())
    }

    /// Returns the interface to close after the locks are released.
    fn drop_session_by_client(&self, client_id: &str) -> Result<Option<Arc<Interface>>> {
        let mut sess = self.sess.write();
        let session_id = *sess
            .client2session
            .get(client_id)
            .ok_or(Error::SessionNotExists)?;

        logging::info!(self.log, "dropping session by client id";
                       "client_id" => client_id, "session_id" => session_id);

        Ok(self.drop_session_locked(&mut sess, session_id))
    }

    /// Removes every trace of a session from the tables. Device teardown
    /// (shell commands) is left to the caller so no I/O runs under the
    /// write locks.
    fn drop_session_locked(
        &self,
        sess: &mut SessState,
        session_id: u32,
    ) -> Option<Arc<Interface>> {
        let info = sess.sessions.remove(&session_id)?;
        sess.client2session.remove(&info.client_id);

        let mut to_close = None;
        {
            let mut conns = self.conns.write();
            if let Some(ifc) = conns.interfaces.remove(&info.if_name) {
                for conn in &ifc.connections {
                    if let Some(control) = conn.control() {
                        control.retry.stop();
                        control.ack.stop();
                    }
                    conn.close();
                }
                to_close = Some(ifc.ifc);
            }
            conns
                .connections
                .retain(|_, sc| sc.session_id != session_id);
        }

        self.merger.delete_stream(session_id);
        self.srv.drop_session(session_id);

        to_close
    }

    fn close_interface(&self, ifc: &Arc<Interface>) {
        if let Err(err) = self.iface.close(ifc) {
            logging::error!(self.log, "failed to close network interface"; "error" => %err);
        }
    }

    /// Creates (or finds) the one tunnel interface of a session and its
    /// handler threads.
    fn create_interface(self: &Arc<Self>, session_id: u32) -> Result<(String, IfIp)> {
        let _guard = self.if_create.lock();

        {
            let sess = self.sess.read();
            let info = sess
                .sessions
                .get(&session_id)
                .ok_or(Error::SessionNotExists)?;
            if !info.if_name.is_empty() {
                let conns = self.conns.read();
                let ifc = conns
                    .interfaces
                    .get(&info.if_name)
                    .ok_or(Error::InterfaceNotExists)?;
                return Ok((info.if_name.clone(), ifc.ifc.ip));
            }
        }

        let ip = self.next_tunnel_ip()?;
        let (tx, rx) = bounded(self.cfg.tunnel.number_of_handler_threads * 10);
        let index = self.if_index.fetch_add(1, Ordering::Relaxed);
        let ifc = self.iface.create(index, ip, tx, self.cancel.clone())?;
        let if_name = ifc.name();

        for _ in 0..self.cfg.tunnel.number_of_handler_threads {
            let uc = self.clone();
            let name = if_name.clone();
            let rx: Receiver<Message> = rx.clone();
            thread::spawn(move || interface_handler(uc, name, rx));
        }

        {
            let mut sess = self.sess.write();
            let mut conns = self.conns.write();
            conns.interfaces.insert(
                if_name.clone(),
                InterfaceInfo {
                    ifc,
                    connections: Vec::new(),
                    session_id,
                },
            );
            if let Some(info) = sess.sessions.get_mut(&session_id) {
                info.if_name = if_name.clone();
            }
        }

        Ok((if_name, ip))
    }

    /// Allocates the next block of four tunnel addresses above the highest
    /// block in use.
    fn next_tunnel_ip(&self) -> Result<IfIp> {
        let mut from = u32::from(self.cfg.tunnel.addr_min_v4()?);

        let conns = self.conns.read();
        let highest = conns
            .interfaces
            .values()
            .map(|info| u32::from(info.ifc.ip.client_remote))
            .max();
        if let Some(highest) = highest {
            from = highest + 1;
        }

        Ok(IfIp {
            server_local: from.into(),
            server_remote: (from + 1).into(),
            client_local: (from + 2).into(),
            client_remote: (from + 3).into(),
        })
    }

    fn add_connection(&self, conn: &Arc<Connection>, sc: ServerConn) {
        let mut conns = self.conns.write();
        // A reconnect of the same (session, protocol, port) replaces the
        // old registration.
        conns
            .connections
            .retain(|_, old| {
                !(old.session_id == sc.session_id && old.proto == sc.proto && old.port == sc.port)
            });
        conns.connections.insert(conn.key(), sc);
    }

    fn get_connection(&self, conn: &Arc<Connection>) -> Option<ServerConn> {
        self.conns.read().connections.get(&conn.key()).cloned()
    }

    fn set_connection_encryptor(
        &self,
        conn: &Arc<Connection>,
        encryptor: Arc<dyn Encryptor>,
    ) -> Result<()> {
        let mut conns = self.conns.write();
        match conns.connections.get_mut(&conn.key()) {
            Some(sc) => {
                sc.encryptor = Some(encryptor);
                Ok(())
            }
            None => Err(Error::ConnectionNotExists),
        }
    }

    fn connection_encryptor(&self, conn: &Arc<Connection>) -> Result<Option<Arc<dyn Encryptor>>> {
        match self.conns.read().connections.get(&conn.key()) {
            Some(sc) => Ok(sc.encryptor.clone()),
            None => Err(Error::ConnectionNotExists),
        }
    }

    fn add_interface_connection(&self, sc: &ServerConn, conn: &Arc<Connection>) -> Result<()> {
        conn.set_compression(sc.compression, sc.compression_level);

        let mut conns = self.conns.write();
        let info = conns
            .interfaces
            .get_mut(&sc.if_name)
            .ok_or(Error::InterfaceNotExists)?;

        for existing in info.connections.iter_mut() {
            if existing.session_id() == sc.session_id
                && existing.proto == sc.proto
                && existing.port == sc.port
            {
                *existing = conn.clone();
                return Ok(());
            }
        }
        info.connections.push(conn.clone());
        Ok(())
    }

    fn add_session_stat(&self, session_id: u32, delta: StatDelta) {
        if let Some(info) = self.sess.read().sessions.get(&session_id) {
            info.stat.add(&delta);
        }
    }

    fn disconnect(&self, conn: &Arc<Connection>, err: Option<Error>) {
        match &err {
            Some(err) => logging::error!(self.log, "disconnected";
                                         "error" => %err,
                                         "session_id" => conn.session_id(),
                                         "addr" => %conn.peer()),
            None => logging::info!(self.log, "disconnected";
                                   "session_id" => conn.session_id(),
                                   "addr" => %conn.peer()),
        }

        self.remove_connection(conn);
    }

    fn remove_connection(&self, conn: &Arc<Connection>) {
        let mut teardown: Option<(Arc<Interface>, u32)> = None;

        {
            let mut sess = self.sess.write();
            let mut conns = self.conns.write();

            let sc = match conns.connections.remove(&conn.key()) {
                Some(sc) => sc,
                None => return,
            };

            if !sc.if_name.is_empty() {
                let empty = match conns.interfaces.get_mut(&sc.if_name) {
                    Some(info) => {
                        info.connections.retain(|c| c.key() != conn.key());
                        info.connections.is_empty()
                    }
                    None => false,
                };

                // The last connection of a session tears the session down.
                if empty {
                    if let Some(info) = conns.interfaces.remove(&sc.if_name) {
                        if let Some(session) = sess.sessions.remove(&info.session_id) {
                            sess.client2session.remove(&session.client_id);
                        }
                        teardown = Some((info.ifc, info.session_id));
                    }
                }
            }
        }

        if let Some((ifc, session_id)) = teardown {
            self.merger.delete_stream(session_id);
            self.srv.drop_session(session_id);
            self.close_interface(&ifc);
        }
    }
}

/// Routes packets read from one tunnel interface to a connection of its
/// session, chosen by the configured strategy.
fn interface_handler(uc: Arc<ServerUseCase>, if_name: String, rx: Receiver<Message>) {
    loop {
        select! {
            recv(rx) -> msg => match msg {
                Ok(msg) => uc.interface_receiver(&if_name, msg),
                Err(_) => return,
            },
            recv(uc.cancel.channel()) -> _ => return,
        }
    }
}

impl ServerUseCase {
    fn interface_receiver(&self, if_name: &str, mut msg: Message) {
        let conn = {
            let conns = self.conns.read();
            let info = match conns.interfaces.get(if_name) {
                Some(info) => info,
                None => {
                    logging::warn!(self.log, "interface not exists"; "if" => if_name);
                    return;
                }
            };
            if info.connections.is_empty() {
                return;
            }

            let index = match self.strategy {
                PortStrategy::Random => rand::thread_rng().gen_range(0..info.connections.len()),
                PortStrategy::Hash => {
                    (msg.endpoint().0 % info.connections.len() as u64) as usize
                }
            };
            info.connections[index].clone()
        };

        msg.session_id = conn.session_id();
        let (compression, level) = conn.compression();
        msg.compression = compression;
        msg.compression_level = level;

        let payload_length = msg.payload_length;
        if let Err(err) = self.srv.send(&mut msg, &conn) {
            logging::error!(self.log, "failed to send data frame";
                            "error" => %err, "id" => msg.id);
        }

        self.add_session_stat(
            msg.session_id,
            StatDelta {
                incoming_bytes: u64::from(payload_length),
                incoming_frames: 1,
                ..Default::default()
            },
        );
    }
}

impl TransportHooks for ServerHandlers {
    fn receive(&self, msg: Message, conn: Arc<Connection>) -> Result<()> {
        self.0.merger.push(msg, conn)
    }

    fn disconnect(&self, conn: &Arc<Connection>, err: Option<Error>) {
        self.0.disconnect(conn, err);
    }

    fn user_encryptor(&self, conn: &Arc<Connection>) -> Result<Option<Arc<dyn Encryptor>>> {
        self.0.connection_encryptor(conn)
    }

    fn add_stat(&self, session_id: u32, delta: StatDelta) {
        self.0.add_session_stat(session_id, delta);
    }
}

impl MergeSink for ServerHandlers {
    fn deliver(&self, msg: Message, conn: &Arc<Connection>) -> Result<()> {
        self.0.socket_receiver(msg, conn)
    }

    fn reset(&self, session_id: u32, conn: &Arc<Connection>) {
        self.0.send_reset(session_id, conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AuthRequest, HEADER_SIZE};
    use crate::tun::{MemoryTunFactory, ShellExecutor};
    use std::net::UdpSocket;
    use std::time::Duration;

    struct Fixture {
        uc: Arc<ServerUseCase>,
        factory: Arc<MemoryTunFactory>,
        // The "client" end of the loopback socket pair.
        client: UdpSocket,
        conn: Arc<Connection>,
    }

    fn fixture() -> Fixture {
        let mut cfg = ServerConfig::default();
        cfg.users.push(User {
            name: "alice".to_string(),
            password: "pw".to_string(),
        });
        // Identity encryption keeps the frames inspectable.
        cfg.tunnel.encryption = "none".to_string();
        cfg.network.obfuscate_data = false;
        cfg.tunnel.number_of_handler_threads = 1;

        let factory = MemoryTunFactory::new("bur");
        let uc = ServerUseCase::new(
            &logging::null(),
            cfg,
            factory.clone(),
            Arc::new(ShellExecutor::new("")),
        )
        .unwrap();
        uc.wire();

        let server_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let client_addr = client.local_addr().unwrap();
        let port = server_socket.local_addr().unwrap().port();

        let conn = Arc::new(Connection::udp_server(
            Arc::new(server_socket),
            client_addr,
            port,
        ));

        Fixture {
            uc,
            factory,
            client,
            conn,
        }
    }

    fn auth_message(session_id: u32, name: &str, password: &str) -> Message {
        let mut msg = Message::new(MessageType::Authentication);
        msg.session_id = session_id;
        msg.is_request = true;
        msg.payload = Payload::Auth(AuthRequest {
            client_id: "client-1".to_string(),
            name: name.to_string(),
            password: password.to_string(),
            compression: Compression::None,
            compression_level: 0,
        });
        msg
    }

    fn read_reply(fx: &Fixture) -> Message {
        let mut buf = [0u8; 2048];
        let n = fx.client.recv(&mut buf).unwrap();

        let codec = crate::usecase::build_codec(
            &logging::null(),
            1400,
            Method::None,
            false,
        )
        .unwrap();
        let mut msg = codec.unmarshal_header(&buf[..HEADER_SIZE]).unwrap();
        if msg.payload_length > 0 {
            msg.payload = Payload::Raw(buf[HEADER_SIZE..n].to_vec());
            codec.unmarshal_payload(&mut msg).unwrap();
        }
        msg
    }

    fn authenticate(fx: &Fixture) -> u32 {
        fx.uc
            .socket_receiver(auth_message(0, "alice", "pw"), &fx.conn)
            .unwrap();
        let reply = read_reply(fx);
        assert_eq!(reply.kind, MessageType::Authentication);
        assert!(!reply.is_error);
        match reply.payload {
            Payload::AuthReply(resp) => {
                assert_ne!(resp.session_id, 0);
                resp.session_id
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    fn handshake(fx: &Fixture) -> [u8; 32] {
        let (secret, public) = ecdh_keypair();
        let mut msg = Message::new(MessageType::Handshake);
        msg.session_id = fx.conn.session_id();
        msg.payload = Payload::Handshake(Handshake {
            key: public.as_bytes().to_vec(),
        });

        fx.uc.socket_receiver(msg, &fx.conn).unwrap();
        let reply = read_reply(fx);
        assert_eq!(reply.kind, MessageType::Handshake);
        match reply.payload {
            Payload::Handshake(h) => ecdh_shared(secret, &h.key).unwrap(),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_authentication_creates_session() {
        let fx = fixture();
        let session_id = authenticate(&fx);

        let sessions = fx.uc.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, session_id);
        assert_eq!(sessions[0].client_id, "client-1");
        assert_eq!(sessions[0].user_name, "alice");
        assert!(!sessions[0].if_name.is_empty());
        assert_eq!(fx.factory.devices().len(), 1);
    }

    #[test]
    fn test_wrong_password_is_rejected() {
        let fx = fixture();
        fx.uc
            .socket_receiver(auth_message(0, "alice", "wrong"), &fx.conn)
            .unwrap();

        let reply = read_reply(&fx);
        assert!(reply.is_error);
        assert_eq!(Error::from_wire_code(reply.error), Error::Unauthorized);
        assert!(fx.uc.sessions().is_empty());
    }

    #[test]
    fn test_unknown_user_is_rejected() {
        let fx = fixture();
        fx.uc
            .socket_receiver(auth_message(0, "mallory", "pw"), &fx.conn)
            .unwrap();

        let reply = read_reply(&fx);
        assert!(reply.is_error);
        assert_eq!(Error::from_wire_code(reply.error), Error::Unauthorized);
    }

    #[test]
    fn test_session_ids_are_unique_and_nonzero() {
        let fx = fixture();

        let mut ids = Vec::new();
        for i in 0..10 {
            let mut msg = auth_message(0, "alice", "pw");
            if let Payload::Auth(ref mut req) = msg.payload {
                req.client_id = format!("client-{}", i);
            }
            fx.uc.socket_receiver(msg, &fx.conn).unwrap();
            let reply = read_reply(&fx);
            match reply.payload {
                Payload::AuthReply(resp) => ids.push(resp.session_id),
                other => panic!("unexpected payload {:?}", other),
            }
        }

        let unique: std::collections::HashSet<u32> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
        assert!(!unique.contains(&0));
    }

    #[test]
    fn test_reauthentication_evicts_prior_session() {
        let fx = fixture();
        let first = authenticate(&fx);

        // The same install logs in again from scratch.
        let second = authenticate(&fx);
        assert_ne!(first, second);

        let sessions = fx.uc.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, second);
    }

    #[test]
    fn test_reattach_with_wrong_client_is_rejected() {
        let fx = fixture();
        let session_id = authenticate(&fx);

        let mut msg = auth_message(session_id, "alice", "pw");
        if let Payload::Auth(ref mut req) = msg.payload {
            req.client_id = "other-client".to_string();
        }
        fx.uc.socket_receiver(msg, &fx.conn).unwrap();

        let reply = read_reply(&fx);
        assert!(reply.is_error);
        assert_eq!(Error::from_wire_code(reply.error), Error::Unauthorized);
    }

    #[test]
    fn test_handshake_installs_session_encryptor() {
        let fx = fixture();
        authenticate(&fx);

        assert!(fx
            .uc
            .connection_encryptor(&fx.conn)
            .unwrap()
            .is_none());

        handshake(&fx);

        assert!(fx
            .uc
            .connection_encryptor(&fx.conn)
            .unwrap()
            .is_some());

        // The handshake also attached the connection to the interface.
        let interfaces = fx.uc.interfaces();
        assert_eq!(interfaces.len(), 1);
        assert_eq!(interfaces[0].connections, 1);
    }

    #[test]
    fn test_handshake_without_auth_is_rejected() {
        let fx = fixture();

        let (_, public) = ecdh_keypair();
        let mut msg = Message::new(MessageType::Handshake);
        msg.payload = Payload::Handshake(Handshake {
            key: public.as_bytes().to_vec(),
        });

        fx.uc.socket_receiver(msg, &fx.conn).unwrap();
        let reply = read_reply(&fx);
        assert!(reply.is_error);
    }

    #[test]
    fn test_data_is_written_to_tunnel() {
        let fx = fixture();
        authenticate(&fx);
        handshake(&fx);

        let packet = vec![0x45, 0, 0, 20, 0, 0, 0, 0, 0, 6, 0, 0, 10, 0, 0, 1, 10, 0, 0, 2];
        let mut msg = Message::new(MessageType::Data);
        msg.session_id = fx.conn.session_id();
        msg.id = 1;
        msg.payload = Payload::Raw(packet.clone());

        fx.uc.socket_receiver(msg, &fx.conn).unwrap();

        let device = fx.factory.devices()[0].clone();
        let written = device.take_written(Duration::from_secs(2)).unwrap();
        assert_eq!(written, packet);
    }

    #[test]
    fn test_reset_drops_session() {
        let fx = fixture();
        authenticate(&fx);
        handshake(&fx);
        assert_eq!(fx.uc.sessions().len(), 1);

        let msg = Message::new(MessageType::Reset);
        fx.uc.socket_receiver(msg, &fx.conn).unwrap();

        assert!(fx.uc.sessions().is_empty());
        assert!(fx.uc.interfaces().is_empty());
    }

    #[test]
    fn test_last_disconnect_tears_down_session() {
        let fx = fixture();
        authenticate(&fx);
        handshake(&fx);

        fx.uc.disconnect(&fx.conn, None);

        assert!(fx.uc.sessions().is_empty());
        assert!(fx.uc.interfaces().is_empty());
    }
}
