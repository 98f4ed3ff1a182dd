use std::io::{self, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Mutex, RwLock};

use loam::time::timestamp_secs;

use loam::crypto::Encryptor;

use crate::ack::AckAccumulator;
use crate::error::{Error, Result};
use crate::message::{Compression, Message};
use crate::retry::Retry;
use crate::stat::StatDelta;

pub const CONNECTION_KEY_SIZE: usize = 9;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp = 1,
    Udp = 2,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Identifies one transport flow: protocol, local port and the remote
/// IPv4 address/port, packed the way the flow tables key them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct ConnectionKey([u8; CONNECTION_KEY_SIZE]);

enum Socket {
    Tcp(TcpStream),
    Udp {
        socket: Arc<UdpSocket>,
        /// Client sockets are connected and use `send`; the server shares
        /// one unconnected socket per port and addresses each datagram.
        connected: bool,
    },
}

/// The per-session retransmission and acknowledgement machinery, carried as
/// one record so both pointers are always read in a single snapshot.
#[derive(Clone)]
pub struct ConnControl {
    pub retry: Arc<Retry>,
    pub ack: Arc<AckAccumulator>,
}

/// Late-bound collaborators of a transport: the session layer supplies
/// these when it starts, closing the loop between sockets and sessions.
pub trait TransportHooks: Send + Sync {
    /// A fully decoded frame arrived.
    fn receive(&self, msg: Message, conn: Arc<Connection>) -> Result<()>;
    /// The flow ended; `err` is `None` for an orderly close.
    fn disconnect(&self, conn: &Arc<Connection>, err: Option<Error>);
    /// The session-ephemeral encryptor of this connection, or `None` while
    /// the handshake has not completed yet.
    fn user_encryptor(&self, conn: &Arc<Connection>) -> Result<Option<Arc<dyn Encryptor>>>;
    /// Accounts traffic against the session's counters.
    fn add_stat(&self, session_id: u32, delta: StatDelta);
}

/// An established transport flow between a client and one server port.
/// For UDP the peer address is learned from received datagrams, so one
/// connection object survives peer roaming.
pub struct Connection {
    socket: Socket,
    pub proto: Protocol,
    pub port: u16,
    peer: Mutex<SocketAddr>,
    session_id: AtomicU32,
    compression: Mutex<(Compression, u8)>,
    control: RwLock<Option<ConnControl>>,
    closed: AtomicBool,
    pub created_at: u64,
}

impl Connection {
    pub fn tcp(stream: TcpStream, peer: SocketAddr, port: u16) -> Connection {
        Connection::new(Socket::Tcp(stream), Protocol::Tcp, peer, port)
    }

    pub fn udp_client(socket: UdpSocket, peer: SocketAddr, port: u16) -> Connection {
        Connection::new(
            Socket::Udp {
                socket: Arc::new(socket),
                connected: true,
            },
            Protocol::Udp,
            peer,
            port,
        )
    }

    pub fn udp_server(socket: Arc<UdpSocket>, peer: SocketAddr, port: u16) -> Connection {
        Connection::new(
            Socket::Udp {
                socket,
                connected: false,
            },
            Protocol::Udp,
            peer,
            port,
        )
    }

    fn new(socket: Socket, proto: Protocol, peer: SocketAddr, port: u16) -> Connection {
        Connection {
            socket,
            proto,
            port,
            peer: Mutex::new(peer),
            session_id: AtomicU32::new(0),
            compression: Mutex::new((Compression::None, 0)),
            control: RwLock::new(None),
            closed: AtomicBool::new(false),
            created_at: timestamp_secs(),
        }
    }

    #[inline]
    pub fn session_id(&self) -> u32 {
        self.session_id.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_session_id(&self, session_id: u32) {
        self.session_id.store(session_id, Ordering::Release);
    }

    #[inline]
    pub fn peer(&self) -> SocketAddr {
        *self.peer.lock()
    }

    #[inline]
    pub fn set_peer(&self, addr: SocketAddr) {
        *self.peer.lock() = addr;
    }

    #[inline]
    pub fn compression(&self) -> (Compression, u8) {
        *self.compression.lock()
    }

    #[inline]
    pub fn set_compression(&self, compression: Compression, level: u8) {
        *self.compression.lock() = (compression, level);
    }

    /// Snapshot of the retry/ack record, taken under one lock acquisition.
    #[inline]
    pub fn control(&self) -> Option<ConnControl> {
        self.control.read().clone()
    }

    #[inline]
    pub fn set_control(&self, control: ConnControl) {
        *self.control.write() = Some(control);
    }

    #[inline]
    pub fn tcp_stream(&self) -> Option<&TcpStream> {
        match &self.socket {
            Socket::Tcp(stream) => Some(stream),
            _ => None,
        }
    }

    #[inline]
    pub fn udp_socket(&self) -> Option<&UdpSocket> {
        match &self.socket {
            Socket::Udp { socket, .. } => Some(socket),
            _ => None,
        }
    }

    /// Writes one frame to the flow. TCP frames are back-to-back on the
    /// stream; a UDP frame is exactly one datagram.
    pub fn send(&self, data: &[u8]) -> io::Result<()> {
        match &self.socket {
            Socket::Tcp(stream) => {
                let mut stream = stream;
                stream.write_all(data)
            }
            Socket::Udp { socket, connected } => {
                let n = if *connected {
                    socket.send(data)?
                } else {
                    socket.send_to(data, self.peer())?
                };
                if n != data.len() {
                    return Err(io::ErrorKind::WriteZero.into());
                }
                Ok(())
            }
        }
    }

    /// Unique key of this flow for the connection tables.
    pub fn key(&self) -> ConnectionKey {
        if self.port == 0 {
            return ConnectionKey::default();
        }

        let peer = self.peer();
        let ip = match peer.ip() {
            IpAddr::V4(v4) => v4.octets(),
            IpAddr::V6(_) => [0u8; 4],
        };

        let mut key = [0u8; CONNECTION_KEY_SIZE];
        key[0] = self.proto as u8;
        LittleEndian::write_u16(&mut key[1..3], self.port);
        key[3..7].copy_from_slice(&ip);
        LittleEndian::write_u16(&mut key[7..9], peer.port());

        ConnectionKey(key)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the connection closed and shuts the stream down. UDP sockets
    /// have no shutdown; their receive loops poll the closed flag.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Socket::Tcp(stream) = &self.socket {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}
