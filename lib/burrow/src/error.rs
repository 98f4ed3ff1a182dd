use std::fmt;
use std::io;

use loam::crypto::CryptoError;

pub type Result<T> = std::result::Result<T, Error>;

/// The error taxonomy of the engine. Frame-level failures are dropped and
/// logged by the receive loops, connection-level failures tear down exactly
/// one connection, and validation failures abort startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Unknown,
    Internal,
    UnknownCommand,
    WrongHeaderSize,
    WrongPayload,
    EmptyPayload,
    WrongPayloadSize,
    WrongAcknowledgement,
    MaxFieldLen,
    WrongFieldLen,
    Unauthorized,
    HandlerNotSet,
    SessionNotExists,
    ConnectionNotExists,
    InterfaceNotExists,
    MaxConnectionAttempts,
    KeepaliveTimeoutExceeded,
    WrongPacketLength,
    WrongPacketData,
    NoPortSelectionStrategy,
    UnsupportedCompression,
    HandshakeFailed,
    Closed,
    Crypto(CryptoError),
    Validation(String),
    Io(io::ErrorKind),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Unknown => write!(f, "unknown error"),
            Error::Internal => write!(f, "internal error"),
            Error::UnknownCommand => write!(f, "unknown command"),
            Error::WrongHeaderSize => write!(f, "wrong message header size"),
            Error::WrongPayload => write!(f, "wrong message payload"),
            Error::EmptyPayload => write!(f, "empty message payload"),
            Error::WrongPayloadSize => write!(f, "wrong message payload size"),
            Error::WrongAcknowledgement => write!(f, "wrong message acknowledgement"),
            Error::MaxFieldLen => write!(f, "maximum size for byte field exceeded"),
            Error::WrongFieldLen => write!(f, "wrong byte field size"),
            Error::Unauthorized => write!(f, "invalid username or password"),
            Error::HandlerNotSet => write!(f, "handler is not set"),
            Error::SessionNotExists => write!(f, "session not exists"),
            Error::ConnectionNotExists => write!(f, "connection not exists"),
            Error::InterfaceNotExists => write!(f, "interface not exists"),
            Error::MaxConnectionAttempts => {
                write!(f, "maximum number of connection attempts exceeded")
            }
            Error::KeepaliveTimeoutExceeded => write!(f, "keepalive timeout exceeded"),
            Error::WrongPacketLength => write!(f, "wrong packet length"),
            Error::WrongPacketData => write!(f, "wrong packet data"),
            Error::NoPortSelectionStrategy => write!(f, "no port selection strategy"),
            Error::UnsupportedCompression => write!(f, "unsupported compression method"),
            Error::HandshakeFailed => write!(f, "handshake failed"),
            Error::Closed => write!(f, "closed"),
            Error::Crypto(err) => write!(f, "crypto: {}", err),
            Error::Validation(msg) => write!(f, "validation error: {}", msg),
            Error::Io(kind) => write!(f, "i/o error: {:?}", kind),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    #[inline]
    fn from(err: io::Error) -> Self {
        Error::Io(err.kind())
    }
}

impl From<CryptoError> for Error {
    #[inline]
    fn from(err: CryptoError) -> Self {
        Error::Crypto(err)
    }
}

impl Error {
    /// True for failures that end a transport flow: EOF, resets, timeouts
    /// and locally closed sockets. Everything else is frame-local.
    pub fn is_interrupting(&self) -> bool {
        match self {
            Error::Closed => true,
            Error::Io(kind) => matches!(
                kind,
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// The one-byte error code carried by error frames.
    pub fn wire_code(&self) -> u8 {
        match self {
            Error::WrongPayload => 0x01,
            Error::UnknownCommand => 0x02,
            Error::Unauthorized => 0x03,
            Error::Internal => 0x04,
            _ => 0xff,
        }
    }

    /// Maps a received error code back onto the taxonomy.
    pub fn from_wire_code(code: u8) -> Error {
        match code {
            0x01 => Error::WrongPayload,
            0x02 => Error::UnknownCommand,
            0x03 => Error::Unauthorized,
            0x04 => Error::Internal,
            _ => Error::Unknown,
        }
    }
}

/// True when an `io::Error` signals a dead flow rather than a transient
/// hiccup.
#[inline]
pub fn is_interrupting_io(err: &io::Error) -> bool {
    Error::Io(err.kind()).is_interrupting()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_code_roundtrip() {
        for err in &[
            Error::WrongPayload,
            Error::UnknownCommand,
            Error::Unauthorized,
            Error::Internal,
        ] {
            assert_eq!(&Error::from_wire_code(err.wire_code()), err);
        }
        assert_eq!(Error::from_wire_code(0xab), Error::Unknown);
    }

    #[test]
    fn test_interrupting() {
        assert!(Error::Io(io::ErrorKind::UnexpectedEof).is_interrupting());
        assert!(Error::Closed.is_interrupting());
        assert!(!Error::WrongPayload.is_interrupting());
        assert!(!Error::Unauthorized.is_interrupting());
    }
}
