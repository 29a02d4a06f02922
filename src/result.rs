use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    StdIOError(std::io::Error),
    WriteError(etherparse::WriteError),
    ReadError(etherparse::ReadError),
    ValueError(etherparse::ValueError),
    /// Raw buffer shorter than the minimum IPv4 header (20 bytes).
    PacketTooShort,
    /// Computed checksum did not match the one carried on the wire.
    BadChecksum,
    /// IP protocol field was neither TCP (6) nor UDP (17).
    UnsupportedProtocol(u8),
    /// `Listen` on a local endpoint that already has a listener bound.
    AddressInUse,
    /// Dial or Close did not complete within its retransmit budget.
    HandshakeTimeout,
    /// Read/Write attempted on a connection that is not CONNECTED.
    Closed,
    /// Internal non-blocking queue was momentarily empty/full.
    WouldBlock,
    /// `proto` argument to Listen/Dial was not `"ptcp"`.
    UnsupportedNetwork,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::StdIOError(e) => write!(f, "io error: {}", e),
            Error::WriteError(e) => write!(f, "header write error: {:?}", e),
            Error::ReadError(e) => write!(f, "header read error: {:?}", e),
            Error::ValueError(e) => write!(f, "header value error: {:?}", e),
            Error::PacketTooShort => write!(f, "packet too short"),
            Error::BadChecksum => write!(f, "bad checksum"),
            Error::UnsupportedProtocol(p) => write!(f, "unsupported protocol: id={}", p),
            Error::AddressInUse => write!(f, "address already in use"),
            Error::HandshakeTimeout => write!(f, "handshake timeout"),
            Error::Closed => write!(f, "use of closed connection"),
            Error::WouldBlock => write!(f, "operation would block"),
            Error::UnsupportedNetwork => write!(f, "unsupported network, expected \"ptcp\""),
        }
    }
}

impl std::error::Error for Error {}

macro_rules! impl_error {
    ($err:ty,$en:ident) => {
        impl From<$err> for Error {
            fn from(err: $err) -> Self {
                Error::$en(err)
            }
        }
    };
}

impl_error!(std::io::Error, StdIOError);
impl_error!(etherparse::WriteError, WriteError);
impl_error!(etherparse::ReadError, ReadError);
impl_error!(etherparse::ValueError, ValueError);
