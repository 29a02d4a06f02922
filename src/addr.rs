use std::fmt;
use std::net::Ipv4Addr;

/// The network-address contract connections and listeners expose to
/// callers, mirroring the shape of `std::net::SocketAddr` plus the
/// `network()` tag Go's `net.Addr` interface carries.
pub trait NetAddr: fmt::Display {
    fn network(&self) -> &'static str {
        "ptcp"
    }
}

/// An IPv4 address and port, the unit of identity for one end of a
/// connection. Stringifies as `a.b.c.d:port`.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct Endpoint {
    ip: Ipv4Addr,
    port: u16,
}

impl Endpoint {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Parses `"a.b.c.d:port"`.
    pub fn parse(s: &str) -> crate::result::Result<Self> {
        let (ip_part, port_part) = s
            .rsplit_once(':')
            .ok_or(crate::result::Error::PacketTooShort)?;
        let ip: Ipv4Addr = ip_part
            .parse()
            .map_err(|_| crate::result::Error::PacketTooShort)?;
        let port: u16 = port_part
            .parse()
            .map_err(|_| crate::result::Error::PacketTooShort)?;
        Ok(Self::new(ip, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl NetAddr for Endpoint {}

/// Identity of a connection: the ordered pair (local, remote). Used as
/// the registry lookup key; canonical string form is `local:remote`.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct ConnectionKey {
    pub local: Endpoint,
    pub remote: Endpoint,
}

impl ConnectionKey {
    pub fn new(local: Endpoint, remote: Endpoint) -> Self {
        Self { local, remote }
    }

    /// Builds the key from the perspective of the local host: the
    /// packet's destination is local, its source is remote.
    pub fn from_packet_perspective(dst: Endpoint, src: Endpoint) -> Self {
        Self::new(dst, src)
    }

    /// The key an outbound connection uses: its own local/remote pair
    /// reversed, i.e. as seen on the wire (src = local, dst = remote).
    pub fn reversed(&self) -> Self {
        Self::new(self.remote, self.local)
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_round_trips_through_display_and_parse() {
        let ep = Endpoint::new(Ipv4Addr::new(127, 0, 0, 1), 12222);
        assert_eq!(ep.to_string(), "127.0.0.1:12222");
        assert_eq!(Endpoint::parse("127.0.0.1:12222").unwrap(), ep);
    }

    #[test]
    fn connection_key_equality_is_componentwise() {
        let a = Endpoint::new(Ipv4Addr::new(127, 0, 0, 1), 1);
        let b = Endpoint::new(Ipv4Addr::new(127, 0, 0, 1), 2);
        let k1 = ConnectionKey::new(a, b);
        let k2 = ConnectionKey::new(a, b);
        assert_eq!(k1, k2);
        assert_ne!(k1, ConnectionKey::new(b, a));
    }
}
