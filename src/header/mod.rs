//! IPv4/TCP/UDP header parsing and building.
//!
//! Pure codec: no I/O, no allocation beyond the buffer `build_tcp_packet`
//! returns. Checksums (IP header checksum, TCP pseudo-header checksum)
//! are computed by `etherparse`'s serialization path rather than
//! hand-rolled, since it already implements RFC 1071 correctly.

use std::net::Ipv4Addr;

use etherparse::{Ipv4Header, Ipv4HeaderSlice, IpTrafficClass, TcpHeader, TcpHeaderSlice, UdpHeaderSlice};

use crate::addr::Endpoint;
use crate::net_types::Protocol;
use crate::result::{Error, Result};

pub const FIN: u8 = 0x01;
pub const SYN: u8 = 0x02;
pub const RST: u8 = 0x04;
pub const PSH: u8 = 0x08;
pub const ACK: u8 = 0x10;

/// The fully parsed view of one captured frame, per `parse_full`.
pub struct ParsedSegment<'a> {
    pub protocol: Protocol,
    pub ip: Ipv4HeaderSlice<'a>,
    pub tcp: Option<TcpHeaderSlice<'a>>,
    pub udp: Option<UdpHeaderSlice<'a>>,
    /// Payload slice, bounded by the IP header's total-length field,
    /// not by the length of the input buffer.
    pub payload: &'a [u8],
}

fn ipv4_slice(bytes: &[u8]) -> Result<Ipv4HeaderSlice> {
    if bytes.len() < 20 {
        return Err(Error::PacketTooShort);
    }
    Ok(Ipv4HeaderSlice::from_slice(bytes)?)
}

/// Parses just enough of a frame to route it: protocol and the two
/// endpoints, as seen from the packet (not yet reoriented to
/// local/remote). Fails with `PacketTooShort` if the buffer is under
/// 20 bytes, `UnsupportedProtocol` if the IP protocol is neither TCP
/// (6) nor UDP (17).
pub fn parse_base(bytes: &[u8]) -> Result<(Protocol, Endpoint, Endpoint)> {
    let ip = ipv4_slice(bytes)?;
    let header_len = ip.slice().len();
    let rest = &bytes[header_len..];

    match Protocol::from(ip.protocol()) {
        Protocol::TCP => {
            let tcp = TcpHeaderSlice::from_slice(rest)?;
            let src = Endpoint::new(ip.source_addr(), tcp.source_port());
            let dst = Endpoint::new(ip.destination_addr(), tcp.destination_port());
            Ok((Protocol::TCP, src, dst))
        }
        Protocol::UDP => {
            let udp = UdpHeaderSlice::from_slice(rest)?;
            let src = Endpoint::new(ip.source_addr(), udp.source_port());
            let dst = Endpoint::new(ip.destination_addr(), udp.destination_port());
            Ok((Protocol::UDP, src, dst))
        }
        _ => Err(Error::UnsupportedProtocol(ip.protocol())),
    }
}

/// Full structured parse: IP header, transport header (TCP or UDP),
/// and the payload slice bounded by the IP total-length field.
pub fn parse_full(bytes: &[u8]) -> Result<ParsedSegment> {
    let ip = ipv4_slice(bytes)?;
    let ip_header_len = ip.slice().len();
    let total_len = ip.total_len() as usize;
    let bounded = if total_len > 0 && total_len <= bytes.len() {
        &bytes[..total_len]
    } else {
        bytes
    };
    let rest = &bounded[ip_header_len..];

    match Protocol::from(ip.protocol()) {
        Protocol::TCP => {
            let tcp = TcpHeaderSlice::from_slice(rest)?;
            let tcp_header_len = tcp.slice().len();
            Ok(ParsedSegment {
                protocol: Protocol::TCP,
                ip,
                tcp: Some(tcp),
                udp: None,
                payload: &rest[tcp_header_len..],
            })
        }
        Protocol::UDP => {
            let udp = UdpHeaderSlice::from_slice(rest)?;
            let udp_header_len = udp.slice().len();
            Ok(ParsedSegment {
                protocol: Protocol::UDP,
                ip,
                tcp: None,
                udp: Some(udp),
                payload: &rest[udp_header_len..],
            })
        }
        _ => Err(Error::UnsupportedProtocol(ip.protocol())),
    }
}

/// Reads the flag bitmask (`FIN|SYN|RST|PSH|ACK`) off a parsed TCP
/// header slice, matching the `build_tcp_packet` flags argument shape.
pub fn flags_of(tcp: &TcpHeaderSlice) -> u8 {
    let mut flags = 0u8;
    if tcp.fin() {
        flags |= FIN;
    }
    if tcp.syn() {
        flags |= SYN;
    }
    if tcp.rst() {
        flags |= RST;
    }
    if tcp.psh() {
        flags |= PSH;
    }
    if tcp.ack() {
        flags |= ACK;
    }
    flags
}

/// Builds a single IPv4+TCP frame: version 4, IHL 5, TTL 64, protocol
/// 6, data offset 5, fixed window, checksums computed.
pub fn build_tcp_packet(
    src: Endpoint,
    dst: Endpoint,
    flags: u8,
    seq: u32,
    ack: u32,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let mut tcp_header = TcpHeader::new(src.port(), dst.port(), seq, crate::meta::FIXED_WINDOW_SIZE);
    tcp_header.fin = flags & FIN != 0;
    tcp_header.syn = flags & SYN != 0;
    tcp_header.rst = flags & RST != 0;
    tcp_header.psh = flags & PSH != 0;
    tcp_header.ack = flags & ACK != 0;
    tcp_header.acknowledgment_number = ack;

    let mut ip_header = Ipv4Header::new(
        tcp_header.header_len(),
        crate::meta::DEFAULT_TIME_TO_LIVE,
        IpTrafficClass::Tcp,
        ip_octets(src.ip()),
        ip_octets(dst.ip()),
    );
    ip_header.set_payload_len(tcp_header.header_len() as usize + payload.len())?;

    tcp_header.checksum = tcp_header.calc_checksum_ipv4(&ip_header, payload)?;

    let mut out = Vec::with_capacity(ip_header.header_len() + tcp_header.header_len() as usize + payload.len());
    ip_header.write(&mut out)?;
    tcp_header.write(&mut out)?;
    out.extend_from_slice(payload);
    Ok(out)
}

fn ip_octets(ip: Ipv4Addr) -> [u8; 4] {
    ip.octets()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ep(a: u8, b: u8, c: u8, d: u8, port: u16) -> Endpoint {
        Endpoint::new(Ipv4Addr::new(a, b, c, d), port)
    }

    #[test]
    fn build_then_parse_round_trips_addresses_and_flags() {
        let src = ep(127, 0, 0, 1, 54466);
        let dst = ep(127, 0, 0, 1, 12222);
        let frame = build_tcp_packet(src, dst, SYN, 1, 0, b"").expect("build");

        let (proto, parsed_src, parsed_dst) = parse_base(&frame).expect("parse_base");
        assert_eq!(proto, Protocol::TCP);
        assert_eq!(parsed_src, src);
        assert_eq!(parsed_dst, dst);

        let full = parse_full(&frame).expect("parse_full");
        let tcp = full.tcp.expect("tcp header");
        assert_eq!(flags_of(&tcp), SYN);
        assert!(full.payload.is_empty());
    }

    #[test]
    fn build_tcp_packet_carries_payload_and_psh_ack() {
        let src = ep(10, 0, 0, 1, 1000);
        let dst = ep(10, 0, 0, 2, 2000);
        let frame = build_tcp_packet(src, dst, PSH | ACK, 1, 1, b"hello").expect("build");

        let full = parse_full(&frame).expect("parse_full");
        assert_eq!(full.payload, b"hello");
        assert_eq!(flags_of(&full.tcp.unwrap()), PSH | ACK);
    }

    #[test]
    fn rejects_short_buffers() {
        let err = parse_base(&[0u8; 4]).unwrap_err();
        matches!(err, Error::PacketTooShort);
    }

    #[test]
    fn ip_header_checksum_is_zero_over_itself() {
        let src = ep(192, 168, 1, 1, 1);
        let dst = ep(192, 168, 1, 2, 2);
        let frame = build_tcp_packet(src, dst, ACK, 1, 1, b"").expect("build");
        let ip = ipv4_slice(&frame).expect("ip slice");
        let header_len = ip.slice().len();
        let sum = checksum_over(&frame[..header_len]);
        assert_eq!(sum, 0);
    }

    fn checksum_over(bytes: &[u8]) -> u16 {
        let mut sum: u32 = 0;
        let mut iter = bytes.chunks(2);
        for chunk in &mut iter {
            let word = if chunk.len() == 2 {
                u16::from_be_bytes([chunk[0], chunk[1]])
            } else {
                u16::from_be_bytes([chunk[0], 0])
            };
            sum += word as u32;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        !(sum as u16)
    }
}
