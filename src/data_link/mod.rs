//! The raw send/receive primitive the protocol core is built against.
//!
//! `receive_frame`/`transmit_frame` bind to a named interface. The
//! protocol core (header codec, connection state machine, server)
//! only ever talks to this trait, never to `tun_tap::Iface` directly,
//! so the capture/injection primitive stays swappable (e.g. for
//! tests, see `server::tests`).

use std::io::Result;

use crate::meta::{ETHERNET_MTU, TUN_SIZE};

pub trait DataLayer: Send {
    /// Injects one raw IP frame onto the interface.
    fn transmit_frame(&mut self, frame: &[u8]) -> Result<usize>;

    /// Blocks until one raw IP frame is available, copies it into
    /// `buf`, and returns its length.
    fn receive_frame(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// `DataLayer` backed by a Linux TUN device via `tun_tap`.
///
/// `tun_tap::Iface` frames carry a 4-byte protocol-info header ahead of
/// the IP packet (see the kernel's `Documentation/networking/tuntap.rst`,
/// section 3.2). This wrapper strips it on receive and re-prepends it
/// on transmit, so everything above this module deals only in raw
/// IPv4 frames.
pub struct TunInterface {
    iface: tun_tap::Iface,
}

impl TunInterface {
    pub fn new(name: &str) -> Result<Self> {
        let iface = tun_tap::Iface::new(name, tun_tap::Mode::Tun)?;
        Ok(Self { iface })
    }
}

impl DataLayer for TunInterface {
    fn transmit_frame(&mut self, frame: &[u8]) -> Result<usize> {
        let mut framed = Vec::with_capacity(TUN_SIZE + frame.len());
        // IFF_TUN, no checksum offload, IPv4: flags=0, proto=ETH_P_IP.
        framed.extend_from_slice(&0u16.to_be_bytes());
        framed.extend_from_slice(&0x0800u16.to_be_bytes());
        framed.extend_from_slice(frame);
        self.iface.send(&framed)
    }

    fn receive_frame(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut raw = [0u8; ETHERNET_MTU + TUN_SIZE];
        let n = self.iface.recv(&mut raw)?;
        let payload_len = n.saturating_sub(TUN_SIZE);
        let copy_len = payload_len.min(buf.len());
        buf[..copy_len].copy_from_slice(&raw[TUN_SIZE..TUN_SIZE + copy_len]);
        Ok(payload_len)
    }
}
