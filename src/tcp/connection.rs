use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;

use crate::addr::{ConnectionKey, Endpoint, NetAddr};
use crate::header;
use crate::meta::{CONN_CHAN_BUF_SIZE, CONN_TIMEOUT, FIXED_SEQ_ACK, RETRY_INTERVAL_MS, RETRY_TIME};
use crate::result::{Error, Result};

use super::vars::{AtomicState, ConnectionState};

const CONTROL_CHAN_SIZE: usize = 32;

/// Per-peer TCP-like state machine. Owns its own inbound/outbound
/// bounded queues and runs a keep-alive background task plus an
/// internal read-adapter task that demultiplexes control frames
/// (handshake/close traffic) away from the payload stream `Read`
/// consumes.
pub struct Connection {
    key: ConnectionKey,
    state: AtomicState,
    last_update: Mutex<Instant>,

    /// Raw frames handed to this connection by the capture task.
    /// Closed (sender dropped) on teardown, which is what unblocks any
    /// thread parked in the read-adapter or a raw poll.
    raw_tx: Mutex<Option<Sender<Vec<u8>>>>,
    raw_rx: Receiver<Vec<u8>>,

    /// Payload-bearing frames, what `Read` blocks on. The sender half
    /// is optional so teardown can drop it, which is what unblocks a
    /// thread parked in `read`'s blocking receive.
    data_tx: Mutex<Option<Sender<Vec<u8>>>>,
    data_rx: Receiver<Vec<u8>>,

    /// Handshake/close control frames (SYN*, FIN*, bare ACK), consumed
    /// by Dial/Accept/CloseRequest/CloseResponse.
    control_tx: Sender<Vec<u8>>,
    control_rx: Receiver<Vec<u8>>,

    /// Frames queued for the transmit task to inject.
    outbound_tx: Sender<Vec<u8>>,
    outbound_rx: Mutex<Option<Receiver<Vec<u8>>>>,

    close_once: AtomicBool,
    read_adapter: Mutex<Option<thread::JoinHandle<()>>>,
    keep_alive: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Connection {
    pub(crate) fn new(key: ConnectionKey, state: ConnectionState) -> Arc<Self> {
        let (raw_tx, raw_rx) = bounded(CONN_CHAN_BUF_SIZE);
        let (data_tx, data_rx) = bounded(CONN_CHAN_BUF_SIZE);
        let (control_tx, control_rx) = bounded(CONTROL_CHAN_SIZE);
        let (outbound_tx, outbound_rx) = bounded(CONN_CHAN_BUF_SIZE);

        let conn = Arc::new(Self {
            key,
            state: AtomicState::new(state),
            last_update: Mutex::new(Instant::now()),
            raw_tx: Mutex::new(Some(raw_tx)),
            raw_rx,
            data_tx: Mutex::new(Some(data_tx)),
            data_rx,
            control_tx,
            control_rx,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            close_once: AtomicBool::new(false),
            read_adapter: Mutex::new(None),
            keep_alive: Mutex::new(None),
        });

        *conn.read_adapter.lock() = Some(spawn_read_adapter(conn.clone()));
        *conn.keep_alive.lock() = Some(spawn_keep_alive(conn.clone()));
        conn
    }

    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    pub fn local_addr(&self) -> impl NetAddr + 'static {
        self.key.local
    }

    pub fn remote_addr(&self) -> impl NetAddr + 'static {
        self.key.remote
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    /// No-op, like the source: this transport has no notion of a
    /// per-call deadline, only the fixed handshake/retry budget.
    pub fn set_deadline(&self, _deadline: Option<Instant>) -> Result<()> {
        Ok(())
    }

    /// No-op; see `set_deadline`.
    pub fn set_read_deadline(&self, _deadline: Option<Instant>) -> Result<()> {
        Ok(())
    }

    /// No-op; see `set_deadline`.
    pub fn set_write_deadline(&self, _deadline: Option<Instant>) -> Result<()> {
        Ok(())
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        self.state.store(next);
    }

    pub fn touch(&self) {
        *self.last_update.lock() = Instant::now();
    }

    pub fn is_timed_out(&self) -> bool {
        self.last_update.lock().elapsed() > Duration::from_secs(CONN_TIMEOUT)
    }

    /// Non-blocking offer from the capture task. Drops the newest frame
    /// silently if the queue is full — no flow control exists.
    pub(crate) fn offer_raw_inbound(&self, frame: Vec<u8>) {
        let guard = self.raw_tx.lock();
        if let Some(tx) = guard.as_ref() {
            if tx.try_send(frame).is_err() {
                warn!("inbound queue full for {}, dropping frame", self.key);
            }
        }
    }

    /// Blocking read of one payload. Returns the full payload length
    /// even if it exceeds `buf` — the overflow is dropped. Preserved
    /// quirk: no real flow control exists above the transport queues.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if self.state() != ConnectionState::Connected {
            return Err(Error::Closed);
        }
        match self.data_rx.recv() {
            Ok(payload) => {
                self.touch();
                let n = payload.len().min(buf.len());
                buf[..n].copy_from_slice(&payload[..n]);
                Ok(payload.len())
            }
            Err(_) => Err(Error::Closed),
        }
    }

    /// Blocking write of one segment, flags `PSH|ACK`. No fragmentation:
    /// callers must size writes to fit one segment.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.state() != ConnectionState::Connected {
            return Err(Error::Closed);
        }
        let frame = header::build_tcp_packet(
            self.key.local,
            self.key.remote,
            header::PSH | header::ACK,
            FIXED_SEQ_ACK,
            FIXED_SEQ_ACK,
            buf,
        )?;
        self.outbound_tx.send(frame).map_err(|_| Error::Closed)?;
        self.touch();
        Ok(buf.len())
    }

    /// Non-blocking read of one raw frame (header + payload).
    pub fn read_raw(&self, buf: &mut [u8]) -> Result<usize> {
        match self.control_rx.try_recv() {
            Ok(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(frame.len())
            }
            Err(TryRecvError::Empty) => Err(Error::WouldBlock),
            Err(TryRecvError::Disconnected) => Err(Error::Closed),
        }
    }

    /// Non-blocking send of a pre-built raw frame.
    pub fn write_raw(&self, frame: Vec<u8>) -> Result<usize> {
        let len = frame.len();
        match self.outbound_tx.try_send(frame) {
            Ok(()) => Ok(len),
            Err(TrySendError::Full(_)) => Err(Error::WouldBlock),
            Err(TrySendError::Disconnected(_)) => Err(Error::Closed),
        }
    }

    pub(crate) fn next_outbound_frame(&self) -> Option<Vec<u8>> {
        let guard = self.outbound_rx.lock();
        guard.as_ref().and_then(|rx| rx.try_recv().ok())
    }

    fn next_control_frame(&self, deadline: Instant) -> Option<Vec<u8>> {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        self.control_rx.recv_timeout(remaining).ok()
    }

    /// Active-side close handshake: send FIN, retransmit up to
    /// `RETRY_TIME` times, await `FIN|ACK`, send a final ACK.
    pub fn close_request(&self) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Ok(());
        }
        self.set_state(ConnectionState::Closing);

        let fin = header::build_tcp_packet(
            self.key.local,
            self.key.remote,
            header::FIN,
            FIXED_SEQ_ACK,
            FIXED_SEQ_ACK,
            &[],
        )?;

        let stop = Arc::new(AtomicBool::new(false));
        let retransmit = {
            let stop = stop.clone();
            let tx = self.outbound_tx.clone();
            let fin = fin.clone();
            thread::spawn(move || {
                for _ in 0..RETRY_TIME {
                    if stop.load(Ordering::Acquire) {
                        return;
                    }
                    let _ = tx.try_send(fin.clone());
                    thread::sleep(Duration::from_millis(RETRY_INTERVAL_MS));
                }
            })
        };

        let deadline = Instant::now() + Duration::from_millis(RETRY_TIME as u64 * RETRY_INTERVAL_MS);
        let mut result = Err(Error::HandshakeTimeout);
        while let Some(frame) = self.next_control_frame(deadline) {
            if let Ok(full) = header::parse_full(&frame) {
                if let Some(tcp) = full.tcp {
                    if header::flags_of(&tcp) == (header::FIN | header::ACK) {
                        result = Ok(());
                        break;
                    }
                }
            }
        }

        stop.store(true, Ordering::Release);
        let _ = retransmit.join();

        if result.is_ok() {
            let ack = header::build_tcp_packet(
                self.key.local,
                self.key.remote,
                header::ACK,
                FIXED_SEQ_ACK,
                FIXED_SEQ_ACK,
                &[],
            )?;
            let _ = self.outbound_tx.try_send(ack);
        }

        self.set_state(ConnectionState::Closed);
        result
    }

    /// Passive-side close handshake: send `FIN|ACK`, retransmit, await
    /// a plain `ACK`, tear down.
    pub fn close_response(&self) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Ok(());
        }
        self.set_state(ConnectionState::Closing);

        let fin_ack = header::build_tcp_packet(
            self.key.local,
            self.key.remote,
            header::FIN | header::ACK,
            FIXED_SEQ_ACK,
            FIXED_SEQ_ACK,
            &[],
        )?;

        let stop = Arc::new(AtomicBool::new(false));
        let retransmit = {
            let stop = stop.clone();
            let tx = self.outbound_tx.clone();
            let fin_ack = fin_ack.clone();
            thread::spawn(move || {
                for _ in 0..RETRY_TIME {
                    if stop.load(Ordering::Acquire) {
                        return;
                    }
                    let _ = tx.try_send(fin_ack.clone());
                    thread::sleep(Duration::from_millis(RETRY_INTERVAL_MS));
                }
            })
        };

        let deadline = Instant::now() + Duration::from_millis(RETRY_TIME as u64 * RETRY_INTERVAL_MS);
        let mut result = Err(Error::HandshakeTimeout);
        while let Some(frame) = self.next_control_frame(deadline) {
            if let Ok(full) = header::parse_full(&frame) {
                if let Some(tcp) = full.tcp {
                    if header::flags_of(&tcp) == header::ACK {
                        result = Ok(());
                        break;
                    }
                }
            }
        }

        stop.store(true, Ordering::Release);
        let _ = retransmit.join();

        self.teardown();
        super::server::deregister(self.key);
        result
    }

    /// Top-level close: runs the active handshake, tears down local
    /// state, and removes this connection from the Server's
    /// connection table. `Connection` only knows its own key, not the
    /// table itself — it reaches the table through the process-wide
    /// singleton rather than holding a back pointer, avoiding a
    /// reference cycle between `Connection` and `Server`.
    pub fn close(&self) -> Result<()> {
        let result = self.close_request();
        self.teardown();
        super::server::deregister(self.key);
        result
    }

    /// Closes both queues. Idempotent: a second call is a no-op.
    pub(crate) fn teardown(&self) {
        if self.close_once.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(ConnectionState::Closed);
        self.raw_tx.lock().take();
        self.data_tx.lock().take();
        self.outbound_rx.lock().take();
        if let Some(handle) = self.read_adapter.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.keep_alive.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Consumes `raw_rx`, routing control-plane frames (SYN/FIN/RST, or a
/// bare empty-payload ACK) to the control channel and payload-bearing
/// frames to the data channel `Read` consumes. A remote FIN while
/// CONNECTED triggers the passive close handshake in its own thread so
/// this loop keeps draining (it still needs to forward the peer's
/// final ACK into the control channel `close_response` is waiting on).
///
/// Control frames are only routed to `control_tx` while CONNECTING or
/// CLOSING — the two windows where `Dial`/`Accept`/`CloseRequest`/
/// `CloseResponse` actually drain that queue. Outside those windows a
/// control-shaped frame is steady-state traffic (a keep-alive
/// heartbeat is a bare empty-payload ACK, indistinguishable on the
/// wire from a close-ack) with nobody waiting on it; queuing it
/// anyway would let it sit there and be mistaken for the real
/// handshake/close-ack frame once a later window starts draining the
/// same queue.
fn spawn_read_adapter(conn: Arc<Connection>) -> thread::JoinHandle<()> {
    thread::spawn(move || loop {
        let frame = match conn.raw_rx.recv() {
            Ok(frame) => frame,
            Err(_) => return,
        };
        conn.touch();

        let full = match header::parse_full(&frame) {
            Ok(full) => full,
            Err(e) => {
                debug!("dropping unparsable frame for {}: {:?}", conn.key, e);
                continue;
            }
        };
        let tcp = match &full.tcp {
            Some(tcp) => tcp,
            None => continue,
        };
        let flags = header::flags_of(tcp);
        let state = conn.state();

        if flags & header::FIN != 0 && state == ConnectionState::Connected {
            let responder = conn.clone();
            thread::spawn(move || {
                let _ = responder.close_response();
            });
            continue;
        }

        let is_control = flags & (header::SYN | header::FIN | header::RST) != 0 || full.payload.is_empty();
        if is_control {
            let awaiting_control = matches!(state, ConnectionState::Connecting | ConnectionState::Closing);
            if awaiting_control && conn.control_tx.try_send(frame).is_err() {
                warn!("control queue full for {}, dropping control frame", conn.key);
            }
        } else {
            let guard = conn.data_tx.lock();
            if let Some(tx) = guard.as_ref() {
                if tx.try_send(full.payload.to_vec()).is_err() {
                    warn!("data queue full for {}, dropping frame", conn.key);
                }
            }
        }
    })
}

fn spawn_keep_alive(conn: Arc<Connection>) -> thread::JoinHandle<()> {
    thread::spawn(move || loop {
        match conn.state() {
            ConnectionState::Closed | ConnectionState::Closing => return,
            ConnectionState::Connected => {
                if let Ok(ack) = header::build_tcp_packet(
                    conn.key.local,
                    conn.key.remote,
                    header::ACK,
                    FIXED_SEQ_ACK,
                    FIXED_SEQ_ACK,
                    &[],
                ) {
                    let _ = conn.outbound_tx.try_send(ack);
                }
            }
            ConnectionState::Connecting => {}
        }
        thread::sleep(Duration::from_secs(1));
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn key() -> ConnectionKey {
        ConnectionKey::new(
            Endpoint::new(Ipv4Addr::new(127, 0, 0, 1), 12222),
            Endpoint::new(Ipv4Addr::new(127, 0, 0, 1), 54466),
        )
    }

    #[test]
    fn read_write_yield_end_of_stream_when_not_connected() {
        let conn = Connection::new(key(), ConnectionState::Connecting);
        let mut buf = [0u8; 16];
        assert!(matches!(conn.read(&mut buf), Err(Error::Closed)));
        assert!(matches!(conn.write(b"hi"), Err(Error::Closed)));
        conn.teardown();
    }

    #[test]
    fn write_enqueues_a_psh_ack_segment() {
        let conn = Connection::new(key(), ConnectionState::Connected);
        let n = conn.write(b"hello").expect("write");
        assert_eq!(n, 5);
        let frame = conn.next_outbound_frame().expect("frame queued");
        let full = header::parse_full(&frame).expect("parse");
        assert_eq!(full.payload, b"hello");
        assert_eq!(header::flags_of(&full.tcp.unwrap()), header::PSH | header::ACK);
        conn.teardown();
    }

    #[test]
    fn close_on_non_connected_connection_is_a_no_op() {
        let conn = Connection::new(key(), ConnectionState::Connecting);
        assert!(conn.close_request().is_ok());
        conn.teardown();
    }

    #[test]
    fn read_after_teardown_yields_end_of_stream() {
        let conn = Connection::new(key(), ConnectionState::Connected);
        conn.teardown();
        let mut buf = [0u8; 8];
        assert!(matches!(conn.read(&mut buf), Err(Error::Closed)));
    }

    #[test]
    fn read_reports_full_payload_length_even_past_buffer_capacity() {
        let conn = Connection::new(key(), ConnectionState::Connected);
        let guard = conn.data_tx.lock();
        guard.as_ref().unwrap().try_send(vec![b'x'; 2048]).unwrap();
        drop(guard);

        let mut buf = [0u8; 512];
        let n = conn.read(&mut buf).expect("read");
        assert_eq!(n, 2048, "payload length is reported even though it overflows buf");
        assert!(buf.iter().all(|&b| b == b'x'), "buf is filled up to its own capacity");
        conn.teardown();
    }

    /// Wires two `Connection`s' outbound queues to each other's raw
    /// inbound queue, simulating the wire between a local and a peer
    /// endpoint once a handshake has already put both in CONNECTED
    /// (the SYN/SYN|ACK/ACK exchange itself lives in `tcp::server`,
    /// which needs a real `DataLayer` and is out of reach here).
    fn pump(a: Arc<Connection>, b: Arc<Connection>) -> thread::JoinHandle<()> {
        thread::spawn(move || loop {
            let mut idle = true;
            if let Some(frame) = a.next_outbound_frame() {
                b.offer_raw_inbound(frame);
                idle = false;
            }
            if let Some(frame) = b.next_outbound_frame() {
                a.offer_raw_inbound(frame);
                idle = false;
            }
            if a.state() == ConnectionState::Closed && b.state() == ConnectionState::Closed {
                return;
            }
            if idle {
                thread::sleep(Duration::from_millis(2));
            }
        })
    }

    #[test]
    fn echo_round_trip_over_a_wired_connection_pair() {
        let local = Endpoint::new(Ipv4Addr::new(127, 0, 0, 1), 12222);
        let remote = Endpoint::new(Ipv4Addr::new(127, 0, 0, 1), 54466);
        let server_side = Connection::new(ConnectionKey::new(local, remote), ConnectionState::Connected);
        let client_side = Connection::new(ConnectionKey::new(remote, local), ConnectionState::Connected);
        let wire = pump(server_side.clone(), client_side.clone());

        client_side.write(b"hello").expect("client write");
        let mut buf = [0u8; 16];
        let n = server_side.read(&mut buf).expect("server read");
        assert_eq!(&buf[..n], b"hello");

        server_side.write(b"world").expect("server write");
        let n = client_side.read(&mut buf).expect("client read");
        assert_eq!(&buf[..n], b"world");

        server_side.teardown();
        client_side.teardown();
        let _ = wire.join();
    }

    #[test]
    fn close_request_drives_peer_to_closed_via_the_fin_handshake() {
        let local = Endpoint::new(Ipv4Addr::new(127, 0, 0, 1), 12222);
        let remote = Endpoint::new(Ipv4Addr::new(127, 0, 0, 1), 54466);
        let active = Connection::new(ConnectionKey::new(local, remote), ConnectionState::Connected);
        let passive = Connection::new(ConnectionKey::new(remote, local), ConnectionState::Connected);
        let wire = pump(active.clone(), passive.clone());

        active.close().expect("active close completes");
        assert_eq!(active.state(), ConnectionState::Closed);

        let mut buf = [0u8; 8];
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match passive.read(&mut buf) {
                Err(Error::Closed) => break,
                _ if Instant::now() > deadline => panic!("peer never reached end-of-stream"),
                _ => thread::sleep(Duration::from_millis(5)),
            }
        }
        assert_eq!(passive.state(), ConnectionState::Closed);
        let _ = wire.join();
    }
}
