use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use rand::Rng;

use crate::addr::{ConnectionKey, Endpoint};
use crate::data_link::{DataLayer, TunInterface};
use crate::header;
use crate::meta::{EPHEMERAL_PORT_HIGH, EPHEMERAL_PORT_LOW, RETRY_INTERVAL_MS, RETRY_TIME};
use crate::net_types::Protocol;
use crate::result::{Error, Result};

use super::connection::Connection;
use super::listener::Listener;
use super::vars::ConnectionState;

/// Local IP used as the source address of a dialed connection. Nothing
/// resolves a real interface address here; every example dials and
/// listens on loopback, so this crate does the same rather than invent
/// interface-address discovery nothing else needs.
const DEFAULT_LOCAL_IP: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

static SERVER: OnceCell<Arc<Server>> = OnceCell::new();

/// Process-wide singleton: owns the raw interface, the connection
/// table, the listener table, and the capture/transmit/sweep tasks.
pub struct Server {
    data_layer: Mutex<Box<dyn DataLayer>>,
    connections: RwLock<HashMap<ConnectionKey, Arc<Connection>>>,
    listeners: RwLock<HashMap<Endpoint, Arc<Listener>>>,
    local_ip: Ipv4Addr,
}

impl Server {
    fn global() -> Option<Arc<Server>> {
        SERVER.get().cloned()
    }

    fn require_global() -> Result<Arc<Server>> {
        Self::global().ok_or(Error::Closed)
    }
}

/// Idempotent global initialization: opens the raw interface and
/// starts the capture, transmit, and idle-eviction sweep threads. Must
/// be called before `listen`/`dial`.
pub fn init(interface_name: &str) -> Result<()> {
    if SERVER.get().is_some() {
        return Ok(());
    }
    let data_layer = TunInterface::new(interface_name)?;
    let server = Arc::new(Server {
        data_layer: Mutex::new(Box::new(data_layer)),
        connections: RwLock::new(HashMap::new()),
        listeners: RwLock::new(HashMap::new()),
        local_ip: DEFAULT_LOCAL_IP,
    });

    spawn_capture_task(server.clone());
    spawn_transmit_task(server.clone());
    spawn_sweep_task(server.clone());

    // Another thread may have raced us to init; either outcome leaves
    // a correctly-running Server installed, so ignore the failure.
    let _ = SERVER.set(server);
    Ok(())
}

/// Registers a listener on `local`. Errors if already bound.
pub fn listen(proto: &str, local: &str) -> Result<Arc<Listener>> {
    if proto != "ptcp" {
        return Err(Error::UnsupportedNetwork);
    }
    let server = Server::require_global()?;
    let endpoint = Endpoint::parse(local)?;

    let mut listeners = server.listeners.write();
    if listeners.contains_key(&endpoint) {
        return Err(Error::AddressInUse);
    }
    let listener = Listener::new(endpoint);
    listeners.insert(endpoint, listener.clone());
    info!("listening on {}", endpoint);
    Ok(listener)
}

/// Actively opens a connection to `remote`: picks an ephemeral local
/// port, sends SYN retransmits up to `RETRY_TIME` times, and awaits
/// `SYN|ACK`.
pub fn dial(proto: &str, remote: &str) -> Result<Arc<Connection>> {
    if proto != "ptcp" {
        return Err(Error::UnsupportedNetwork);
    }
    let server = Server::require_global()?;
    let remote = Endpoint::parse(remote)?;

    let local = pick_ephemeral_endpoint(&server)?;
    let key = ConnectionKey::new(local, remote);
    let conn = Connection::new(key, ConnectionState::Connecting);
    server.connections.write().insert(key, conn.clone());

    let syn = header::build_tcp_packet(local, remote, header::SYN, 1, 0, &[])?;
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let retransmit = {
        let stop = stop.clone();
        let conn = conn.clone();
        let syn = syn.clone();
        thread::spawn(move || {
            for _ in 0..RETRY_TIME {
                if stop.load(std::sync::atomic::Ordering::Acquire) {
                    return;
                }
                let _ = conn.write_raw(syn.clone());
                thread::sleep(Duration::from_millis(RETRY_INTERVAL_MS));
            }
        })
    };

    let deadline =
        std::time::Instant::now() + Duration::from_millis(RETRY_TIME as u64 * RETRY_INTERVAL_MS);
    let mut result = Err(Error::HandshakeTimeout);
    loop {
        let remaining = match deadline.checked_duration_since(std::time::Instant::now()) {
            Some(d) => d,
            None => break,
        };
        thread::sleep(remaining.min(Duration::from_millis(10)));
        let mut buf = [0u8; crate::meta::ETHERNET_MTU];
        match conn.read_raw(&mut buf) {
            Ok(n) => {
                if let Ok(full) = header::parse_full(&buf[..n]) {
                    if let Some(tcp) = full.tcp {
                        if header::flags_of(&tcp) == (header::SYN | header::ACK) {
                            result = Ok(());
                            break;
                        }
                    }
                }
            }
            Err(Error::Closed) => break,
            Err(_) => {}
        }
    }

    stop.store(true, std::sync::atomic::Ordering::Release);
    let _ = retransmit.join();

    match result {
        Ok(()) => {
            let ack = header::build_tcp_packet(local, remote, header::ACK, 1, 1, &[])?;
            let _ = conn.write_raw(ack);
            conn.touch();
            conn.set_state(ConnectionState::Connected);
            debug!("dial to {} connected, local {}", remote, local);
            Ok(conn)
        }
        Err(e) => {
            server.connections.write().remove(&key);
            conn.teardown();
            warn!("dial to {} timed out", remote);
            Err(e)
        }
    }
}

fn pick_ephemeral_endpoint(server: &Server) -> Result<Endpoint> {
    let mut rng = rand::thread_rng();
    let connections = server.connections.read();
    for _ in 0..64 {
        let port = rng.gen_range(EPHEMERAL_PORT_LOW, EPHEMERAL_PORT_HIGH);
        let candidate = Endpoint::new(server.local_ip, port);
        if !connections.values().any(|c| c.key().local == candidate) {
            return Ok(candidate);
        }
    }
    Err(Error::AddressInUse)
}

/// Removes `key` from the connection table, if present. Used by
/// `Connection::close`/`close_response` to deregister themselves
/// through the singleton rather than a back pointer.
pub(crate) fn deregister(key: ConnectionKey) {
    if let Some(server) = Server::global() {
        server.connections.write().remove(&key);
    }
}

/// Removes the listener bound to `local`, if present.
pub(crate) fn deregister_listener(local: Endpoint) {
    if let Some(server) = Server::global() {
        server.listeners.write().remove(&local);
    }
}

fn spawn_capture_task(server: Arc<Server>) {
    thread::spawn(move || loop {
        let mut buf = [0u8; crate::meta::ETHERNET_MTU];
        let n = {
            let mut data_layer = server.data_layer.lock();
            match data_layer.receive_frame(&mut buf) {
                Ok(n) => n,
                Err(e) => {
                    warn!("capture: interface read error: {}", e);
                    continue;
                }
            }
        };
        handle_frame(&server, &buf[..n]);
    });
}

fn handle_frame(server: &Arc<Server>, frame: &[u8]) {
    let (protocol, pkt_src, pkt_dst) = match header::parse_base(frame) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("capture: dropping unparsable frame: {:?}", e);
            return;
        }
    };
    if protocol != Protocol::TCP {
        trace!("capture: dropping non-TCP frame, protocol unused for ptcp routing");
        return;
    }

    let key = ConnectionKey::from_packet_perspective(pkt_dst, pkt_src);
    if let Some(conn) = server.connections.read().get(&key).cloned() {
        conn.offer_raw_inbound(frame.to_vec());
        return;
    }

    let listener = match server.listeners.read().get(&pkt_dst).cloned() {
        Some(listener) => listener,
        None => {
            debug!("capture: no connection or listener for {}, dropping", key);
            return;
        }
    };

    let full = match header::parse_full(frame) {
        Ok(full) => full,
        Err(e) => {
            debug!("capture: dropping unparsable frame: {:?}", e);
            return;
        }
    };
    let tcp = match full.tcp {
        Some(tcp) => tcp,
        None => return,
    };
    if header::flags_of(&tcp) & header::SYN == 0 {
        return;
    }

    let server = server.clone();
    thread::spawn(move || passive_accept(server, listener, key));
}

/// Drives the passive SYN / SYN|ACK / ACK exchange for one inbound
/// SYN, then enqueues the resulting CONNECTED connection on the
/// listener's accept queue.
fn passive_accept(server: Arc<Server>, listener: Arc<Listener>, key: ConnectionKey) {
    let conn = Connection::new(key, ConnectionState::Connecting);
    server.connections.write().insert(key, conn.clone());

    let syn_ack = match header::build_tcp_packet(key.local, key.remote, header::SYN | header::ACK, 1, 1, &[]) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("passive accept: failed to build SYN|ACK: {}", e);
            server.connections.write().remove(&key);
            conn.teardown();
            return;
        }
    };

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let retransmit = {
        let stop = stop.clone();
        let conn = conn.clone();
        let syn_ack = syn_ack.clone();
        thread::spawn(move || {
            for _ in 0..RETRY_TIME {
                if stop.load(std::sync::atomic::Ordering::Acquire) {
                    return;
                }
                let _ = conn.write_raw(syn_ack.clone());
                thread::sleep(Duration::from_millis(RETRY_INTERVAL_MS));
            }
        })
    };

    let deadline =
        std::time::Instant::now() + Duration::from_millis(RETRY_TIME as u64 * RETRY_INTERVAL_MS);
    let mut connected = false;
    loop {
        let remaining = match deadline.checked_duration_since(std::time::Instant::now()) {
            Some(d) => d,
            None => break,
        };
        thread::sleep(remaining.min(Duration::from_millis(10)));
        let mut buf = [0u8; crate::meta::ETHERNET_MTU];
        match conn.read_raw(&mut buf) {
            Ok(n) => {
                if let Ok(full) = header::parse_full(&buf[..n]) {
                    if let Some(tcp) = full.tcp {
                        if header::flags_of(&tcp) == header::ACK {
                            connected = true;
                            break;
                        }
                    }
                }
            }
            Err(Error::Closed) => break,
            Err(_) => {}
        }
    }

    stop.store(true, std::sync::atomic::Ordering::Release);
    let _ = retransmit.join();

    if connected {
        conn.touch();
        conn.set_state(ConnectionState::Connected);
        info!("accepted new connection {}", key);
        listener.offer(conn);
    } else {
        warn!("passive accept for {} timed out", key);
        server.connections.write().remove(&key);
        conn.teardown();
    }
}

fn spawn_transmit_task(server: Arc<Server>) {
    thread::spawn(move || loop {
        let conns: Vec<Arc<Connection>> = server.connections.read().values().cloned().collect();
        if conns.is_empty() {
            thread::sleep(Duration::from_millis(5));
            continue;
        }
        for conn in &conns {
            if let Some(frame) = conn.next_outbound_frame() {
                let mut data_layer = server.data_layer.lock();
                if let Err(e) = data_layer.transmit_frame(&frame) {
                    warn!("transmit: interface write error: {}", e);
                }
            }
        }
    });
}

fn spawn_sweep_task(server: Arc<Server>) {
    thread::spawn(move || loop {
        thread::sleep(Duration::from_secs(1));
        let timed_out: Vec<ConnectionKey> = server
            .connections
            .read()
            .iter()
            .filter(|(_, conn)| conn.is_timed_out())
            .map(|(key, _)| *key)
            .collect();
        for key in timed_out {
            if let Some(conn) = server.connections.write().remove(&key) {
                debug!("evicting idle connection {}", key);
                conn.teardown();
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory `DataLayer` double: never yields a frame, accepts
    /// every write. Exercises the table/lookup logic below without
    /// opening a real TUN device, the seam `DataLayer` exists for.
    struct NullDataLayer;

    impl DataLayer for NullDataLayer {
        fn transmit_frame(&mut self, frame: &[u8]) -> std::io::Result<usize> {
            Ok(frame.len())
        }

        fn receive_frame(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            std::thread::park_timeout(Duration::from_secs(3600));
            Ok(0)
        }
    }

    fn bare_server() -> Server {
        Server {
            data_layer: Mutex::new(Box::new(NullDataLayer)),
            connections: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            local_ip: DEFAULT_LOCAL_IP,
        }
    }

    #[test]
    fn dial_rejects_unsupported_proto() {
        assert!(matches!(
            dial("tcp", "127.0.0.1:9"),
            Err(Error::UnsupportedNetwork)
        ));
    }

    #[test]
    fn listen_rejects_unsupported_proto() {
        assert!(matches!(
            listen("udp", "127.0.0.1:9"),
            Err(Error::UnsupportedNetwork)
        ));
    }

    #[test]
    fn pick_ephemeral_endpoint_avoids_in_use_ports() {
        let server = bare_server();
        let taken = pick_ephemeral_endpoint(&server).expect("first pick succeeds");
        assert!(taken.port() >= EPHEMERAL_PORT_LOW && taken.port() < EPHEMERAL_PORT_HIGH);

        let conn = Connection::new(
            ConnectionKey::new(taken, Endpoint::new(DEFAULT_LOCAL_IP, 1)),
            ConnectionState::Connecting,
        );
        server.connections.write().insert(conn.key(), conn.clone());

        for _ in 0..32 {
            let next = pick_ephemeral_endpoint(&server).expect("pick still succeeds");
            assert_ne!(next, taken);
        }
        conn.teardown();
    }

    #[test]
    fn deregister_on_unknown_key_is_a_no_op() {
        deregister(ConnectionKey::new(
            Endpoint::new(DEFAULT_LOCAL_IP, 1),
            Endpoint::new(DEFAULT_LOCAL_IP, 2),
        ));
    }
}
