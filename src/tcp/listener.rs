use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::addr::Endpoint;
use crate::result::{Error, Result};

use super::connection::Connection;

/// Backlog size for a listener's accept queue.
const ACCEPT_BACKLOG: usize = 128;

/// Passive-open endpoint: a bound local address and a bounded queue of
/// newly-established connections, filled by the Server's capture task
/// once it has driven the SYN/SYN|ACK/ACK exchange to completion.
pub struct Listener {
    local: Endpoint,
    accept_tx: Sender<Arc<Connection>>,
    accept_rx: Mutex<Option<Receiver<Arc<Connection>>>>,
}

impl Listener {
    pub(crate) fn new(local: Endpoint) -> Arc<Self> {
        let (accept_tx, accept_rx) = bounded(ACCEPT_BACKLOG);
        Arc::new(Self {
            local,
            accept_tx,
            accept_rx: Mutex::new(Some(accept_rx)),
        })
    }

    pub fn local_addr(&self) -> Endpoint {
        self.local
    }

    /// Offers a newly-established connection to the accept queue.
    /// Non-blocking: drops the connection (closing it) if the backlog
    /// is full.
    pub(crate) fn offer(&self, conn: Arc<Connection>) {
        if let Err(e) = self.accept_tx.try_send(conn) {
            warn!("accept queue full for listener on {}, dropping connection", self.local);
            if let crossbeam_channel::TrySendError::Full(conn) = e {
                let key = conn.key();
                conn.teardown();
                super::server::deregister(key);
            }
        }
    }

    /// Blocks until a new connection, already CONNECTED, is available.
    pub fn accept(&self) -> Result<Arc<Connection>> {
        let guard = self.accept_rx.lock();
        let rx = match guard.as_ref() {
            Some(rx) => rx.clone(),
            None => return Err(Error::Closed),
        };
        drop(guard);
        rx.recv().map_err(|_| Error::Closed)
    }

    /// Removes this listener from the Server's listener table, drains
    /// and closes every still-queued connection, and closes the
    /// accept queue so a blocked `accept` unblocks with `Closed`.
    /// No other part of this crate calls this automatically — callers
    /// that want queued-but-unaccepted connections cleaned up on
    /// shutdown need to call it explicitly.
    pub fn close(&self) {
        super::server::deregister_listener(self.local);
        if let Some(rx) = self.accept_rx.lock().take() {
            while let Ok(conn) = rx.try_recv() {
                conn.teardown();
            }
        }
    }
}
