use std::sync::atomic::{AtomicU8, Ordering};

/// Connection lifecycle state. Strictly monotonic: a connection's state
/// sequence is always a prefix of `Connecting -> Connected -> Closing
/// -> Closed`; no state is ever re-entered.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Atomic holder for `ConnectionState`, read often (capture task,
/// keep-alive task) and written rarely (state machine transitions).
#[derive(Debug)]
pub struct AtomicState(AtomicU8);

impl AtomicState {
    pub fn new(initial: ConnectionState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Advances to `next` unconditionally. Transitions only ever move
    /// forward in the state sequence; callers are responsible for only
    /// calling this with a state later than the current one.
    pub fn store(&self, next: ConnectionState) {
        self.0.store(next as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_only_advance() {
        let s = AtomicState::new(ConnectionState::Connecting);
        assert_eq!(s.load(), ConnectionState::Connecting);
        s.store(ConnectionState::Connected);
        assert_eq!(s.load(), ConnectionState::Connected);
        assert!(ConnectionState::Connected > ConnectionState::Connecting);
        assert!(ConnectionState::Closed > ConnectionState::Closing);
    }
}
