#[macro_use]
extern crate log;
extern crate pretty_env_logger;

pub mod addr;
pub mod data_link;
pub mod header;
pub mod meta;
pub mod net_types;
pub mod result;
pub mod tcp;

pub use addr::{ConnectionKey, Endpoint, NetAddr};
pub use result::{Error, Result};
pub use tcp::connection::Connection;
pub use tcp::listener::Listener;
pub use tcp::vars::ConnectionState;

pub fn init_log() {
    pretty_env_logger::init();
}

/// Opens `interface_name` as a TUN device and starts the background
/// capture/transmit/eviction tasks. Must be called once before
/// `listen`/`dial`; later calls are no-ops.
pub fn init(interface_name: &str) -> Result<()> {
    tcp::server::init(interface_name)
}

/// Binds a passive-open endpoint on `local`. `proto` must be `"ptcp"`.
pub fn listen(proto: &str, local: &str) -> Result<std::sync::Arc<Listener>> {
    tcp::server::listen(proto, local)
}

/// Actively opens a connection to `remote`. `proto` must be `"ptcp"`.
pub fn dial(proto: &str, remote: &str) -> Result<std::sync::Arc<Connection>> {
    tcp::server::dial(proto, remote)
}
