//! Sockets to and from RPC peers.
//!
//! - `address`: endpoints and host name resolution
//! - `bind`: local port selection for outgoing sockets
//! - `connection`: one connected stream or packet socket
//! - `listener`: accepting inbound stream connections

pub mod address;
pub mod bind;
pub mod connection;
pub mod listener;

pub use address::{AddressResolver, PeerAddress, Protocol, NFS_PORT};
pub use bind::BindPolicy;
pub use connection::Connection;
pub use listener::ConnectionListener;
