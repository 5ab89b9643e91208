//! NFS Mamont client - the RPC transport and session core of an NFSv4.0 client
//!
//! This library connects to NFS servers, frames and delivers ONC RPC calls,
//! negotiates and renews the client lease, recovers from server reboots and
//! serves the callback program servers use to recall delegations. File
//! system semantics live above it and reach it through the traits in
//! [`client::filesystem`].
//!
//! ## Main Components
//!
//! - `transport`: peer addresses, name resolution, stream and packet
//!   connections, and the listener for inbound callback connections.
//!
//! - `client`: the per-server session with its retrying requests, renewal
//!   task, reboot recovery and callback dispatch, plus the session registry
//!   that mount and unmount go through.
//!
//! - `protocol`: XDR encoding, RPC message headers, record marking and the
//!   NFSv4.0 types for SETCLIENTID, SETCLIENTID_CONFIRM, RENEW, CB_GETATTR
//!   and CB_RECALL.
//!
//! ## Standards Compliance
//!
//! - RFC 7530: Network File System (NFS) Version 4 Protocol
//! - RFC 5531: RPC: Remote Procedure Call Protocol Specification Version 2
//! - RFC 4506: XDR: External Data Representation Standard
//! - RFC 5665: IANA Considerations for RPC Net Identifiers and Universal Address Formats

pub mod client;
pub mod error;
pub mod protocol;
pub mod transport;

pub use error::{RpcError, RpcResult};
pub use protocol::xdr;
