//! Wire protocols spoken by the client.
//!
//! - `xdr`: External Data Representation (RFC 4506) encoding, the RPC
//!   message header and the NFSv4.0 types used by the session layer.
//!
//! - `rpc`: ONC RPC framing, reply matching and the background work queue.

pub mod rpc;
pub mod xdr;
