//! Error type shared by the transport, request and session layers.

use std::io;

use thiserror::Error;

use crate::protocol::xdr::nfs4::nfsstat4;

/// Errors surfaced to callers of the client core.
///
/// Transport failures keep the original [`io::Error`] so the OS error code
/// reaches the caller unchanged. Protocol timeouts only appear once the
/// retry budget of a soft mount is exhausted.
#[derive(Debug, Error)]
pub enum RpcError {
    /// OS-level socket failure, passed through verbatim.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// A blocked wait was interrupted by disconnect, reconnect or shutdown,
    /// or the peer closed the connection.
    #[error("connection aborted")]
    Aborted,

    /// The call was abandoned through its cookie or because the server
    /// handle is shutting down.
    #[error("call cancelled")]
    Cancelled,

    /// No reply arrived within the retry budget of a soft mount.
    #[error("no reply after {attempts} attempts")]
    TimedOut { attempts: u32 },

    /// Address resolution produced no (more) candidates.
    #[error("no address found")]
    AddressNotFound,

    #[error("malformed address literal {0:?}")]
    BadAddress(String),

    #[error("RPC record of {length} bytes exceeds maximum {max}")]
    RecordTooLarge { length: usize, max: usize },

    /// Allocation failed while reassembling an incoming record.
    #[error("out of memory reassembling RPC record")]
    OutOfMemory,

    /// The server did not accept the call (RPC level).
    #[error("RPC call rejected: {0}")]
    Rejected(String),

    /// The server processed the call and answered with an NFS error.
    #[error("server returned {0:?}")]
    Status(nfsstat4),

    /// A reply could not be decoded.
    #[error("malformed reply: {0}")]
    Xdr(String),
}

impl RpcError {
    /// True for the session-condition codes that the renewal path recovers
    /// from instead of reporting.
    pub fn is_session_condition(&self) -> bool {
        matches!(
            self,
            RpcError::Status(
                nfsstat4::NFS4ERR_STALE_CLIENTID
                    | nfsstat4::NFS4ERR_EXPIRED
                    | nfsstat4::NFS4ERR_LEASE_MOVED
                    | nfsstat4::NFS4ERR_CB_PATH_DOWN
            )
        )
    }
}

/// Result alias used across the crate.
pub type RpcResult<T> = Result<T, RpcError>;
