//! Passive side of a stream transport, used to receive callback connections.

use std::net::{IpAddr, SocketAddr};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{RpcError, RpcResult};
use crate::transport::connection::Connection;

/// A listening TCP socket whose accepts can be interrupted.
#[derive(Debug)]
pub struct ConnectionListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl ConnectionListener {
    /// Binds to `ip:port` and starts listening. Port 0 lets the OS choose.
    pub async fn listen(ip: IpAddr, port: u16) -> RpcResult<ConnectionListener> {
        let listener = TcpListener::bind(SocketAddr::new(ip, port)).await?;
        let local_addr = listener.local_addr()?;
        info!("Listening on {:?}", local_addr);
        Ok(ConnectionListener { listener, local_addr, cancel: CancellationToken::new() })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the next peer and returns a ready stream connection.
    ///
    /// Returns [`RpcError::Aborted`] once [`disconnect`](Self::disconnect)
    /// has been called, including for acceptors already blocked here.
    pub async fn accept_connection(&self) -> RpcResult<Connection> {
        if self.cancel.is_cancelled() {
            return Err(RpcError::Aborted);
        }
        let (stream, peer) = tokio::select! {
            _ = self.cancel.cancelled() => return Err(RpcError::Aborted),
            accepted = self.listener.accept() => accepted?,
        };
        debug!("Accepted connection from {}", peer);
        Connection::from_accepted(stream)
    }

    /// Wakes every blocked acceptor. The socket itself closes on drop.
    pub fn disconnect(&self) {
        self.cancel.cancel();
        debug!("Listener on {} disconnected", self.local_addr);
    }

    pub fn is_disconnected(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
