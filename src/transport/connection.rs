//! A single socket to an RPC peer.
//!
//! [`Connection`] hides whether the peer is reached over a stream (TCP,
//! record-marked) or a packet (UDP, one message per datagram) transport.
//! Every blocking wait races the connection's cancellation token, so
//! [`Connection::disconnect`] and [`Connection::reconnect`] wake blocked
//! senders and receivers right away instead of leaving them to a socket
//! timeout.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::error::{RpcError, RpcResult};
use crate::protocol::rpc::wire;
use crate::transport::address::{PeerAddress, Protocol};
use crate::transport::bind::BindPolicy;

/// Connected socket to one peer.
#[derive(Debug)]
pub struct Connection {
    peer: PeerAddress,
    bind: BindPolicy,
    max_fragment: usize,
    transport: Transport,
}

#[derive(Debug)]
enum Transport {
    Stream(StreamSocket),
    Packet(PacketSocket),
}

/// Halves are kept behind separate async locks: the writer lock serializes
/// concurrent senders, the reader lock belongs to whichever task is
/// receiving. Reconnect takes both, which means waiting for the receiver
/// to notice cancellation and let go.
#[derive(Debug)]
struct StreamSocket {
    reader: tokio::sync::Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    cancel: Mutex<CancellationToken>,
    /// Accepted connections cannot be dialed again.
    reconnectable: bool,
}

#[derive(Debug)]
struct PacketSocket {
    state: Mutex<PacketState>,
}

#[derive(Debug)]
struct PacketState {
    socket: Option<Arc<UdpSocket>>,
    cancel: CancellationToken,
}

fn unspecified_for(addr: &SocketAddr) -> IpAddr {
    match addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

async fn dial_stream(peer: &PeerAddress, policy: &BindPolicy) -> io::Result<TcpStream> {
    let target = peer.socket_addr();
    let local_ip = unspecified_for(&target);
    let (socket, port) = policy.bind_with_retry(|port| {
        let socket = match target {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.bind(SocketAddr::new(local_ip, port))?;
        Ok(socket)
    })?;
    let stream = socket.connect(target).await?;
    let _ = stream.set_nodelay(true);
    info!("Connected to {} from {:?} (requested port {})", peer, stream.local_addr(), port);
    Ok(stream)
}

async fn dial_packet(peer: &PeerAddress, policy: &BindPolicy) -> io::Result<UdpSocket> {
    let target = peer.socket_addr();
    let local_ip = unspecified_for(&target);
    let (socket, port) =
        policy.bind_with_retry(|port| std::net::UdpSocket::bind(SocketAddr::new(local_ip, port)))?;
    socket.set_nonblocking(true)?;
    let socket = UdpSocket::from_std(socket)?;
    socket.connect(target).await?;
    info!("Connected to {} from {:?} (requested port {})", peer, socket.local_addr(), port);
    Ok(socket)
}

impl StreamSocket {
    fn new(stream: TcpStream, reconnectable: bool) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: tokio::sync::Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            cancel: Mutex::new(CancellationToken::new()),
            reconnectable,
        }
    }

    fn token(&self) -> CancellationToken {
        self.cancel.lock().expect("unable to lock cancellation token").clone()
    }

    fn signal_cancel(&self) {
        self.token().cancel();
    }

    /// Drops both halves, which closes the socket. The caller has already
    /// signalled cancellation so a blocked receiver releases its lock.
    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Some(mut half) = writer.take() {
            let _ = half.shutdown().await;
        }
        self.reader.lock().await.take();
    }
}

impl PacketSocket {
    fn new(socket: UdpSocket) -> Self {
        Self {
            state: Mutex::new(PacketState {
                socket: Some(Arc::new(socket)),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Socket and token of the current incarnation, taken together so a
    /// reconnect cannot hand out a new socket with a stale token.
    fn current(&self) -> (Option<Arc<UdpSocket>>, CancellationToken) {
        let state = self.state.lock().expect("unable to lock packet socket state");
        (state.socket.clone(), state.cancel.clone())
    }

    fn close(&self) {
        let mut state = self.state.lock().expect("unable to lock packet socket state");
        state.cancel.cancel();
        state.socket = None;
    }

    fn install(&self, socket: UdpSocket) {
        let mut state = self.state.lock().expect("unable to lock packet socket state");
        state.socket = Some(Arc::new(socket));
        state.cancel = CancellationToken::new();
    }
}

impl Connection {
    /// Opens a socket of the kind `peer.protocol()` calls for, binds it
    /// according to `bind` and connects it.
    pub async fn connect(peer: PeerAddress, bind: BindPolicy) -> RpcResult<Connection> {
        let transport = match peer.protocol() {
            Protocol::Tcp => {
                let stream = dial_stream(&peer, &bind).await?;
                Transport::Stream(StreamSocket::new(stream, true))
            }
            Protocol::Udp => {
                let socket = dial_packet(&peer, &bind).await?;
                Transport::Packet(PacketSocket::new(socket))
            }
        };
        Ok(Connection { peer, bind, max_fragment: wire::MAX_FRAGMENT_SIZE, transport })
    }

    /// Wraps a stream accepted by a [`ConnectionListener`](super::ConnectionListener).
    pub fn from_accepted(stream: TcpStream) -> RpcResult<Connection> {
        let peer = PeerAddress::new(stream.peer_addr()?, Protocol::Tcp);
        let _ = stream.set_nodelay(true);
        Ok(Connection {
            peer,
            bind: BindPolicy::os_assigned(),
            max_fragment: wire::MAX_FRAGMENT_SIZE,
            transport: Transport::Stream(StreamSocket::new(stream, false)),
        })
    }

    /// Limits the size of outgoing stream fragments. Records larger than
    /// this are split; packet connections ignore the setting.
    pub fn with_max_fragment(mut self, max_fragment: usize) -> Connection {
        self.max_fragment = max_fragment.clamp(1, wire::MAX_FRAGMENT_SIZE);
        self
    }

    /// The remote end. Unchanged by [`reconnect`](Self::reconnect).
    pub fn peer(&self) -> PeerAddress {
        self.peer
    }

    /// Local address of the current socket.
    pub async fn local_addr(&self) -> RpcResult<SocketAddr> {
        match &self.transport {
            Transport::Stream(stream) => {
                let writer = stream.writer.lock().await;
                Ok(writer.as_ref().ok_or(RpcError::Aborted)?.local_addr()?)
            }
            Transport::Packet(packet) => {
                let (socket, _) = packet.current();
                Ok(socket.ok_or(RpcError::Aborted)?.local_addr()?)
            }
        }
    }

    /// Sends one RPC message.
    ///
    /// Stream transports frame the message with record marks and hold the
    /// send lock until every byte is written. Packet transports hand the
    /// whole message to a single datagram send.
    pub async fn send(&self, buf: &[u8]) -> RpcResult<()> {
        match &self.transport {
            Transport::Stream(stream) => {
                let mut writer = stream.writer.lock().await;
                let token = stream.token();
                let half = writer.as_mut().ok_or(RpcError::Aborted)?;
                tokio::select! {
                    _ = token.cancelled() => Err(RpcError::Aborted),
                    sent = wire::write_record(half, buf, self.max_fragment) => sent,
                }
            }
            Transport::Packet(packet) => {
                if buf.len() > wire::MAX_DATAGRAM_SIZE {
                    return Err(RpcError::RecordTooLarge {
                        length: buf.len(),
                        max: wire::MAX_DATAGRAM_SIZE,
                    });
                }
                let (socket, token) = packet.current();
                let socket = socket.ok_or(RpcError::Aborted)?;
                let sent = tokio::select! {
                    _ = token.cancelled() => return Err(RpcError::Aborted),
                    sent = socket.send(buf) => sent?,
                };
                trace!("Sent datagram of {} bytes", sent);
                if sent != buf.len() {
                    return Err(RpcError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("datagram truncated to {sent} of {} bytes", buf.len()),
                    )));
                }
                Ok(())
            }
        }
    }

    /// Waits for one complete RPC message or cancellation, whichever comes
    /// first. Cancellation and peer close both report [`RpcError::Aborted`].
    ///
    /// Only one task should receive at a time. On a stream the receiver
    /// holds the read half for the whole wait, and fragments are collected
    /// until the last-fragment bit. A record growing past
    /// [`wire::MAX_RPC_RECORD_LENGTH`] fails with
    /// [`RpcError::RecordTooLarge`]; a buffer that cannot be grown fails
    /// with [`RpcError::OutOfMemory`].
    ///
    /// On a packet socket each datagram is one message. Errors queued on
    /// the socket, such as ICMP port unreachable, come back as
    /// [`RpcError::Io`] and leave the socket usable.
    pub async fn receive(&self) -> RpcResult<Vec<u8>> {
        match &self.transport {
            Transport::Stream(stream) => {
                let mut reader = stream.reader.lock().await;
                let token = stream.token();
                let half = reader.as_mut().ok_or(RpcError::Aborted)?;
                tokio::select! {
                    _ = token.cancelled() => Err(RpcError::Aborted),
                    record = wire::read_record(half, wire::MAX_RPC_RECORD_LENGTH) => record,
                }
            }
            Transport::Packet(packet) => {
                let (socket, token) = packet.current();
                let socket = socket.ok_or(RpcError::Aborted)?;
                let mut buf = vec![0_u8; wire::MAX_DATAGRAM_SIZE];
                loop {
                    let received = tokio::select! {
                        _ = token.cancelled() => return Err(RpcError::Aborted),
                        received = socket.recv(&mut buf) => received?,
                    };
                    // An empty datagram carries no message; wait for the next one.
                    if received > 0 {
                        buf.truncate(received);
                        return Ok(buf);
                    }
                }
            }
        }
    }

    /// Tears the socket down and dials the same peer again.
    ///
    /// Waits for a blocked sender and receiver to drop their halves before
    /// closing, then installs the new socket with a fresh cancellation
    /// token. Connections made by
    /// [`from_accepted`](Self::from_accepted) fail with
    /// [`io::ErrorKind::NotConnected`].
    pub async fn reconnect(&self) -> RpcResult<()> {
        debug!("Reconnecting to {}", self.peer);
        match &self.transport {
            Transport::Stream(stream) => {
                if !stream.reconnectable {
                    return Err(RpcError::Io(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "accepted connections cannot be re-established",
                    )));
                }
                stream.signal_cancel();
                let mut writer = stream.writer.lock().await;
                let mut reader = stream.reader.lock().await;
                if let Some(mut half) = writer.take() {
                    let _ = half.shutdown().await;
                }
                reader.take();

                let fresh = dial_stream(&self.peer, &self.bind).await?;
                let (new_reader, new_writer) = fresh.into_split();
                *stream.cancel.lock().expect("unable to lock cancellation token") =
                    CancellationToken::new();
                *reader = Some(new_reader);
                *writer = Some(new_writer);
                Ok(())
            }
            Transport::Packet(packet) => {
                packet.close();
                packet.install(dial_packet(&self.peer, &self.bind).await?);
                Ok(())
            }
        }
    }

    /// Wakes every blocked wait with [`RpcError::Aborted`] and closes the
    /// socket. Calling it again is harmless.
    pub async fn disconnect(&self) {
        match &self.transport {
            Transport::Stream(stream) => {
                stream.signal_cancel();
                stream.close().await;
            }
            Transport::Packet(packet) => packet.close(),
        }
        debug!("Disconnected from {}", self.peer);
    }
}
