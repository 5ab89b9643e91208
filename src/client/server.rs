//! Shared handle to one server connection.
//!
//! Requests send through the handle and wait for their reply on a oneshot
//! channel registered under the call's xid. A single reader task owns the
//! receive side of the connection and routes each reply to its waiter.
//! When the stream breaks while calls are outstanding the reader repairs
//! it, backing off between failed attempts. A datagram socket has nothing
//! to repair, so the reader goes back to receiving after a short pause.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::client::config::SessionConfig;
use crate::error::{RpcError, RpcResult};
use crate::protocol::rpc::PendingCalls;
use crate::protocol::xdr::rpc::{auth_unix, opaque_auth, peek_xid};
use crate::transport::{Connection, PeerAddress, Protocol};

/// Pause after a failed datagram receive before reading again.
const PACKET_ERROR_PAUSE: Duration = Duration::from_millis(10);

struct Shared {
    connection: Connection,
    pending: PendingCalls,
    /// Bumped after every successful reconnect
    generation: AtomicU64,
    repair_lock: tokio::sync::Mutex<()>,
    reconnected: Notify,
    shutdown: CancellationToken,
}

impl Shared {
    async fn repair(&self, seen: u64) -> RpcResult<()> {
        let _guard = self.repair_lock.lock().await;
        if self.generation.load(Ordering::SeqCst) != seen {
            trace!("Connection to {} already repaired", self.connection.peer());
            return Ok(());
        }
        if self.shutdown.is_cancelled() {
            return Err(RpcError::Cancelled);
        }
        self.connection.reconnect().await?;
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.reconnected.notify_waiters();
        info!("Reconnected to {}", self.connection.peer());
        Ok(())
    }
}

/// Connection to a server plus the machinery to match replies to calls.
pub struct RpcServer {
    shared: Arc<Shared>,
    next_xid: AtomicU32,
    credential: opaque_auth,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer").field("peer", &self.peer()).finish()
    }
}

impl RpcServer {
    /// Connects to `peer` and starts the reply reader.
    ///
    /// The local port is bound according to `config.bind`. The AUTH_UNIX
    /// credential built from `config` is encoded once here and attached to
    /// every call made through the handle. Xids start at a random value so
    /// a restarted client does not collide with replies meant for an
    /// earlier incarnation.
    pub async fn connect(peer: PeerAddress, config: &SessionConfig) -> RpcResult<Arc<RpcServer>> {
        let connection = Connection::connect(peer, config.bind.clone()).await?;
        let cred = auth_unix {
            stamp: rand::random(),
            machinename: config.machine_name.clone(),
            uid: config.uid,
            gid: config.gid,
            gids: vec![config.gid],
        };
        let credential = opaque_auth::unix(&cred)?;

        let shared = Arc::new(Shared {
            connection,
            pending: PendingCalls::new(),
            generation: AtomicU64::new(0),
            repair_lock: tokio::sync::Mutex::new(()),
            reconnected: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        let reader = tokio::spawn(read_replies(
            shared.clone(),
            config.initial_reconnect_delay,
            config.max_reconnect_delay,
        ));
        Ok(Arc::new(RpcServer {
            shared,
            next_xid: AtomicU32::new(rand::random()),
            credential,
            reader: Mutex::new(Some(reader)),
        }))
    }

    /// Address the handle was connected to. Stable across reconnects.
    pub fn peer(&self) -> PeerAddress {
        self.shared.connection.peer()
    }

    pub fn protocol(&self) -> Protocol {
        self.peer().protocol()
    }

    /// Local end of the current socket.
    pub async fn local_addr(&self) -> RpcResult<SocketAddr> {
        self.shared.connection.local_addr().await
    }

    /// AUTH_UNIX credential attached to every call.
    pub fn credential(&self) -> &opaque_auth {
        &self.credential
    }

    /// Allocates a transaction id. Ids increase by one and wrap.
    pub fn next_xid(&self) -> u32 {
        self.next_xid.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers interest in the reply to `xid`. Must happen before the
    /// call is sent.
    pub fn register(&self, xid: u32) -> oneshot::Receiver<Vec<u8>> {
        self.shared.pending.register(xid)
    }

    /// Stops waiting for `xid`; a reply arriving later is dropped.
    pub fn cancel_call(&self, xid: u32) {
        self.shared.pending.cancel(xid);
    }

    /// Calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    /// Sends one complete RPC message.
    ///
    /// The reply, if any, is delivered through the receiver obtained from
    /// [`register`](Self::register). Returns [`RpcError::Cancelled`] once
    /// the handle has been shut down; transport errors are passed through
    /// unchanged so the caller can decide whether to repair.
    pub async fn send(&self, message: &[u8]) -> RpcResult<()> {
        if self.shared.shutdown.is_cancelled() {
            return Err(RpcError::Cancelled);
        }
        self.shared.connection.send(message).await
    }

    /// Number of reconnects so far. Pass it to [`repair`](Self::repair) so
    /// concurrent repairers reconnect only once.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Re-establishes the connection unless it has been re-established
    /// since `seen` was read.
    pub async fn repair(&self, seen: u64) -> RpcResult<()> {
        self.shared.repair(seen).await
    }

    /// Token cancelled when the handle shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Fails every outstanding call, stops the reader and closes the socket.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.shared.pending.cancel_all();
        self.shared.connection.disconnect().await;
        let reader = self.reader.lock().expect("unable to lock reader handle").take();
        if let Some(reader) = reader {
            let _ = reader.await;
        }
        debug!("Server handle for {} shut down", self.peer());
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn read_replies(shared: Arc<Shared>, initial_delay: Duration, max_delay: Duration) {
    let peer = shared.connection.peer();
    let mut delay = initial_delay;
    loop {
        let seen = shared.generation.load(Ordering::SeqCst);
        let received = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            received = shared.connection.receive() => received,
        };
        let error = match received {
            Ok(message) => {
                delay = initial_delay;
                match peek_xid(&message) {
                    Some(xid) => {
                        trace!("Reply for xid {} ({} bytes)", xid, message.len());
                        shared.pending.complete(xid, message);
                    }
                    None => warn!("Dropping runt message of {} bytes from {}", message.len(), peer),
                }
                continue;
            }
            Err(e) => e,
        };
        if shared.shutdown.is_cancelled() {
            break;
        }
        if peer.protocol() == Protocol::Udp {
            // A refused port or similar; the socket stays usable.
            debug!("Receive from {} failed: {}", peer, error);
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                _ = tokio::time::sleep(PACKET_ERROR_PAUSE) => {}
            }
            continue;
        }

        let reconnected = shared.reconnected.notified();
        if shared.generation.load(Ordering::SeqCst) != seen {
            continue;
        }
        debug!("Receive from {} failed: {}", peer, error);

        if !shared.pending.is_empty() {
            match shared.repair(seen).await {
                Ok(()) => {
                    delay = initial_delay;
                    continue;
                }
                Err(e) => warn!("Reconnect to {} failed: {}", peer, e),
            }
        }
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = reconnected => {}
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(max_delay);
    }
    debug!("Reply reader for {} finished", peer);
}
