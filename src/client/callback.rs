//! Server side of the NFSv4 callback program.
//!
//! The NFS server connects back to the client to query attributes of
//! delegated files and to recall delegations. Every session registers here
//! under a callback ident, which it announces in SETCLIENTID and which the
//! server repeats in each CB_COMPOUND.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::anyhow;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::client::config::CallbackConfig;
use crate::client::session::Session;
use crate::error::{RpcError, RpcResult};
use crate::protocol::xdr::nfs4::{self, nfsstat4, CB_COMPOUND4header, CB_COMPOUND4res};
use crate::protocol::xdr::{self, deserialize, Serialize};
use crate::transport::{Connection, ConnectionListener};

type SessionTable = Mutex<HashMap<u32, Weak<Session>>>;

struct Shared {
    program: u32,
    sessions: SessionTable,
}

/// Listener plus the tasks serving callback connections.
pub struct CallbackServer {
    shared: Arc<Shared>,
    listener: Arc<ConnectionListener>,
    next_ident: AtomicU32,
    shutdown: CancellationToken,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CallbackServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackServer")
            .field("program", &self.shared.program)
            .field("local_addr", &self.listener.local_addr())
            .finish()
    }
}

impl CallbackServer {
    /// Starts listening and accepting callback connections.
    pub async fn start(config: &CallbackConfig) -> RpcResult<Arc<CallbackServer>> {
        let listener = Arc::new(ConnectionListener::listen(config.listen_ip, config.port).await?);
        let shared =
            Arc::new(Shared { program: config.program, sessions: Mutex::new(HashMap::new()) });
        let shutdown = CancellationToken::new();
        let accept =
            tokio::spawn(handle_forever(listener.clone(), shared.clone(), shutdown.clone()));
        Ok(Arc::new(CallbackServer {
            shared,
            listener,
            next_ident: AtomicU32::new(1),
            shutdown,
            accept: Mutex::new(Some(accept)),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().port()
    }

    /// Callback program number announced to servers.
    pub fn program(&self) -> u32 {
        self.shared.program
    }

    /// Adds a session and returns the ident callbacks for it will carry.
    pub fn register(&self, session: Weak<Session>) -> u32 {
        let ident = self.next_ident.fetch_add(1, Ordering::Relaxed);
        let mut sessions = self.shared.sessions.lock().expect("unable to lock session table");
        sessions.insert(ident, session);
        trace!("Registered callback ident {}", ident);
        ident
    }

    pub fn unregister(&self, ident: u32) {
        let mut sessions = self.shared.sessions.lock().expect("unable to lock session table");
        sessions.remove(&ident);
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().expect("unable to lock session table").len()
    }

    /// Stops accepting, closes every callback connection and waits for the
    /// tasks to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.listener.disconnect();
        let accept = self.accept.lock().expect("unable to lock accept handle").take();
        if let Some(accept) = accept {
            let _ = accept.await;
        }
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.listener.disconnect();
    }
}

async fn handle_forever(
    listener: Arc<ConnectionListener>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        while connections.try_join_next().is_some() {}
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept_connection() => accepted,
        };
        match accepted {
            Ok(connection) => {
                info!("Accepting callback connection from {}", connection.peer());
                let shared = shared.clone();
                let token = shutdown.child_token();
                connections.spawn(async move {
                    if let Err(e) = process_connection(connection, shared, token).await {
                        debug!("Callback connection closed: {:?}", e);
                    }
                });
            }
            Err(RpcError::Aborted) => break,
            Err(e) => {
                error!("Accepting callback connection failed: {}", e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
                }
            }
        }
    }
    connections.shutdown().await;
    debug!("Callback listener on {} stopped", listener.local_addr());
}

async fn process_connection(
    connection: Connection,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let result = loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            message = connection.receive() => message,
        };
        let message = match message {
            Ok(message) => message,
            Err(RpcError::Aborted) => break Ok(()),
            Err(e) => break Err(e.into()),
        };
        let mut output = Vec::new();
        match handle_rpc(&mut Cursor::new(&message), &mut output, &shared).await {
            Ok(()) => {
                if let Err(e) = connection.send(&output).await {
                    break Err(e.into());
                }
            }
            Err(e) => warn!("Dropping callback message from {}: {:?}", connection.peer(), e),
        }
    };
    connection.disconnect().await;
    result
}

/// Decodes one inbound call and writes the reply to `output`.
async fn handle_rpc(
    input: &mut impl Read,
    output: &mut impl Write,
    shared: &Shared,
) -> anyhow::Result<()> {
    let recv = deserialize::<xdr::rpc::rpc_msg>(input)?;
    let xid = recv.xid;
    let xdr::rpc::rpc_body::CALL(call) = recv.body else {
        error!("Unexpectedly received a Reply instead of a Call");
        return Err(anyhow!("Bad RPC Call format"));
    };
    if call.rpcvers != xdr::rpc::RPC_VERSION {
        warn!("Invalid RPC version {} != {}", call.rpcvers, xdr::rpc::RPC_VERSION);
        xdr::rpc::rpc_vers_mismatch(xid).serialize(output)?;
        return Ok(());
    }
    if call.prog != shared.program {
        warn!("Unknown callback program {} != {}", call.prog, shared.program);
        xdr::rpc::prog_unavail_reply_message(xid).serialize(output)?;
        return Ok(());
    }
    if call.vers != nfs4::CB_VERSION {
        warn!("Unsupported callback version {} (supported {})", call.vers, nfs4::CB_VERSION);
        xdr::rpc::prog_mismatch_reply_message(xid, nfs4::CB_VERSION).serialize(output)?;
        return Ok(());
    }

    match call.proc {
        nfs4::CB_NULL => {
            debug!("cb_null({})", xid);
            xdr::rpc::make_success_reply(xid).serialize(output)?;
        }
        nfs4::CB_COMPOUND => {
            let header = match deserialize::<CB_COMPOUND4header>(input) {
                Ok(header) => header,
                Err(e) => {
                    warn!("Undecodable CB_COMPOUND header: {}", e);
                    xdr::rpc::garbage_args_reply_message(xid).serialize(output)?;
                    return Ok(());
                }
            };
            let res = compound(&header, input, shared);
            debug!("cb_compound({}, ident {}) -> {:?}", xid, header.callback_ident, res.status);
            xdr::rpc::make_success_reply(xid).serialize(output)?;
            res.serialize(output)?;
        }
        other => {
            warn!("Unknown callback procedure {}", other);
            xdr::rpc::proc_unavail_reply_message(xid).serialize(output)?;
        }
    }
    Ok(())
}

fn compound(
    header: &CB_COMPOUND4header,
    input: &mut impl Read,
    shared: &Shared,
) -> CB_COMPOUND4res {
    let failed = |status| CB_COMPOUND4res { status, tag: header.tag.clone(), resarray: Vec::new() };
    if header.minorversion != 0 {
        return failed(nfsstat4::NFS4ERR_MINOR_VERS_MISMATCH);
    }
    let session = {
        let sessions = shared.sessions.lock().expect("unable to lock session table");
        sessions.get(&header.callback_ident).and_then(Weak::upgrade)
    };
    match session {
        Some(session) => session.dispatch_callback(header, input),
        None => {
            warn!("Callback for unknown ident {}", header.callback_ident);
            failed(nfsstat4::NFS4ERR_STALE_CLIENTID)
        }
    }
}
