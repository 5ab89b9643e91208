//! Client state shared by every mount of one server.
//!
//! A session owns the connection to the server, the client id negotiated
//! with SETCLIENTID/SETCLIENTID_CONFIRM and the lease that keeps it alive.
//! While any file is open a renewal task sends RENEW shortly before the
//! lease runs out and reacts to the conditions the server reports through
//! it: a reboot (the id went stale), a broken callback path, or a migrated
//! export. Inbound callbacks for the session's delegations are dispatched
//! here as well.

use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::client::config::SessionConfig;
use crate::client::filesystem::{CachedAttributes, Delegation, FileSystem};
use crate::client::request::{Cookie, Request, RetryPolicy};
use crate::client::server::RpcServer;
use crate::client::services::Services;
use crate::error::{RpcError, RpcResult};
use crate::protocol::xdr::nfs4::{
    self, bitmap4, bitmap_has, bitmap_set, cb_client4, clientaddr4, clientid4, fattr4,
    nfs_argop4, nfs_cb_argop4, nfs_cb_resop4, nfs_client_id4, nfs_fh4, nfs_resop4, nfsstat4,
    verifier4, CB_COMPOUND4header, CB_COMPOUND4res, CB_GETATTR4args, CB_RECALL4args,
    COMPOUND4args, COMPOUND4res, RENEW4args, SETCLIENTID4args, SETCLIENTID4res,
    SETCLIENTID_CONFIRM4args,
};
use crate::protocol::xdr::{deserialize, Serialize};
use crate::transport::{PeerAddress, Protocol};

/// Client strings tried when the server reports the id as in use.
const MAX_CLIENT_STRINGS: u32 = 5;
/// How long before lease expiry RENEW goes out.
const RENEW_MARGIN: Duration = Duration::from_secs(2);
/// RENEW transmissions that fit between sending and lease expiry.
const RENEW_ATTEMPTS: u32 = 2;

#[derive(Debug)]
struct Usage {
    /// Open files across all registered file systems
    use_count: usize,
    last_use: Instant,
    renewal: Option<JoinHandle<()>>,
}

/// Per-server client state. Always handled through an `Arc`.
pub struct Session {
    server: Arc<RpcServer>,
    config: SessionConfig,
    services: Services,
    callback_ident: u32,
    verifier: verifier4,
    instance: AtomicU32,
    lease_time: Mutex<Duration>,
    /// Negotiated client id; the lock also serializes negotiation
    client: tokio::sync::Mutex<Option<clientid4>>,
    usage: Mutex<Usage>,
    file_systems: Mutex<Vec<Weak<FileSystem>>>,
    reclaim: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    cookie: Cookie,
    wake: Arc<Notify>,
    this: Weak<Session>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer())
            .field("callback_ident", &self.callback_ident)
            .finish()
    }
}

impl Session {
    /// Connects to `peer` and sets up a session without negotiating a
    /// client id yet.
    pub async fn connect(
        peer: PeerAddress,
        config: SessionConfig,
        services: Services,
    ) -> RpcResult<Arc<Session>> {
        let server = RpcServer::connect(peer, &config).await?;
        Ok(Session::new(server, config, services))
    }

    pub fn new(server: Arc<RpcServer>, config: SessionConfig, services: Services) -> Arc<Session> {
        let cancel = CancellationToken::new();
        let lease_time = config.lease_time;
        Arc::new_cyclic(|this: &Weak<Session>| Session {
            callback_ident: services.callbacks.register(this.clone()),
            server,
            config,
            services,
            verifier: rand::random(),
            instance: AtomicU32::new(rand::random()),
            lease_time: Mutex::new(lease_time),
            client: tokio::sync::Mutex::new(None),
            usage: Mutex::new(Usage { use_count: 0, last_use: Instant::now(), renewal: None }),
            file_systems: Mutex::new(Vec::new()),
            reclaim: tokio::sync::Mutex::new(()),
            cookie: Cookie::from(cancel.clone()),
            cancel,
            wake: Arc::new(Notify::new()),
            this: this.clone(),
        })
    }

    pub fn peer(&self) -> PeerAddress {
        self.server.peer()
    }

    pub fn server(&self) -> &Arc<RpcServer> {
        &self.server
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn callback_ident(&self) -> u32 {
        self.callback_ident
    }

    pub fn lease_time(&self) -> Duration {
        *self.lease_time.lock().expect("unable to lock lease time")
    }

    /// Updates the lease once the file system layer has read it from the
    /// server. Takes effect at the next renewal.
    pub fn set_lease_time(&self, lease_time: Duration) {
        *self.lease_time.lock().expect("unable to lock lease time") = lease_time;
    }

    /// Client id currently held, without negotiating.
    pub async fn current_client_id(&self) -> Option<clientid4> {
        *self.client.lock().await
    }

    /// Returns a valid client id, negotiating a new one when there is none,
    /// when the lease lapsed while nothing was open, or when `force_new` is
    /// set and the current id is still `prev`. Concurrent callers wait for
    /// a single negotiation.
    pub async fn client_id(
        &self,
        prev: Option<clientid4>,
        force_new: bool,
    ) -> RpcResult<clientid4> {
        let mut client = self.client.lock().await;
        let lease_time = self.lease_time();
        let idle_expired = {
            let usage = self.usage.lock().expect("unable to lock usage");
            usage.use_count == 0 && usage.last_use.elapsed() > lease_time
        };
        let id = match *client {
            Some(current) if !(force_new && prev == Some(current)) && !idle_expired => current,
            stale => {
                if let Some(old) = stale {
                    debug!("Replacing client id {:x} (idle expired: {})", old, idle_expired);
                }
                let id = self.negotiate().await?;
                *client = Some(id);
                info!("Established client id {:x} with {}", id, self.peer());
                id
            }
        };
        self.touch();
        Ok(id)
    }

    /// Open files across the registered file systems.
    pub fn use_count(&self) -> usize {
        self.usage.lock().expect("unable to lock usage").use_count
    }

    pub fn renewal_active(&self) -> bool {
        let usage = self.usage.lock().expect("unable to lock usage");
        usage.renewal.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Registers a mounted file system and counts its open files, now and
    /// as they are opened and closed.
    pub fn add_file_system(&self, fs: &Arc<FileSystem>) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let added = {
            let mut file_systems = self.file_systems.lock().expect("unable to lock file systems");
            file_systems.retain(|weak| weak.strong_count() > 0);
            let known = file_systems.iter().any(|weak| Weak::as_ptr(weak) == Arc::as_ptr(fs));
            if !known {
                file_systems.push(Arc::downgrade(fs));
            }
            !known
        };
        if added {
            fs.start_counting(&this);
        }
    }

    /// Unregisters a file system and stops counting its open files.
    pub fn remove_file_system(&self, fs: &FileSystem) {
        let removed = {
            let mut file_systems = self.file_systems.lock().expect("unable to lock file systems");
            let before = file_systems.len();
            file_systems.retain(|weak| {
                weak.strong_count() > 0 && !std::ptr::eq(Weak::as_ptr(weak), fs)
            });
            before != file_systems.len()
        };
        if removed {
            fs.stop_counting(self);
        }
    }

    /// Live file systems registered with this session.
    pub fn file_systems(&self) -> Vec<Arc<FileSystem>> {
        let file_systems = self.file_systems.lock().expect("unable to lock file systems");
        file_systems.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn has_file_systems(&self) -> bool {
        !self.file_systems().is_empty()
    }

    /// Looks a delegation up across every file system of the session.
    pub fn find_delegation(&self, fh: &nfs_fh4) -> Option<(Arc<FileSystem>, Delegation)> {
        self.file_systems().into_iter().find_map(|fs| {
            let delegation = fs.find_delegation(fh)?;
            Some((fs, delegation))
        })
    }

    /// Sends RENEW for the current client id and recovers from the session
    /// conditions the server may answer with.
    pub async fn renew(&self) -> RpcResult<()> {
        let client_id = self.client_id(None, false).await?;
        let mut request = Request::new(self.server.clone(), self.renew_policy());
        let status = self
            .compound(&mut request, "renew", nfs_argop4::RENEW(RENEW4args { clientid: client_id }))
            .await?
            .status();
        match status {
            nfsstat4::NFS4_OK => {
                trace!("Renewed lease of {:x} on {}", client_id, self.peer());
                Ok(())
            }
            nfsstat4::NFS4ERR_CB_PATH_DOWN => {
                warn!("{} cannot reach our callback server, returning delegations", self.peer());
                self.recall_all_delegations().await;
                Ok(())
            }
            nfsstat4::NFS4ERR_STALE_CLIENTID | nfsstat4::NFS4ERR_EXPIRED => {
                warn!("{} no longer knows client id {:x}", self.peer(), client_id);
                self.server_rebooted(client_id).await.map(|_| ())
            }
            nfsstat4::NFS4ERR_LEASE_MOVED => {
                warn!("Lease on {} moved", self.peer());
                self.lease_moved();
                Ok(())
            }
            other => Err(RpcError::Status(other)),
        }
    }

    /// Recovers from a server that lost our state.
    ///
    /// The first caller holding the stale `client_id` negotiates a new one
    /// and reclaims every open file once; callers arriving after that just
    /// get the new id.
    pub async fn server_rebooted(&self, client_id: clientid4) -> RpcResult<clientid4> {
        let _reclaiming = self.reclaim.lock().await;
        let current = *self.client.lock().await;
        if let Some(current) = current.filter(|current| *current != client_id) {
            debug!("Client id already refreshed to {:x}", current);
            return Ok(current);
        }

        let fresh = self.client_id(Some(client_id), true).await?;
        info!("Reclaiming state on {} under client id {:x}", self.peer(), fresh);
        for fs in self.file_systems() {
            let dropped = fs.invalidate_delegations();
            if dropped > 0 {
                debug!("Dropped {} delegations of {:?}", dropped, fs.ids());
            }
            for file in fs.open_files() {
                if let Err(e) = file.reclaim(fresh).await {
                    warn!("Reclaim of {:?} failed: {:?}", file.file_handle(), e);
                }
            }
        }
        Ok(fresh)
    }

    /// Returns every delegation held by the session's file systems.
    pub async fn recall_all_delegations(&self) {
        for fs in self.file_systems() {
            for delegation in fs.delegations() {
                if let Err(e) = delegation.file.return_delegation(delegation.stateid, false).await {
                    warn!("Returning delegation on {:?} failed: {:?}", delegation.fh, e);
                }
                fs.remove_delegation(&delegation.fh);
            }
        }
    }

    /// Handles the operations of one CB_COMPOUND whose header has been
    /// decoded already.
    ///
    /// Processing stops at the first failing operation. An operation that
    /// cannot be decoded ends the compound with NFS4ERR_BADXDR; results of
    /// the operations before it are still returned.
    pub fn dispatch_callback(
        &self,
        header: &CB_COMPOUND4header,
        input: &mut impl Read,
    ) -> CB_COMPOUND4res {
        let mut res = CB_COMPOUND4res {
            status: nfsstat4::NFS4_OK,
            tag: header.tag.clone(),
            resarray: Vec::new(),
        };
        for index in 0..header.op_count {
            let op = match deserialize::<nfs_cb_argop4>(input) {
                Ok(op) => op,
                Err(e) => {
                    warn!("Undecodable callback operation {}: {}", index, e);
                    res.status = nfsstat4::NFS4ERR_BADXDR;
                    break;
                }
            };
            let result = match op {
                nfs_cb_argop4::CB_GETATTR(args) => self.cb_getattr(args),
                nfs_cb_argop4::CB_RECALL(args) => self.cb_recall(args),
                nfs_cb_argop4::CB_ILLEGAL(opnum) => {
                    warn!("Illegal callback operation {}", opnum);
                    nfs_cb_resop4::CB_ILLEGAL(nfsstat4::NFS4ERR_OP_ILLEGAL)
                }
            };
            let status = result.status();
            res.resarray.push(result);
            if status != nfsstat4::NFS4_OK {
                res.status = status;
                break;
            }
        }
        res
    }

    /// Cancels the renewal task and waits for it, then closes the
    /// connection.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let renewal = self.usage.lock().expect("unable to lock usage").renewal.take();
        if let Some(renewal) = renewal {
            let _ = renewal.await;
        }
        self.services.callbacks.unregister(self.callback_ident);
        self.server.shutdown().await;
        info!("Session with {} shut down", self.peer());
    }

    fn cb_getattr(&self, args: CB_GETATTR4args) -> nfs_cb_resop4 {
        let Some((_, delegation)) = self.find_delegation(&args.fh) else {
            debug!("CB_GETATTR for unknown handle {:?}", args.fh);
            return nfs_cb_resop4::CB_GETATTR(nfsstat4::NFS4ERR_BADHANDLE, None);
        };
        match getattr_reply(&args.attr_request, delegation.file.cached_attributes()) {
            Ok(attrs) => nfs_cb_resop4::CB_GETATTR(nfsstat4::NFS4_OK, Some(attrs)),
            Err(e) => {
                error!("Encoding CB_GETATTR reply failed: {}", e);
                nfs_cb_resop4::CB_GETATTR(nfsstat4::NFS4ERR_SERVERFAULT, None)
            }
        }
    }

    fn cb_recall(&self, args: CB_RECALL4args) -> nfs_cb_resop4 {
        let Some((fs, delegation)) = self.find_delegation(&args.fh) else {
            debug!("CB_RECALL for unknown handle {:?}", args.fh);
            return nfs_cb_resop4::CB_RECALL(nfsstat4::NFS4ERR_BADHANDLE);
        };
        if delegation.stateid.other != args.stateid.other {
            warn!("CB_RECALL stateid mismatch on {:?}", args.fh);
            return nfs_cb_resop4::CB_RECALL(nfsstat4::NFS4ERR_BAD_STATEID);
        }
        let name = format!("recall {:?}", args.fh);
        let job = async move {
            delegation.file.return_delegation(args.stateid, args.truncate).await?;
            fs.remove_delegation(&delegation.fh);
            Ok(())
        };
        match self.services.work_queue.submit(name, job) {
            Ok(()) => nfs_cb_resop4::CB_RECALL(nfsstat4::NFS4_OK),
            Err(e) => {
                error!("{:?}", e);
                nfs_cb_resop4::CB_RECALL(nfsstat4::NFS4ERR_RESOURCE)
            }
        }
    }

    fn lease_moved(&self) {
        for fs in self.file_systems() {
            let name = format!("lease moved {:?}", fs.ids());
            let job = async move { fs.lease_moved().await };
            if let Err(e) = self.services.work_queue.submit(name, job) {
                error!("{:?}", e);
            }
        }
    }

    async fn negotiate(&self) -> RpcResult<clientid4> {
        let callback = self.callback_location().await?;
        let mut request = Request::new(self.server.clone(), RetryPolicy::bootstrap());
        for _ in 0..MAX_CLIENT_STRINGS {
            let args = SETCLIENTID4args {
                client: nfs_client_id4 {
                    verifier: self.verifier,
                    id: self.client_string().into_bytes(),
                },
                callback: callback.clone(),
                callback_ident: self.callback_ident,
            };
            let setclientid = nfs_argop4::SETCLIENTID(args);
            let resok = match self.compound(&mut request, "setclientid", setclientid).await? {
                nfs_resop4::SETCLIENTID(SETCLIENTID4res::Ok(resok)) => resok,
                nfs_resop4::SETCLIENTID(SETCLIENTID4res::ClidInUse(owner)) => {
                    warn!("Client string in use by {} {}", owner.r_netid, owner.r_addr);
                    self.instance.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                other => return Err(unexpected(other)),
            };

            let confirm = nfs_argop4::SETCLIENTID_CONFIRM(SETCLIENTID_CONFIRM4args {
                clientid: resok.clientid,
                setclientid_confirm: resok.setclientid_confirm,
            });
            return match self.compound(&mut request, "setclientid_confirm", confirm).await? {
                nfs_resop4::SETCLIENTID_CONFIRM(nfsstat4::NFS4_OK) => Ok(resok.clientid),
                other => Err(unexpected(other)),
            };
        }
        Err(RpcError::Status(nfsstat4::NFS4ERR_CLID_INUSE))
    }

    /// Sends a single-operation COMPOUND and returns the operation's result.
    /// The request is reset afterwards so it can carry the next call.
    async fn compound(
        &self,
        request: &mut Request,
        tag: &str,
        op: nfs_argop4,
    ) -> RpcResult<nfs_resop4> {
        let args = COMPOUND4args { tag: tag.to_string(), minorversion: 0, argarray: vec![op] };
        request.set_call_args(nfs4::PROGRAM, nfs4::VERSION, nfs4::NFSPROC4_COMPOUND, &args)?;
        request.send(Some(&self.cookie)).await?;
        let res: COMPOUND4res = request.decode_reply()?;
        request.reset();
        match res.resarray.into_iter().next() {
            Some(result) => Ok(result),
            None if res.status == nfsstat4::NFS4_OK => {
                Err(RpcError::Xdr(format!("empty COMPOUND result for {tag}")))
            }
            None => Err(RpcError::Status(res.status)),
        }
    }

    async fn callback_location(&self) -> RpcResult<cb_client4> {
        let local = self.server.local_addr().await?;
        let endpoint = PeerAddress::new(
            SocketAddr::new(local.ip(), self.services.callbacks.port()),
            Protocol::Tcp,
        );
        Ok(cb_client4 {
            cb_program: self.services.callbacks.program(),
            cb_location: clientaddr4 {
                r_netid: endpoint.netid().to_string(),
                r_addr: endpoint.universal_address(),
            },
        })
    }

    fn client_string(&self) -> String {
        format!(
            "{} {} {:08x}",
            self.config.machine_name,
            self.peer(),
            self.instance.load(Ordering::Relaxed)
        )
    }

    fn touch(&self) {
        self.usage.lock().expect("unable to lock usage").last_use = Instant::now();
    }

    fn renew_interval(&self) -> Duration {
        let lease = self.lease_time();
        if lease > RENEW_MARGIN {
            lease - RENEW_MARGIN
        } else {
            lease / 2
        }
    }

    /// Retransmissions of RENEW must all go out before the lease expires.
    fn renew_policy(&self) -> RetryPolicy {
        let window = self.lease_time().saturating_sub(self.renew_interval());
        RetryPolicy { timeout: window / RENEW_ATTEMPTS, retry_limit: RENEW_ATTEMPTS, hard: false }
    }

    pub(crate) fn add_usage(&self, count: usize) {
        let mut usage = self.usage.lock().expect("unable to lock usage");
        usage.use_count += count;
        usage.last_use = Instant::now();
        let idle = usage.renewal.as_ref().is_none_or(JoinHandle::is_finished);
        if usage.use_count > 0 && idle && !self.cancel.is_cancelled() {
            debug!("Starting lease renewal for {}", self.peer());
            usage.renewal = Some(tokio::spawn(renew_loop(
                self.this.clone(),
                self.cancel.clone(),
                self.wake.clone(),
            )));
        }
    }

    pub(crate) fn sub_usage(&self, count: usize) {
        let mut usage = self.usage.lock().expect("unable to lock usage");
        usage.use_count = usage.use_count.saturating_sub(count);
        usage.last_use = Instant::now();
        if usage.use_count == 0 {
            self.wake.notify_one();
        }
    }

    /// Called by the renewal task after each wakeup. Clears the task's
    /// handle when nothing is open so the next open starts a fresh one.
    fn keep_renewing(&self) -> bool {
        let mut usage = self.usage.lock().expect("unable to lock usage");
        if usage.use_count == 0 {
            usage.renewal = None;
            false
        } else {
            true
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.services.callbacks.unregister(self.callback_ident);
    }
}

async fn renew_loop(session: Weak<Session>, cancel: CancellationToken, wake: Arc<Notify>) {
    let mut deadline = match session.upgrade() {
        Some(session) => Instant::now() + session.renew_interval(),
        None => return,
    };
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {}
            _ = wake.notified() => {}
        }
        let Some(session) = session.upgrade() else {
            break;
        };
        if !session.keep_renewing() {
            debug!("Nothing open on {}, stopping lease renewal", session.peer());
            break;
        }
        if Instant::now() < deadline {
            continue;
        }
        match session.renew().await {
            Ok(()) => {}
            Err(RpcError::Cancelled) => break,
            Err(e) => error!("Lease renewal with {} failed: {}", session.peer(), e),
        }
        deadline = Instant::now() + session.renew_interval();
    }
    trace!("Lease renewal task finished");
}

fn getattr_reply(request: &bitmap4, cached: CachedAttributes) -> std::io::Result<fattr4> {
    let change = if cached.dirty { cached.change.wrapping_add(1) } else { cached.change };
    let mut attrs = fattr4::default();
    // Values follow the bitmap in attribute number order.
    if bitmap_has(request, nfs4::FATTR4_CHANGE) {
        bitmap_set(&mut attrs.attrmask, nfs4::FATTR4_CHANGE);
        change.serialize(&mut attrs.attr_vals)?;
    }
    if bitmap_has(request, nfs4::FATTR4_SIZE) {
        bitmap_set(&mut attrs.attrmask, nfs4::FATTR4_SIZE);
        cached.size.serialize(&mut attrs.attr_vals)?;
    }
    Ok(attrs)
}

fn unexpected(result: nfs_resop4) -> RpcError {
    match result.status() {
        nfsstat4::NFS4_OK => RpcError::Xdr(format!("unexpected operation result {result:?}")),
        status => RpcError::Status(status),
    }
}
