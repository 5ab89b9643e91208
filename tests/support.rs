#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use nfs_mamont_client::client::{
    CachedAttributes, CallbackConfig, DelegatedFile, Delegation, DelegationKind, ExportLocator,
    FileSystem, OpenFile, Services, Session, SessionConfig,
};
use nfs_mamont_client::transport::{BindPolicy, ConnectionListener, PeerAddress, Protocol};
use nfs_mamont_client::xdr::nfs4::{
    self, clientid4, nfs_argop4, nfs_fh4, nfs_resop4, nfsstat4, stateid4, COMPOUND4args,
    COMPOUND4res, SETCLIENTID4args, SETCLIENTID4res, SETCLIENTID4resok,
};
use nfs_mamont_client::xdr::rpc::{self, call_message, opaque_auth, rpc_body, rpc_msg};
use nfs_mamont_client::xdr::{deserialize, Serialize};

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

pub fn localhost() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// Session settings that work without privileges: no reserved ports.
pub fn session_config() -> SessionConfig {
    SessionConfig { bind: BindPolicy::os_assigned(), ..Default::default() }
}

pub fn callback_config() -> CallbackConfig {
    CallbackConfig { listen_ip: localhost(), ..Default::default() }
}

pub async fn start_services() -> Services {
    Services::start(&callback_config()).await.expect("start services")
}

pub fn fh(byte: u8) -> nfs_fh4 {
    nfs_fh4(vec![byte; 16])
}

pub fn stateid(byte: u8) -> stateid4 {
    stateid4 { seqid: 1, other: [byte; 12] }
}

/// Behavior and counters of a [`FakeServer`].
#[derive(Default)]
pub struct FakeState {
    pub setclientid_calls: AtomicU32,
    pub confirm_calls: AtomicU32,
    pub renew_calls: AtomicU32,
    pub null_calls: AtomicU32,
    pub connections: AtomicU32,
    /// Next RENEW answers; NFS4_OK once exhausted
    pub renew_statuses: Mutex<VecDeque<nfsstat4>>,
    /// SETCLIENTID calls still to be refused with NFS4ERR_CLID_INUSE
    pub clid_inuse: AtomicU32,
    /// Calls still to be swallowed without a reply
    pub drop_calls: AtomicU32,
    pub setclientid_delay_ms: AtomicU64,
    pub client_strings: Mutex<Vec<Vec<u8>>>,
    pub last_setclientid: Mutex<Option<SETCLIENTID4args>>,
    next_clientid: AtomicU64,
}

impl FakeState {
    pub fn script_renew(&self, status: nfsstat4) {
        self.renew_statuses.lock().expect("lock renew statuses").push_back(status);
    }

    /// Answers one call, or returns None to stay silent.
    pub async fn handle(&self, message: &[u8]) -> Option<Vec<u8>> {
        let mut input = Cursor::new(message);
        let msg = deserialize::<rpc_msg>(&mut input).expect("decode call header");
        let rpc_body::CALL(call) = msg.body else {
            panic!("fake server received a reply");
        };
        if self
            .drop_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return None;
        }

        let mut output = Vec::new();
        if call.prog != nfs4::PROGRAM {
            rpc::prog_unavail_reply_message(msg.xid).serialize(&mut output).expect("encode");
            return Some(output);
        }
        match call.proc {
            nfs4::NFSPROC4_NULL => {
                self.null_calls.fetch_add(1, Ordering::SeqCst);
                rpc::make_success_reply(msg.xid).serialize(&mut output).expect("encode");
            }
            nfs4::NFSPROC4_COMPOUND => {
                let args = deserialize::<COMPOUND4args>(&mut input).expect("decode COMPOUND");
                let res = self.compound(args).await;
                rpc::make_success_reply(msg.xid).serialize(&mut output).expect("encode");
                res.serialize(&mut output).expect("encode");
            }
            _ => {
                rpc::proc_unavail_reply_message(msg.xid).serialize(&mut output).expect("encode");
            }
        }
        Some(output)
    }

    async fn compound(&self, args: COMPOUND4args) -> COMPOUND4res {
        let mut res = COMPOUND4res { status: nfsstat4::NFS4_OK, tag: args.tag, resarray: vec![] };
        for op in args.argarray {
            let result = match op {
                nfs_argop4::SETCLIENTID(args) => self.setclientid(args).await,
                nfs_argop4::SETCLIENTID_CONFIRM(_) => {
                    self.confirm_calls.fetch_add(1, Ordering::SeqCst);
                    nfs_resop4::SETCLIENTID_CONFIRM(nfsstat4::NFS4_OK)
                }
                nfs_argop4::RENEW(_) => {
                    self.renew_calls.fetch_add(1, Ordering::SeqCst);
                    let status = self
                        .renew_statuses
                        .lock()
                        .expect("lock renew statuses")
                        .pop_front()
                        .unwrap_or(nfsstat4::NFS4_OK);
                    nfs_resop4::RENEW(status)
                }
            };
            res.status = result.status();
            res.resarray.push(result);
            if res.status != nfsstat4::NFS4_OK {
                break;
            }
        }
        res
    }

    async fn setclientid(&self, args: SETCLIENTID4args) -> nfs_resop4 {
        self.setclientid_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.setclientid_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.client_strings.lock().expect("lock client strings").push(args.client.id.clone());
        *self.last_setclientid.lock().expect("lock setclientid") = Some(args.clone());
        if self
            .clid_inuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return nfs_resop4::SETCLIENTID(SETCLIENTID4res::ClidInUse(
                args.callback.cb_location,
            ));
        }
        let clientid = 0x1000 + self.next_clientid.fetch_add(1, Ordering::SeqCst);
        nfs_resop4::SETCLIENTID(SETCLIENTID4res::Ok(SETCLIENTID4resok {
            clientid,
            setclientid_confirm: [7; 8],
        }))
    }
}

/// Minimal NFSv4 server answering NULL and the session bootstrap
/// COMPOUNDs over TCP or UDP.
pub struct FakeServer {
    pub addr: SocketAddr,
    pub protocol: Protocol,
    pub state: Arc<FakeState>,
    task: JoinHandle<()>,
}

impl FakeServer {
    pub async fn tcp() -> FakeServer {
        let listener = ConnectionListener::listen(localhost(), 0).await.expect("listen");
        let addr = listener.local_addr();
        let state = Arc::new(FakeState::default());
        let shared = state.clone();
        let task = tokio::spawn(async move {
            while let Ok(connection) = listener.accept_connection().await {
                shared.connections.fetch_add(1, Ordering::SeqCst);
                let connection = Arc::new(connection);
                let state = shared.clone();
                tokio::spawn(async move {
                    while let Ok(message) = connection.receive().await {
                        let state = state.clone();
                        let connection = connection.clone();
                        tokio::spawn(async move {
                            if let Some(reply) = state.handle(&message).await {
                                let _ = connection.send(&reply).await;
                            }
                        });
                    }
                });
            }
        });
        FakeServer { addr, protocol: Protocol::Tcp, state, task }
    }

    pub async fn udp() -> FakeServer {
        FakeServer::udp_at(0).await
    }

    /// UDP server on a given local port; 0 picks one.
    pub async fn udp_at(port: u16) -> FakeServer {
        let socket = Arc::new(UdpSocket::bind((localhost(), port)).await.expect("bind udp"));
        let addr = socket.local_addr().expect("local addr");
        let state = Arc::new(FakeState::default());
        let shared = state.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0_u8; 65535];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                if let Some(reply) = shared.handle(&buf[..len]).await {
                    let _ = socket.send_to(&reply, from).await;
                }
            }
        });
        FakeServer { addr, protocol: Protocol::Udp, state, task }
    }

    pub fn peer(&self) -> PeerAddress {
        PeerAddress::new(self.addr, self.protocol)
    }

    pub async fn session(&self, services: &Services) -> Arc<Session> {
        Session::connect(self.peer(), session_config(), services.clone()).await.expect("connect")
    }

    pub async fn session_with(&self, config: SessionConfig, services: &Services) -> Arc<Session> {
        Session::connect(self.peer(), config, services.clone()).await.expect("connect")
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Open file that records every reclaim.
pub struct FakeOpenFile {
    pub fh: nfs_fh4,
    pub reclaims: Mutex<Vec<clientid4>>,
}

impl FakeOpenFile {
    pub fn new(fh: nfs_fh4) -> Arc<FakeOpenFile> {
        Arc::new(FakeOpenFile { fh, reclaims: Mutex::new(Vec::new()) })
    }

    pub fn reclaims(&self) -> Vec<clientid4> {
        self.reclaims.lock().expect("lock reclaims").clone()
    }
}

#[async_trait]
impl OpenFile for FakeOpenFile {
    fn file_handle(&self) -> nfs_fh4 {
        self.fh.clone()
    }

    async fn reclaim(&self, client_id: clientid4) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.reclaims.lock().expect("lock reclaims").push(client_id);
        Ok(())
    }
}

/// Delegated file with fixed attributes that records returns.
pub struct FakeDelegatedFile {
    pub attributes: CachedAttributes,
    pub returned: Mutex<Vec<(stateid4, bool)>>,
    pub return_calls: AtomicUsize,
}

impl FakeDelegatedFile {
    pub fn new(attributes: CachedAttributes) -> Arc<FakeDelegatedFile> {
        Arc::new(FakeDelegatedFile {
            attributes,
            returned: Mutex::new(Vec::new()),
            return_calls: AtomicUsize::new(0),
        })
    }

    pub fn returned(&self) -> Vec<(stateid4, bool)> {
        self.returned.lock().expect("lock returned").clone()
    }
}

#[async_trait]
impl DelegatedFile for FakeDelegatedFile {
    fn cached_attributes(&self) -> CachedAttributes {
        self.attributes
    }

    async fn return_delegation(&self, stateid: stateid4, truncate: bool) -> anyhow::Result<()> {
        self.return_calls.fetch_add(1, Ordering::SeqCst);
        self.returned.lock().expect("lock returned").push((stateid, truncate));
        Ok(())
    }
}

pub fn delegation(fh: nfs_fh4, stateid: stateid4, file: Arc<FakeDelegatedFile>) -> Delegation {
    let file: Arc<dyn DelegatedFile> = file;
    Delegation { fh, stateid, kind: DelegationKind::Read, client_id: 0, file }
}

/// Locator pointing every moved export at one address.
pub struct FixedLocator(pub PeerAddress);

#[async_trait]
impl ExportLocator for FixedLocator {
    async fn locate(&self, _fs: &FileSystem) -> anyhow::Result<PeerAddress> {
        Ok(self.0)
    }
}

/// Encodes an RPC call with an AUTH_NULL credential.
pub fn call(xid: u32, prog: u32, vers: u32, proc: u32, args: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    call_message(xid, prog, vers, proc, opaque_auth::default())
        .serialize(&mut buf)
        .expect("encode call");
    buf.extend_from_slice(args);
    buf
}

/// Splits a reply into its header and the bytes that follow it.
pub fn split_reply(message: &[u8]) -> (rpc_msg, Vec<u8>) {
    let mut cursor = Cursor::new(message);
    let header = deserialize::<rpc_msg>(&mut cursor).expect("decode reply header");
    let rest = message[cursor.position() as usize..].to_vec();
    (header, rest)
}

/// Polls `check` until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
