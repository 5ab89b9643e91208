mod support;

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nfs_mamont_client::client::{Cookie, MountConfig, Request, RetryPolicy, RpcServer};
use nfs_mamont_client::transport::{PeerAddress, Protocol};
use nfs_mamont_client::xdr::deserialize;
use nfs_mamont_client::xdr::nfs4::{
    self, nfs_argop4, nfs_resop4, nfsstat4, COMPOUND4args, COMPOUND4res, RENEW4args,
};
use nfs_mamont_client::xdr::rpc::{auth_flavor, peek_xid, rpc_body, rpc_msg};
use nfs_mamont_client::RpcError;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use support::{init_tracing, localhost, session_config, FakeServer};

fn soft(timeout_ms: u64, retry_limit: u32) -> RetryPolicy {
    RetryPolicy { timeout: Duration::from_millis(timeout_ms), retry_limit, hard: false }
}

fn hard(timeout_ms: u64) -> RetryPolicy {
    RetryPolicy { timeout: Duration::from_millis(timeout_ms), retry_limit: 1, hard: true }
}

async fn connect(peer: PeerAddress) -> Arc<RpcServer> {
    RpcServer::connect(peer, &session_config()).await.expect("connect")
}

/// UDP peer that never answers and keeps every datagram it gets.
async fn silent_udp() -> (PeerAddress, Arc<Mutex<Vec<Vec<u8>>>>) {
    let socket = UdpSocket::bind((localhost(), 0)).await.expect("bind");
    let peer = PeerAddress::new(socket.local_addr().expect("addr"), Protocol::Udp);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    tokio::spawn(async move {
        let mut buf = vec![0_u8; 65535];
        while let Ok((len, _)) = socket.recv_from(&mut buf).await {
            record.lock().expect("lock datagrams").push(buf[..len].to_vec());
        }
    });
    (peer, seen)
}

fn null_request(server: &Arc<RpcServer>, policy: RetryPolicy) -> Request {
    let mut request = Request::new(server.clone(), policy);
    request.set_call(nfs4::PROGRAM, nfs4::VERSION, nfs4::NFSPROC4_NULL, &[]).expect("set call");
    request
}

#[test]
fn policy_follows_mount_config() {
    let config = MountConfig { hard: false, retry_limit: 7, ..Default::default() };
    let policy = RetryPolicy::from(&config);
    assert_eq!(policy.timeout, Duration::from_secs(60));
    assert_eq!(policy.retry_limit, 7);
    assert!(!policy.hard);
    assert!(!RetryPolicy::bootstrap().hard);
}

#[tokio::test]
async fn soft_packet_call_times_out_after_retry_limit() {
    init_tracing();
    let (peer, seen) = silent_udp().await;
    let server = connect(peer).await;
    let mut request = null_request(&server, soft(100, 3));

    let started = Instant::now();
    match request.send(None).await {
        Err(RpcError::TimedOut { attempts }) => assert_eq!(attempts, 3),
        other => panic!("expected TimedOut, got {:?}", other),
    }
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(server.pending_calls(), 0);

    let datagrams = seen.lock().expect("lock datagrams").clone();
    assert_eq!(datagrams.len(), 3);
    let xid = peek_xid(&datagrams[0]).expect("xid");
    assert!(datagrams.iter().all(|d| peek_xid(d) == Some(xid)));
    assert!(datagrams.iter().all(|d| d == &datagrams[0]));
    server.shutdown().await;
}

#[tokio::test]
async fn hard_packet_call_ends_only_on_cancel() {
    init_tracing();
    let (peer, seen) = silent_udp().await;
    let server = connect(peer).await;
    let mut request = null_request(&server, hard(50));

    let cookie = Cookie::new();
    let canceller = cookie.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        canceller.cancel();
    });
    assert!(matches!(request.send(Some(&cookie)).await, Err(RpcError::Cancelled)));
    assert!(cookie.is_cancelled());
    assert_eq!(server.pending_calls(), 0);
    assert!(seen.lock().expect("lock datagrams").len() >= 4);
    server.shutdown().await;
}

#[tokio::test]
async fn packet_reader_keeps_listening_through_refused_port() {
    init_tracing();
    let port = {
        let socket = std::net::UdpSocket::bind((localhost(), 0)).expect("bind");
        socket.local_addr().expect("addr").port()
    };
    let server = connect(PeerAddress::new(SocketAddr::new(localhost(), port), Protocol::Udp)).await;
    for _ in 0..7 {
        let mut request = null_request(&server, soft(20, 1));
        assert!(request.send(None).await.is_err());
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let fake = FakeServer::udp_at(port).await;
    let mut request = null_request(&server, soft(1000, 1));
    let started = Instant::now();
    request.send(None).await.expect("NULL once the server is back");
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(fake.state.null_calls.load(Ordering::SeqCst), 1);
    server.shutdown().await;
}

#[tokio::test]
async fn stream_null_and_compound() {
    init_tracing();
    let fake = FakeServer::tcp().await;
    let server = connect(fake.peer()).await;
    assert_eq!(server.protocol(), Protocol::Tcp);

    let mut request = null_request(&server, soft(1000, 2));
    request.send(None).await.expect("NULL");
    assert_eq!(request.reply(), Some(&[][..]));
    assert_eq!(fake.state.null_calls.load(Ordering::SeqCst), 1);

    let args = COMPOUND4args {
        tag: "renew".to_string(),
        minorversion: 0,
        argarray: vec![nfs_argop4::RENEW(RENEW4args { clientid: 42 })],
    };
    request.reset();
    assert!(request.reply().is_none());
    request
        .set_call_args(nfs4::PROGRAM, nfs4::VERSION, nfs4::NFSPROC4_COMPOUND, &args)
        .expect("set call");
    request.send(None).await.expect("COMPOUND");
    let res: COMPOUND4res = request.decode_reply().expect("decode");
    assert_eq!(res.status, nfsstat4::NFS4_OK);
    assert_eq!(res.tag, "renew");
    assert_eq!(res.resarray, vec![nfs_resop4::RENEW(nfsstat4::NFS4_OK)]);

    // The call stays set up and can be sent again.
    request.send(None).await.expect("COMPOUND again");
    assert_eq!(fake.state.renew_calls.load(Ordering::SeqCst), 2);
    server.shutdown().await;
}

#[tokio::test]
async fn send_without_call_fails() {
    let fake = FakeServer::tcp().await;
    let server = connect(fake.peer()).await;
    let mut request = Request::new(server.clone(), soft(100, 1));
    assert!(matches!(request.send(None).await, Err(RpcError::Xdr(_))));
    assert!(matches!(request.decode_reply::<COMPOUND4res>(), Err(RpcError::Xdr(_))));
    server.shutdown().await;
}

#[tokio::test]
async fn unaccepted_reply_is_rejected() {
    let fake = FakeServer::tcp().await;
    let server = connect(fake.peer()).await;
    let mut request = Request::new(server.clone(), soft(1000, 1));
    request.set_call(100005, 3, 0, &[]).expect("set call");
    match request.send(None).await {
        Err(RpcError::Rejected(reason)) => assert_eq!(reason, "program unavailable"),
        other => panic!("expected Rejected, got {:?}", other),
    }
    assert!(request.reply().is_none());

    request.set_call(nfs4::PROGRAM, nfs4::VERSION, 99, &[]).expect("set call");
    match request.send(None).await {
        Err(RpcError::Rejected(reason)) => assert_eq!(reason, "procedure unavailable"),
        other => panic!("expected Rejected, got {:?}", other),
    }
    server.shutdown().await;
}

#[tokio::test]
async fn concurrent_calls_share_one_connection() {
    init_tracing();
    let fake = FakeServer::tcp().await;
    let server = connect(fake.peer()).await;

    let mut calls = Vec::new();
    for _ in 0..20 {
        let server = server.clone();
        calls.push(tokio::spawn(async move {
            let mut request = null_request(&server, soft(2000, 1));
            request.send(None).await
        }));
    }
    for call in calls {
        call.await.expect("join").expect("NULL");
    }
    assert_eq!(fake.state.null_calls.load(Ordering::SeqCst), 20);
    assert_eq!(fake.state.connections.load(Ordering::SeqCst), 1);
    assert_eq!(server.pending_calls(), 0);
    server.shutdown().await;
}

#[tokio::test]
async fn silent_stream_is_repaired_and_call_resent() {
    init_tracing();
    let fake = FakeServer::tcp().await;
    fake.state.drop_calls.store(1, Ordering::SeqCst);
    let server = connect(fake.peer()).await;
    assert_eq!(server.generation(), 0);

    let mut request = null_request(&server, soft(200, 3));
    request.send(None).await.expect("NULL after repair");
    assert_eq!(server.generation(), 1);
    assert_eq!(fake.state.connections.load(Ordering::SeqCst), 2);
    assert_eq!(fake.state.null_calls.load(Ordering::SeqCst), 1);
    server.shutdown().await;
}

#[tokio::test]
async fn soft_stream_call_gives_up() {
    let fake = FakeServer::tcp().await;
    fake.state.drop_calls.store(u32::MAX, Ordering::SeqCst);
    let server = connect(fake.peer()).await;

    let mut request = null_request(&server, soft(100, 2));
    match request.send(None).await {
        Err(RpcError::TimedOut { attempts }) => assert_eq!(attempts, 2),
        other => panic!("expected TimedOut, got {:?}", other),
    }
    assert_eq!(server.generation(), 1);
    server.shutdown().await;
}

#[tokio::test]
async fn concurrent_repairs_reconnect_once() {
    let fake = FakeServer::tcp().await;
    let server = connect(fake.peer()).await;
    let seen = server.generation();
    let (a, b) = tokio::join!(server.repair(seen), server.repair(seen));
    a.expect("first repair");
    b.expect("second repair");
    assert_eq!(server.generation(), seen + 1);

    let mut request = null_request(&server, soft(1000, 1));
    request.send(None).await.expect("NULL on repaired connection");
    server.shutdown().await;
}

#[tokio::test]
async fn shutdown_cancels_waiting_calls() {
    init_tracing();
    let fake = FakeServer::tcp().await;
    fake.state.drop_calls.store(u32::MAX, Ordering::SeqCst);
    let server = connect(fake.peer()).await;

    let waiting = {
        let server = server.clone();
        tokio::spawn(async move {
            let mut request = null_request(&server, hard(10_000));
            request.send(None).await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.pending_calls(), 1);
    server.shutdown().await;
    assert!(server.is_shut_down());

    let result = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .expect("call woke up")
        .expect("join");
    assert!(matches!(result, Err(RpcError::Cancelled)));

    let mut request = null_request(&server, soft(100, 1));
    assert!(matches!(request.send(None).await, Err(RpcError::Cancelled)));
    assert!(matches!(server.repair(server.generation()).await, Err(RpcError::Cancelled)));
}

#[tokio::test]
async fn calls_carry_unix_credentials() {
    let (peer, seen) = silent_udp().await;
    let server = connect(peer).await;
    let mut request = null_request(&server, soft(50, 1));
    let _ = request.send(None).await;

    let datagram = seen.lock().expect("lock datagrams")[0].clone();
    let header = deserialize::<rpc_msg>(&mut Cursor::new(&datagram)).expect("decode call");
    let rpc_body::CALL(call) = header.body else {
        panic!("expected a call");
    };
    assert_eq!(call.prog, nfs4::PROGRAM);
    assert_eq!(call.vers, nfs4::VERSION);
    assert_eq!(call.cred.flavor, auth_flavor::AUTH_UNIX);
    assert_eq!(call.cred.body, server.credential().body);
    server.shutdown().await;
}
