mod support;

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use nfs_mamont_client::transport::{
    AddressResolver, BindPolicy, Connection, ConnectionListener, PeerAddress, Protocol, NFS_PORT,
};
use nfs_mamont_client::RpcError;
use tokio::net::UdpSocket;

use support::{init_tracing, localhost};

fn v4(a: u8, b: u8, c: u8, d: u8, port: u16, protocol: Protocol) -> PeerAddress {
    PeerAddress::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port), protocol)
}

/// Echoes every record back on each accepted connection.
async fn echo_listener() -> (SocketAddr, tokio::task::JoinHandle<usize>) {
    let listener = ConnectionListener::listen(localhost(), 0).await.expect("listen");
    let addr = listener.local_addr();
    let task = tokio::spawn(async move {
        let mut accepted = 0;
        while let Ok(connection) = listener.accept_connection().await {
            accepted += 1;
            tokio::spawn(async move {
                while let Ok(message) = connection.receive().await {
                    if connection.send(&message).await.is_err() {
                        break;
                    }
                }
            });
            if accepted == 2 {
                break;
            }
        }
        accepted
    });
    (addr, task)
}

#[tokio::test]
async fn literals_resolve_without_lookup() {
    let mut resolver = AddressResolver::resolve("192.0.2.7").await.expect("v4 literal");
    assert_eq!(resolver.len(), 1);
    let peer = resolver.next_address().expect("candidate");
    assert_eq!(peer.socket_addr(), "192.0.2.7:2049".parse().expect("addr"));
    assert_eq!(peer.protocol(), Protocol::Tcp);

    let mut resolver = AddressResolver::resolve("[2001:db8::1]").await.expect("bracketed v6");
    let peer = resolver.next_address().expect("candidate");
    assert_eq!(peer.socket_addr().ip(), "2001:db8::1".parse::<Ipv6Addr>().expect("ip"));
    assert_eq!(peer.port(), NFS_PORT);

    let mut resolver = AddressResolver::resolve("2001:db8::2").await.expect("bare v6");
    assert!(resolver.next_address().expect("candidate").socket_addr().is_ipv6());
}

#[tokio::test]
async fn malformed_literals_are_rejected() {
    for host in ["[2001:db8::1", "[not-an-ip]", "10.0.0.300", "fe80:::zz"] {
        match AddressResolver::resolve(host).await {
            Err(RpcError::BadAddress(literal)) => assert_eq!(literal, host),
            other => panic!("{} resolved to {:?}", host, other),
        }
    }
}

#[tokio::test]
async fn localhost_name_resolves() {
    let mut resolver = AddressResolver::resolve("localhost").await.expect("resolve localhost");
    assert!(!resolver.is_empty());
    let peer = resolver.next_address().expect("candidate");
    assert!(peer.socket_addr().ip().is_loopback());
}

#[test]
fn resolver_forces_port_and_protocol_and_rewinds() {
    let first = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    let second = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
    let mut resolver = AddressResolver::from_candidates(vec![first, second]);
    resolver.force_port(20049);
    resolver.force_protocol(Protocol::Udp);

    let a = resolver.next_address().expect("first");
    let b = resolver.next_address().expect("second");
    assert_eq!(a, v4(10, 0, 0, 1, 20049, Protocol::Udp));
    assert_eq!(b, v4(10, 0, 0, 2, 20049, Protocol::Udp));
    assert!(matches!(resolver.next_address(), Err(RpcError::AddressNotFound)));

    resolver.rewind();
    assert_eq!(resolver.next_address().expect("again"), a);
}

#[test]
fn peer_ordering_and_hashing() {
    let a = v4(10, 0, 0, 1, 2049, Protocol::Tcp);
    let b = v4(10, 0, 0, 1, 2050, Protocol::Tcp);
    let c = v4(10, 0, 0, 2, 1, Protocol::Tcp);
    let d = v4(10, 0, 0, 1, 2049, Protocol::Udp);
    assert!(a < b);
    assert!(b < c);
    assert!(a < d);
    assert_ne!(a, d);

    let v6 = PeerAddress::new("[::1]:2049".parse().expect("addr"), Protocol::Tcp);
    assert!(a < v6);

    let set: HashSet<PeerAddress> = [a, b, a, d, v4(10, 0, 0, 1, 2049, Protocol::Tcp)].into();
    assert_eq!(set.len(), 3);
}

#[test]
fn netid_and_universal_address() {
    let tcp = v4(10, 0, 0, 1, 2049, Protocol::Tcp);
    assert_eq!(tcp.netid(), "tcp");
    assert_eq!(tcp.universal_address(), "10.0.0.1.8.1");

    let udp6 = PeerAddress::new("[fe80::1]:700".parse().expect("addr"), Protocol::Udp);
    assert_eq!(udp6.netid(), "udp6");
    assert_eq!(udp6.universal_address(), "fe80::1.2.188");

    let mut moved = tcp;
    moved.set_port(0);
    moved.set_protocol(Protocol::Udp);
    assert_eq!(moved.universal_address(), "10.0.0.1.0.0");
    assert_eq!(moved.to_string(), "10.0.0.1:0/udp");
}

#[test]
fn bind_falls_back_to_os_port() {
    let policy = BindPolicy::default();
    let mut tried = Vec::new();
    let (_, port) = policy
        .bind_with_retry(|port| {
            tried.push(port);
            if port == 0 {
                Ok(())
            } else {
                Err(io::Error::from(io::ErrorKind::AddrInUse))
            }
        })
        .expect("fallback bind");
    assert_eq!(port, 0);
    assert_eq!(tried.len(), 11);
    assert!(tried[..10].iter().all(|p| (665..1024).contains(p)));
    assert_eq!(tried[10], 0);
}

#[test]
fn bind_stops_at_first_success() {
    let policy = BindPolicy { attempts: 5, ports: 900..=900 };
    let mut calls = 0;
    let (_, port) = policy
        .bind_with_retry(|port| {
            calls += 1;
            Ok::<_, io::Error>(port)
        })
        .expect("bind");
    assert_eq!(port, 900);
    assert_eq!(calls, 1);
}

#[test]
fn bind_reports_fallback_error() {
    let policy = BindPolicy { attempts: 2, ports: 700..=701 };
    let err = policy
        .bind_with_retry(|port| -> io::Result<()> {
            if port == 0 {
                Err(io::Error::from(io::ErrorKind::PermissionDenied))
            } else {
                Err(io::Error::from(io::ErrorKind::AddrInUse))
            }
        })
        .expect_err("every bind fails");
    assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);

    let mut calls = Vec::new();
    BindPolicy::os_assigned()
        .bind_with_retry(|port| {
            calls.push(port);
            Ok::<_, io::Error>(())
        })
        .expect("os assigned");
    assert_eq!(calls, vec![0]);
}

#[tokio::test]
async fn stream_connection_exchanges_fragmented_records() {
    init_tracing();
    let (addr, server) = echo_listener().await;
    let peer = PeerAddress::new(addr, Protocol::Tcp);
    let connection = Connection::connect(peer, BindPolicy::os_assigned())
        .await
        .expect("connect")
        .with_max_fragment(16);
    assert_eq!(connection.peer(), peer);
    assert!(connection.local_addr().await.expect("local addr").ip().is_loopback());

    let message: Vec<u8> = (0..1000_u32).map(|i| i as u8).collect();
    connection.send(&message).await.expect("send");
    assert_eq!(connection.receive().await.expect("receive"), message);

    connection.send(&[]).await.expect("send empty");
    assert!(connection.receive().await.expect("receive empty").is_empty());

    connection.reconnect().await.expect("reconnect");
    connection.send(b"after reconnect").await.expect("send");
    assert_eq!(connection.receive().await.expect("receive"), b"after reconnect");

    assert_eq!(server.await.expect("server"), 2);
}

#[tokio::test]
async fn packet_connection_sends_whole_datagrams() {
    init_tracing();
    let echo = UdpSocket::bind((localhost(), 0)).await.expect("bind");
    let addr = echo.local_addr().expect("addr");
    tokio::spawn(async move {
        let mut buf = vec![0_u8; 65535];
        while let Ok((len, from)) = echo.recv_from(&mut buf).await {
            let _ = echo.send_to(&buf[..len], from).await;
        }
    });

    let peer = PeerAddress::new(addr, Protocol::Udp);
    let connection = Connection::connect(peer, BindPolicy::os_assigned()).await.expect("connect");
    let message = vec![0xab_u8; 8000];
    connection.send(&message).await.expect("send");
    assert_eq!(connection.receive().await.expect("receive"), message);

    match connection.send(&vec![0_u8; 70000]).await {
        Err(RpcError::RecordTooLarge { length, max }) => {
            assert_eq!(length, 70000);
            assert_eq!(max, 65535);
        }
        other => panic!("expected RecordTooLarge, got {:?}", other),
    }

    connection.reconnect().await.expect("reconnect");
    connection.send(b"again").await.expect("send");
    assert_eq!(connection.receive().await.expect("receive"), b"again");
}

#[tokio::test]
async fn disconnect_wakes_blocked_receiver() {
    init_tracing();
    let listener = ConnectionListener::listen(localhost(), 0).await.expect("listen");
    let peer = PeerAddress::new(listener.local_addr(), Protocol::Tcp);
    let connection =
        Arc::new(Connection::connect(peer, BindPolicy::os_assigned()).await.expect("connect"));
    let _accepted = listener.accept_connection().await.expect("accept");

    let receiver = connection.clone();
    let blocked = tokio::spawn(async move { receiver.receive().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    connection.disconnect().await;

    let result = tokio::time::timeout(Duration::from_secs(1), blocked)
        .await
        .expect("receiver woke up")
        .expect("join");
    assert!(matches!(result, Err(RpcError::Aborted)));
    assert!(matches!(connection.send(b"x").await, Err(RpcError::Aborted)));
    connection.disconnect().await;
}

#[tokio::test]
async fn disconnect_wakes_blocked_packet_receiver() {
    let silent = UdpSocket::bind((localhost(), 0)).await.expect("bind");
    let peer = PeerAddress::new(silent.local_addr().expect("addr"), Protocol::Udp);
    let connection =
        Arc::new(Connection::connect(peer, BindPolicy::os_assigned()).await.expect("connect"));

    let receiver = connection.clone();
    let blocked = tokio::spawn(async move { receiver.receive().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    connection.disconnect().await;

    let result = tokio::time::timeout(Duration::from_secs(1), blocked)
        .await
        .expect("receiver woke up")
        .expect("join");
    assert!(matches!(result, Err(RpcError::Aborted)));
}

#[tokio::test]
async fn peer_close_aborts_receive() {
    let listener = ConnectionListener::listen(localhost(), 0).await.expect("listen");
    let peer = PeerAddress::new(listener.local_addr(), Protocol::Tcp);
    let connection = Connection::connect(peer, BindPolicy::os_assigned()).await.expect("connect");
    let accepted = listener.accept_connection().await.expect("accept");
    accepted.disconnect().await;
    drop(accepted);

    assert!(matches!(connection.receive().await, Err(RpcError::Aborted)));
}

#[tokio::test]
async fn accepted_connection_cannot_reconnect() {
    let listener = ConnectionListener::listen(localhost(), 0).await.expect("listen");
    let peer = PeerAddress::new(listener.local_addr(), Protocol::Tcp);
    let _client = Connection::connect(peer, BindPolicy::os_assigned()).await.expect("connect");
    let accepted = listener.accept_connection().await.expect("accept");
    assert_eq!(accepted.peer().protocol(), Protocol::Tcp);

    match accepted.reconnect().await {
        Err(RpcError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::NotConnected),
        other => panic!("expected NotConnected, got {:?}", other),
    }
}

#[tokio::test]
async fn listener_disconnect_aborts_accept() {
    let listener = Arc::new(ConnectionListener::listen(localhost(), 0).await.expect("listen"));
    assert_ne!(listener.local_addr().port(), 0);

    let acceptor = listener.clone();
    let blocked = tokio::spawn(async move { acceptor.accept_connection().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    listener.disconnect();
    assert!(listener.is_disconnected());

    let result = tokio::time::timeout(Duration::from_secs(1), blocked)
        .await
        .expect("acceptor woke up")
        .expect("join");
    assert!(matches!(result, Err(RpcError::Aborted)));
    assert!(matches!(listener.accept_connection().await, Err(RpcError::Aborted)));
}
