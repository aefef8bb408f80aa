//! Integration tests for the proxy plane and stream forwarders

use srvgate::discovery::{Container, Forward, ForwardKind};
use srvgate::reconcile::ProxyPlane;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

fn http_container(id: &str, prefix: &str, uri: &str, wildcard: bool) -> (String, Arc<Container>) {
    let forward = Forward {
        name: "api".to_string(),
        kind: ForwardKind::Http,
        key: "api".to_string(),
        prefix: prefix.to_string(),
        uri: uri.to_string(),
        wildcard,
    };
    stream_entry(id, forward)
}

fn tcp_container(id: &str, bind: &str, uri: &str) -> (String, Arc<Container>) {
    let forward = Forward {
        name: "db".to_string(),
        kind: ForwardKind::Tcp,
        key: bind.to_string(),
        prefix: format!("tcp://{}", bind),
        uri: uri.to_string(),
        wildcard: false,
    };
    stream_entry(id, forward)
}

fn udp_container(id: &str, bind: &str, uri: &str) -> (String, Arc<Container>) {
    let forward = Forward {
        name: "dns".to_string(),
        kind: ForwardKind::Udp,
        key: bind.to_string(),
        prefix: format!("udp://{}", bind),
        uri: uri.to_string(),
        wildcard: false,
    };
    stream_entry(id, forward)
}

fn stream_entry(id: &str, forward: Forward) -> (String, Arc<Container>) {
    let prefix = forward.prefix.clone();
    let mut forwards = HashMap::new();
    forwards.insert(prefix.clone(), forward);
    (
        prefix,
        Arc::new(Container {
            id: id.to_string(),
            name: "web".to_string(),
            version: "v1.2".to_string(),
            token: "tok".to_string(),
            forwards,
            status: "running".to_string(),
            ..Default::default()
        }),
    )
}

/// Reserve a loopback port by binding ephemeral and releasing it.
async fn free_tcp_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

async fn free_udp_addr() -> String {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap().to_string();
    drop(socket);
    addr
}

/// Wait for an address to accept connections (forwarder is registered)
async fn wait_for_listener(addr: &str, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(addr).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Wait for an address to stop accepting connections
async fn wait_for_closed(addr: &str, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(addr).await.is_err() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Spawn a TCP upstream that echoes every connection, prefixed by a tag.
async fn spawn_echo_upstream(tag: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = stream.write_all(tag.as_bytes()).await;
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

async fn read_tag(stream: &mut TcpStream, len: usize) -> String {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.unwrap();
    String::from_utf8(buf).unwrap()
}

#[tokio::test]
async fn test_tcp_forward_lifecycle() {
    let plane = ProxyPlane::new(".example".to_string());
    let upstream = spawn_echo_upstream("one").await;
    let bind = free_tcp_addr().await;

    let (prefix, service) = tcp_container("c1", &bind, &upstream);
    let outcome = plane.apply(HashMap::from([(prefix.clone(), service)]));
    assert!(outcome.added.contains_key(&prefix));
    assert!(wait_for_listener(&bind, Duration::from_secs(2)).await);
    assert!(plane.has_listener(&prefix));

    // Traffic is spliced to the upstream and back.
    let mut stream = TcpStream::connect(&bind).await.unwrap();
    assert_eq!(read_tag(&mut stream, 3).await, "one");
    stream.write_all(b"ping").await.unwrap();
    assert_eq!(read_tag(&mut stream, 4).await, "ping");
    drop(stream);

    // The container vanishes: listener is closed and the prefix is removed.
    let outcome = plane.apply(HashMap::new());
    assert!(outcome.removed.contains_key(&prefix));
    assert!(wait_for_closed(&bind, Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_tcp_forward_uri_change_respawns_listener() {
    let plane = ProxyPlane::new(".example".to_string());
    let first = spawn_echo_upstream("aaa").await;
    let second = spawn_echo_upstream("bbb").await;
    let bind = free_tcp_addr().await;

    let (prefix, service) = tcp_container("c1", &bind, &first);
    plane.apply(HashMap::from([(prefix.clone(), service)]));
    assert!(wait_for_listener(&bind, Duration::from_secs(2)).await);

    let (_, changed) = tcp_container("c1", &bind, &second);
    let outcome = plane.apply(HashMap::from([(prefix.clone(), changed)]));
    assert!(outcome.updated.contains_key(&prefix));
    assert!(outcome.added.is_empty());

    // New connections land on the replacement upstream. The respawned
    // listener may need a moment to rebind the same address.
    let start = std::time::Instant::now();
    loop {
        if let Ok(mut stream) = TcpStream::connect(&bind).await {
            if read_tag(&mut stream, 3).await == "bbb" {
                break;
            }
        }
        assert!(
            start.elapsed() < Duration::from_secs(3),
            "forward never moved to the new upstream"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_tcp_unchanged_uri_keeps_listener() {
    let plane = ProxyPlane::new(".example".to_string());
    let upstream = spawn_echo_upstream("one").await;
    let bind = free_tcp_addr().await;

    let (prefix, service) = tcp_container("c1", &bind, &upstream);
    plane.apply(HashMap::from([(prefix.clone(), Arc::clone(&service))]));
    assert!(wait_for_listener(&bind, Duration::from_secs(2)).await);

    let outcome = plane.apply(HashMap::from([(prefix.clone(), service)]));
    assert!(outcome.added.is_empty());
    assert!(outcome.updated.is_empty());
    assert!(outcome.removed.is_empty());
    assert!(plane.has_listener(&prefix));

    let mut stream = TcpStream::connect(&bind).await.unwrap();
    assert_eq!(read_tag(&mut stream, 3).await, "one");
}

#[tokio::test]
async fn test_udp_forward_splices_datagrams() {
    let plane = ProxyPlane::new(".example".to_string());

    // UDP upstream that echoes datagrams back to the sender.
    let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            match upstream.recv_from(&mut buf).await {
                Ok((n, from)) => {
                    let _ = upstream.send_to(&buf[..n], from).await;
                }
                Err(_) => return,
            }
        }
    });

    let bind = free_udp_addr().await;
    let (prefix, service) = udp_container("c1", &bind, &upstream_addr);
    let outcome = plane.apply(HashMap::from([(prefix.clone(), service)]));
    assert!(outcome.added.contains_key(&prefix));

    // Registration happens in the spawned task.
    let start = std::time::Instant::now();
    while !plane.has_listener(&prefix) {
        assert!(start.elapsed() < Duration::from_secs(2), "udp forward never registered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(&bind).await.unwrap();
    client.send(b"ping").await.unwrap();
    let mut buf = [0u8; 16];
    let received = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
        .await
        .expect("no echo within timeout")
        .unwrap();
    assert_eq!(&buf[..received], b"ping");

    // Teardown unregisters the forward.
    plane.apply(HashMap::new());
    let start = std::time::Instant::now();
    while plane.has_listener(&prefix) {
        assert!(start.elapsed() < Duration::from_secs(2), "udp forward never unregistered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_refresh_buckets_are_disjoint() {
    let plane = ProxyPlane::new(".example".to_string());
    let upstream = spawn_echo_upstream("one").await;
    let bind_kept = free_tcp_addr().await;
    let bind_gone = free_tcp_addr().await;

    let (p_http, c_http) = http_container("c1", "api.v12.web", "10.0.0.5:32001", false);
    let (p_kept, c_kept) = tcp_container("c2", &bind_kept, &upstream);
    let (p_gone, c_gone) = tcp_container("c3", &bind_gone, &upstream);
    plane.apply(HashMap::from([
        (p_http.clone(), c_http),
        (p_kept.clone(), Arc::clone(&c_kept)),
        (p_gone.clone(), c_gone),
    ]));

    // Next pass: http upstream changes, one tcp forward stays, one is gone,
    // and a brand new route appears.
    let (_, c_http2) = http_container("c1", "api.v12.web", "10.0.0.5:32002", false);
    let (p_new, c_new) = http_container("c4", "www.v20.shop", "10.0.0.5:32011", false);
    let outcome = plane.apply(HashMap::from([
        (p_http.clone(), c_http2),
        (p_kept.clone(), c_kept),
        (p_new.clone(), c_new),
    ]));

    assert!(outcome.added.contains_key(&p_new));
    assert!(outcome.updated.contains_key(&p_http));
    assert!(outcome.removed.contains_key(&p_gone));
    assert_eq!(outcome.all.len(), 3);

    // A prefix never lands in more than one bucket.
    for prefix in outcome.added.keys() {
        assert!(!outcome.updated.contains_key(prefix));
        assert!(!outcome.removed.contains_key(prefix));
    }
    for prefix in outcome.updated.keys() {
        assert!(!outcome.removed.contains_key(prefix));
    }
    // Unchanged prefixes stay out of every bucket.
    assert!(!outcome.added.contains_key(&p_kept));
    assert!(!outcome.updated.contains_key(&p_kept));
    assert!(!outcome.removed.contains_key(&p_kept));
}
