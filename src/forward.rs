//! Per-forward stream forwarders
//!
//! Each TCP forward runs one accept loop; every accepted connection dials
//! the upstream and splices both directions until either side closes. Each
//! UDP forward runs one bidirectional splice between the bound local socket
//! and a connected upstream socket, serving a single client flow.
//!
//! Forwarder tasks register themselves on the proxy plane once their socket
//! is bound and unregister on exit; the reconciler tears them down by
//! closing their shutdown channel. An abrupt close is a normal termination.

use crate::discovery::{Container, Forward};
use crate::error::GatewayError;
use crate::reconcile::ProxyPlane;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Datagram buffer size for UDP splicing
const UDP_BUF_SIZE: usize = 64 * 1024;

/// Bind attempts while a previous listener for the same address drains
const BIND_ATTEMPTS: usize = 5;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Spawn the accept loop for a TCP forward. The listener is registered on
/// the plane under the forward's prefix; the task exits when the plane
/// signals shutdown or the listener fails.
pub fn spawn_tcp(plane: Arc<ProxyPlane>, forward: Forward, service: Arc<Container>) -> u64 {
    let generation = plane.next_generation();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(run_tcp(plane, forward, service, generation, shutdown_tx, shutdown_rx));
    generation
}

/// Spawn the splice task for a UDP forward.
pub fn spawn_udp(plane: Arc<ProxyPlane>, forward: Forward, service: Arc<Container>) -> u64 {
    let generation = plane.next_generation();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(run_udp(plane, forward, service, generation, shutdown_tx, shutdown_rx));
    generation
}

async fn run_tcp(
    plane: Arc<ProxyPlane>,
    forward: Forward,
    service: Arc<Container>,
    generation: u64,
    shutdown_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let listener = match bind_tcp(&forward.key).await {
        Ok(listener) => listener,
        Err(e) => {
            let err = GatewayError::ListenerFailure(format!("bind {}: {}", forward.key, e));
            warn!(prefix = %forward.prefix, upstream = %forward.uri, error = %err, "TCP forward failed");
            return;
        }
    };
    if !plane.register_listener(&forward, &service, generation, shutdown_tx) {
        // The plane moved on while we were binding.
        return;
    }
    info!(prefix = %forward.prefix, upstream = %forward.uri, "TCP forward started");

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((local, peer)) => {
                    let upstream = forward.uri.clone();
                    let prefix = forward.prefix.clone();
                    tokio::spawn(async move {
                        match TcpStream::connect(&upstream).await {
                            Ok(remote) => splice_tcp(local, remote, &prefix).await,
                            // Keep accepting: one unreachable upstream dial
                            // must not take the whole forward down.
                            Err(e) => {
                                warn!(prefix = %prefix, upstream = %upstream, peer = %peer, error = %e, "Upstream dial failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!(prefix = %forward.prefix, error = %e, "TCP accept failed");
                    break;
                }
            }
        }
    }

    plane.unregister_listener(&forward.prefix, generation);
    info!(prefix = %forward.prefix, upstream = %forward.uri, "TCP forward stopped");
}

async fn bind_tcp(addr: &str) -> std::io::Result<TcpListener> {
    for _ in 1..BIND_ATTEMPTS {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            // A replaced listener for this address may still be draining.
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tokio::time::sleep(BIND_RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
    TcpListener::bind(addr).await
}

async fn splice_tcp(mut local: TcpStream, mut remote: TcpStream, prefix: &str) {
    match tokio::io::copy_bidirectional(&mut local, &mut remote).await {
        Ok((to_remote, to_local)) => {
            debug!(prefix, to_remote, to_local, "TCP connection closed");
        }
        Err(e) => {
            debug!(prefix, error = %e, "TCP connection closed with error");
        }
    }
}

async fn run_udp(
    plane: Arc<ProxyPlane>,
    forward: Forward,
    service: Arc<Container>,
    generation: u64,
    shutdown_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let local = match UdpSocket::bind(&forward.key).await {
        Ok(socket) => socket,
        Err(e) => {
            let err = GatewayError::ListenerFailure(format!("bind {}: {}", forward.key, e));
            warn!(prefix = %forward.prefix, upstream = %forward.uri, error = %err, "UDP forward failed");
            return;
        }
    };
    let remote = match dial_udp(&forward.uri).await {
        Ok(socket) => socket,
        Err(e) => {
            let err = GatewayError::ListenerFailure(format!("dial {}: {}", forward.uri, e));
            warn!(prefix = %forward.prefix, upstream = %forward.uri, error = %err, "UDP forward failed");
            return;
        }
    };
    if !plane.register_listener(&forward, &service, generation, shutdown_tx) {
        return;
    }
    info!(prefix = %forward.prefix, upstream = %forward.uri, "UDP forward started");

    // Single client flow: datagrams from the most recent peer are forwarded
    // and replies go back to it.
    let mut peer = None;
    let mut inbound = vec![0u8; UDP_BUF_SIZE];
    let mut outbound = vec![0u8; UDP_BUF_SIZE];
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            received = local.recv_from(&mut inbound) => match received {
                Ok((n, from)) => {
                    peer = Some(from);
                    if let Err(e) = remote.send(&inbound[..n]).await {
                        debug!(prefix = %forward.prefix, error = %e, "UDP send to upstream failed");
                        break;
                    }
                }
                Err(e) => {
                    debug!(prefix = %forward.prefix, error = %e, "UDP local receive failed");
                    break;
                }
            },
            received = remote.recv(&mut outbound) => match received {
                Ok(n) => {
                    if let Some(peer) = peer {
                        if let Err(e) = local.send_to(&outbound[..n], peer).await {
                            debug!(prefix = %forward.prefix, error = %e, "UDP reply failed");
                            break;
                        }
                    }
                }
                Err(e) => {
                    debug!(prefix = %forward.prefix, error = %e, "UDP upstream receive failed");
                    break;
                }
            },
        }
    }

    plane.unregister_listener(&forward.prefix, generation);
    info!(prefix = %forward.prefix, upstream = %forward.uri, "UDP forward stopped");
}

async fn dial_udp(upstream: &str) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(upstream).await?;
    Ok(socket)
}
