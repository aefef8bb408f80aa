//! Front-door HTTP server: virtual-host dispatch per request
//!
//! Every inbound request is matched against the route table by Host header.
//! A match either enters the service control surface (paths under the
//! reserved prefix) or is forwarded to the container upstream; anything
//! else falls back to the index page.

use crate::control::ControlSurface;
use crate::error::{text_response, GatewayBody};
use crate::index::IndexPage;
use crate::reconcile::ProxyPlane;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub struct FrontDoor {
    bind_addr: SocketAddr,
    plane: Arc<ProxyPlane>,
    control: Arc<ControlSurface>,
    index: Arc<IndexPage>,
    srv_prefix: String,
    shutdown_rx: watch::Receiver<bool>,
}

impl FrontDoor {
    pub fn new(
        bind_addr: SocketAddr,
        plane: Arc<ProxyPlane>,
        control: Arc<ControlSurface>,
        index: Arc<IndexPage>,
        srv_prefix: String,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            plane,
            control,
            index,
            srv_prefix,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Front door listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let plane = Arc::clone(&self.plane);
                            let control = Arc::clone(&self.control);
                            let index = Arc::clone(&self.index);
                            let srv_prefix = self.srv_prefix.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, plane, control, index, srv_prefix).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Front door shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    plane: Arc<ProxyPlane>,
    control: Arc<ControlSurface>,
    index: Arc<IndexPage>,
    srv_prefix: String,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let plane = Arc::clone(&plane);
        let control = Arc::clone(&control);
        let index = Arc::clone(&index);
        let srv_prefix = srv_prefix.clone();
        async move { handle_request(req, plane, control, index, &srv_prefix).await }
    });

    // Upgrades are required for the control surface's log stream.
    AutoBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    plane: Arc<ProxyPlane>,
    control: Arc<ControlSurface>,
    index: Arc<IndexPage>,
    srv_prefix: &str,
) -> Result<Response<GatewayBody>, hyper::Error> {
    let host = request_host(&req);

    if let Some(host) = &host {
        if let Some(matched) = plane.lookup(host) {
            if req.uri().path().starts_with(srv_prefix) {
                return Ok(control.handle(req, matched.service).await);
            }
            debug!(host = %host, upstream = %matched.forward.uri, method = %req.method(), "Proxying request");
            return match plane.pool.send_request(req, &matched.forward.uri).await {
                Ok(response) => Ok(response),
                Err(e) => {
                    error!(host = %host, upstream = %matched.forward.uri, error = %e, "Upstream request failed");
                    Ok(text_response(
                        StatusCode::BAD_GATEWAY,
                        format!("upstream request failed: {}", e),
                    ))
                }
            };
        }
    }

    Ok(index.render(host.as_deref().unwrap_or(""), plane.containers()))
}

/// Request host for route lookup.
fn request_host(req: &Request<Incoming>) -> Option<String> {
    let header = req.headers().get(hyper::header::HOST)?.to_str().ok()?;
    normalize_host(header)
}

/// Host header minus any `:port`, lowercased to match the route table.
/// Route keys are dotted virtual hosts, so anything else (an IPv6 literal,
/// an empty header) simply falls through to the index page.
fn normalize_host(header: &str) -> Option<String> {
    let name = header.split(':').next().unwrap_or(header);
    if name.is_empty() {
        return None;
    }
    Some(name.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_host_strips_port_and_case() {
        assert_eq!(
            normalize_host("API.v12.Web.Example:443"),
            Some("api.v12.web.example".to_string())
        );
        assert_eq!(
            normalize_host("api.v12.web.example"),
            Some("api.v12.web.example".to_string())
        );
        assert_eq!(normalize_host(""), None);
        assert_eq!(normalize_host(":8080"), None);
    }
}
