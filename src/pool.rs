//! Pooled HTTP client for forwarding requests to container upstreams
//!
//! One shared client serves every virtual host; hyper-util keeps idle
//! connections per upstream authority, so replacing a forward's upstream
//! simply routes new requests to the new authority.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, CONNECTION};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Hop-by-hop headers that must not travel past this hop (RFC 7230 §6.1)
const HOP_BY_HOP_HEADERS: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Error type for upstream forwarding
#[derive(Debug)]
pub enum UpstreamError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error building the rewritten request
    RequestBuild(String),
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::Client(e) => write!(f, "client error: {}", e),
            UpstreamError::RequestBuild(s) => write!(f, "request build error: {}", s),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<hyper_util::client::legacy::Error> for UpstreamError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        UpstreamError::Client(err)
    }
}

/// A connection-pooling forwarder for requests to container upstreams
pub struct UpstreamPool {
    client: Client<HttpConnector, Incoming>,
}

impl Default for UpstreamPool {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamPool {
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(HttpConnector::new());
        Self { client }
    }

    /// Forward `req` to `upstream` (a `host:port` authority), preserving
    /// method, path, query, end-to-end headers, and body. Hop-by-hop
    /// headers are stripped; hyper re-frames the upstream connection.
    pub async fn send_request(
        &self,
        mut req: Request<Incoming>,
        upstream: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, UpstreamError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        let uri: Uri = format!("http://{}{}", upstream, path_and_query)
            .parse()
            .map_err(|e| UpstreamError::RequestBuild(format!("{}: {}", upstream, e)))?;
        *req.uri_mut() = uri;
        strip_hop_by_hop(req.headers_mut());

        debug!(upstream, method = %req.method(), path = %path_and_query, "Forwarding request");
        let response = self.client.request(req).await?;
        Ok(response.map(|body| body.boxed()))
    }
}

/// Remove hop-by-hop headers: those named by the Connection header, then
/// the fixed RFC 7230 set.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let connection_named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();
    for name in connection_named {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}
