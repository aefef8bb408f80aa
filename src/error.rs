//! Error taxonomy for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Errors produced by the gateway's engine, discovery, and housekeeping paths.
///
/// Control-surface failures are rendered straight into HTTP responses and do
/// not round-trip through this type.
#[derive(Debug)]
pub enum GatewayError {
    /// Finder script failed, TLS material was unreadable, or the engine
    /// client could not be constructed.
    EngineUnavailable(String),
    /// Container list or inspect failed mid-pass.
    DiscoveryFailed(String),
    /// A forwarding label could not be parsed or its port resolved.
    LabelMalformed(String),
    /// Bind/resolve failure while setting up a stream forwarder.
    ListenerFailure(String),
    /// Engine call failed while serving a control request.
    ControlEngineError(String),
    /// A housekeeper pass aborted.
    HousekeeperError(String),
    /// A trigger child process exited nonzero.
    TriggerFailed(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::EngineUnavailable(s) => write!(f, "engine unavailable: {}", s),
            GatewayError::DiscoveryFailed(s) => write!(f, "discovery failed: {}", s),
            GatewayError::LabelMalformed(s) => write!(f, "malformed label: {}", s),
            GatewayError::ListenerFailure(s) => write!(f, "listener failure: {}", s),
            GatewayError::ControlEngineError(s) => write!(f, "engine error: {}", s),
            GatewayError::HousekeeperError(s) => write!(f, "housekeeper error: {}", s),
            GatewayError::TriggerFailed(s) => write!(f, "trigger failed: {}", s),
        }
    }
}

impl std::error::Error for GatewayError {}

impl GatewayError {
    pub fn engine(err: impl std::fmt::Display) -> Self {
        GatewayError::EngineUnavailable(err.to_string())
    }

    pub fn discovery(err: impl std::fmt::Display) -> Self {
        GatewayError::DiscoveryFailed(err.to_string())
    }

    pub fn housekeeper(err: impl std::fmt::Display) -> Self {
        GatewayError::HousekeeperError(err.to_string())
    }
}

/// Body type served by the front door: either an upstream `Incoming` body or
/// a locally built one.
pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

/// An empty boxed body for upgrade responses
pub fn empty_body() -> GatewayBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Helper to create a plain-text response - infallible with valid StatusCode
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<GatewayBody> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum")
}

/// Helper to create an HTML response
pub fn html_response(status: StatusCode, body: impl Into<Bytes>) -> Response<GatewayBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/html; charset=utf-8")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}
