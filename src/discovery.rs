//! Container discovery: inventory listing and label parsing
//!
//! Containers opt in by name (`{service}{match_key}{version}…`) and declare
//! forwards through labels:
//!
//! - `PD_SERVICE_TOKEN` — control-surface secret
//! - `PD_HOST_<name>` — `[hostKey "/"] ":" port`, an HTTP virtual host
//! - `PD_TCP_<name>` / `PD_UDP_<name>` — `bindAddr "/" ":" port`, a stream
//!   forward bound on the gateway host
//!
//! Declared ports are internal container ports and are resolved to the
//! engine's published host port through the inspect port map.

use crate::engine::EngineCache;
use crate::error::GatewayError;
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerInspectResponse, PortBinding};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const TOKEN_LABEL: &str = "PD_SERVICE_TOKEN";
pub const HOST_LABEL: &str = "PD_HOST_";
pub const TCP_LABEL: &str = "PD_TCP_";
pub const UDP_LABEL: &str = "PD_UDP_";

/// Kind of traffic a forward carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardKind {
    Http,
    Tcp,
    Udp,
}

impl ForwardKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardKind::Http => "http",
            ForwardKind::Tcp => "tcp",
            ForwardKind::Udp => "udp",
        }
    }
}

impl std::fmt::Display for ForwardKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One externally reachable endpoint declared by a container label.
///
/// Immutable once constructed; a changed upstream produces a new `Forward`
/// under the same prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    /// Label suffix
    pub name: String,
    pub kind: ForwardKind,
    /// Host key for http, bind address for tcp/udp
    pub key: String,
    /// Canonical identity across the proxy plane
    pub prefix: String,
    /// Engine host plus published host port
    pub uri: String,
    /// Http only: the virtual host matches any suffix
    pub wildcard: bool,
}

/// A discovered running workload and its declared forwards.
///
/// Produced fresh on every discovery pass; the live set replaces these
/// snapshots wholesale.
#[derive(Debug, Clone, Default)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub version: String,
    pub token: String,
    pub forwards: HashMap<String, Forward>,
    pub status: String,
    pub error: String,
    pub started_at: String,
    pub finished_at: String,
}

pub type PortMap = HashMap<String, Option<Vec<PortBinding>>>;

/// Lists and inspects service containers through the engine.
pub struct Discovery {
    engine: Arc<EngineCache>,
    match_key: String,
}

impl Discovery {
    pub fn new(engine: Arc<EngineCache>, match_key: String) -> Self {
        Self { engine, match_key }
    }

    /// One discovery pass: every running service container, keyed by the
    /// prefix of each of its forwards.
    ///
    /// Malformed labels are skipped with a warning; an inspect failure
    /// aborts the whole pass so the caller keeps its previous live set.
    pub async fn discover(&self) -> Result<HashMap<String, Arc<Container>>, GatewayError> {
        let (docker, engine_host) = self.engine.get().await?;

        let mut filters = HashMap::new();
        filters.insert(
            "name".to_string(),
            vec![format!("^.*{}v[0-9\\.]*.*$", self.match_key)],
        );
        let listed = docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(GatewayError::discovery)?;

        let mut discovered = HashMap::new();
        for summary in listed {
            if summary.state.as_deref() != Some("running") {
                continue;
            }
            let id = match summary.id {
                Some(id) => id,
                None => continue,
            };
            let inspect = docker
                .inspect_container(&id, None)
                .await
                .map_err(GatewayError::discovery)?;
            let container = match parse_container(&id, &inspect, &self.match_key, &engine_host) {
                Some(c) => Arc::new(c),
                None => continue,
            };
            debug!(
                service = %container.name,
                version = %container.version,
                forwards = container.forwards.len(),
                "Discovered service container"
            );
            for prefix in container.forwards.keys() {
                discovered.insert(prefix.clone(), Arc::clone(&container));
            }
        }
        Ok(discovered)
    }
}

/// Split an inspected container name into service name and version.
///
/// `/web-srv-v1.2-abc` with match key `-srv-` yields `("web", "v1.2")`.
pub fn split_service_name(name: &str, match_key: &str) -> Option<(String, String)> {
    let name = name.strip_prefix('/').unwrap_or(name);
    let (service, rest) = name.split_once(match_key)?;
    let version = rest.split('-').next().unwrap_or(rest);
    if service.is_empty() || version.is_empty() {
        return None;
    }
    Some((service.to_string(), version.to_string()))
}

/// Build a `Container` snapshot from an inspect response, walking its
/// labels. Returns `None` when the name does not carry the match key.
pub fn parse_container(
    id: &str,
    inspect: &ContainerInspectResponse,
    match_key: &str,
    engine_host: &str,
) -> Option<Container> {
    let raw_name = inspect.name.as_deref().unwrap_or_default();
    let (service, version) = split_service_name(raw_name, match_key)?;

    let state = inspect.state.as_ref();
    let mut container = Container {
        id: id.to_string(),
        name: service,
        version,
        status: state
            .and_then(|s| s.status.as_ref())
            .map(|s| s.to_string())
            .unwrap_or_default(),
        error: state
            .and_then(|s| s.error.clone())
            .unwrap_or_default(),
        started_at: state
            .and_then(|s| s.started_at.clone())
            .unwrap_or_default(),
        finished_at: state
            .and_then(|s| s.finished_at.clone())
            .unwrap_or_default(),
        ..Default::default()
    };

    let empty = PortMap::new();
    let ports = inspect
        .network_settings
        .as_ref()
        .and_then(|n| n.ports.as_ref())
        .unwrap_or(&empty);
    let labels = match inspect.config.as_ref().and_then(|c| c.labels.as_ref()) {
        Some(labels) => labels,
        None => return Some(container),
    };

    for (key, value) in labels {
        if key == TOKEN_LABEL {
            container.token = value.clone();
            continue;
        }
        let parsed = if let Some(name) = key.strip_prefix(HOST_LABEL) {
            Some(parse_http_label(
                name,
                value,
                ports,
                engine_host,
                &container.name,
                &container.version,
            ))
        } else if let Some(name) = key.strip_prefix(TCP_LABEL) {
            Some(parse_stream_label(ForwardKind::Tcp, name, value, ports, engine_host))
        } else if let Some(name) = key.strip_prefix(UDP_LABEL) {
            Some(parse_stream_label(ForwardKind::Udp, name, value, ports, engine_host))
        } else {
            None
        };
        match parsed {
            Some(Ok(forward)) => {
                container.forwards.insert(forward.prefix.clone(), forward);
            }
            Some(Err(err)) => {
                warn!(
                    container = %raw_name,
                    label = %key,
                    value = %value,
                    error = %err,
                    "Skipping unparsable forward label"
                );
            }
            None => {}
        }
    }
    Some(container)
}

/// Parse a `PD_HOST_<name>` label value: `[hostKey "/"] ":" port`.
pub fn parse_http_label(
    name: &str,
    value: &str,
    ports: &PortMap,
    engine_host: &str,
    service: &str,
    version: &str,
) -> Result<Forward, GatewayError> {
    let (host_key, port_val) = match value.split_once('/') {
        Some((host_key, port_val)) => (host_key, port_val),
        None => ("", value),
    };
    let host_port = resolve_host_port(port_val, ports)?;

    let (host_key, wildcard) = match host_key.strip_prefix('*') {
        Some(stripped) => (stripped, true),
        None => (host_key, false),
    };
    let version_no_dots = version.replace('.', "");
    let prefix = if host_key.is_empty() {
        format!("{}.{}", version_no_dots, service)
    } else {
        format!("{}.{}.{}", host_key, version_no_dots, service)
    };
    Ok(Forward {
        name: name.to_string(),
        kind: ForwardKind::Http,
        key: host_key.to_string(),
        prefix,
        uri: format!("{}:{}", engine_host, host_port),
        wildcard,
    })
}

/// Parse a `PD_TCP_<name>` / `PD_UDP_<name>` label value:
/// `bindAddr "/" [":"] port`.
pub fn parse_stream_label(
    kind: ForwardKind,
    name: &str,
    value: &str,
    ports: &PortMap,
    engine_host: &str,
) -> Result<Forward, GatewayError> {
    let (bind_addr, port_val) = value.split_once('/').ok_or_else(|| {
        GatewayError::LabelMalformed(format!("expected bindAddr/port, got {:?}", value))
    })?;
    let host_port = resolve_host_port(port_val, ports)?;
    Ok(Forward {
        name: name.to_string(),
        kind,
        key: bind_addr.to_string(),
        prefix: format!("{}://{}", kind, bind_addr),
        uri: format!("{}:{}", engine_host, host_port),
        wildcard: false,
    })
}

/// Resolve a declared internal port to the first published host port.
fn resolve_host_port(port_val: &str, ports: &PortMap) -> Result<String, GatewayError> {
    let port = port_val.strip_prefix(':').unwrap_or(port_val);
    let key = format!("{}/tcp", port);
    ports
        .get(&key)
        .and_then(|bindings| bindings.as_ref())
        .and_then(|bindings| bindings.first())
        .and_then(|binding| binding.host_port.clone())
        .ok_or_else(|| GatewayError::LabelMalformed(format!("port {} is not published", key)))
}
