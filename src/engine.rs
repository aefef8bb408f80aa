//! Cached, authenticated client for the container engine API

use crate::config::Config;
use crate::error::GatewayError;
use bollard::{Docker, API_DEFAULT_VERSION};
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// How long a built client is reused before being rebuilt
const CLIENT_TTL_SECS: u64 = 600;

/// Engine connection timeout in seconds
const CONNECT_TIMEOUT_SECS: u64 = 120;

struct CachedClient {
    docker: Docker,
    host: String,
    built_at: Instant,
}

/// Lazily builds and caches the engine client.
///
/// Concurrent callers share one instance; the cache slot is guarded by an
/// async mutex so only one caller at a time runs the finder script and the
/// TLS handshake setup.
pub struct EngineCache {
    trigger_bash: String,
    finder: String,
    cert_dir: String,
    addr: String,
    host: String,
    slot: Mutex<Option<CachedClient>>,
}

impl EngineCache {
    pub fn new(config: &Config) -> Self {
        Self {
            trigger_bash: config.trigger_bash.clone(),
            finder: config.trigger_finder.clone(),
            cert_dir: config.docker_cert.clone(),
            addr: config.docker_addr.clone(),
            host: config.docker_host.clone(),
            slot: Mutex::new(None),
        }
    }

    /// Return the cached client and the host on which published container
    /// ports are reachable, rebuilding the client when it has aged out.
    pub async fn get(&self) -> Result<(Docker, String), GatewayError> {
        let mut slot = self.slot.lock().await;
        if let Some(cached) = slot.as_ref() {
            if cached.built_at.elapsed().as_secs() < CLIENT_TTL_SECS {
                return Ok((cached.docker.clone(), cached.host.clone()));
            }
        }
        // Dropping the previous client closes its connections.
        *slot = None;

        let (mut cert_dir, mut addr, mut host) =
            (self.cert_dir.clone(), self.addr.clone(), self.host.clone());
        if !self.finder.is_empty() {
            let overrides = self.run_finder().await?;
            if let Some(v) = overrides.get("docker_cert") {
                cert_dir = v.clone();
            }
            if let Some(v) = overrides.get("docker_addr") {
                addr = v.clone();
            }
            if let Some(v) = overrides.get("docker_host") {
                host = v.clone();
            }
            debug!(addr, host, "Finder resolved engine endpoint");
        }

        let docker = connect(&addr, &cert_dir)?;
        info!(addr, "Engine client built");
        *slot = Some(CachedClient {
            docker: docker.clone(),
            host: host.clone(),
            built_at: Instant::now(),
        });
        Ok((docker, host))
    }

    async fn run_finder(&self) -> Result<HashMap<String, String>, GatewayError> {
        let output = Command::new(&self.trigger_bash)
            .arg(&self.finder)
            .output()
            .await
            .map_err(|e| {
                GatewayError::engine(format!(
                    "finder spawn failed ({} {}): {}",
                    self.trigger_bash, self.finder, e
                ))
            })?;
        if !output.status.success() {
            warn!(
                finder = %self.finder,
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "Finder script failed"
            );
            return Err(GatewayError::engine(format!(
                "finder exited with {}",
                output.status
            )));
        }
        Ok(parse_properties(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse `key=value` lines as emitted by a finder script. Blank lines and
/// `#` comments are skipped; later keys win.
pub fn parse_properties(input: &str) -> HashMap<String, String> {
    let mut props = HashMap::new();
    for line in input.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            props.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    props
}

fn connect(addr: &str, cert_dir: &str) -> Result<Docker, GatewayError> {
    if let Some(socket) = addr.strip_prefix("unix://") {
        return Docker::connect_with_socket(socket, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            .map_err(|e| GatewayError::engine(format!("socket {}: {}", socket, e)));
    }
    if cert_dir.is_empty() {
        return Docker::connect_with_http(addr, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            .map_err(|e| GatewayError::engine(format!("http {}: {}", addr, e)));
    }
    let dir = Path::new(cert_dir);
    Docker::connect_with_ssl(
        addr,
        &dir.join("key.pem"),
        &dir.join("cert.pem"),
        &dir.join("ca.pem"),
        CONNECT_TIMEOUT_SECS,
        API_DEFAULT_VERSION,
    )
    .map_err(|e| GatewayError::engine(format!("tls {} ({}): {}", addr, cert_dir, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_properties() {
        let props = parse_properties(
            "# engine endpoint\ndocker_addr=tcp://10.1.2.3:2376\ndocker_host = 10.1.2.3\n\nignored\n",
        );
        assert_eq!(props.get("docker_addr").unwrap(), "tcp://10.1.2.3:2376");
        assert_eq!(props.get("docker_host").unwrap(), "10.1.2.3");
        assert_eq!(props.len(), 2);
    }

    #[test]
    fn test_parse_properties_last_key_wins() {
        let props = parse_properties("docker_host=a\ndocker_host=b\n");
        assert_eq!(props.get("docker_host").unwrap(), "b");
    }
}
