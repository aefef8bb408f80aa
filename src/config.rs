use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Gateway configuration, loaded from a TOML file.
///
/// Key names follow the operator-facing property names; everything has a
/// default so an empty file yields a working local gateway.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Front-door bind address
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Reconciliation interval in milliseconds
    #[serde(default = "default_refresh_time")]
    pub refresh_time: u64,

    /// Interpreter used to run finder and trigger scripts
    #[serde(default = "default_trigger_bash")]
    pub trigger_bash: String,

    /// Script whose stdout overrides engine connection settings
    #[serde(default)]
    pub trigger_finder: String,

    /// Script invoked once per added HTTP prefix
    #[serde(default)]
    pub trigger_added: String,

    /// Script invoked once per removed HTTP prefix
    #[serde(default)]
    pub trigger_removed: String,

    /// Script invoked once per updated HTTP prefix
    #[serde(default)]
    pub trigger_updated: String,

    /// Directory holding ca.pem / cert.pem / key.pem for the engine API
    #[serde(default = "default_docker_cert")]
    pub docker_cert: String,

    /// Engine API address
    #[serde(default = "default_docker_addr")]
    pub docker_addr: String,

    /// Host on which published container ports are reachable
    #[serde(default = "default_docker_host")]
    pub docker_host: String,

    /// Marker separating service name from version in container names
    #[serde(default = "default_match_key")]
    pub match_key: String,

    /// Minimum container age in minutes before clear removes it; 0 disables
    #[serde(default)]
    pub docker_clear_delay: u64,

    /// Name patterns exempt from clear
    #[serde(default)]
    pub docker_clear_exc: Vec<String>,

    /// Minutes between engine prune passes; 0 disables
    #[serde(default)]
    pub docker_prune_delay: u64,

    /// Prune targets to skip: any of "network", "image", "container"
    #[serde(default)]
    pub docker_prune_exc: Vec<String>,

    /// Suffix appended to forward prefixes to build virtual hosts
    #[serde(default)]
    pub host_suffix: String,

    /// Protocol used when rendering index-page links
    #[serde(default = "default_host_proto")]
    pub host_proto: String,

    /// Host header under which the index page is served without a 404
    #[serde(default)]
    pub host_self: String,

    /// Reserved URL prefix for the per-service control surface
    #[serde(default = "default_srv_prefix")]
    pub srv_prefix: String,

    /// Optional HTML shell for the index page
    #[serde(default)]
    pub preview: String,

    /// Log filter directive
    #[serde(default = "default_log")]
    pub log: String,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate operator-supplied values that would otherwise fail deep
    /// inside a refresh pass.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.refresh_time == 0 {
            errors.push("'refresh_time' must be greater than 0".to_string());
        }
        if self.listen.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!("'listen' is not a bind address: {}", self.listen));
        }
        for pattern in &self.docker_clear_exc {
            if let Err(e) = regex::Regex::new(pattern) {
                errors.push(format!("'docker_clear_exc' pattern {}: {}", pattern, e));
            }
        }
        for target in &self.docker_prune_exc {
            if !matches!(target.as_str(), "network" | "image" | "container") {
                errors.push(format!("'docker_prune_exc' unknown target: {}", target));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_time)
    }

    pub fn clear_delay(&self) -> Duration {
        Duration::from_secs(self.docker_clear_delay * 60)
    }

    pub fn prune_delay(&self) -> Duration {
        Duration::from_secs(self.docker_prune_delay * 60)
    }
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("empty config deserializes via defaults")
    }
}

// Default value functions
fn default_listen() -> String {
    "0.0.0.0:9231".to_string()
}

fn default_refresh_time() -> u64 {
    10_000
}

fn default_trigger_bash() -> String {
    "bash".to_string()
}

fn default_docker_cert() -> String {
    "certs".to_string()
}

fn default_docker_addr() -> String {
    "tcp://127.0.0.1:2376".to_string()
}

fn default_docker_host() -> String {
    "127.0.0.1".to_string()
}

fn default_match_key() -> String {
    "-srv-".to_string()
}

fn default_host_proto() -> String {
    "https".to_string()
}

fn default_srv_prefix() -> String {
    "/_s/".to_string()
}

fn default_log() -> String {
    "info".to_string()
}
