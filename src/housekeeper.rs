//! Periodic engine housekeeping: container clear and resource prune

use crate::config::Config;
use crate::engine::EngineCache;
use crate::error::GatewayError;
use bollard::container::{ListContainersOptions, RemoveContainerOptions};
use bollard::image::PruneImagesOptions;
use bollard::network::PruneNetworksOptions;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct Housekeeper {
    engine: Arc<EngineCache>,
    clear_delay: Duration,
    clear_exclusions: Vec<Regex>,
    prune_delay: Duration,
    prune_exclusions: Vec<String>,
}

impl Housekeeper {
    pub fn new(engine: Arc<EngineCache>, config: &Config) -> anyhow::Result<Self> {
        let clear_exclusions = config
            .docker_clear_exc
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            engine,
            clear_delay: config.clear_delay(),
            clear_exclusions,
            prune_delay: config.prune_delay(),
            prune_exclusions: config.docker_prune_exc.clone(),
        })
    }

    pub fn clear_delay(&self) -> Duration {
        self.clear_delay
    }

    pub fn prune_delay(&self) -> Duration {
        self.prune_delay
    }

    /// Force-remove containers older than the clear delay, skipping names
    /// matched by any exclusion pattern. Returns the number removed; the
    /// first engine error aborts the pass.
    pub async fn clear(&self) -> Result<usize, GatewayError> {
        if self.clear_delay.is_zero() {
            return Ok(0);
        }
        let (docker, _) = self.engine.get().await?;
        let listed = docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(GatewayError::housekeeper)?;

        let now = Utc::now();
        let mut cleared = 0;
        for summary in listed {
            let id = match summary.id {
                Some(id) => id,
                None => continue,
            };
            let inspect = docker
                .inspect_container(&id, None)
                .await
                .map_err(GatewayError::housekeeper)?;
            let name = inspect.name.as_deref().unwrap_or_default();
            let started_at = inspect
                .state
                .as_ref()
                .and_then(|s| s.started_at.as_deref())
                .unwrap_or_default();
            if !should_clear(name, started_at, now, self.clear_delay, &self.clear_exclusions)? {
                continue;
            }
            docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
                .map_err(|e| {
                    warn!(container = %name, error = %e, "Container removal failed");
                    GatewayError::housekeeper(e)
                })?;
            info!(container = %name, "Removed expired container");
            cleared += 1;
        }
        Ok(cleared)
    }

    /// Prune engine networks, images, and containers, in that order, minus
    /// the configured exclusions. The first error aborts the pass.
    pub async fn prune(&self) -> Result<(), GatewayError> {
        if self.prune_delay.is_zero() {
            return Ok(());
        }
        let (docker, _) = self.engine.get().await?;
        for target in ["network", "image", "container"] {
            if self.prune_exclusions.iter().any(|exc| exc == target) {
                continue;
            }
            match target {
                "network" => {
                    let report = docker
                        .prune_networks(None::<PruneNetworksOptions<String>>)
                        .await
                        .map_err(GatewayError::housekeeper)?;
                    info!(
                        deleted = report.networks_deleted.map(|n| n.len()).unwrap_or(0),
                        "Pruned networks"
                    );
                }
                "image" => {
                    let report = docker
                        .prune_images(None::<PruneImagesOptions<String>>)
                        .await
                        .map_err(GatewayError::housekeeper)?;
                    info!(
                        space_reclaimed = report.space_reclaimed.unwrap_or(0),
                        "Pruned images"
                    );
                }
                _ => {
                    let report = docker
                        .prune_containers(None::<bollard::container::PruneContainersOptions<String>>)
                        .await
                        .map_err(GatewayError::housekeeper)?;
                    info!(
                        space_reclaimed = report.space_reclaimed.unwrap_or(0),
                        "Pruned containers"
                    );
                }
            }
        }
        Ok(())
    }
}

/// Decide whether a container is old enough, and not excluded, for clear.
///
/// An unparsable start timestamp aborts the pass rather than risking the
/// removal of a container of unknown age.
pub fn should_clear(
    name: &str,
    started_at: &str,
    now: DateTime<Utc>,
    delay: Duration,
    exclusions: &[Regex],
) -> Result<bool, GatewayError> {
    if exclusions.iter().any(|pattern| pattern.is_match(name)) {
        return Ok(false);
    }
    let started = DateTime::parse_from_rfc3339(started_at)
        .map_err(|e| GatewayError::housekeeper(format!("started_at {:?}: {}", started_at, e)))?;
    let age = now.signed_duration_since(started.with_timezone(&Utc));
    let delay = chrono::Duration::from_std(delay)
        .map_err(|e| GatewayError::housekeeper(format!("clear delay: {}", e)))?;
    Ok(age >= delay)
}
