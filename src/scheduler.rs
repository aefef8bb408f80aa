//! Fixed-interval driver for reconciliation and housekeeping
//!
//! One task ticks at `refresh_time`: reconcile, fire trigger scripts for
//! the diff, then run the age-gated housekeeping passes. Each phase is
//! isolated behind a panic boundary so a bad tick never takes the loop
//! down. Stop is cooperative through the shutdown channel.

use crate::config::Config;
use crate::discovery::{Container, Discovery, ForwardKind};
use crate::error::GatewayError;
use crate::housekeeper::Housekeeper;
use crate::reconcile::ProxyPlane;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct Scheduler {
    discovery: Discovery,
    plane: Arc<ProxyPlane>,
    housekeeper: Housekeeper,
    trigger_bash: String,
    trigger_added: String,
    trigger_removed: String,
    trigger_updated: String,
    interval: std::time::Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        discovery: Discovery,
        plane: Arc<ProxyPlane>,
        housekeeper: Housekeeper,
        config: &Config,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            discovery,
            plane,
            housekeeper,
            trigger_bash: config.trigger_bash.clone(),
            trigger_added: config.trigger_added.clone(),
            trigger_removed: config.trigger_removed.clone(),
            trigger_updated: config.trigger_updated.clone(),
            interval: config.refresh_interval(),
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Scheduler started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; the gates below see "never ran" and
        // allow an initial housekeeping pass.
        let mut clear_last: Option<Instant> = None;
        let mut prune_last: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Scheduler stopped");
                        return;
                    }
                    continue;
                }
            }

            isolate("refresh", self.refresh_once()).await;

            let clear_delay = self.housekeeper.clear_delay();
            if !clear_delay.is_zero()
                && clear_last.map(|t| t.elapsed() >= clear_delay).unwrap_or(true)
            {
                isolate("clear", async {
                    match self.housekeeper.clear().await {
                        Ok(cleared) => info!(cleared, "Container clear pass finished"),
                        Err(e) => error!(error = %e, "Container clear pass failed"),
                    }
                })
                .await;
                clear_last = Some(Instant::now());
            }

            let prune_delay = self.housekeeper.prune_delay();
            if !prune_delay.is_zero()
                && prune_last.map(|t| t.elapsed() >= prune_delay).unwrap_or(true)
            {
                isolate("prune", async {
                    match self.housekeeper.prune().await {
                        Ok(()) => info!("Prune pass finished"),
                        Err(e) => error!(error = %e, "Prune pass failed"),
                    }
                })
                .await;
                prune_last = Some(Instant::now());
            }
        }
    }

    async fn refresh_once(&self) {
        let discovered = match self.discovery.discover().await {
            Ok(discovered) => discovered,
            // The live set stays untouched on a failed pass.
            Err(e) => {
                error!(error = %e, "Discovery pass failed");
                return;
            }
        };
        let outcome = self.plane.apply(discovered);
        debug!(
            all = outcome.all.len(),
            added = outcome.added.len(),
            updated = outcome.updated.len(),
            removed = outcome.removed.len(),
            "Refresh pass finished"
        );

        if !outcome.added.is_empty() && !self.trigger_added.is_empty() {
            self.run_triggers(&outcome.added, "added", &self.trigger_added)
                .await;
        }
        if !outcome.removed.is_empty() && !self.trigger_removed.is_empty() {
            self.run_triggers(&outcome.removed, "removed", &self.trigger_removed)
                .await;
        }
        if !outcome.updated.is_empty() && !self.trigger_updated.is_empty() {
            self.run_triggers(&outcome.updated, "updated", &self.trigger_updated)
                .await;
        }
    }

    /// Invoke the trigger script once per affected HTTP prefix. Stream
    /// forwards never fire triggers; a nonzero exit is logged, not fatal.
    async fn run_triggers(
        &self,
        bucket: &HashMap<String, Arc<Container>>,
        event: &str,
        script: &str,
    ) {
        for (prefix, service) in bucket {
            let forward = match service.forwards.get(prefix) {
                Some(forward) if forward.kind == ForwardKind::Http => forward,
                _ => continue,
            };
            let mut command = Command::new(&self.trigger_bash);
            command.arg(script);
            for (key, value) in trigger_env(service, forward) {
                command.env(key, value);
            }
            match command.output().await {
                Ok(output) if output.status.success() => {
                    info!(event, prefix = %prefix, script, "Trigger finished");
                }
                Ok(output) => {
                    let err = GatewayError::TriggerFailed(format!(
                        "{} {} exited with {}",
                        self.trigger_bash, script, output.status
                    ));
                    warn!(
                        event,
                        prefix = %prefix,
                        error = %err,
                        stderr = %String::from_utf8_lossy(&output.stderr),
                        "Trigger exited nonzero"
                    );
                }
                Err(e) => {
                    warn!(event, prefix = %prefix, script, error = %e, "Trigger spawn failed");
                }
            }
        }
    }
}

/// Environment handed to trigger child processes.
pub fn trigger_env(
    service: &Container,
    forward: &crate::discovery::Forward,
) -> Vec<(String, String)> {
    let (host, pref) = if forward.wildcard {
        (
            format!("*.{}", forward.uri),
            format!("*.{}", forward.prefix),
        )
    } else {
        (forward.uri.clone(), forward.prefix.clone())
    };
    vec![
        ("PD_SERVICE_NAME".to_string(), service.name.clone()),
        ("PD_SERVICE_VER".to_string(), service.version.clone()),
        ("PD_SERVICE_TYPE".to_string(), forward.kind.as_str().to_string()),
        ("PD_SERVICE_HOST".to_string(), host),
        ("PD_SERVICE_PREF".to_string(), pref),
    ]
}

/// Run a scheduler phase behind a panic boundary, logging instead of
/// unwinding into the tick loop.
async fn isolate<F: Future<Output = ()>>(phase: &str, fut: F) {
    if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        error!(phase, panic = %message, "Scheduler phase panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::Forward;

    fn service_with(forward: Forward) -> Container {
        let mut forwards = HashMap::new();
        forwards.insert(forward.prefix.clone(), forward.clone());
        Container {
            id: "c1".to_string(),
            name: "web".to_string(),
            version: "v1.2".to_string(),
            forwards,
            ..Default::default()
        }
    }

    #[test]
    fn test_trigger_env_plain_host() {
        let forward = Forward {
            name: "api".to_string(),
            kind: ForwardKind::Http,
            key: "api".to_string(),
            prefix: "api.v12.web".to_string(),
            uri: "10.0.0.5:32001".to_string(),
            wildcard: false,
        };
        let service = service_with(forward.clone());
        let env: HashMap<_, _> = trigger_env(&service, &forward).into_iter().collect();
        assert_eq!(env["PD_SERVICE_NAME"], "web");
        assert_eq!(env["PD_SERVICE_VER"], "v1.2");
        assert_eq!(env["PD_SERVICE_TYPE"], "http");
        assert_eq!(env["PD_SERVICE_HOST"], "10.0.0.5:32001");
        assert_eq!(env["PD_SERVICE_PREF"], "api.v12.web");
    }

    #[test]
    fn test_trigger_env_wildcard_prepends_star() {
        let forward = Forward {
            name: "api".to_string(),
            kind: ForwardKind::Http,
            key: "api".to_string(),
            prefix: "api.v12.web".to_string(),
            uri: "10.0.0.5:32001".to_string(),
            wildcard: true,
        };
        let service = service_with(forward.clone());
        let env: HashMap<_, _> = trigger_env(&service, &forward).into_iter().collect();
        assert_eq!(env["PD_SERVICE_HOST"], "*.10.0.0.5:32001");
        assert_eq!(env["PD_SERVICE_PREF"], "*.api.v12.web");
    }

    #[tokio::test]
    async fn test_isolate_swallows_panic() {
        isolate("test", async {
            panic!("boom");
        })
        .await;
        // Reaching this point means the panic did not unwind.
    }
}
