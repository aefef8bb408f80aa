//! The live proxy plane and its reconciler
//!
//! Three tables describe what is currently being served, all behind one
//! readers-writer lock: `all` (prefix to owning container), `reverse`
//! (virtual host to HTTP route), and `listen` (prefix to stream forwarder).
//! [`ProxyPlane::apply`] diffs a fresh discovery snapshot against the live
//! set and mutates routes and listeners in place, leaving unaffected
//! entries untouched.
//!
//! The lock is never held across an await; forwarder tasks register and
//! unregister themselves with short write sections of their own.

use crate::discovery::{Container, Forward, ForwardKind};
use crate::forward;
use crate::pool::UpstreamPool;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// A live HTTP route: the forward it serves and the container owning it.
pub struct ReverseProxy {
    pub forward: Forward,
    pub service: Arc<Container>,
}

/// A live stream forwarder registration. Closing `shutdown` aborts the
/// forwarder's socket loop.
pub struct ListenerProxy {
    pub forward: Forward,
    pub service: Arc<Container>,
    generation: u64,
    shutdown: watch::Sender<bool>,
}

/// Result of one reconciliation pass. A prefix appears in at most one of
/// `added`, `updated`, `removed`.
#[derive(Default)]
pub struct RefreshOutcome {
    pub all: HashMap<String, Arc<Container>>,
    pub added: HashMap<String, Arc<Container>>,
    pub updated: HashMap<String, Arc<Container>>,
    pub removed: HashMap<String, Arc<Container>>,
}

/// A matched HTTP route for an incoming request host.
pub struct RouteMatch {
    pub forward: Forward,
    pub service: Arc<Container>,
}

#[derive(Default)]
struct PlaneState {
    all: HashMap<String, Arc<Container>>,
    reverse: HashMap<String, ReverseProxy>,
    listen: HashMap<String, ListenerProxy>,
    /// Latest forwarder generation the reconciler spawned per prefix; a
    /// forwarder may only register while it still owns its slot.
    expected_gen: HashMap<String, u64>,
}

pub struct ProxyPlane {
    host_suffix: String,
    state: RwLock<PlaneState>,
    generation: AtomicU64,
    pub pool: UpstreamPool,
}

impl ProxyPlane {
    pub fn new(host_suffix: String) -> Arc<Self> {
        Arc::new(Self {
            host_suffix,
            state: RwLock::new(PlaneState::default()),
            generation: AtomicU64::new(1),
            pool: UpstreamPool::new(),
        })
    }

    pub fn host_suffix(&self) -> &str {
        &self.host_suffix
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Reconcile the live set against a discovery snapshot.
    ///
    /// Unchanged forwards keep their routes and listeners; a changed
    /// upstream replaces the route or respawns the forwarder; prefixes
    /// absent from the snapshot are torn down.
    pub fn apply(self: &Arc<Self>, discovered: HashMap<String, Arc<Container>>) -> RefreshOutcome {
        let mut state = self.state.write();
        let mut outcome = RefreshOutcome::default();
        let mut new_all: HashMap<String, Arc<Container>> = HashMap::new();

        for (prefix, service) in &discovered {
            let forward = match service.forwards.get(prefix) {
                Some(forward) => forward.clone(),
                None => continue,
            };
            let old_forward = state
                .all
                .get(prefix)
                .and_then(|old| old.forwards.get(prefix))
                .cloned();
            match forward.kind {
                ForwardKind::Http => {
                    if !self.apply_http(&mut state, &mut outcome, prefix, &forward, service, old_forward) {
                        continue;
                    }
                }
                ForwardKind::Tcp | ForwardKind::Udp => {
                    self.apply_stream(&mut state, &mut outcome, prefix, &forward, service, old_forward);
                }
            }
            new_all.insert(prefix.clone(), Arc::clone(service));
        }

        let dropped: Vec<String> = state
            .all
            .keys()
            .filter(|prefix| !new_all.contains_key(*prefix))
            .cloned()
            .collect();
        for prefix in dropped {
            let service = match state.all.get(&prefix) {
                Some(service) => Arc::clone(service),
                None => continue,
            };
            let old_forward = match service.forwards.get(&prefix) {
                Some(forward) => forward.clone(),
                None => continue,
            };
            match old_forward.kind {
                ForwardKind::Http => {
                    let host = format!("{}{}", old_forward.prefix, self.host_suffix);
                    state.reverse.remove(&host);
                    info!(host = %host, "Route removed for service down");
                }
                ForwardKind::Tcp | ForwardKind::Udp => {
                    close_listener(&mut state, &prefix);
                    info!(prefix = %prefix, "Stream forward removed for service down");
                }
            }
            outcome.removed.insert(prefix, service);
        }

        state.all = new_all.clone();
        outcome.all = new_all;
        outcome
    }

    /// Returns false when the forward is unusable and must not enter the
    /// live set.
    fn apply_http(
        &self,
        state: &mut PlaneState,
        outcome: &mut RefreshOutcome,
        prefix: &str,
        forward: &Forward,
        service: &Arc<Container>,
        old_forward: Option<Forward>,
    ) -> bool {
        let host = format!("{}{}", forward.prefix, self.host_suffix);
        if forward.uri.parse::<hyper::http::uri::Authority>().is_err() {
            warn!(host = %host, upstream = %forward.uri, "Skipping route with unusable upstream");
            return false;
        }
        let entry = ReverseProxy {
            forward: forward.clone(),
            service: Arc::clone(service),
        };
        match old_forward {
            Some(old) if old.kind == ForwardKind::Http => {
                if old.uri != forward.uri || old.wildcard != forward.wildcard {
                    state.reverse.insert(host.clone(), entry);
                    outcome.updated.insert(prefix.to_string(), Arc::clone(service));
                    info!(host = %host, upstream = %forward.uri, "Route updated for service change");
                }
            }
            Some(_) => {
                // The prefix switched type: tear the old listener down and
                // install the HTTP path.
                close_listener(state, prefix);
                state.reverse.insert(host.clone(), entry);
                outcome.updated.insert(prefix.to_string(), Arc::clone(service));
                info!(host = %host, upstream = %forward.uri, "Route replaced stream forward");
            }
            None => {
                state.reverse.insert(host.clone(), entry);
                outcome.added.insert(prefix.to_string(), Arc::clone(service));
                info!(host = %host, upstream = %forward.uri, "Route added for service up");
            }
        }
        true
    }

    fn apply_stream(
        self: &Arc<Self>,
        state: &mut PlaneState,
        outcome: &mut RefreshOutcome,
        prefix: &str,
        forward: &Forward,
        service: &Arc<Container>,
        old_forward: Option<Forward>,
    ) {
        if let Some(old) = &old_forward {
            if old.kind == forward.kind && old.uri == forward.uri && old.key == forward.key {
                return;
            }
        }
        let had_live = match &old_forward {
            Some(old) if old.kind == ForwardKind::Http => {
                let host = format!("{}{}", old.prefix, self.host_suffix);
                state.reverse.remove(&host).is_some()
            }
            Some(_) => close_listener(state, prefix),
            None => false,
        };
        let generation = match forward.kind {
            ForwardKind::Tcp => {
                forward::spawn_tcp(Arc::clone(self), forward.clone(), Arc::clone(service))
            }
            _ => forward::spawn_udp(Arc::clone(self), forward.clone(), Arc::clone(service)),
        };
        state.expected_gen.insert(prefix.to_string(), generation);
        if had_live {
            outcome.updated.insert(prefix.to_string(), Arc::clone(service));
            info!(prefix = %prefix, upstream = %forward.uri, "Stream forward updated for service change");
        } else {
            outcome.added.insert(prefix.to_string(), Arc::clone(service));
            info!(prefix = %prefix, upstream = %forward.uri, "Stream forward added for service up");
        }
    }

    /// Record a bound forwarder under its prefix. Refused when the
    /// reconciler has since replaced or removed this forwarder's slot.
    pub(crate) fn register_listener(
        &self,
        forward: &Forward,
        service: &Arc<Container>,
        generation: u64,
        shutdown: watch::Sender<bool>,
    ) -> bool {
        let mut state = self.state.write();
        if state.expected_gen.get(&forward.prefix) != Some(&generation) {
            return false;
        }
        state.listen.insert(
            forward.prefix.clone(),
            ListenerProxy {
                forward: forward.clone(),
                service: Arc::clone(service),
                generation,
                shutdown,
            },
        );
        true
    }

    /// Drop a forwarder's registration on task exit, unless a newer
    /// generation already took the slot.
    pub(crate) fn unregister_listener(&self, prefix: &str, generation: u64) {
        let mut state = self.state.write();
        if state.listen.get(prefix).map(|entry| entry.generation) == Some(generation) {
            state.listen.remove(prefix);
        }
        if state.expected_gen.get(prefix) == Some(&generation) {
            state.expected_gen.remove(prefix);
        }
    }

    /// Match a request host against the route table: an exact entry wins,
    /// otherwise the longest wildcard suffix.
    pub fn lookup(&self, request_host: &str) -> Option<RouteMatch> {
        let state = self.state.read();
        if let Some(entry) = state.reverse.get(request_host) {
            return Some(RouteMatch {
                forward: entry.forward.clone(),
                service: Arc::clone(&entry.service),
            });
        }
        state
            .reverse
            .iter()
            .filter(|(host, entry)| entry.forward.wildcard && request_host.ends_with(host.as_str()))
            .max_by_key(|(host, _)| host.len())
            .map(|(_, entry)| RouteMatch {
                forward: entry.forward.clone(),
                service: Arc::clone(&entry.service),
            })
    }

    /// Snapshot of the live set for the index page.
    pub fn containers(&self) -> Vec<(String, Arc<Container>)> {
        let state = self.state.read();
        state
            .all
            .iter()
            .map(|(prefix, service)| (prefix.clone(), Arc::clone(service)))
            .collect()
    }

    /// Whether a stream forwarder is currently registered for `prefix`.
    pub fn has_listener(&self, prefix: &str) -> bool {
        self.state.read().listen.contains_key(prefix)
    }

    /// Number of live HTTP routes.
    pub fn route_count(&self) -> usize {
        self.state.read().reverse.len()
    }
}

fn close_listener(state: &mut PlaneState, prefix: &str) -> bool {
    state.expected_gen.remove(prefix);
    if let Some(entry) = state.listen.remove(prefix) {
        let _ = entry.shutdown.send(true);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_container(prefix: &str, uri: &str, wildcard: bool) -> (String, Arc<Container>) {
        let forward = Forward {
            name: "api".to_string(),
            kind: ForwardKind::Http,
            key: "api".to_string(),
            prefix: prefix.to_string(),
            uri: uri.to_string(),
            wildcard,
        };
        let mut forwards = HashMap::new();
        forwards.insert(prefix.to_string(), forward);
        (
            prefix.to_string(),
            Arc::new(Container {
                id: "c1".to_string(),
                name: "web".to_string(),
                version: "v1.2".to_string(),
                token: "tok".to_string(),
                forwards,
                status: "running".to_string(),
                ..Default::default()
            }),
        )
    }

    #[tokio::test]
    async fn test_http_add_update_remove_buckets() {
        let plane = ProxyPlane::new(".example".to_string());

        let (prefix, service) = http_container("api.v12.web", "10.0.0.5:32001", true);
        let outcome = plane.apply(HashMap::from([(prefix.clone(), service)]));
        assert_eq!(outcome.added.len(), 1);
        assert!(outcome.added.contains_key(&prefix));
        assert!(outcome.updated.is_empty() && outcome.removed.is_empty());
        assert!(plane.lookup("api.v12.web.example").is_some());

        let (_, changed) = http_container("api.v12.web", "10.0.0.5:32002", true);
        let outcome = plane.apply(HashMap::from([(prefix.clone(), changed)]));
        assert_eq!(outcome.updated.len(), 1);
        assert!(outcome.added.is_empty() && outcome.removed.is_empty());
        let matched = plane.lookup("api.v12.web.example").unwrap();
        assert_eq!(matched.forward.uri, "10.0.0.5:32002");

        let outcome = plane.apply(HashMap::new());
        assert_eq!(outcome.removed.len(), 1);
        assert!(plane.lookup("api.v12.web.example").is_none());
    }

    #[tokio::test]
    async fn test_unchanged_uri_leaves_route_untouched() {
        let plane = ProxyPlane::new(".example".to_string());
        let (prefix, service) = http_container("api.v12.web", "10.0.0.5:32001", false);
        plane.apply(HashMap::from([(prefix.clone(), Arc::clone(&service))]));
        let outcome = plane.apply(HashMap::from([(prefix.clone(), service)]));
        assert!(outcome.added.is_empty());
        assert!(outcome.updated.is_empty());
        assert!(outcome.removed.is_empty());
        assert_eq!(outcome.all.len(), 1);
    }

    #[tokio::test]
    async fn test_wildcard_lookup_prefers_exact_then_longest_suffix() {
        let plane = ProxyPlane::new(".example".to_string());
        let (p1, c1) = http_container("api.v12.web", "10.0.0.5:32001", true);
        let (p2, c2) = http_container("x.api.v12.web", "10.0.0.5:32002", true);
        plane.apply(HashMap::from([(p1, c1), (p2, c2)]));

        // Exact match wins over any wildcard.
        let matched = plane.lookup("api.v12.web.example").unwrap();
        assert_eq!(matched.forward.uri, "10.0.0.5:32001");

        // Longest wildcard suffix wins among wildcards.
        let matched = plane.lookup("y.x.api.v12.web.example").unwrap();
        assert_eq!(matched.forward.uri, "10.0.0.5:32002");

        assert!(plane.lookup("unrelated.example").is_none());
    }

    #[tokio::test]
    async fn test_bad_upstream_never_enters_live_set() {
        let plane = ProxyPlane::new(".example".to_string());
        let (prefix, service) = http_container("api.v12.web", "not an authority", false);
        let outcome = plane.apply(HashMap::from([(prefix, service)]));
        assert!(outcome.all.is_empty());
        assert!(outcome.added.is_empty());
        assert_eq!(plane.route_count(), 0);
    }
}
