//! Endpoint and endpoint pool.

use rand::seq::SliceRandom;
use std::collections::HashSet;

/// A single broker endpoint and its reconnect bookkeeping.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: String,
    pub is_implicit: bool,
    pub did_connect: bool,
    pub reconnects: u32,
    pub tls_name: Option<String>,
    pub last_auth_err_code: Option<String>,
}

impl Endpoint {
    pub fn explicit(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            is_implicit: false,
            did_connect: false,
            reconnects: 0,
            tls_name: None,
            last_auth_err_code: None,
        }
    }

    pub fn implicit(url: impl Into<String>) -> Self {
        Self {
            is_implicit: true,
            ..Self::explicit(url)
        }
    }
}

/// Normalize `host:port` for dedup: case-insensitive, and treats
/// `localhost` / `127.0.0.1` / `[::1]` as equivalent for a given port.
fn normalize_host_port(url: &str) -> String {
    let without_scheme = url.split("://").last().unwrap_or(url);
    let host_port = without_scheme.split('/').next().unwrap_or(without_scheme);
    let lower = host_port.to_ascii_lowercase();
    let (host, port) = lower.rsplit_once(':').unwrap_or((lower.as_str(), ""));
    let canon_host = match host {
        "localhost" | "127.0.0.1" | "[::1]" | "::1" => "127.0.0.1",
        other => other,
    };
    format!("{canon_host}:{port}")
}

/// Policy parameters `next()` needs to decide rotate-vs-remove.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_reconnect: Option<u32>,
}

/// Ordered, randomizable set of broker endpoints.
///
/// Invariant: never empty, and `current()` always points at a member of
/// the pool — enforced by construction (`new` seeds a default endpoint
/// if given none) and by `next()` refusing to remove the last endpoint.
#[derive(Debug)]
pub struct EndpointPool {
    endpoints: Vec<Endpoint>,
    cur: usize,
    seen: HashSet<String>,
}

impl EndpointPool {
    pub const DEFAULT_URL: &'static str = "nats://127.0.0.1:4222";

    pub fn new(explicit_url: Option<String>, servers: Vec<String>, no_randomize: bool) -> Self {
        let mut endpoints: Vec<Endpoint> = Vec::new();
        let mut seen = HashSet::new();

        for url in servers {
            let key = normalize_host_port(&url);
            if seen.insert(key) {
                endpoints.push(Endpoint::explicit(url));
            }
        }
        if endpoints.is_empty() && explicit_url.is_none() {
            endpoints.push(Endpoint::explicit(Self::DEFAULT_URL));
            seen.insert(normalize_host_port(Self::DEFAULT_URL));
        }

        if !no_randomize {
            let mut rng = rand::thread_rng();
            endpoints.shuffle(&mut rng);
        }

        if let Some(url) = explicit_url {
            let key = normalize_host_port(&url);
            // Move to front after shuffling, inserting if new.
            if let Some(pos) = endpoints.iter().position(|e| normalize_host_port(&e.url) == key) {
                let ep = endpoints.remove(pos);
                endpoints.insert(0, ep);
            } else {
                endpoints.insert(0, Endpoint::explicit(url));
                seen.insert(key);
            }
        }

        Self {
            endpoints,
            cur: 0,
            seen,
        }
    }

    pub fn current(&self) -> &Endpoint {
        &self.endpoints[self.cur]
    }

    pub fn current_mut(&mut self) -> &mut Endpoint {
        &mut self.endpoints[self.cur]
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter()
    }

    /// Rotate the current endpoint to the back if it's still usable under
    /// `policy`, otherwise drop it. Returns the new current endpoint, or
    /// `None` if the pool is now empty.
    pub fn next(&mut self, policy: ReconnectPolicy) -> Option<&Endpoint> {
        if self.endpoints.is_empty() {
            return None;
        }
        let ep = self.endpoints.remove(self.cur);
        let exceeded = policy
            .max_reconnect
            .map(|max| ep.reconnects >= max)
            .unwrap_or(false);
        if !exceeded {
            self.endpoints.push(ep);
        } else {
            self.seen.remove(&normalize_host_port(&ep.url));
        }
        if self.endpoints.is_empty() {
            return None;
        }
        self.cur = 0;
        Some(&self.endpoints[0])
    }

    /// Merge a broker-advertised endpoint list: add unknown URLs as
    /// implicit, drop implicit endpoints no longer advertised (unless
    /// they're the current endpoint). Returns whether any endpoint was
    /// newly added.
    pub fn merge_advertised(&mut self, urls: &[String]) -> bool {
        let advertised: HashSet<String> = urls.iter().map(|u| normalize_host_port(u)).collect();

        let cur_key = normalize_host_port(&self.endpoints[self.cur].url);
        let mut kept = Vec::new();
        let mut removed_cur_shift = 0usize;
        for (idx, ep) in self.endpoints.drain(..).enumerate() {
            let key = normalize_host_port(&ep.url);
            let is_current = idx == self.cur;
            if ep.is_implicit && !is_current && !advertised.contains(&key) {
                self.seen.remove(&key);
                if idx < self.cur {
                    removed_cur_shift += 1;
                }
                continue;
            }
            kept.push(ep);
        }
        self.endpoints = kept;
        self.cur = self
            .endpoints
            .iter()
            .position(|e| normalize_host_port(&e.url) == cur_key)
            .unwrap_or(self.cur.saturating_sub(removed_cur_shift));

        let mut added = false;
        for url in urls {
            let key = normalize_host_port(url);
            if self.seen.insert(key) {
                self.endpoints.push(Endpoint::implicit(url.clone()));
                added = true;
            }
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_empty_and_seeds_default() {
        let pool = EndpointPool::new(None, Vec::new(), true);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.current().url, EndpointPool::DEFAULT_URL);
    }

    #[test]
    fn dedups_by_host_port_case_insensitive() {
        let pool = EndpointPool::new(
            None,
            vec!["nats://A:4222".into(), "nats://a:4222".into()],
            true,
        );
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn localhost_variants_are_equivalent() {
        let pool = EndpointPool::new(
            None,
            vec![
                "nats://localhost:4222".into(),
                "nats://127.0.0.1:4222".into(),
                "nats://[::1]:4222".into(),
            ],
            true,
        );
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn explicit_url_moved_to_front() {
        let pool = EndpointPool::new(
            Some("nats://explicit:1".into()),
            vec!["nats://a:1".into(), "nats://b:1".into()],
            true,
        );
        assert_eq!(pool.current().url, "nats://explicit:1");
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn next_rotates_when_under_limit() {
        let mut pool = EndpointPool::new(None, vec!["nats://a:1".into(), "nats://b:1".into()], true);
        let first = pool.current().url.clone();
        let policy = ReconnectPolicy { max_reconnect: Some(5) };
        let next = pool.next(policy).unwrap().url.clone();
        assert_ne!(first, next);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn next_removes_when_limit_exceeded() {
        let mut pool = EndpointPool::new(None, vec!["nats://a:1".into(), "nats://b:1".into()], true);
        pool.current_mut().reconnects = 10;
        let policy = ReconnectPolicy { max_reconnect: Some(5) };
        pool.next(policy);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn merge_advertised_adds_new_and_drops_stale_implicit() {
        let mut pool = EndpointPool::new(None, vec!["nats://a:1".into()], true);
        let added = pool.merge_advertised(&["nats://a:1".to_string(), "nats://b:1".to_string()]);
        assert!(added);
        assert_eq!(pool.len(), 2);

        // `b` is implicit and not current; if no longer advertised it is removed.
        let added_again = pool.merge_advertised(&["nats://a:1".to_string()]);
        assert!(!added_again);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn merge_advertised_never_drops_current() {
        let mut pool = EndpointPool::new(None, vec!["nats://a:1".into()], true);
        pool.merge_advertised(&["nats://a:1".to_string(), "nats://b:1".to_string()]);
        // current is "a", not advertised anymore, but it's current so stays.
        pool.merge_advertised(&["nats://b:1".to_string()]);
        assert!(pool.iter().any(|e| e.url.contains("a:1")));
    }
}
