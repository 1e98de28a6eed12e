//! Proxy pool management.
//!
//! The pool is the only shared mutable resource in the crawler. Every proxy
//! is in exactly one of two partitions (available or in-use) and all
//! transitions happen under a single mutex, so concurrent tasks can never
//! observe a proxy in both states.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use rand::Rng;
use tracing::debug;

/// Fixed set of proxy URLs partitioned into available and in-use.
pub struct ProxyPool {
    inner: Mutex<PoolState>,
}

struct PoolState {
    all: Vec<String>,
    in_use: HashSet<String>,
}

impl ProxyPool {
    /// Build a pool from a proxy URL list. Duplicates are dropped, keeping
    /// first-seen order.
    pub fn new(proxies: Vec<String>) -> Self {
        let mut seen = HashSet::new();
        let all: Vec<String> = proxies
            .into_iter()
            .filter(|p| seen.insert(p.clone()))
            .collect();

        Self {
            inner: Mutex::new(PoolState {
                all,
                in_use: HashSet::new(),
            }),
        }
    }

    /// Total number of proxies in the pool.
    pub fn len(&self) -> usize {
        self.lock().all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().all.is_empty()
    }

    /// Proxies not currently assigned, in pool order.
    pub fn available(&self) -> Vec<String> {
        let state = self.lock();
        state
            .all
            .iter()
            .filter(|p| !state.in_use.contains(*p))
            .cloned()
            .collect()
    }

    /// Proxies currently assigned.
    pub fn in_use(&self) -> Vec<String> {
        let state = self.lock();
        state
            .all
            .iter()
            .filter(|p| state.in_use.contains(*p))
            .cloned()
            .collect()
    }

    /// Atomically move a proxy from available to in-use. Returns false if it
    /// is already assigned or not part of the pool.
    pub fn assign(&self, proxy: &str) -> bool {
        let mut state = self.lock();
        if !state.all.iter().any(|p| p == proxy) || state.in_use.contains(proxy) {
            return false;
        }
        state.in_use.insert(proxy.to_string());
        true
    }

    /// Return a proxy to the available partition. Idempotent.
    pub fn release(&self, proxy: &str) {
        let mut state = self.lock();
        state.in_use.remove(proxy);
    }

    /// Assign a uniformly random available proxy. Returns None when the pool
    /// is empty or every proxy is already in use.
    pub fn acquire(&self) -> Option<String> {
        let mut state = self.lock();
        let candidates: Vec<&String> = state
            .all
            .iter()
            .filter(|p| !state.in_use.contains(*p))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let idx = rand::rng().random_range(0..candidates.len());
        let next = candidates[idx].clone();
        state.in_use.insert(next.clone());
        debug!("Acquired proxy {}", next);
        Some(next)
    }

    /// Release `current` and assign a uniformly random replacement drawn from
    /// the available partition minus `exclude`. The released proxy is never
    /// picked as its own replacement. Returns None when no candidate remains;
    /// `current` stays released in that case.
    pub fn rotate(&self, current: &str, exclude: &[String]) -> Option<String> {
        let mut state = self.lock();
        state.in_use.remove(current);

        let candidates: Vec<&String> = state
            .all
            .iter()
            .filter(|p| {
                !state.in_use.contains(*p)
                    && p.as_str() != current
                    && !exclude.iter().any(|e| e == *p)
            })
            .collect();

        if candidates.is_empty() {
            debug!("Proxy rotation found no replacement for {}", current);
            return None;
        }

        let idx = rand::rng().random_range(0..candidates.len());
        let next = candidates[idx].clone();
        state.in_use.insert(next.clone());
        debug!("Rotated proxy {} -> {}", current, next);
        Some(next)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        // A panicked holder cannot leave the partition half-updated, so a
        // poisoned lock is safe to recover.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pool(names: &[&str]) -> ProxyPool {
        ProxyPool::new(names.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_assign_moves_to_in_use() {
        let pool = pool(&["http://p1:8080", "http://p2:8080"]);
        assert!(pool.assign("http://p1:8080"));
        assert_eq!(pool.available(), vec!["http://p2:8080"]);
        assert_eq!(pool.in_use(), vec!["http://p1:8080"]);
    }

    #[test]
    fn test_double_assign_fails() {
        let pool = pool(&["http://p1:8080"]);
        assert!(pool.assign("http://p1:8080"));
        assert!(!pool.assign("http://p1:8080"));
    }

    #[test]
    fn test_assign_unknown_proxy_fails() {
        let pool = pool(&["http://p1:8080"]);
        assert!(!pool.assign("http://nope:1"));
        assert!(pool.in_use().is_empty());
    }

    #[test]
    fn test_release_is_idempotent() {
        let pool = pool(&["http://p1:8080"]);
        assert!(pool.assign("http://p1:8080"));
        pool.release("http://p1:8080");
        pool.release("http://p1:8080");
        assert_eq!(pool.available().len(), 1);
        assert!(pool.in_use().is_empty());
    }

    #[test]
    fn test_acquire_assigns_an_available_proxy() {
        let pool = pool(&["p1", "p2"]);
        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        assert_ne!(first, second);
        assert_eq!(pool.acquire(), None);
        assert_eq!(pool.in_use().len(), 2);
    }

    #[test]
    fn test_rotate_picks_only_unexcluded_available() {
        let pool = pool(&["p1", "p2", "p3", "p4"]);
        assert!(pool.assign("p1"));
        assert!(pool.assign("p2"));
        let next = pool.rotate("p1", &["p3".to_string()]);
        // p2 is in use, p3 excluded, p1 never replaces itself.
        assert_eq!(next.as_deref(), Some("p4"));
        assert!(pool.available().contains(&"p1".to_string()));
    }

    #[test]
    fn test_rotate_exhaustion_returns_none_without_reassigning() {
        let pool = pool(&["p1", "p2", "p3"]);
        assert!(pool.assign("p1"));
        let exclude = vec!["p2".to_string(), "p3".to_string()];
        assert_eq!(pool.rotate("p1", &exclude), None);
        // current was released but not re-assigned
        assert!(pool.in_use().is_empty());
        assert_eq!(pool.available().len(), 3);
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let pool = pool(&["p1", "p2", "p1"]);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_partitions_stay_disjoint_under_concurrency() {
        let pool = Arc::new(pool(&["p1", "p2", "p3", "p4", "p5", "p6"]));
        let names: Vec<String> = (1..=6).map(|i| format!("p{}", i)).collect();

        let mut handles = Vec::new();
        for t in 0..4 {
            let pool = pool.clone();
            let names = names.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    let p = &names[(t * 7 + i) % names.len()];
                    if pool.assign(p) {
                        if i % 3 == 0 {
                            let _ = pool.rotate(p, &[]);
                        } else {
                            pool.release(p);
                        }
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // Union of both partitions is the full pool with no overlap.
        let available = pool.available();
        let in_use = pool.in_use();
        assert_eq!(available.len() + in_use.len(), 6);
        for p in &available {
            assert!(!in_use.contains(p));
        }
    }
}
