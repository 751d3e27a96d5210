//! Peer manager
//!
//! Tracks the addresses gossip rounds can target: bootstrap peers
//! supplied at startup (always retried, never dropped) and peers
//! discovered through other hosts' records (dropped after repeated
//! failure). Each peer carries exponential-backoff state so an
//! unreachable peer is not hammered; no peer is ever required to
//! succeed for the mesh to make progress.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Base backoff applied after the first consecutive failure.
pub const BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Backoff ceiling.
pub const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Discovered peers are dropped after this many consecutive failures.
pub const DISCOVERED_FAILURE_CEILING: u32 = 8;

#[derive(Debug, Clone)]
struct PeerEntry {
    bootstrap: bool,
    consecutive_failures: u32,
    next_retry: Instant,
}

impl PeerEntry {
    fn new(bootstrap: bool) -> Self {
        Self {
            bootstrap,
            consecutive_failures: 0,
            next_retry: Instant::now(),
        }
    }
}

/// Snapshot of peer bookkeeping, exposed for diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PeerStats {
    pub url: String,
    pub bootstrap: bool,
    pub consecutive_failures: u32,
}

pub struct PeerManager {
    peers: HashMap<String, PeerEntry>,
    /// The local node's own gossip URL, filtered out of discoveries.
    local_url: String,
}

impl PeerManager {
    pub fn new(local_url: String, bootstrap_peers: &[String]) -> Self {
        let mut peers = HashMap::new();
        for url in bootstrap_peers {
            let url = normalize(url);
            if url != local_url {
                peers.insert(url, PeerEntry::new(true));
            }
        }
        Self { peers, local_url }
    }

    /// Record a peer address learned from a gossiped host record.
    /// Known peers keep their backoff state.
    pub fn add_discovered(&mut self, url: &str) {
        let url = normalize(url);
        if url == self.local_url {
            return;
        }
        if !self.peers.contains_key(&url) {
            debug!(%url, "discovered new peer");
            self.peers.insert(url, PeerEntry::new(false));
        }
    }

    /// Select up to `n` peers currently due for a gossip round.
    ///
    /// Peers still inside their backoff window are skipped. The least
    /// recently failed peers go first so a flapping peer cannot starve
    /// healthy ones.
    pub fn select_peers(&self, n: usize) -> Vec<String> {
        let now = Instant::now();
        let mut due: Vec<(&String, &PeerEntry)> = self
            .peers
            .iter()
            .filter(|(_, entry)| entry.next_retry <= now)
            .collect();
        due.sort_by_key(|(_, entry)| entry.consecutive_failures);
        due.into_iter().take(n).map(|(url, _)| url.clone()).collect()
    }

    pub fn record_success(&mut self, url: &str) {
        if let Some(entry) = self.peers.get_mut(url) {
            entry.consecutive_failures = 0;
            entry.next_retry = Instant::now();
        }
    }

    /// Record a failed round: bump the failure count, push the next
    /// retry out exponentially, and drop discovered peers that have
    /// exceeded the failure ceiling. Bootstrap peers are kept forever.
    pub fn record_failure(&mut self, url: &str) {
        let Some(entry) = self.peers.get_mut(url) else {
            return;
        };
        entry.consecutive_failures += 1;

        if !entry.bootstrap && entry.consecutive_failures >= DISCOVERED_FAILURE_CEILING {
            debug!(%url, "dropping unreachable discovered peer");
            self.peers.remove(url);
            return;
        }

        let exponent = entry.consecutive_failures.saturating_sub(1).min(16);
        let backoff = BACKOFF_BASE
            .saturating_mul(1u32 << exponent)
            .min(BACKOFF_MAX);
        entry.next_retry = Instant::now() + backoff;
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn stats(&self) -> Vec<PeerStats> {
        let mut stats: Vec<_> = self
            .peers
            .iter()
            .map(|(url, entry)| PeerStats {
                url: url.clone(),
                bootstrap: entry.bootstrap,
                consecutive_failures: entry.consecutive_failures,
            })
            .collect();
        stats.sort_by(|a, b| a.url.cmp(&b.url));
        stats
    }
}

fn normalize(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}
