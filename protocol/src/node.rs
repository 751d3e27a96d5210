//! Mesh node
//!
//! `MeshNode` owns the single shared `MeshState` and is the only path
//! through which it mutates: every merge result and every disk write
//! goes through one write lock, so two gossip rounds can never
//! interleave a merge or race a persistence write. Outbound snapshots
//! are cheap clones taken under the read lock.

use ed25519_dalek::SigningKey;
use std::collections::BTreeMap;
use std::net::IpAddr;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info};

use crate::crypto::{encode_public_key, sign_host};
use crate::error::MeshError;
use crate::merge::{merge, refresh_last_seen, sanitize};
use crate::model::{now_unix, validate_label, Host, Hostname, MeshState, Network};
use crate::peers::{PeerManager, PeerStats};
use crate::store::Store;

/// Membership admission: which networks a node adds itself to.
///
/// Deliberately a seam rather than a hard-coded rule; today any
/// validly signed record is admitted everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdmissionPolicy {
    /// Join every network this node learns about.
    #[default]
    Open,
    /// Only refresh membership in networks that already list this node.
    ExistingMembersOnly,
}

#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Seconds between gossip rounds.
    pub interval_secs: u64,
    /// Per-request timeout for one peer exchange.
    pub request_timeout_secs: u64,
    /// How many peers each round gossips with.
    pub fanout: usize,
    pub admission: AdmissionPolicy,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            request_timeout_secs: 10,
            fanout: 3,
            admission: AdmissionPolicy::default(),
        }
    }
}

pub struct MeshNode {
    key: SigningKey,
    public_key: String,
    ip: IpAddr,
    port: u16,
    /// Labels this node claims in every network it belongs to.
    hostnames: Vec<String>,
    store: Store,
    config: GossipConfig,
    state: RwLock<MeshState>,
    peers: Mutex<PeerManager>,
    /// Signalled after a local mutation so the gossip loop runs an
    /// eager round instead of waiting out the interval.
    changed: Notify,
}

impl MeshNode {
    /// Construct a node from persisted state.
    ///
    /// A missing state file yields an empty mesh (the node will learn
    /// everything from its bootstrap peers). A state file that exists
    /// but cannot be read is an error the caller must treat as fatal.
    pub async fn open(
        key: SigningKey,
        ip: IpAddr,
        port: u16,
        hostnames: Vec<String>,
        bootstrap_peers: &[String],
        store: Store,
        config: GossipConfig,
    ) -> Result<Self, MeshError> {
        for label in &hostnames {
            validate_label(label)?;
        }

        let public_key = encode_public_key(&key.verifying_key());
        let state = store.load().await?.unwrap_or_default();
        if !state.is_empty() {
            info!(
                networks = state.networks.len(),
                hosts = state.host_count(),
                "loaded persisted mesh state"
            );
        }

        let local_url = gossip_url(ip, port);
        Ok(Self {
            key,
            public_key,
            ip,
            port,
            hostnames,
            store,
            config,
            state: RwLock::new(state),
            peers: Mutex::new(PeerManager::new(local_url, bootstrap_peers)),
            changed: Notify::new(),
        })
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    /// Wait until a local mutation requests an eager gossip round.
    pub async fn local_change(&self) {
        self.changed.notified().await;
    }

    /// Clone the current state for an outbound exchange.
    pub async fn snapshot(&self) -> MeshState {
        self.state.read().await.clone()
    }

    /// Found a new network with this node as its sole member, keyed by
    /// the local public key, and persist it.
    ///
    /// Idempotent: founding a network that already exists just
    /// refreshes the local membership record.
    pub async fn found_network(&self, tld: &str) -> Result<(), MeshError> {
        let now = now_unix();
        let mut guard = self.state.write().await;

        let version = guard.max_version_of(&self.public_key) + 1;
        let host = self.signed_local_host(&guard, version, now)?;

        let network = guard
            .networks
            .entry(self.public_key.clone())
            .or_insert_with(|| Network::new(tld));
        network.hosts.insert(self.public_key.clone(), host);

        let state = guard.clone();
        self.persist(&state, now).await?;
        drop(guard);

        info!(tld, network = %self.public_key, "founded network");
        self.changed.notify_one();
        Ok(())
    }

    /// Verify, merge, prune, and (if anything changed) persist a
    /// remote snapshot. Returns whether the state changed.
    ///
    /// This is the single write path shared by inbound gossip handlers
    /// and outbound round results.
    pub async fn apply_remote(&self, remote: MeshState) -> Result<bool, MeshError> {
        let remote = sanitize(remote);
        let now = now_unix();

        let changed;
        {
            let mut guard = self.state.write().await;
            let prev = guard.clone();

            let mut merged = merge(&prev, &remote);
            refresh_last_seen(&prev, &mut merged, now);
            self.store.prune(&mut merged, now, &self.public_key);

            changed = merged != prev;
            if changed {
                *guard = merged.clone();
                // Persist inside the critical section so a concurrent
                // round can never interleave its own save.
                self.persist(&merged, now).await?;
            }
        }

        if changed {
            self.learn_peers().await;
        }
        Ok(changed)
    }

    /// Heartbeat: re-sign the local host record with a bumped version,
    /// refresh it in every network the admission policy allows, and
    /// persist.
    ///
    /// Peers observe the version advance and keep this host out of
    /// their staleness windows. Returns whether membership changed
    /// (it does whenever this node belongs to at least one network).
    pub async fn refresh_local(&self) -> Result<bool, MeshError> {
        let now = now_unix();
        let mut changed = false;

        {
            let mut guard = self.state.write().await;
            let version = guard.max_version_of(&self.public_key) + 1;
            let host = self.signed_local_host(&guard, version, now)?;

            let joinable: Vec<String> = guard
                .networks
                .iter()
                .filter(|(_, network)| match self.config.admission {
                    AdmissionPolicy::Open => true,
                    AdmissionPolicy::ExistingMembersOnly => {
                        network.hosts.contains_key(&self.public_key)
                    }
                })
                .map(|(id, _)| id.clone())
                .collect();

            for id in joinable {
                if let Some(network) = guard.networks.get_mut(&id) {
                    network.hosts.insert(self.public_key.clone(), host.clone());
                    changed = true;
                }
            }

            if changed {
                let state = guard.clone();
                self.persist(&state, now).await?;
            }
        }

        if changed {
            debug!("refreshed local host record");
        }
        Ok(changed)
    }

    /// Feed every known host's gossip endpoint to the peer manager.
    pub async fn learn_peers(&self) {
        let state = self.state.read().await;
        let mut peers = self.peers.lock().await;
        for network in state.networks.values() {
            for host in network.hosts.values() {
                if host.public_key != self.public_key {
                    peers.add_discovered(&host.gossip_url());
                }
            }
        }
    }

    pub async fn select_peers(&self) -> Vec<String> {
        self.peers.lock().await.select_peers(self.config.fanout)
    }

    pub async fn record_peer_success(&self, url: &str) {
        self.peers.lock().await.record_success(url);
    }

    pub async fn record_peer_failure(&self, url: &str) {
        self.peers.lock().await.record_failure(url);
    }

    pub async fn peer_stats(&self) -> Vec<PeerStats> {
        self.peers.lock().await.stats()
    }

    /// Build and sign the local host record at the given version,
    /// preserving original claim timestamps for labels already held.
    fn signed_local_host(
        &self,
        state: &MeshState,
        version: u64,
        now: u64,
    ) -> Result<Host, MeshError> {
        let existing = state
            .networks
            .values()
            .find_map(|n| n.hosts.get(&self.public_key));

        let mut hostnames = BTreeMap::new();
        for label in &self.hostnames {
            let claimed_at = existing
                .and_then(|h| h.hostnames.get(label))
                .map(|h| h.claimed_at)
                .unwrap_or(now);
            hostnames.insert(
                label.clone(),
                Hostname {
                    label: label.clone(),
                    claimed_at,
                },
            );
        }

        let mut host = Host {
            public_key: self.public_key.clone(),
            ip: self.ip,
            port: self.port,
            hostnames,
            version,
            last_seen: now,
            signature: String::new(),
        };
        sign_host(&mut host, &self.key)?;
        Ok(host)
    }

    /// Save the state and rewrite the DNS projection.
    async fn persist(&self, state: &MeshState, now: u64) -> Result<(), MeshError> {
        self.store.save(state).await?;
        let projection = self.store.derive_dns(state, now);
        self.store.write_dns(&projection).await?;
        Ok(())
    }
}

/// The URL form under which an address/port pair gossips.
pub fn gossip_url(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(ip) => format!("http://{}:{}", ip, port),
        IpAddr::V6(ip) => format!("http://[{}]:{}", ip, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use tempfile::TempDir;

    async fn test_node(dir: &TempDir, seed: u8, hostnames: &[&str]) -> MeshNode {
        let key = SigningKey::from_bytes(&[seed; 32]);
        let store = Store::new(StoreConfig::new(
            dir.path().join(format!("state-{seed}.json")),
            dir.path().join(format!("dns-{seed}.json")),
        ));
        MeshNode::open(
            key,
            format!("10.0.0.{seed}").parse().unwrap(),
            7331,
            hostnames.iter().map(|s| s.to_string()).collect(),
            &[],
            store,
            GossipConfig::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn found_network_creates_single_member_state() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(&dir, 1, &["db"]).await;

        node.found_network("example").await.unwrap();

        let state = node.snapshot().await;
        assert_eq!(state.networks.len(), 1);
        let network = &state.networks[node.public_key()];
        assert_eq!(network.tld, "example");
        assert_eq!(network.hosts.len(), 1);
        assert!(network.hosts[node.public_key()]
            .hostnames
            .contains_key("db"));
    }

    #[tokio::test]
    async fn found_network_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(&dir, 1, &[]).await;

        node.found_network("example").await.unwrap();
        let v1 = node.snapshot().await.max_version_of(node.public_key());
        node.found_network("example").await.unwrap();

        let state = node.snapshot().await;
        assert_eq!(state.networks.len(), 1);
        assert!(state.max_version_of(node.public_key()) > v1);
    }

    #[tokio::test]
    async fn apply_remote_merges_and_reports_change() {
        let dir = tempfile::tempdir().unwrap();
        let founder = test_node(&dir, 1, &[]).await;
        founder.found_network("example").await.unwrap();
        let snapshot = founder.snapshot().await;

        let joiner = test_node(&dir, 2, &[]).await;
        assert!(joiner.apply_remote(snapshot.clone()).await.unwrap());
        assert_eq!(joiner.snapshot().await.host_count(), 1);

        // Re-delivering the same snapshot changes nothing.
        assert!(!joiner.apply_remote(snapshot).await.unwrap());
    }

    #[tokio::test]
    async fn refresh_local_joins_known_networks() {
        let dir = tempfile::tempdir().unwrap();
        let founder = test_node(&dir, 1, &[]).await;
        founder.found_network("example").await.unwrap();

        let joiner = test_node(&dir, 2, &["web"]).await;
        joiner.apply_remote(founder.snapshot().await).await.unwrap();
        assert!(joiner.refresh_local().await.unwrap());

        let state = joiner.snapshot().await;
        let network = &state.networks[founder.public_key()];
        assert_eq!(network.hosts.len(), 2);
        assert!(network.hosts[joiner.public_key()]
            .hostnames
            .contains_key("web"));
    }

    #[tokio::test]
    async fn refresh_local_without_networks_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(&dir, 1, &["db"]).await;
        assert!(!node.refresh_local().await.unwrap());
    }

    #[tokio::test]
    async fn existing_members_only_policy_does_not_join() {
        let dir = tempfile::tempdir().unwrap();
        let founder = test_node(&dir, 1, &[]).await;
        founder.found_network("example").await.unwrap();

        let key = SigningKey::from_bytes(&[2; 32]);
        let store = Store::new(StoreConfig::new(
            dir.path().join("state-closed.json"),
            dir.path().join("dns-closed.json"),
        ));
        let joiner = MeshNode::open(
            key,
            "10.0.0.2".parse().unwrap(),
            7331,
            vec![],
            &[],
            store,
            GossipConfig {
                admission: AdmissionPolicy::ExistingMembersOnly,
                ..GossipConfig::default()
            },
        )
        .await
        .unwrap();

        joiner.apply_remote(founder.snapshot().await).await.unwrap();
        assert!(!joiner.refresh_local().await.unwrap());
        assert_eq!(joiner.snapshot().await.host_count(), 1);
    }

    #[tokio::test]
    async fn learn_peers_discovers_other_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let founder = test_node(&dir, 1, &[]).await;
        founder.found_network("example").await.unwrap();

        let joiner = test_node(&dir, 2, &[]).await;
        joiner.apply_remote(founder.snapshot().await).await.unwrap();

        let stats = joiner.peer_stats().await;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].url, "http://10.0.0.1:7331");
    }

    #[tokio::test]
    async fn invalid_hostname_flag_is_rejected_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        let key = SigningKey::from_bytes(&[1; 32]);
        let store = Store::new(StoreConfig::new(
            dir.path().join("state.json"),
            dir.path().join("dns.json"),
        ));
        let result = MeshNode::open(
            key,
            "10.0.0.1".parse().unwrap(),
            7331,
            vec!["Not Valid".to_string()],
            &[],
            store,
            GossipConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(MeshError::InvalidLabel(_))));
    }
}
