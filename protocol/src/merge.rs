//! Merge engine
//!
//! Reconciles two mesh snapshots into one by a per-entity join
//! (least upper bound). The join is commutative, associative, and
//! idempotent, which is what makes repeated, reordered, and partial
//! gossip delivery harmless: any exchange order converges to the same
//! state once all updates have propagated.
//!
//! `merge` is pure and does no I/O. Signature checking happens in a
//! separate `sanitize` pass applied to inbound snapshots, so the join
//! itself can assume verified inputs.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::cmp::Ordering;

use crate::crypto::verify_host;
use crate::model::{Host, MeshState, Network};

/// Drop everything in a snapshot that cannot be trusted.
///
/// A host is kept only if its signature verifies against its embedded
/// public key and the record sits under its own key in the membership
/// map. `last_seen` is an observation local to each node, so whatever
/// the remote side claims is cleared here. Networks left empty after
/// filtering are removed.
pub fn sanitize(state: MeshState) -> MeshState {
    let mut clean = MeshState::default();

    for (network_id, network) in state.networks {
        let mut hosts = std::collections::BTreeMap::new();
        for (key, mut host) in network.hosts {
            if host.public_key != key {
                continue;
            }
            if !verify_host(&host) {
                continue;
            }
            host.last_seen = 0;
            hosts.insert(key, host);
        }

        if !hosts.is_empty() {
            clean.networks.insert(
                network_id,
                Network {
                    tld: network.tld,
                    hosts,
                },
            );
        }
    }

    clean
}

/// Join two mesh snapshots into their least upper bound.
pub fn merge(a: &MeshState, b: &MeshState) -> MeshState {
    let mut result = a.clone();

    for (network_id, remote_network) in &b.networks {
        match result.networks.get_mut(network_id) {
            Some(local_network) => merge_network(local_network, remote_network),
            None => {
                result
                    .networks
                    .insert(network_id.clone(), remote_network.clone());
            }
        }
    }

    result
}

fn merge_network(local: &mut Network, remote: &Network) {
    // The TLD is set by the founder and never legitimately diverges.
    // If two snapshots disagree anyway, pick deterministically so both
    // sides settle on the same value.
    if remote.tld < local.tld {
        local.tld = remote.tld.clone();
    }

    for (key, remote_host) in &remote.hosts {
        match local.hosts.get_mut(key) {
            Some(local_host) => {
                *local_host = join_host(local_host, remote_host);
            }
            None => {
                local.hosts.insert(key.clone(), remote_host.clone());
            }
        }
    }
}

/// Pick the winning record for one public key present on both sides.
///
/// Higher version wins. On a version tie the record whose signature
/// bytes compare lexicographically greater wins; any total order
/// works here as long as every peer computes the same one. Two fully
/// identical records join to the greater `last_seen`.
fn join_host(a: &Host, b: &Host) -> Host {
    match a.version.cmp(&b.version) {
        Ordering::Greater => return a.clone(),
        Ordering::Less => return b.clone(),
        Ordering::Equal => {}
    }

    match signature_bytes(a).cmp(&signature_bytes(b)) {
        Ordering::Greater => a.clone(),
        Ordering::Less => b.clone(),
        Ordering::Equal => {
            let mut joined = a.clone();
            joined.last_seen = a.last_seen.max(b.last_seen);
            joined
        }
    }
}

fn signature_bytes(host: &Host) -> Vec<u8> {
    // Sanitized records always decode; fall back to the encoded form
    // for raw states built in tests.
    BASE64
        .decode(&host.signature)
        .unwrap_or_else(|_| host.signature.clone().into_bytes())
}

/// Stamp `now` on every host whose version advanced relative to what
/// this node previously knew, or that is entirely new to it.
///
/// Kept out of `merge` so the join stays deterministic; the node
/// applies this right after merging, before persistence.
pub fn refresh_last_seen(prev: &MeshState, merged: &mut MeshState, now: u64) {
    for (network_id, network) in &mut merged.networks {
        let prev_hosts = prev.networks.get(network_id).map(|n| &n.hosts);

        for (key, host) in &mut network.hosts {
            let prev_version = prev_hosts.and_then(|h| h.get(key)).map(|h| h.version);
            match prev_version {
                Some(v) if v >= host.version => {}
                _ => host.last_seen = now,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{encode_public_key, sign_host};
    use ed25519_dalek::SigningKey;
    use std::collections::BTreeMap;
    use std::net::IpAddr;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn signed_host(signing: &SigningKey, ip: &str, version: u64, labels: &[&str]) -> Host {
        let mut hostnames = BTreeMap::new();
        for label in labels {
            hostnames.insert(
                label.to_string(),
                crate::model::Hostname {
                    label: label.to_string(),
                    claimed_at: 1_000,
                },
            );
        }
        let mut host = Host {
            public_key: encode_public_key(&signing.verifying_key()),
            ip: ip.parse::<IpAddr>().unwrap(),
            port: 7331,
            hostnames,
            version,
            last_seen: 0,
            signature: String::new(),
        };
        sign_host(&mut host, signing).unwrap();
        host
    }

    fn state_with(network_id: &str, tld: &str, hosts: Vec<Host>) -> MeshState {
        let mut network = Network::new(tld);
        for host in hosts {
            network.hosts.insert(host.public_key.clone(), host);
        }
        let mut state = MeshState::default();
        state.networks.insert(network_id.to_string(), network);
        state
    }

    fn founder_id(signing: &SigningKey) -> String {
        encode_public_key(&signing.verifying_key())
    }

    #[test]
    fn merge_is_commutative() {
        let founder = key(1);
        let id = founder_id(&founder);
        let a = state_with(&id, "example", vec![signed_host(&key(1), "10.0.0.1", 1, &[])]);
        let b = state_with(&id, "example", vec![signed_host(&key(2), "10.0.0.2", 1, &[])]);

        assert_eq!(merge(&a, &b), merge(&b, &a));
    }

    #[test]
    fn merge_is_associative() {
        let founder = key(1);
        let id = founder_id(&founder);
        let a = state_with(&id, "example", vec![signed_host(&key(1), "10.0.0.1", 1, &[])]);
        let b = state_with(&id, "example", vec![signed_host(&key(2), "10.0.0.2", 3, &[])]);
        let c = state_with(&id, "example", vec![signed_host(&key(3), "10.0.0.3", 2, &[])]);

        assert_eq!(merge(&merge(&a, &b), &c), merge(&a, &merge(&b, &c)));
    }

    #[test]
    fn merge_is_idempotent() {
        let founder = key(1);
        let id = founder_id(&founder);
        let a = state_with(
            &id,
            "example",
            vec![
                signed_host(&key(1), "10.0.0.1", 4, &["db"]),
                signed_host(&key(2), "10.0.0.2", 2, &[]),
            ],
        );

        assert_eq!(merge(&a, &a), a);
    }

    #[test]
    fn higher_version_wins() {
        let founder = key(1);
        let id = founder_id(&founder);
        let member = key(2);
        let old = state_with(&id, "example", vec![signed_host(&member, "10.0.0.2", 1, &[])]);
        let new = state_with(&id, "example", vec![signed_host(&member, "10.0.0.9", 2, &[])]);

        let merged = merge(&old, &new);
        let host = &merged.networks[&id].hosts[&encode_public_key(&member.verifying_key())];
        assert_eq!(host.version, 2);
        assert_eq!(host.ip, "10.0.0.9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn version_never_decreases() {
        let founder = key(1);
        let id = founder_id(&founder);
        let member = key(2);
        let member_id = encode_public_key(&member.verifying_key());
        let newer = state_with(&id, "example", vec![signed_host(&member, "10.0.0.2", 5, &[])]);
        let older = state_with(&id, "example", vec![signed_host(&member, "10.0.0.2", 3, &[])]);

        let merged = merge(&newer, &older);
        assert_eq!(merged.networks[&id].hosts[&member_id].version, 5);
    }

    #[test]
    fn version_tie_breaks_on_signature_bytes_both_ways() {
        let founder = key(1);
        let id = founder_id(&founder);
        let member = key(2);

        // Same version, different payloads, both correctly signed.
        let x = state_with(&id, "example", vec![signed_host(&member, "10.0.0.1", 7, &[])]);
        let y = state_with(&id, "example", vec![signed_host(&member, "10.0.0.2", 7, &[])]);

        assert_eq!(merge(&x, &y), merge(&y, &x));
    }

    #[test]
    fn unknown_networks_are_unioned() {
        let a = state_with(
            &founder_id(&key(1)),
            "alpha",
            vec![signed_host(&key(1), "10.0.0.1", 1, &[])],
        );
        let b = state_with(
            &founder_id(&key(2)),
            "beta",
            vec![signed_host(&key(2), "10.0.0.2", 1, &[])],
        );

        let merged = merge(&a, &b);
        assert_eq!(merged.networks.len(), 2);
    }

    #[test]
    fn sanitize_drops_forged_records() {
        let founder = key(1);
        let id = founder_id(&founder);
        let honest = signed_host(&key(2), "10.0.0.2", 1, &[]);

        // Forged: claims key 3's identity but is signed by key 2.
        let mut forged = signed_host(&key(2), "10.0.0.66", 9, &[]);
        forged.public_key = encode_public_key(&key(3).verifying_key());

        let mut network = Network::new("example");
        network.hosts.insert(honest.public_key.clone(), honest);
        network.hosts.insert(forged.public_key.clone(), forged);
        let mut state = MeshState::default();
        state.networks.insert(id.clone(), network);

        let clean = sanitize(state);
        assert_eq!(clean.networks[&id].hosts.len(), 1);
    }

    #[test]
    fn sanitize_drops_misfiled_records() {
        let founder = key(1);
        let id = founder_id(&founder);
        let host = signed_host(&key(2), "10.0.0.2", 1, &[]);

        // Valid signature, but filed under the wrong key.
        let mut network = Network::new("example");
        network.hosts.insert("somebody-else".to_string(), host);
        let mut state = MeshState::default();
        state.networks.insert(id, network);

        assert!(sanitize(state).is_empty());
    }

    #[test]
    fn sanitize_clears_remote_last_seen() {
        let founder = key(1);
        let id = founder_id(&founder);
        let mut host = signed_host(&founder, "10.0.0.1", 1, &[]);
        host.last_seen = 999_999; // remote's claim, not ours
        let state = state_with(&id, "example", vec![host]);

        let clean = sanitize(state);
        let host = clean.networks[&id].hosts.values().next().unwrap();
        assert_eq!(host.last_seen, 0);
    }

    #[test]
    fn forged_merge_leaves_state_unchanged() {
        let founder = key(1);
        let id = founder_id(&founder);
        let local = state_with(&id, "example", vec![signed_host(&founder, "10.0.0.1", 1, &[])]);

        let mut forged = signed_host(&key(9), "10.0.0.66", 50, &[]);
        forged.public_key = encode_public_key(&key(2).verifying_key());
        let remote = state_with(&id, "example", vec![forged]);

        let merged = merge(&local, &sanitize(remote));
        assert_eq!(merged, local);
    }

    #[test]
    fn refresh_stamps_new_and_advanced_hosts_only() {
        let founder = key(1);
        let id = founder_id(&founder);
        let member = key(2);
        let member_id = encode_public_key(&member.verifying_key());

        let prev = state_with(&id, "example", vec![signed_host(&founder, "10.0.0.1", 3, &[])]);
        let mut merged = state_with(
            &id,
            "example",
            vec![
                signed_host(&founder, "10.0.0.1", 3, &[]), // unchanged
                signed_host(&member, "10.0.0.2", 1, &[]),  // new
            ],
        );

        refresh_last_seen(&prev, &mut merged, 5_000);
        assert_eq!(merged.networks[&id].hosts[&id].last_seen, 0);
        assert_eq!(merged.networks[&id].hosts[&member_id].last_seen, 5_000);
    }

    #[test]
    fn convergence_over_any_exchange_order() {
        let founder = key(1);
        let id = founder_id(&founder);
        let states: Vec<MeshState> = (1..=4u8)
            .map(|i| {
                state_with(
                    &id,
                    "example",
                    vec![signed_host(&key(i), &format!("10.0.0.{i}"), i as u64, &[])],
                )
            })
            .collect();

        let forward = states
            .iter()
            .fold(MeshState::default(), |acc, s| merge(&acc, s));
        let backward = states
            .iter()
            .rev()
            .fold(MeshState::default(), |acc, s| merge(&acc, s));
        // Repeated delivery must not change the outcome either.
        let repeated = states
            .iter()
            .chain(states.iter())
            .fold(forward.clone(), |acc, s| merge(&acc, s));

        assert_eq!(forward, backward);
        assert_eq!(forward, repeated);
        assert_eq!(forward.host_count(), 4);
    }
}
