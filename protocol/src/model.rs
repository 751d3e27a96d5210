//! Mesh data model
//!
//! A `MeshState` is the full local view: networks keyed by their
//! founder's base64 public key, each holding signed `Host` records
//! keyed by the member's base64 public key. Host records carry the
//! hostnames their owner claims; ownership disputes are settled at
//! DNS-projection time, never by rewriting a signed record.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::error::MeshError;

/// Maximum hostname label length.
pub const MAX_LABEL_LENGTH: usize = 63;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A hostname claim held inside its owner's `Host` record.
///
/// The owning public key and the claim's version are those of the
/// containing record, so they are not repeated here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hostname {
    /// The claimed label (without the network TLD).
    pub label: String,
    /// Unix timestamp (seconds) when the owner first claimed the label.
    pub claimed_at: u64,
}

/// A peer's signed identity and reachability record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Owner's ed25519 verifying key, base64-encoded (32 bytes).
    pub public_key: String,
    /// Address the peer's gossip endpoint is reachable at.
    pub ip: IpAddr,
    pub port: u16,
    /// Labels this host claims, keyed by label.
    pub hostnames: BTreeMap<String, Hostname>,
    /// Monotonically increasing counter, bumped only by the key holder.
    pub version: u64,
    /// Unix timestamp (seconds) when this node last observed the record's
    /// version advance. Local metadata: excluded from the signature.
    #[serde(default)]
    pub last_seen: u64,
    /// Detached ed25519 signature over `canonical_bytes`, base64-encoded.
    pub signature: String,
}

impl Host {
    /// Canonical serialization used for signing and verification.
    ///
    /// The signature field is cleared and `last_seen` zeroed so the
    /// bytes are stable across transports and observers. `BTreeMap`
    /// keeps hostname ordering deterministic.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, MeshError> {
        let mut canonical = self.clone();
        canonical.signature = String::new();
        canonical.last_seen = 0;
        Ok(serde_json::to_vec(&canonical)?)
    }

    /// The gossip endpoint URL other peers use to reach this host.
    pub fn gossip_url(&self) -> String {
        match self.ip {
            IpAddr::V4(ip) => format!("http://{}:{}", ip, self.port),
            IpAddr::V6(ip) => format!("http://[{}]:{}", ip, self.port),
        }
    }
}

/// A namespace of hosts rooted at a founding public key, exposed
/// under one top-level domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Top-level domain appended to every label in this network.
    pub tld: String,
    /// Membership, keyed by each member's base64 public key.
    pub hosts: BTreeMap<String, Host>,
}

impl Network {
    pub fn new(tld: &str) -> Self {
        Self {
            tld: tld.to_string(),
            hosts: BTreeMap::new(),
        }
    }
}

/// The full local view of all known networks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshState {
    /// Networks keyed by the base64 encoding of their founding public key.
    pub networks: BTreeMap<String, Network>,
}

impl MeshState {
    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    /// Total number of host records across all networks.
    pub fn host_count(&self) -> usize {
        self.networks.values().map(|n| n.hosts.len()).sum()
    }

    /// Highest version any network records for the given public key.
    ///
    /// Used at startup so a restarted node never signs a version below
    /// one it previously published.
    pub fn max_version_of(&self, public_key: &str) -> u64 {
        self.networks
            .values()
            .filter_map(|n| n.hosts.get(public_key))
            .map(|h| h.version)
            .max()
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// DNS projection
// ---------------------------------------------------------------------------

/// One derived DNS record: a fully qualified hostname and the address
/// of the host that currently owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsEntry {
    pub hostname: String,
    pub ip: IpAddr,
}

/// Derived, disposable list of DNS records. Fully recomputed from the
/// mesh state on every change, never mutated independently.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsProjection {
    pub entries: Vec<DnsEntry>,
}

// ---------------------------------------------------------------------------
// Label validation
// ---------------------------------------------------------------------------

/// Validate a hostname label (the part before the network TLD).
///
/// Rules: 1-63 characters from `[a-z0-9-.]`, starting and ending with
/// an alphanumeric character. Dots are allowed so a host can claim a
/// nested name such as `db.cluster`.
pub fn validate_label(label: &str) -> Result<(), MeshError> {
    if label.is_empty() || label.len() > MAX_LABEL_LENGTH {
        return Err(MeshError::InvalidLabel(format!(
            "label must be 1-{} characters, got {}",
            MAX_LABEL_LENGTH,
            label.len()
        )));
    }

    if !label
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
        || !label
            .chars()
            .last()
            .is_some_and(|c| c.is_ascii_alphanumeric())
    {
        return Err(MeshError::InvalidLabel(format!(
            "'{label}' must start and end with an alphanumeric character"
        )));
    }

    for ch in label.chars() {
        if !ch.is_ascii_lowercase() && !ch.is_ascii_digit() && ch != '-' && ch != '.' {
            return Err(MeshError::InvalidLabel(format!(
                "invalid character '{ch}' in '{label}'; only [a-z0-9-.] allowed"
            )));
        }
    }

    Ok(())
}

/// Get the current unix timestamp in seconds.
pub fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
