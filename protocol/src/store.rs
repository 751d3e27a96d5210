//! State store
//!
//! Persists the mesh state and the derived DNS projection. Both files
//! are written to a temporary path in the same directory and renamed
//! into place, so a crash mid-write never leaves a truncated file.
//!
//! Staleness is the mesh's only eviction mechanism: a host whose
//! version has not been observed to advance within the liveness window
//! disappears from the DNS projection, and after the longer grace
//! window it is removed from the persisted state on the next save.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::MeshError;
use crate::model::{validate_label, DnsEntry, DnsProjection, Host, MeshState};

/// Default liveness window: hosts quieter than this are hidden from DNS.
pub const DEFAULT_LIVENESS_WINDOW_SECS: u64 = 300;

/// Default grace window: hosts quieter than this are pruned from state.
pub const DEFAULT_GRACE_WINDOW_SECS: u64 = 3600;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub state_file: PathBuf,
    pub dns_file: PathBuf,
    pub liveness_window_secs: u64,
    pub grace_window_secs: u64,
}

impl StoreConfig {
    pub fn new(state_file: PathBuf, dns_file: PathBuf) -> Self {
        Self {
            state_file,
            dns_file,
            liveness_window_secs: DEFAULT_LIVENESS_WINDOW_SECS,
            grace_window_secs: DEFAULT_GRACE_WINDOW_SECS,
        }
    }
}

pub struct Store {
    config: StoreConfig,
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Load the persisted mesh state.
    ///
    /// Returns `Ok(None)` when no state file exists yet. An existing
    /// file that cannot be read or parsed is an error: the caller must
    /// treat that as fatal at startup rather than silently running
    /// with an empty identity.
    pub async fn load(&self) -> Result<Option<MeshState>, MeshError> {
        let path = &self.config.state_file;
        let data = match fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(MeshError::CorruptState {
                    path: path.clone(),
                    reason: e.to_string(),
                })
            }
        };

        let state = serde_json::from_slice(&data).map_err(|e| MeshError::CorruptState {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Ok(Some(state))
    }

    /// Persist the mesh state atomically.
    pub async fn save(&self, state: &MeshState) -> Result<(), MeshError> {
        let data = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.config.state_file, &data).await?;
        debug!(
            path = %self.config.state_file.display(),
            hosts = state.host_count(),
            "persisted mesh state"
        );
        Ok(())
    }

    /// Derive the DNS projection from a mesh state.
    ///
    /// Covers every non-stale host across all networks. Within one
    /// network a label claimed by several hosts goes to the claimant
    /// with the highest record version, tie-broken by the smaller
    /// public key; losing claims are simply not emitted. Labels that
    /// fail validation are skipped with a warning.
    pub fn derive_dns(&self, state: &MeshState, now: u64) -> DnsProjection {
        let mut entries = Vec::new();

        for network in state.networks.values() {
            // label -> winning host for that label
            let mut owners: BTreeMap<&str, &Host> = BTreeMap::new();

            for host in network.hosts.values() {
                if is_stale(host, now, self.config.liveness_window_secs) {
                    continue;
                }
                for label in host.hostnames.keys() {
                    if let Err(e) = validate_label(label) {
                        warn!(%label, error = %e, "skipping invalid hostname claim");
                        continue;
                    }
                    match owners.get(label.as_str()) {
                        Some(current) if !claim_beats(host, current) => {}
                        _ => {
                            owners.insert(label.as_str(), host);
                        }
                    }
                }
            }

            for (label, host) in owners {
                entries.push(DnsEntry {
                    hostname: format!("{}.{}", label, network.tld),
                    ip: host.ip,
                });
            }
        }

        DnsProjection { entries }
    }

    /// Write the DNS projection as JSON lines, atomically.
    pub async fn write_dns(&self, projection: &DnsProjection) -> Result<(), MeshError> {
        let mut data = Vec::new();
        for entry in &projection.entries {
            serde_json::to_writer(&mut data, entry)?;
            data.push(b'\n');
        }
        write_atomic(&self.config.dns_file, &data).await?;
        Ok(())
    }

    /// Remove hosts unseen for longer than the grace window.
    ///
    /// The local host is exempt: a node never evicts its own identity.
    /// Networks left empty are dropped. Returns whether anything was
    /// removed.
    pub fn prune(&self, state: &mut MeshState, now: u64, local_key: &str) -> bool {
        let grace = self.config.grace_window_secs;
        let mut changed = false;

        state.networks.retain(|_, network| {
            let before = network.hosts.len();
            network
                .hosts
                .retain(|key, host| key == local_key || !is_stale(host, now, grace));
            changed |= network.hosts.len() != before;
            !network.hosts.is_empty()
        });

        changed
    }
}

/// Does `challenger`'s hostname claim beat `incumbent`'s?
///
/// Highest owning-record version wins; on a tie the lexicographically
/// smaller public key does.
fn claim_beats(challenger: &Host, incumbent: &Host) -> bool {
    match challenger.version.cmp(&incumbent.version) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => challenger.public_key < incumbent.public_key,
    }
}

fn is_stale(host: &Host, now: u64, window_secs: u64) -> bool {
    now.saturating_sub(host.last_seen) > window_secs
}

/// Write `data` to a sibling temporary file, then rename into place.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), MeshError> {
    let mut tmp_name: OsString = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    fs::write(&tmp, data).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
