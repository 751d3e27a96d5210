//! Gossip service
//!
//! Drives periodic anti-entropy rounds: on every tick (or eagerly
//! after a local mutation) the service re-signs the local host record,
//! picks a handful of due peers, and runs one push/pull exchange with
//! each in its own task. An exchange POSTs the local snapshot to the
//! peer and merges whatever snapshot comes back; the merge engine's
//! algebra makes duplicated or reordered exchanges harmless.
//!
//! No failure below this loop aborts the process: unreachable peers
//! are backed off, invalid payloads are dropped, save errors are
//! logged and retried on the next cycle.

use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::MeshError;
use crate::model::MeshState;
use crate::node::MeshNode;

pub struct GossipService {
    node: Arc<MeshNode>,
    http: Client,
}

impl GossipService {
    pub fn new(node: Arc<MeshNode>) -> Result<Self, MeshError> {
        let timeout = Duration::from_secs(node.config().request_timeout_secs);
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MeshError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { node, http })
    }

    /// Run gossip rounds forever.
    pub async fn run(self) {
        let interval = Duration::from_secs(self.node.config().interval_secs);
        info!(interval_secs = interval.as_secs(), "gossip service started");

        loop {
            // Heartbeat first so the outbound snapshot carries a fresh
            // local record. A failed save is retried next cycle.
            if let Err(e) = self.node.refresh_local().await {
                warn!(error = %e, "failed to refresh local record; will retry");
            }

            self.round().await;

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.node.local_change() => {
                    debug!("local change; gossiping eagerly");
                }
            }
        }
    }

    /// One gossip round: exchange with each selected peer, all peers
    /// in parallel so a slow peer never stalls the others.
    pub async fn round(&self) {
        let peers = self.node.select_peers().await;
        if peers.is_empty() {
            debug!("no peers due for gossip");
            return;
        }

        let mut rounds = Vec::with_capacity(peers.len());
        for peer in peers {
            let node = Arc::clone(&self.node);
            let http = self.http.clone();
            rounds.push(tokio::spawn(async move {
                match exchange(&node, &http, &peer).await {
                    Ok(remote) => {
                        node.record_peer_success(&peer).await;
                        // A save failure here is ours, not the peer's;
                        // the merge is retried against the next reply.
                        match node.apply_remote(remote).await {
                            Ok(true) => debug!(%peer, "gossip round merged new state"),
                            Ok(false) => {}
                            Err(e) => warn!(%peer, error = %e, "failed to apply snapshot"),
                        }
                    }
                    Err(e) => {
                        node.record_peer_failure(&peer).await;
                        warn!(%peer, error = %e, "gossip round failed");
                    }
                }
            }));
        }

        for round in rounds {
            // A panicked round task is a bug, but must not take the
            // whole service down with it.
            if let Err(e) = round.await {
                warn!(error = %e, "gossip round task aborted");
            }
        }
    }
}

/// Push our snapshot to one peer and return the snapshot it replies
/// with.
///
/// The timeout on the HTTP client bounds the whole request; a round
/// that times out merges nothing.
async fn exchange(node: &MeshNode, http: &Client, peer_url: &str) -> Result<MeshState, MeshError> {
    let snapshot = node.snapshot().await;

    let response = http
        .post(format!("{peer_url}/api/gossip"))
        .json(&snapshot)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                MeshError::RoundTimeout(peer_url.to_string())
            } else {
                MeshError::PeerUnreachable {
                    url: peer_url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(MeshError::PeerStatus {
            url: peer_url.to_string(),
            status: status.as_u16(),
        });
    }

    response
        .json()
        .await
        .map_err(|e| MeshError::PeerUnreachable {
            url: peer_url.to_string(),
            reason: format!("invalid snapshot payload: {e}"),
        })
}
