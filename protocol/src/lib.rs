//! meshdns protocol library
//!
//! A decentralized, eventually-consistent registry of network
//! membership: which hosts exist, where they are reachable, and which
//! hostnames they claim. Peers exchange full state snapshots over
//! HTTP gossip; records are self-signed so authenticity never depends
//! on the transport; a join-based merge guarantees convergence under
//! partial, reordered, and repeated delivery.
//!
//! # Modules
//!
//! - `model` - Host/Hostname/Network/MeshState entities and the DNS projection
//! - `crypto` - record signing and verification
//! - `identity` - signing-key file handling
//! - `merge` - the join (least-upper-bound) merge engine
//! - `store` - atomic persistence, DNS derivation, staleness pruning
//! - `node` - shared mesh node with the single-writer merge path
//! - `gossip` - periodic anti-entropy rounds against known peers
//! - `peers` - bootstrap/discovered peer tracking with backoff
//! - `server` - axum endpoints serving and accepting gossip

pub mod crypto;
pub mod error;
pub mod gossip;
pub mod identity;
pub mod merge;
pub mod model;
pub mod node;
pub mod peers;
pub mod server;
pub mod store;

pub use crypto::{encode_public_key, sign_host, verify_host};
pub use error::MeshError;
pub use gossip::GossipService;
pub use merge::{merge, sanitize};
pub use model::{DnsEntry, DnsProjection, Host, Hostname, MeshState, Network};
pub use node::{AdmissionPolicy, GossipConfig, MeshNode};
pub use peers::PeerManager;
pub use store::{Store, StoreConfig};
