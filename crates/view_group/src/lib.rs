//! Control plane for one group of partitioned secondary view indexes.
//!
//! A view group owns a single on-disk index file built from the documents of
//! a configurable set of partitions and coordinates every long-running
//! activity on that file: incremental updates, background key purging,
//! on-line compaction, and an optional mirror (replica) group used to speed
//! up partition hand-off between nodes.
//!
//! The controller is a single-task actor: one mailbox carries both client
//! requests and worker progress events, so all group mutation is totally
//! ordered. Workers (updater, cleaner, compactor) run as separate tokio
//! tasks and talk back only through that mailbox.

pub mod bitmask;
pub mod cleaner;
pub mod compactor;
pub mod config;
pub mod controller;
pub mod dbset;
pub mod error;
pub mod file;
pub mod group;
pub mod header;
pub mod message;
pub mod roles;
pub mod stats;
pub mod tree;
pub mod updater;
pub mod waiters;

use serde::{Serialize, Serializer};

pub use bitmask::Bitmask;
pub use config::GroupConfig;
pub use controller::{open_group, GroupHandle};
pub use dbset::{DbSet, DocChange, MemDbSet};
pub use error::{Error, Result};
pub use group::{GroupInfo, GroupSnapshot, GroupType, IdentityMapper, ViewMapper};
pub use header::{GroupHeader, PendingTransition};
pub use message::{DeletedOutcome, Stale};
pub use roles::SeqMap;

/// Index of one partition (logical shard) within the set.
pub type PartitionId = u16;

/// Content hash of the group's compiled view definitions. A group whose
/// backing design document no longer hashes to this signature is stale.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(pub [u8; 16]);

impl Signature {
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Derive a signature from arbitrary seed bytes (FNV-1a folded twice).
    /// Real deployments hash the compiled map/reduce sources; tests hash a
    /// name.
    pub fn from_seed(seed: &[u8]) -> Self {
        let mut out = [0u8; 16];
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for &b in seed {
            h ^= u64::from(b);
            h = h.wrapping_mul(0x0000_0100_0000_01b3);
        }
        out[..8].copy_from_slice(&h.to_le_bytes());
        let mut h2: u64 = h ^ 0x9e37_79b9_7f4a_7c15;
        for &b in seed.iter().rev() {
            h2 ^= u64::from(b);
            h2 = h2.wrapping_mul(0x0000_0100_0000_01b3);
        }
        out[8..].copy_from_slice(&h2.to_le_bytes());
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(32);
        for b in self.0 {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}
