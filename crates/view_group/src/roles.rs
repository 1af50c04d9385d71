//! Partition-role algebra.
//!
//! Pure transitions over the three role bitmasks and the per-partition
//! sequence maps. Partitions move between {active, passive, cleanup,
//! absent}; the sequence maps always cover exactly the active and passive
//! partitions. No I/O here; callers validate, apply, then persist.

use std::collections::BTreeMap;

use crate::bitmask::Bitmask;
use crate::error::{Error, Result};
use crate::PartitionId;

/// Last-indexed sequence per partition, keyed ascending.
pub type SeqMap = BTreeMap<PartitionId, u64>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoleSet {
    pub abitmask: Bitmask,
    pub pbitmask: Bitmask,
    pub cbitmask: Bitmask,
    pub seqs: SeqMap,
    pub purge_seqs: SeqMap,
}

impl RoleSet {
    /// Move each partition into the active role. Passive partitions keep
    /// their sequences; absent partitions start from zero.
    pub fn promote_active(&mut self, parts: &[PartitionId]) {
        for &p in parts {
            if self.abitmask.contains(p) {
                continue;
            }
            if self.pbitmask.contains(p) {
                self.pbitmask.clear(p);
            } else {
                self.cbitmask.clear(p);
                self.seqs.insert(p, 0);
                self.purge_seqs.insert(p, 0);
            }
            self.abitmask.set(p);
        }
    }

    /// Move each partition into the passive role, preserving sequences
    /// when it was active.
    pub fn promote_passive(&mut self, parts: &[PartitionId]) {
        for &p in parts {
            if self.pbitmask.contains(p) {
                continue;
            }
            if self.abitmask.contains(p) {
                self.abitmask.clear(p);
            } else {
                self.cbitmask.clear(p);
                self.seqs.insert(p, 0);
                self.purge_seqs.insert(p, 0);
            }
            self.pbitmask.set(p);
        }
    }

    /// Mark each partition for cleanup: it is no longer indexed, so its
    /// sequence entries go away.
    pub fn mark_cleanup(&mut self, parts: &[PartitionId]) {
        for &p in parts {
            if self.cbitmask.contains(p) {
                continue;
            }
            self.abitmask.clear(p);
            self.pbitmask.clear(p);
            self.cbitmask.set(p);
            self.seqs.remove(&p);
            self.purge_seqs.remove(&p);
        }
    }

    /// Partitions currently indexed (active or passive).
    pub fn owned(&self) -> Bitmask {
        self.abitmask.union(&self.pbitmask)
    }
}

/// Reject a request whose role lists mention the same partition twice.
pub fn validate_disjoint(
    active: &[PartitionId],
    passive: &[PartitionId],
    cleanup: &[PartitionId],
) -> Result<()> {
    let a = Bitmask::from_partitions(active);
    let p = Bitmask::from_partitions(passive);
    let c = Bitmask::from_partitions(cleanup);
    if a.intersects(&p) || a.intersects(&c) || p.intersects(&c) {
        return Err(Error::IntersectingLists);
    }
    Ok(())
}

/// Every mentioned partition id must fall below the configured count.
pub fn validate_bounds(num_partitions: u32, lists: &[&[PartitionId]]) -> Result<()> {
    for list in lists {
        for &p in *list {
            if u32::from(p) >= num_partitions {
                return Err(Error::InvalidPartitionList);
            }
        }
    }
    Ok(())
}
