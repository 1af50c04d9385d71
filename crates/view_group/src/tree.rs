//! The slice of the tree engine this controller depends on.
//!
//! The real index keeps one B-tree per view plus an id tree; here we
//! contract only what the control plane needs: ordered per-partition key
//! storage, a partition-predicate guided purge that can be cancelled
//! between chunks, the reduce-side partition bitmap, and snapshot
//! encoding into an index-file block.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::bitmask::Bitmask;
use crate::error::{Error, Result};
use crate::PartitionId;

/// Outcome of one guided purge run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PurgeOutcome {
    pub removed: u64,
    /// False when the purge stopped early on a cancellation.
    pub completed: bool,
}

/// Ordered key/value storage partition-prefixed so all of one partition's
/// entries are contiguous.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeyTree {
    entries: BTreeMap<(PartitionId, Bytes), Bytes>,
}

impl KeyTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, partition: PartitionId, key: Bytes, value: Bytes) {
        self.entries.insert((partition, key), value);
    }

    pub fn remove(&mut self, partition: PartitionId, key: &Bytes) -> Option<Bytes> {
        self.entries.remove(&(partition, key.clone()))
    }

    pub fn get(&self, partition: PartitionId, key: &Bytes) -> Option<&Bytes> {
        self.entries.get(&(partition, key.clone()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PartitionId, &Bytes, &Bytes)> {
        self.entries.iter().map(|((p, k), v)| (*p, k, v))
    }

    pub fn partition_entries(
        &self,
        partition: PartitionId,
    ) -> impl Iterator<Item = (&Bytes, &Bytes)> {
        self.entries
            .range((partition, Bytes::new())..)
            .take_while(move |((p, _), _)| *p == partition)
            .map(|((_, k), v)| (k, v))
    }

    /// Sum of key and value lengths; the data-size figure reported in
    /// group info.
    pub fn data_size(&self) -> u64 {
        self.entries
            .iter()
            .map(|((_, k), v)| (k.len() + v.len() + 2) as u64)
            .sum()
    }

    /// Reduce over the tree: which partitions still have entries.
    pub fn partitions_present(&self) -> Bitmask {
        let mut mask = Bitmask::new();
        let mut cursor: Option<PartitionId> = None;
        for ((p, _), _) in self.entries.iter() {
            if cursor != Some(*p) {
                mask.set(*p);
                cursor = Some(*p);
            }
        }
        mask
    }

    /// Remove every entry whose partition is in `purge_mask`, visiting the
    /// tree in bounded chunks and honouring `cancel` between chunks.
    pub fn guided_purge(
        &mut self,
        purge_mask: &Bitmask,
        chunk_bytes: usize,
        cancel: &AtomicBool,
    ) -> PurgeOutcome {
        let mut removed = 0u64;
        loop {
            if cancel.load(Ordering::Acquire) {
                return PurgeOutcome {
                    removed,
                    completed: false,
                };
            }
            let mut chunk = Vec::new();
            let mut chunk_size = 0usize;
            for ((p, k), v) in self.entries.iter() {
                if !purge_mask.contains(*p) {
                    continue;
                }
                chunk.push((*p, k.clone()));
                chunk_size += k.len() + v.len();
                if chunk_size >= chunk_bytes {
                    break;
                }
            }
            if chunk.is_empty() {
                return PurgeOutcome {
                    removed,
                    completed: true,
                };
            }
            for key in chunk {
                self.entries.remove(&key);
                removed += 1;
            }
        }
    }

    /// Snapshot encoding, stored as one index-file block.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(16 + self.entries.len() * 16);
        buf.put_u64_le(self.entries.len() as u64);
        for ((p, k), v) in self.entries.iter() {
            buf.put_u16_le(*p);
            buf.put_u32_le(k.len() as u32);
            buf.put_slice(k);
            buf.put_u32_le(v.len() as u32);
            buf.put_slice(v);
        }
        buf.to_vec()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
            if buf.len() < n {
                return Err(Error::CorruptHeader("short tree block".into()));
            }
            let (head, rest) = buf.split_at(n);
            *buf = rest;
            Ok(head)
        }
        let count = take(&mut buf, 8)?.get_u64_le();
        let mut tree = KeyTree::new();
        for _ in 0..count {
            let p = take(&mut buf, 2)?.get_u16_le();
            let klen = take(&mut buf, 4)?.get_u32_le() as usize;
            let key = Bytes::copy_from_slice(take(&mut buf, klen)?);
            let vlen = take(&mut buf, 4)?.get_u32_le() as usize;
            let value = Bytes::copy_from_slice(take(&mut buf, vlen)?);
            tree.entries.insert((p, key), value);
        }
        if !buf.is_empty() {
            return Err(Error::CorruptHeader("trailing tree bytes".into()));
        }
        Ok(tree)
    }
}
