//! The durable group header and its binary codec.
//!
//! A header frame is the unit of commit: it captures the partition-role
//! state, per-partition sequences, replica bookkeeping, any pending
//! transition, and the file offsets of the tree snapshots it belongs
//! with. The decoder re-checks the structural invariants so a torn or
//! hand-edited file cannot smuggle an illegal state back in.

use bytes::{Buf, BufMut, BytesMut};

use crate::bitmask::Bitmask;
use crate::error::{Error, Result};
use crate::roles::{RoleSet, SeqMap};
use crate::{PartitionId, Signature};

/// Location of one tree snapshot inside the index file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockPtr {
    pub offset: u64,
    pub len: u32,
}

/// A role change that could not be applied yet because some of its
/// partitions are still draining from cleanup. Lists are sorted and
/// pairwise disjoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct PendingTransition {
    pub active: Vec<PartitionId>,
    pub passive: Vec<PartitionId>,
    pub cleanup: Vec<PartitionId>,
}

impl PendingTransition {
    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.passive.is_empty() && self.cleanup.is_empty()
    }

    /// Bitmask of the partitions a waiter could be blocked on (active and
    /// passive sides only).
    pub fn blocking_mask(&self) -> Bitmask {
        let mut mask = Bitmask::from_partitions(&self.active);
        for &p in &self.passive {
            mask.set(p);
        }
        mask
    }
}

/// Per-view slice of the header: tree root plus that view's own copies of
/// the sequence maps.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ViewState {
    pub root: Option<BlockPtr>,
    pub seqs: SeqMap,
    pub purge_seqs: SeqMap,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct GroupHeader {
    /// Defined on first `define_view`; until then the group refuses all
    /// work.
    pub num_partitions: Option<u32>,
    pub roles: RoleSet,
    pub has_replica: bool,
    /// Partitions adopted from the replica that are still catching up.
    /// Sorted; main groups only.
    pub replicas_on_transfer: Vec<PartitionId>,
    pub pending_transition: Option<PendingTransition>,
    pub id_tree_root: Option<BlockPtr>,
    pub view_states: Vec<ViewState>,
}

impl GroupHeader {
    pub fn is_defined(&self) -> bool {
        self.num_partitions.is_some()
    }

    pub fn transfer_mask(&self) -> Bitmask {
        Bitmask::from_partitions(&self.replicas_on_transfer)
    }

    /// Structural invariants that must hold for every committed header.
    pub fn validate(&self) -> Result<()> {
        let r = &self.roles;
        if r.abitmask.intersects(&r.pbitmask)
            || r.abitmask.intersects(&r.cbitmask)
            || r.pbitmask.intersects(&r.cbitmask)
        {
            return Err(Error::CorruptHeader("role bitmasks intersect".into()));
        }
        let owned = r.owned();
        let seq_keys: Vec<PartitionId> = r.seqs.keys().copied().collect();
        let purge_keys: Vec<PartitionId> = r.purge_seqs.keys().copied().collect();
        if seq_keys != owned.to_partitions() || purge_keys != seq_keys {
            return Err(Error::CorruptHeader(
                "sequence maps do not cover active ∪ passive".into(),
            ));
        }
        for &p in &self.replicas_on_transfer {
            if !owned.contains(p) {
                return Err(Error::CorruptHeader(format!(
                    "transfer partition {p} is not owned"
                )));
            }
        }
        if let Some(pending) = &self.pending_transition {
            crate::roles::validate_disjoint(&pending.active, &pending.passive, &pending.cleanup)
                .map_err(|_| Error::CorruptHeader("pending transition lists intersect".into()))?;
        }
        if let Some(n) = self.num_partitions {
            for p in r
                .abitmask
                .iter()
                .chain(r.pbitmask.iter())
                .chain(r.cbitmask.iter())
            {
                if u32::from(p) >= n {
                    return Err(Error::CorruptHeader(format!(
                        "partition {p} out of range ({n} partitions)"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Serialize as the payload of a header frame: `(signature, header)`.
    pub fn encode(&self, signature: &Signature) -> BytesMut {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(signature.as_bytes());
        put_opt_u32(&mut buf, self.num_partitions);
        put_mask(&mut buf, &self.roles.abitmask);
        put_mask(&mut buf, &self.roles.pbitmask);
        put_mask(&mut buf, &self.roles.cbitmask);
        put_seq_map(&mut buf, &self.roles.seqs);
        put_seq_map(&mut buf, &self.roles.purge_seqs);
        buf.put_u8(u8::from(self.has_replica));
        put_partition_list(&mut buf, &self.replicas_on_transfer);
        match &self.pending_transition {
            None => buf.put_u8(0),
            Some(t) => {
                buf.put_u8(1);
                put_partition_list(&mut buf, &t.active);
                put_partition_list(&mut buf, &t.passive);
                put_partition_list(&mut buf, &t.cleanup);
            }
        }
        put_opt_ptr(&mut buf, self.id_tree_root);
        buf.put_u32_le(self.view_states.len() as u32);
        for view in &self.view_states {
            put_opt_ptr(&mut buf, view.root);
            put_seq_map(&mut buf, &view.seqs);
            put_seq_map(&mut buf, &view.purge_seqs);
        }
        buf
    }

    pub fn decode(mut buf: &[u8]) -> Result<(Signature, GroupHeader)> {
        let mut sig = [0u8; 16];
        take(&mut buf, 16)?.copy_to_slice(&mut sig);
        let num_partitions = get_opt_u32(&mut buf)?;
        let abitmask = get_mask(&mut buf)?;
        let pbitmask = get_mask(&mut buf)?;
        let cbitmask = get_mask(&mut buf)?;
        let seqs = get_seq_map(&mut buf)?;
        let purge_seqs = get_seq_map(&mut buf)?;
        let has_replica = take(&mut buf, 1)?.get_u8() != 0;
        let replicas_on_transfer = get_partition_list(&mut buf)?;
        let pending_transition = match take(&mut buf, 1)?.get_u8() {
            0 => None,
            1 => Some(PendingTransition {
                active: get_partition_list(&mut buf)?,
                passive: get_partition_list(&mut buf)?,
                cleanup: get_partition_list(&mut buf)?,
            }),
            tag => {
                return Err(Error::CorruptHeader(format!(
                    "bad pending-transition tag {tag}"
                )))
            }
        };
        let id_tree_root = get_opt_ptr(&mut buf)?;
        let view_count = take(&mut buf, 4)?.get_u32_le() as usize;
        if view_count > 4_096 {
            return Err(Error::CorruptHeader(format!(
                "implausible view count {view_count}"
            )));
        }
        let mut view_states = Vec::with_capacity(view_count);
        for _ in 0..view_count {
            view_states.push(ViewState {
                root: get_opt_ptr(&mut buf)?,
                seqs: get_seq_map(&mut buf)?,
                purge_seqs: get_seq_map(&mut buf)?,
            });
        }
        if !buf.is_empty() {
            return Err(Error::CorruptHeader("trailing bytes".into()));
        }
        let header = GroupHeader {
            num_partitions,
            roles: RoleSet {
                abitmask,
                pbitmask,
                cbitmask,
                seqs,
                purge_seqs,
            },
            has_replica,
            replicas_on_transfer,
            pending_transition,
            id_tree_root,
            view_states,
        };
        header.validate()?;
        Ok((Signature::new(sig), header))
    }
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if buf.len() < n {
        return Err(Error::CorruptHeader("short header".into()));
    }
    let (head, rest) = buf.split_at(n);
    *buf = rest;
    Ok(head)
}

fn put_opt_u32(buf: &mut BytesMut, value: Option<u32>) {
    match value {
        None => buf.put_u8(0),
        Some(v) => {
            buf.put_u8(1);
            buf.put_u32_le(v);
        }
    }
}

fn get_opt_u32(buf: &mut &[u8]) -> Result<Option<u32>> {
    match take(buf, 1)?.get_u8() {
        0 => Ok(None),
        1 => Ok(Some(take(buf, 4)?.get_u32_le())),
        tag => Err(Error::CorruptHeader(format!("bad option tag {tag}"))),
    }
}

fn put_opt_ptr(buf: &mut BytesMut, ptr: Option<BlockPtr>) {
    match ptr {
        None => buf.put_u8(0),
        Some(p) => {
            buf.put_u8(1);
            buf.put_u64_le(p.offset);
            buf.put_u32_le(p.len);
        }
    }
}

fn get_opt_ptr(buf: &mut &[u8]) -> Result<Option<BlockPtr>> {
    match take(buf, 1)?.get_u8() {
        0 => Ok(None),
        1 => {
            let offset = take(buf, 8)?.get_u64_le();
            let len = take(buf, 4)?.get_u32_le();
            Ok(Some(BlockPtr { offset, len }))
        }
        tag => Err(Error::CorruptHeader(format!("bad pointer tag {tag}"))),
    }
}

fn put_mask(buf: &mut BytesMut, mask: &Bitmask) {
    let bytes = mask.to_le_bytes();
    buf.put_u32_le(bytes.len() as u32);
    buf.put_slice(&bytes);
}

fn get_mask(buf: &mut &[u8]) -> Result<Bitmask> {
    let len = take(buf, 4)?.get_u32_le() as usize;
    Ok(Bitmask::from_le_bytes(take(buf, len)?))
}

fn put_seq_map(buf: &mut BytesMut, map: &SeqMap) {
    buf.put_u32_le(map.len() as u32);
    for (&p, &seq) in map {
        buf.put_u16_le(p);
        buf.put_u64_le(seq);
    }
}

fn get_seq_map(buf: &mut &[u8]) -> Result<SeqMap> {
    let count = take(buf, 4)?.get_u32_le() as usize;
    let mut map = SeqMap::new();
    let mut last: Option<PartitionId> = None;
    for _ in 0..count {
        let p = take(buf, 2)?.get_u16_le();
        let seq = take(buf, 8)?.get_u64_le();
        if last.is_some_and(|prev| prev >= p) {
            return Err(Error::CorruptHeader("sequence map not ascending".into()));
        }
        last = Some(p);
        map.insert(p, seq);
    }
    Ok(map)
}

fn put_partition_list(buf: &mut BytesMut, parts: &[PartitionId]) {
    buf.put_u32_le(parts.len() as u32);
    for &p in parts {
        buf.put_u16_le(p);
    }
}

fn get_partition_list(buf: &mut &[u8]) -> Result<Vec<PartitionId>> {
    let count = take(buf, 4)?.get_u32_le() as usize;
    let mut parts = Vec::with_capacity(count.min(1_024));
    for _ in 0..count {
        parts.push(take(buf, 2)?.get_u16_le());
    }
    if !parts.windows(2).all(|w| w[0] < w[1]) {
        return Err(Error::CorruptHeader("partition list not ascending".into()));
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> GroupHeader {
        let mut roles = RoleSet::default();
        roles.promote_active(&[0, 1, 2, 3]);
        roles.promote_passive(&[4, 5]);
        roles.seqs.insert(2, 77);
        roles.mark_cleanup(&[6]);
        GroupHeader {
            num_partitions: Some(8),
            roles,
            has_replica: true,
            replicas_on_transfer: vec![4],
            pending_transition: Some(PendingTransition {
                active: vec![6],
                passive: vec![],
                cleanup: vec![5],
            }),
            id_tree_root: Some(BlockPtr { offset: 9, len: 120 }),
            view_states: vec![ViewState {
                root: Some(BlockPtr {
                    offset: 138,
                    len: 64,
                }),
                seqs: SeqMap::from([(0, 1)]),
                purge_seqs: SeqMap::from([(0, 0)]),
            }],
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let header = sample_header();
        header.validate().unwrap();
        let sig = Signature::from_seed(b"round-trip");
        let bytes = header.encode(&sig);
        let (got_sig, got) = GroupHeader::decode(&bytes).unwrap();
        assert_eq!(got_sig, sig);
        assert_eq!(got, header);
    }

    #[test]
    fn empty_header_round_trip() {
        let header = GroupHeader::default();
        let sig = Signature::from_seed(b"empty");
        let (got_sig, got) = GroupHeader::decode(&header.encode(&sig)).unwrap();
        assert_eq!(got_sig, sig);
        assert_eq!(got, header);
        assert!(!got.is_defined());
    }

    #[test]
    fn decode_rejects_intersecting_masks() {
        let mut header = sample_header();
        header.roles.pbitmask.set(0);
        let bytes = header.encode(&Signature::from_seed(b"bad"));
        assert!(matches!(
            GroupHeader::decode(&bytes),
            Err(Error::CorruptHeader(_))
        ));
    }

    #[test]
    fn decode_rejects_seq_map_mismatch() {
        let mut header = sample_header();
        header.roles.seqs.remove(&0);
        let bytes = header.encode(&Signature::from_seed(b"bad"));
        assert!(matches!(
            GroupHeader::decode(&bytes),
            Err(Error::CorruptHeader(_))
        ));
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let header = sample_header();
        let bytes = header.encode(&Signature::from_seed(b"short"));
        for cut in [0, 5, 16, bytes.len() - 1] {
            assert!(GroupHeader::decode(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn decode_rejects_unowned_transfer_partition() {
        let mut header = sample_header();
        header.replicas_on_transfer = vec![6];
        let bytes = header.encode(&Signature::from_seed(b"rot"));
        assert!(matches!(
            GroupHeader::decode(&bytes),
            Err(Error::CorruptHeader(_))
        ));
    }
}
