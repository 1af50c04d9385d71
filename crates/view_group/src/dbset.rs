//! Gateway to the database set that feeds this group.
//!
//! The controller and updater only ever see this trait: per-partition
//! change feeds, sequence probes, and partition removal. Production wires
//! a real partitioned store here; the in-memory implementation below
//! backs the test suite.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::roles::SeqMap;
use crate::PartitionId;

/// One document change from a partition's feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocChange {
    pub partition: PartitionId,
    pub seq: u64,
    pub id: Bytes,
    pub deleted: bool,
    pub body: Bytes,
}

#[async_trait]
pub trait DbSet: Send + Sync + 'static {
    /// Latest sequence of one partition.
    async fn partition_seq(&self, partition: PartitionId) -> Result<u64>;

    /// Changes after `since`, at most `limit`, in sequence order.
    async fn changes_since(
        &self,
        partition: PartitionId,
        since: u64,
        limit: usize,
    ) -> Result<Vec<DocChange>>;

    /// How many changes the given partitions have beyond the given
    /// sequences; drives the auto-update threshold.
    async fn pending_changes(&self, partitions: &[PartitionId], seqs: &SeqMap) -> Result<u64>;

    /// Drop partitions from the reader once they enter cleanup.
    async fn remove_partitions(&self, partitions: &[PartitionId]) -> Result<()>;

    /// Observed when the database set shuts down; the payload is the
    /// terminal reason.
    fn closed(&self) -> watch::Receiver<Option<String>>;

    async fn close(&self);
}

#[derive(Default)]
struct PartitionFeed {
    changes: Vec<DocChange>,
    seq: u64,
}

/// In-memory database set for tests and examples.
pub struct MemDbSet {
    partitions: RwLock<HashMap<PartitionId, PartitionFeed>>,
    fail_changes: RwLock<Option<String>>,
    closed_tx: watch::Sender<Option<String>>,
    closed_rx: watch::Receiver<Option<String>>,
}

impl Default for MemDbSet {
    fn default() -> Self {
        Self::new()
    }
}

impl MemDbSet {
    pub fn new() -> Self {
        let (closed_tx, closed_rx) = watch::channel(None);
        Self {
            partitions: RwLock::new(HashMap::new()),
            fail_changes: RwLock::new(None),
            closed_tx,
            closed_rx,
        }
    }

    /// Append a document update to a partition's feed; returns its
    /// sequence.
    pub fn push(&self, partition: PartitionId, id: &str, body: &str) -> u64 {
        self.push_change(partition, id, false, body)
    }

    pub fn push_delete(&self, partition: PartitionId, id: &str) -> u64 {
        self.push_change(partition, id, true, "")
    }

    fn push_change(&self, partition: PartitionId, id: &str, deleted: bool, body: &str) -> u64 {
        let mut parts = self.partitions.write().expect("dbset lock");
        let feed = parts.entry(partition).or_default();
        feed.seq += 1;
        feed.changes.push(DocChange {
            partition,
            seq: feed.seq,
            id: Bytes::copy_from_slice(id.as_bytes()),
            deleted,
            body: Bytes::copy_from_slice(body.as_bytes()),
        });
        feed.seq
    }

    /// Make every subsequent `changes_since` fail; exercises the
    /// updater-error path.
    pub fn fail_changes_with(&self, reason: &str) {
        *self.fail_changes.write().expect("dbset lock") = Some(reason.to_string());
    }

    pub fn clear_failure(&self) {
        *self.fail_changes.write().expect("dbset lock") = None;
    }

    /// Simulate the database set dying with a reason.
    pub fn close_with(&self, reason: &str) {
        let _ = self.closed_tx.send(Some(reason.to_string()));
    }
}

#[async_trait]
impl DbSet for MemDbSet {
    async fn partition_seq(&self, partition: PartitionId) -> Result<u64> {
        let parts = self.partitions.read().expect("dbset lock");
        Ok(parts.get(&partition).map(|f| f.seq).unwrap_or(0))
    }

    async fn changes_since(
        &self,
        partition: PartitionId,
        since: u64,
        limit: usize,
    ) -> Result<Vec<DocChange>> {
        if let Some(reason) = self.fail_changes.read().expect("dbset lock").clone() {
            return Err(Error::Io(reason));
        }
        let parts = self.partitions.read().expect("dbset lock");
        let Some(feed) = parts.get(&partition) else {
            return Ok(Vec::new());
        };
        Ok(feed
            .changes
            .iter()
            .filter(|c| c.seq > since)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn pending_changes(&self, partitions: &[PartitionId], seqs: &SeqMap) -> Result<u64> {
        let parts = self.partitions.read().expect("dbset lock");
        let mut pending = 0u64;
        for p in partitions {
            let latest = parts.get(p).map(|f| f.seq).unwrap_or(0);
            let indexed = seqs.get(p).copied().unwrap_or(0);
            pending += latest.saturating_sub(indexed);
        }
        Ok(pending)
    }

    async fn remove_partitions(&self, partitions: &[PartitionId]) -> Result<()> {
        let mut parts = self.partitions.write().expect("dbset lock");
        for p in partitions {
            parts.remove(p);
        }
        Ok(())
    }

    fn closed(&self) -> watch::Receiver<Option<String>> {
        self.closed_rx.clone()
    }

    async fn close(&self) {}
}
