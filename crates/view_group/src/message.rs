//! Controller mailbox types.
//!
//! One channel carries everything the controller reacts to: client
//! requests (each with a oneshot reply) and progress events from the
//! background workers. Worker terminal results travel back through the
//! worker's join handle, which the controller polls alongside the
//! mailbox; progress events are tagged with the worker generation so a
//! restart can't confuse a stale event with the live worker.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::group::{GroupInfo, GroupSnapshot};
use crate::header::GroupHeader;
use crate::tree::KeyTree;
use crate::{PartitionId, Signature};

/// Freshness requirement of a `request_group` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stale {
    /// Wait until the index covers every active partition.
    False,
    /// Reply from the current snapshot.
    Ok,
    /// Reply from the current snapshot, then kick the updater.
    UpdateAfter,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletedOutcome {
    /// The partition (or master database) was owned; the group is going
    /// down.
    Shutdown,
    Ignore,
}

#[derive(Clone, Debug)]
pub struct DefineSpec {
    pub num_partitions: u32,
    pub active: Vec<PartitionId>,
    pub passive: Vec<PartitionId>,
    pub use_replica: bool,
}

pub enum GroupRequest {
    Define {
        spec: DefineSpec,
        reply: oneshot::Sender<Result<()>>,
    },
    IsDefined {
        reply: oneshot::Sender<bool>,
    },
    SetState {
        active: Vec<PartitionId>,
        passive: Vec<PartitionId>,
        cleanup: Vec<PartitionId>,
        reply: oneshot::Sender<Result<()>>,
    },
    AddReplicas {
        partitions: Vec<PartitionId>,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoveReplicas {
        partitions: Vec<PartitionId>,
        reply: oneshot::Sender<Result<()>>,
    },
    RequestGroup {
        wanted: Vec<PartitionId>,
        stale: Stale,
        reply: oneshot::Sender<Result<GroupSnapshot>>,
    },
    Info {
        reply: oneshot::Sender<Result<GroupInfo>>,
    },
    DataSize {
        reply: oneshot::Sender<Result<u64>>,
    },
    PartitionDeleted {
        /// `None` means the master database of the set.
        partition: Option<PartitionId>,
        reply: oneshot::Sender<DeletedOutcome>,
    },
    StartCompact {
        reply: oneshot::Sender<Result<()>>,
    },
    CancelCompact {
        reply: oneshot::Sender<Result<()>>,
    },
    TriggerCleanup {
        reply: oneshot::Sender<Result<()>>,
    },
    DdocUpdated {
        new_signature: Signature,
        reply: oneshot::Sender<()>,
    },
    ResetStats {
        reply: oneshot::Sender<()>,
    },
    /// Current role partitions `(active, passive)`; a main controller
    /// interrogates its replica with this.
    RolePartitions {
        reply: oneshot::Sender<(Vec<PartitionId>, Vec<PartitionId>)>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Updater lifecycle phases, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdaterPhase {
    Starting,
    UpdatingActive,
    /// All active partitions are caught up; freshness waiters unblock
    /// here.
    UpdatingPassive,
}

impl UpdaterPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdaterPhase::Starting => "starting",
            UpdaterPhase::UpdatingActive => "updating_active",
            UpdaterPhase::UpdatingPassive => "updating_passive",
        }
    }
}

/// One document's worth of index mutations inside a batch.
#[derive(Clone, Debug)]
pub struct DocUpdate {
    pub id: Bytes,
    pub seq: u64,
    pub deleted: bool,
    /// Rows per view; empty for deletions.
    pub view_rows: Vec<Vec<(Bytes, Bytes)>>,
}

/// A partial update from the updater: the controller applies it to the
/// live trees and advances the partition's sequence.
#[derive(Clone, Debug)]
pub struct IndexedBatch {
    pub partition: PartitionId,
    /// Sequence reached after this batch.
    pub seq: u64,
    pub docs: Vec<DocUpdate>,
}

#[derive(Clone, Debug, Default)]
pub struct UpdateResult {
    pub docs_indexed: u64,
    pub docs_deleted: u64,
    pub duration: Duration,
    pub stopped: bool,
}

/// Terminal value of an updater task, returned through its join handle.
#[derive(Debug)]
pub enum UpdaterExit {
    Finished(UpdateResult),
    Error(String),
    /// The feed went backwards; the controller must re-prepare the group
    /// from disk and restart.
    Reset,
}

/// Cleaner terminal payload: the purged trees plus progress figures.
/// Returned through the cleaner's join handle.
pub struct CleanResult {
    pub id_tree: KeyTree,
    pub views: Vec<KeyTree>,
    pub removed: u64,
    pub duration: Duration,
    /// False when the run was stopped mid-purge.
    pub completed: bool,
}

/// Compactor completion payload. The verdict channel closes the loop: the
/// controller either commits the swap, hands back a fresh snapshot to
/// retry from, or stops the compactor.
pub struct CompactDone {
    pub path: PathBuf,
    pub header: GroupHeader,
    pub duration: Duration,
    pub retries: u32,
    pub verdict: oneshot::Sender<CompactVerdict>,
}

#[derive(Debug)]
pub enum CompactVerdict {
    Commit,
    Retry(CompactSnapshot),
    Stop,
}

/// Frozen state a compaction run is built from.
#[derive(Clone)]
#[derive(Debug)]
pub struct CompactSnapshot {
    pub header: GroupHeader,
    pub id_tree: KeyTree,
    pub views: Vec<KeyTree>,
}

pub enum WorkerEvent {
    UpdaterState { gen: u64, phase: UpdaterPhase },
    UpdaterBatch { gen: u64, batch: IndexedBatch },
    CompactDone { gen: u64, done: CompactDone },
    CompactorDied { gen: u64, reason: String },
    DbSetClosed(String),
}

pub enum ControlMsg {
    Request(GroupRequest),
    Worker(WorkerEvent),
}
