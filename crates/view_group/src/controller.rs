//! The group controller.
//!
//! One tokio task owns the group exclusively and serializes every
//! mutation through its mailbox. Background workers are held in one slot
//! per role; their terminal results come back through the join handles
//! the main loop polls, so a worker finishing, dying, or being stopped is
//! observed exactly once. Clients talk to the controller through
//! [`GroupHandle`], a cheap clone wrapping the mailbox sender.
//!
//! Commit policy: role changes, cleanup results, compaction swaps and
//! transfer completions are committed with an fsync on the spot; updater
//! batches only schedule a delayed checkpoint (no fsync), which a hard
//! commit cancels.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant as TokioInstant};

use crate::bitmask::Bitmask;
use crate::cleaner::{self, CleanerContext};
use crate::compactor::{self, CompactorContext};
use crate::config::{GroupConfig, MAILBOX_DEPTH, MAX_NUM_PARTITIONS};
use crate::dbset::DbSet;
use crate::error::{Error, Result};
use crate::file::{self, FileRef, IndexFile};
use crate::group::{Group, GroupInfo, GroupSnapshot, GroupType, UpdateProgress, ViewMapper};
use crate::header::PendingTransition;
use crate::message::{
    CleanResult, CompactDone, CompactSnapshot, CompactVerdict, ControlMsg, DefineSpec,
    DeletedOutcome, DocUpdate, GroupRequest, IndexedBatch, Stale, UpdaterExit, UpdaterPhase,
    WorkerEvent,
};
use crate::roles::{validate_bounds, validate_disjoint};
use crate::stats::{self, CleanupRecord, CompactionRecord, GroupStats, UpdateRecord};
use crate::updater::{self, StopSignal, UpdaterContext};
use crate::waiters::{Waiter, WaiterQueues};
use crate::{PartitionId, Signature};

/// Client-side handle to a running group controller.
#[derive(Clone, Debug)]
pub struct GroupHandle {
    tx: mpsc::Sender<ControlMsg>,
    signature: Signature,
    group_type: GroupType,
}

fn controller_gone() -> Error {
    Error::Shutdown("group controller terminated".into())
}

impl GroupHandle {
    pub fn signature(&self) -> Signature {
        self.signature
    }

    pub fn group_type(&self) -> GroupType {
        self.group_type
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> GroupRequest,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ControlMsg::Request(make(tx)))
            .await
            .map_err(|_| controller_gone())?;
        rx.await.map_err(|_| controller_gone())
    }

    pub async fn define_view(
        &self,
        num_partitions: u32,
        active: Vec<PartitionId>,
        passive: Vec<PartitionId>,
        use_replica: bool,
    ) -> Result<()> {
        self.call(|reply| GroupRequest::Define {
            spec: DefineSpec {
                num_partitions,
                active,
                passive,
                use_replica,
            },
            reply,
        })
        .await?
    }

    pub async fn is_view_defined(&self) -> Result<bool> {
        self.call(|reply| GroupRequest::IsDefined { reply }).await
    }

    pub async fn set_state(
        &self,
        active: Vec<PartitionId>,
        passive: Vec<PartitionId>,
        cleanup: Vec<PartitionId>,
    ) -> Result<()> {
        self.call(|reply| GroupRequest::SetState {
            active,
            passive,
            cleanup,
            reply,
        })
        .await?
    }

    pub async fn add_replicas(&self, partitions: Vec<PartitionId>) -> Result<()> {
        self.call(|reply| GroupRequest::AddReplicas { partitions, reply })
            .await?
    }

    pub async fn remove_replicas(&self, partitions: Vec<PartitionId>) -> Result<()> {
        self.call(|reply| GroupRequest::RemoveReplicas { partitions, reply })
            .await?
    }

    pub async fn request_group(
        &self,
        wanted: Vec<PartitionId>,
        stale: Stale,
    ) -> Result<GroupSnapshot> {
        self.call(|reply| GroupRequest::RequestGroup {
            wanted,
            stale,
            reply,
        })
        .await?
    }

    pub async fn request_group_info(&self) -> Result<GroupInfo> {
        self.call(|reply| GroupRequest::Info { reply }).await?
    }

    pub async fn get_data_size(&self) -> Result<u64> {
        self.call(|reply| GroupRequest::DataSize { reply }).await?
    }

    pub async fn partition_deleted(
        &self,
        partition: Option<PartitionId>,
    ) -> Result<DeletedOutcome> {
        self.call(|reply| GroupRequest::PartitionDeleted { partition, reply })
            .await
    }

    pub async fn start_compact(&self) -> Result<()> {
        self.call(|reply| GroupRequest::StartCompact { reply }).await?
    }

    pub async fn cancel_compact(&self) -> Result<()> {
        self.call(|reply| GroupRequest::CancelCompact { reply }).await?
    }

    pub async fn trigger_cleanup(&self) -> Result<()> {
        self.call(|reply| GroupRequest::TriggerCleanup { reply }).await?
    }

    /// Notify the controller that the backing design document changed.
    /// A different signature makes the group stale and shuts it down.
    pub async fn ddoc_updated(&self, new_signature: Signature) -> Result<()> {
        self.call(|reply| GroupRequest::DdocUpdated {
            new_signature,
            reply,
        })
        .await
    }

    pub async fn reset_stats(&self) -> Result<()> {
        self.call(|reply| GroupRequest::ResetStats { reply }).await
    }

    /// Current `(active, passive)` partitions.
    pub async fn role_partitions(&self) -> Result<(Vec<PartitionId>, Vec<PartitionId>)> {
        self.call(|reply| GroupRequest::RolePartitions { reply }).await
    }

    /// Graceful terminal exit with reason `normal`. Resolves once the
    /// terminal sequence has run.
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| GroupRequest::Shutdown { reply }).await
    }
}

/// Open (or initialise) a main group and spawn its controller.
pub fn open_group(
    config: GroupConfig,
    dbset: Arc<dyn DbSet>,
    mapper: Arc<dyn ViewMapper>,
) -> Result<GroupHandle> {
    open_group_typed(config, GroupType::Main, dbset, mapper)
}

fn open_group_typed(
    config: GroupConfig,
    group_type: GroupType,
    dbset: Arc<dyn DbSet>,
    mapper: Arc<dyn ViewMapper>,
) -> Result<GroupHandle> {
    let group = Group::open(&config, group_type, mapper.view_count())?;
    let signature = group.signature;
    let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);

    let replica = if group_type == GroupType::Main && group.header.has_replica {
        Some(open_group_typed(
            config.clone(),
            GroupType::Replica,
            dbset.clone(),
            mapper.clone(),
        )?)
    } else {
        None
    };

    let handle = GroupHandle {
        tx: tx.clone(),
        signature,
        group_type,
    };

    spawn_dbset_watch(dbset.closed(), tx.clone());

    let stats = GroupStats::new(config.history_size);
    let controller = Controller {
        config,
        group,
        dbset,
        mapper,
        replica,
        events: tx,
        updater: None,
        cleaner: None,
        compactor: None,
        worker_gen: 0,
        waiters: WaiterQueues::default(),
        stats,
        commit_due: None,
        recheck_pending: false,
        terminal: None,
        shutdown_ack: None,
    };
    tokio::spawn(controller.run(rx));
    tracing::info!(
        signature = %signature,
        group_type = group_type.file_prefix(),
        "view group opened"
    );
    Ok(handle)
}

fn spawn_dbset_watch(
    mut closed: watch::Receiver<Option<String>>,
    events: mpsc::Sender<ControlMsg>,
) {
    tokio::spawn(async move {
        loop {
            let reason = closed.borrow_and_update().clone();
            if let Some(reason) = reason {
                let _ = events
                    .send(ControlMsg::Worker(WorkerEvent::DbSetClosed(reason)))
                    .await;
                return;
            }
            if closed.changed().await.is_err() {
                return;
            }
        }
    });
}

struct UpdaterSlot {
    gen: u64,
    stop: watch::Sender<StopSignal>,
    join: JoinHandle<UpdaterExit>,
    phase: UpdaterPhase,
    docs_indexed: u64,
}

struct CleanerSlot {
    cancel: Arc<AtomicBool>,
    join: JoinHandle<CleanResult>,
}

struct CompactorSlot {
    gen: u64,
    join: JoinHandle<()>,
    path: PathBuf,
}

enum Terminal {
    Normal,
    DbDeleted(String),
    DbSetDied(String),
    CleanerDied(String),
    CompactorDied(String),
}

impl Terminal {
    fn as_error(&self) -> Error {
        match self {
            Terminal::Normal => Error::Shutdown("normal".into()),
            Terminal::DbDeleted(what) => Error::DbDeleted(what.clone()),
            Terminal::DbSetDied(reason) => Error::DbSetDied(reason.clone()),
            Terminal::CleanerDied(reason) => Error::CleanerDied(reason.clone()),
            Terminal::CompactorDied(reason) => Error::CompactorDied(reason.clone()),
        }
    }
}

enum Next {
    Msg(ControlMsg),
    MailboxClosed,
    CommitDue,
    UpdaterExit(std::result::Result<UpdaterExit, tokio::task::JoinError>),
    CleanerExit(std::result::Result<CleanResult, tokio::task::JoinError>),
    CompactorExit(std::result::Result<(), tokio::task::JoinError>),
}

struct Controller {
    config: GroupConfig,
    group: Group,
    dbset: Arc<dyn DbSet>,
    mapper: Arc<dyn ViewMapper>,
    replica: Option<GroupHandle>,
    events: mpsc::Sender<ControlMsg>,
    updater: Option<UpdaterSlot>,
    cleaner: Option<CleanerSlot>,
    compactor: Option<CompactorSlot>,
    /// Shared generation counter for all worker slots; progress events
    /// carry it so stale ones are recognised.
    worker_gen: u64,
    waiters: WaiterQueues,
    stats: GroupStats,
    commit_due: Option<TokioInstant>,
    /// A cleanup pass shrank the cleanup mask; re-check whether the
    /// pending transition became applicable. Handled at the top of the
    /// main loop so the check never re-enters the handler that set it.
    recheck_pending: bool,
    terminal: Option<Terminal>,
    shutdown_ack: Option<oneshot::Sender<()>>,
}

impl Controller {
    async fn run(mut self, mut rx: mpsc::Receiver<ControlMsg>) {
        loop {
            let next = {
                let commit_due = self.commit_due;
                let has_updater = self.updater.is_some();
                let has_cleaner = self.cleaner.is_some();
                let has_compactor = self.compactor.is_some();
                let updater_join = self.updater.as_mut().map(|s| &mut s.join);
                let cleaner_join = self.cleaner.as_mut().map(|s| &mut s.join);
                let compactor_join = self.compactor.as_mut().map(|s| &mut s.join);
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(msg) => Next::Msg(msg),
                        None => Next::MailboxClosed,
                    },
                    _ = sleep_until(commit_due.unwrap_or_else(TokioInstant::now)),
                        if commit_due.is_some() => Next::CommitDue,
                    res = async { updater_join.unwrap().await }, if has_updater =>
                        Next::UpdaterExit(res),
                    res = async { cleaner_join.unwrap().await }, if has_cleaner =>
                        Next::CleanerExit(res),
                    res = async { compactor_join.unwrap().await }, if has_compactor =>
                        Next::CompactorExit(res),
                }
            };

            match next {
                Next::Msg(ControlMsg::Request(req)) => self.handle_request(req).await,
                Next::Msg(ControlMsg::Worker(event)) => self.handle_worker(event).await,
                Next::MailboxClosed => break,
                Next::CommitDue => {
                    self.commit_due = None;
                    if let Err(err) = self.group.write_header(false) {
                        tracing::warn!(error = %err, "delayed checkpoint failed");
                    }
                }
                Next::UpdaterExit(res) => {
                    let _slot = self.updater.take().expect("updater slot");
                    match res {
                        Ok(exit) => self.absorb_updater_exit(exit, true).await,
                        Err(err) if !err.is_cancelled() => {
                            self.absorb_updater_exit(
                                UpdaterExit::Error(err.to_string()),
                                true,
                            )
                            .await;
                        }
                        Err(_) => {}
                    }
                }
                Next::CleanerExit(res) => {
                    let _slot = self.cleaner.take().expect("cleaner slot");
                    match res {
                        Ok(result) => self.absorb_clean_result(result, true).await,
                        Err(err) if !err.is_cancelled() => {
                            self.terminal = Some(Terminal::CleanerDied(err.to_string()));
                        }
                        Err(_) => {}
                    }
                }
                Next::CompactorExit(res) => {
                    // A compactor that ends without going through the
                    // verdict protocol either panicked or was aborted.
                    let slot = self.compactor.take().expect("compactor slot");
                    if let Err(err) = res {
                        if !err.is_cancelled() {
                            let _ = fs::remove_file(&slot.path);
                            self.terminal =
                                Some(Terminal::CompactorDied(err.to_string()));
                        }
                    }
                }
            }

            if self.terminal.is_none() && self.recheck_pending {
                self.recheck_pending = false;
                self.maybe_apply_pending_transition().await;
            }
            if let Some(terminal) = self.terminal.take() {
                self.terminate(terminal, &mut rx).await;
                return;
            }
        }
    }

    fn defined(&self) -> bool {
        self.group.header.is_defined()
    }

    fn num_partitions(&self) -> u32 {
        self.group.header.num_partitions.unwrap_or(0)
    }

    // ---- request handling -------------------------------------------------

    async fn handle_request(&mut self, req: GroupRequest) {
        match req {
            GroupRequest::Define { spec, reply } => {
                let result = self.handle_define(spec).await;
                let _ = reply.send(result);
            }
            GroupRequest::IsDefined { reply } => {
                let _ = reply.send(self.defined());
            }
            GroupRequest::SetState {
                active,
                passive,
                cleanup,
                reply,
            } => {
                let result = self.handle_set_state(active, passive, cleanup).await;
                let _ = reply.send(result);
            }
            GroupRequest::AddReplicas { partitions, reply } => {
                let result = self.handle_add_replicas(partitions).await;
                let _ = reply.send(result);
            }
            GroupRequest::RemoveReplicas { partitions, reply } => {
                let result = self.handle_remove_replicas(partitions).await;
                let _ = reply.send(result);
            }
            GroupRequest::RequestGroup {
                wanted,
                stale,
                reply,
            } => {
                if !self.defined() {
                    let _ = reply.send(Err(Error::ViewUndefined));
                    return;
                }
                if let Err(err) = validate_bounds(self.num_partitions(), &[&wanted]) {
                    let _ = reply.send(Err(err));
                    return;
                }
                let waiter = Waiter {
                    wanted,
                    stale,
                    reply,
                };
                self.dispatch_request_group(waiter).await;
            }
            GroupRequest::Info { reply } => {
                let result = self.handle_info().await;
                let _ = reply.send(result);
            }
            GroupRequest::DataSize { reply } => {
                let result = if self.defined() {
                    Ok(self.group.data_size())
                } else {
                    Err(Error::ViewUndefined)
                };
                let _ = reply.send(result);
            }
            GroupRequest::PartitionDeleted { partition, reply } => {
                let owned = self.group.header.roles.owned();
                match partition {
                    None => {
                        let _ = reply.send(DeletedOutcome::Shutdown);
                        self.terminal = Some(Terminal::DbDeleted("master".into()));
                    }
                    Some(p) if owned.contains(p) => {
                        let _ = reply.send(DeletedOutcome::Shutdown);
                        self.terminal =
                            Some(Terminal::DbDeleted(format!("partition {p}")));
                    }
                    Some(_) => {
                        let _ = reply.send(DeletedOutcome::Ignore);
                    }
                }
            }
            GroupRequest::StartCompact { reply } => {
                let result = self.handle_start_compact().await;
                let _ = reply.send(result);
            }
            GroupRequest::CancelCompact { reply } => {
                let result = self.handle_cancel_compact().await;
                let _ = reply.send(result);
            }
            GroupRequest::TriggerCleanup { reply } => {
                let result = if self.defined() {
                    self.start_cleaner_if_idle();
                    Ok(())
                } else {
                    Err(Error::ViewUndefined)
                };
                let _ = reply.send(result);
            }
            GroupRequest::DdocUpdated {
                new_signature,
                reply,
            } => {
                let _ = reply.send(());
                if new_signature != self.group.signature {
                    tracing::info!(
                        old = %self.group.signature,
                        new = %new_signature,
                        "design document changed, group is stale"
                    );
                    self.terminal = Some(Terminal::Normal);
                }
            }
            GroupRequest::ResetStats { reply } => {
                self.stats.reset();
                stats::publish(self.group.signature, &self.stats);
                let _ = reply.send(());
            }
            GroupRequest::RolePartitions { reply } => {
                let roles = &self.group.header.roles;
                let _ = reply.send((
                    roles.abitmask.to_partitions(),
                    roles.pbitmask.to_partitions(),
                ));
            }
            GroupRequest::Shutdown { reply } => {
                self.shutdown_ack = Some(reply);
                self.terminal = Some(Terminal::Normal);
            }
        }
    }

    async fn handle_define(&mut self, spec: DefineSpec) -> Result<()> {
        if self.defined() {
            return Err(Error::ViewAlreadyDefined);
        }
        if spec.num_partitions == 0 || spec.num_partitions > MAX_NUM_PARTITIONS {
            return Err(Error::InvalidPartitionList);
        }
        validate_disjoint(&spec.active, &spec.passive, &[])?;
        validate_bounds(spec.num_partitions, &[&spec.active, &spec.passive])?;

        self.group.header.num_partitions = Some(spec.num_partitions);
        self.group.header.roles.promote_active(&spec.active);
        self.group.header.roles.promote_passive(&spec.passive);
        if self.group.group_type == GroupType::Main {
            self.group.header.has_replica = spec.use_replica;
            if spec.use_replica {
                let replica = self.ensure_replica()?;
                replica
                    .define_view(spec.num_partitions, Vec::new(), Vec::new(), false)
                    .await?;
            }
        }
        self.commit(true)?;
        tracing::info!(
            signature = %self.group.signature,
            num_partitions = spec.num_partitions,
            active = ?spec.active,
            passive = ?spec.passive,
            use_replica = spec.use_replica,
            "view group defined"
        );
        Ok(())
    }

    fn ensure_replica(&mut self) -> Result<GroupHandle> {
        if let Some(replica) = &self.replica {
            return Ok(replica.clone());
        }
        let replica = open_group_typed(
            self.config.clone(),
            GroupType::Replica,
            self.dbset.clone(),
            self.mapper.clone(),
        )?;
        self.replica = Some(replica.clone());
        Ok(replica)
    }

    async fn handle_set_state(
        &mut self,
        active: Vec<PartitionId>,
        passive: Vec<PartitionId>,
        cleanup: Vec<PartitionId>,
    ) -> Result<()> {
        if !self.defined() {
            return Err(Error::ViewUndefined);
        }
        // An all-empty triple is accepted as a no-op ahead of validation.
        if active.is_empty() && passive.is_empty() && cleanup.is_empty() {
            return Ok(());
        }
        validate_disjoint(&active, &passive, &cleanup)?;
        validate_bounds(self.num_partitions(), &[&active, &passive, &cleanup])?;

        let roles = &self.group.header.roles;
        let noop = active.iter().all(|p| roles.abitmask.contains(*p))
            && passive.iter().all(|p| roles.pbitmask.contains(*p))
            && cleanup.iter().all(|p| roles.cbitmask.contains(*p));
        if noop {
            return Ok(());
        }

        if self.group.header.pending_transition.is_some() {
            self.merge_into_pending(&active, &passive, &cleanup)?;
            self.reevaluate_pending_waiters().await;
            // The merge may have emptied the blocked side entirely.
            self.recheck_pending = true;
            return Ok(());
        }

        self.stop_cleaner().await;
        let updater_was_running = self.stop_updater(StopSignal::Immediately).await;

        let requested_owned = Bitmask::from_partitions(&active)
            .union(&Bitmask::from_partitions(&passive));
        let in_cleanup = requested_owned.intersect(&self.group.header.roles.cbitmask);
        if in_cleanup.is_empty() {
            self.persist_partition_states(&active, &passive, &cleanup)
                .await?;
        } else {
            let pending = PendingTransition {
                active: sorted(active),
                passive: sorted(passive),
                cleanup: sorted(cleanup),
            };
            tracing::info!(
                in_cleanup = %in_cleanup,
                active = ?pending.active,
                passive = ?pending.passive,
                cleanup = ?pending.cleanup,
                "role change blocked on cleanup, recording pending transition"
            );
            self.group.header.pending_transition = Some(pending);
            self.commit(true)?;
        }
        self.after_partition_update(updater_was_running).await;
        Ok(())
    }

    /// Merge a new role request into the existing pending transition:
    /// union with its own side, subtract from the other two.
    fn merge_into_pending(
        &mut self,
        active: &[PartitionId],
        passive: &[PartitionId],
        cleanup: &[PartitionId],
    ) -> Result<()> {
        let t = self
            .group
            .header
            .pending_transition
            .take()
            .expect("pending transition");
        let a = Bitmask::from_partitions(active);
        let p = Bitmask::from_partitions(passive);
        let c = Bitmask::from_partitions(cleanup);
        let merged = PendingTransition {
            active: Bitmask::from_partitions(&t.active)
                .union(&a)
                .minus(&p)
                .minus(&c)
                .to_partitions(),
            passive: Bitmask::from_partitions(&t.passive)
                .union(&p)
                .minus(&a)
                .minus(&c)
                .to_partitions(),
            cleanup: Bitmask::from_partitions(&t.cleanup)
                .union(&c)
                .minus(&a)
                .minus(&p)
                .to_partitions(),
        };
        tracing::debug!(
            active = ?merged.active,
            passive = ?merged.passive,
            cleanup = ?merged.cleanup,
            "merged role change into pending transition"
        );
        self.group.header.pending_transition = Some(merged);
        self.commit(true)
    }

    /// Apply validated role lists to the live group: resolve replica
    /// transfers, run the role algebra, detach cleanup partitions from the
    /// db-set, commit, and forward replica-side changes.
    async fn persist_partition_states(
        &mut self,
        active: &[PartitionId],
        passive: &[PartitionId],
        cleanup: &[PartitionId],
    ) -> Result<()> {
        let mut active_now = Vec::new();
        let mut to_transfer = Vec::new();
        let transfer_mask = self.group.header.transfer_mask();

        if self.group.group_type == GroupType::Main && self.group.header.has_replica {
            let replica_held = match &self.replica {
                Some(replica) => {
                    let (ra, rp) = replica.role_partitions().await.unwrap_or_default();
                    Bitmask::from_partitions(&ra).union(&Bitmask::from_partitions(&rp))
                }
                None => Bitmask::new(),
            };
            let owned = self.group.header.roles.owned();
            for &p in active {
                if transfer_mask.contains(p) {
                    // Already on transfer; it stays passive until caught
                    // up.
                } else if replica_held.contains(p) && !owned.contains(p) {
                    to_transfer.push(p);
                } else {
                    active_now.push(p);
                }
            }
        } else {
            active_now = active.to_vec();
        }

        let roles = &mut self.group.header.roles;
        roles.promote_active(&active_now);
        roles.promote_passive(passive);
        roles.promote_passive(&to_transfer);
        roles.mark_cleanup(cleanup);

        let mut rot: Vec<PartitionId> = self.group.header.replicas_on_transfer.clone();
        rot.extend_from_slice(&to_transfer);
        let cleanup_mask = Bitmask::from_partitions(cleanup);
        let transfer_cancelled: Vec<PartitionId> = rot
            .iter()
            .copied()
            .filter(|p| cleanup_mask.contains(*p))
            .collect();
        rot.retain(|p| !cleanup_mask.contains(*p));
        self.group.header.replicas_on_transfer = sorted(rot);

        if !cleanup.is_empty() {
            self.dbset.remove_partitions(cleanup).await?;
        }
        self.commit(true)?;
        tracing::info!(
            active = ?active,
            passive = ?passive,
            cleanup = ?cleanup,
            on_transfer = ?self.group.header.replicas_on_transfer,
            "partition states updated"
        );

        if let Some(replica) = self.replica.clone() {
            if !to_transfer.is_empty() {
                tracing::debug!(partitions = ?to_transfer, "partitions adopted from replica, catching up");
            }
            if !transfer_cancelled.is_empty() {
                let _ = replica
                    .set_state(Vec::new(), Vec::new(), transfer_cancelled)
                    .await;
            }
        }
        Ok(())
    }

    /// Post-role-change scheduling, §4.7 step 6.
    async fn after_partition_update(&mut self, updater_was_running: bool) {
        match self.group.group_type {
            GroupType::Main => {
                if updater_was_running || self.waiters.waiting_len() > 0 {
                    self.ensure_updater().await;
                }
                if self.compactor.is_some() {
                    self.restart_compactor().await;
                }
            }
            GroupType::Replica => {
                if self.compactor.is_some() {
                    self.restart_compactor().await;
                } else if self.updater.is_none() {
                    self.maybe_auto_update().await;
                }
            }
        }
        self.maybe_start_cleaner();
    }

    async fn maybe_auto_update(&mut self) {
        let owned = self.group.header.roles.owned().to_partitions();
        if owned.is_empty() {
            return;
        }
        let pending = self
            .dbset
            .pending_changes(&owned, &self.group.header.roles.seqs)
            .await
            .unwrap_or(0);
        if pending >= self.config.auto_update_threshold {
            tracing::debug!(pending, "auto-updating replica group");
            self.ensure_updater().await;
        }
    }

    async fn handle_add_replicas(&mut self, partitions: Vec<PartitionId>) -> Result<()> {
        if self.group.group_type != GroupType::Main || !self.group.header.has_replica {
            return Err(Error::ReplicasNotSupported);
        }
        if !self.defined() {
            return Err(Error::ViewUndefined);
        }
        validate_bounds(self.num_partitions(), &[&partitions])?;
        let owned = self.group.header.roles.owned();
        let remainder: Vec<PartitionId> = partitions
            .into_iter()
            .filter(|p| !owned.contains(*p))
            .collect();
        if remainder.is_empty() {
            return Ok(());
        }
        let replica = self.ensure_replica()?;
        replica
            .set_state(Vec::new(), remainder.clone(), Vec::new())
            .await?;
        tracing::info!(partitions = ?remainder, "replicas added");
        Ok(())
    }

    async fn handle_remove_replicas(&mut self, partitions: Vec<PartitionId>) -> Result<()> {
        if self.group.group_type != GroupType::Main || !self.group.header.has_replica {
            return Err(Error::ReplicasNotSupported);
        }
        if !self.defined() {
            return Err(Error::ViewUndefined);
        }
        validate_bounds(self.num_partitions(), &[&partitions])?;

        let transfer_mask = self.group.header.transfer_mask();
        let on_transfer: Vec<PartitionId> = partitions
            .iter()
            .copied()
            .filter(|p| transfer_mask.contains(*p))
            .collect();
        if !on_transfer.is_empty() {
            // Cancel the transfers: the partitions stop being ours and
            // their keys get purged.
            self.stop_cleaner().await;
            let updater_was_running = self.stop_updater(StopSignal::Immediately).await;
            self.group
                .header
                .replicas_on_transfer
                .retain(|p| !on_transfer.contains(p));
            self.group.header.roles.mark_cleanup(&on_transfer);
            self.dbset.remove_partitions(&on_transfer).await?;
            self.commit(true)?;
            tracing::info!(partitions = ?on_transfer, "replica transfers cancelled");
            self.after_partition_update(updater_was_running).await;
        }

        let replica = self.ensure_replica()?;
        replica.set_state(Vec::new(), Vec::new(), partitions).await?;
        Ok(())
    }

    async fn dispatch_request_group(&mut self, waiter: Waiter) {
        if self.group.group_type == GroupType::Replica && !waiter.wanted.is_empty() {
            // Replica reads are only valid for exactly the partition set
            // the replica currently serves as active.
            let wanted_mask = waiter.wanted_mask();
            if wanted_mask != self.group.header.roles.abitmask {
                let _ = waiter.reply.send(Err(Error::Retry));
                return;
            }
        }

        if let Some(pending) = &self.group.header.pending_transition {
            if waiter.wanted_mask().intersects(&pending.blocking_mask()) {
                self.stats.waiting_clients += 1;
                stats::publish(self.group.signature, &self.stats);
                self.waiters.park_pending(waiter);
                return;
            }
        }

        match waiter.stale {
            Stale::Ok => {
                let snapshot = self.build_snapshot().await;
                let _ = waiter.reply.send(Ok(snapshot));
            }
            Stale::UpdateAfter => {
                let snapshot = self.build_snapshot().await;
                let _ = waiter.reply.send(Ok(snapshot));
                self.ensure_updater().await;
            }
            Stale::False => {
                let fresh = self
                    .updater
                    .as_ref()
                    .is_some_and(|slot| slot.phase == UpdaterPhase::UpdatingPassive);
                if fresh {
                    let snapshot = self.build_snapshot().await;
                    let _ = waiter.reply.send(Ok(snapshot));
                } else {
                    self.stats.waiting_clients += 1;
                    stats::publish(self.group.signature, &self.stats);
                    self.waiters.park_waiting(waiter);
                    self.ensure_updater().await;
                }
            }
        }
    }

    async fn active_replicas(&self) -> Bitmask {
        if self.group.group_type != GroupType::Main || !self.group.header.has_replica {
            return Bitmask::new();
        }
        match &self.replica {
            Some(replica) => match replica.role_partitions().await {
                Ok((active, _)) => Bitmask::from_partitions(&active),
                Err(_) => Bitmask::new(),
            },
            None => Bitmask::new(),
        }
    }

    async fn build_snapshot(&self) -> GroupSnapshot {
        let active_replicas = self.active_replicas().await;
        GroupSnapshot::new(&self.group, active_replicas, self.replica.clone())
    }

    async fn drain_waiting(&mut self) {
        if self.waiters.waiting_len() == 0 {
            return;
        }
        let active_replicas = self.active_replicas().await;
        let group = &self.group;
        let replica = self.replica.clone();
        self.waiters.drain_waiting(|| {
            GroupSnapshot::new(group, active_replicas.clone(), replica.clone())
        });
    }

    async fn reevaluate_pending_waiters(&mut self) {
        for waiter in self.waiters.take_pending() {
            self.dispatch_request_group(waiter).await;
        }
    }

    async fn handle_info(&mut self) -> Result<GroupInfo> {
        let header = &self.group.header;
        let roles = &header.roles;
        let mut info = GroupInfo {
            set_name: self.config.set_name.clone(),
            name: self.config.name.clone(),
            signature: self.group.signature,
            group_type: self.group.group_type,
            language: self.config.language.clone(),
            disk_size: self.group.file.disk_size(),
            data_size: self.group.data_size(),
            updater_running: self.updater.is_some(),
            updater_state: self.updater.as_ref().map(|s| s.phase.as_str().to_string()),
            update_progress: self.updater.as_ref().map(|s| UpdateProgress {
                phase: s.phase.as_str().to_string(),
                docs_indexed: s.docs_indexed,
            }),
            compact_running: self.compactor.is_some(),
            cleanup_running: self.cleaner.is_some(),
            waiting_commit: self.commit_due.is_some(),
            waiting_clients: self.waiters.len(),
            num_partitions: header.num_partitions,
            seqs: roles.seqs.clone(),
            purge_seqs: roles.purge_seqs.clone(),
            active_partitions: roles.abitmask.to_partitions(),
            passive_partitions: roles.pbitmask.to_partitions(),
            cleanup_partitions: roles.cbitmask.to_partitions(),
            pending_transition: header.pending_transition.clone(),
            stats: self.stats.clone(),
            replica_partitions: None,
            replicas_on_transfer: None,
            replica_group_info: None,
        };
        if self.group.group_type == GroupType::Main && header.has_replica {
            info.replicas_on_transfer = Some(header.replicas_on_transfer.clone());
            if let Some(replica) = self.replica.clone() {
                match timeout(self.config.call_timeout, replica.request_group_info()).await {
                    Ok(Ok(replica_info)) => {
                        let mut held = replica_info.active_partitions.clone();
                        held.extend_from_slice(&replica_info.passive_partitions);
                        info.replica_partitions = Some(sorted(held));
                        info.replica_group_info = Some(Box::new(replica_info));
                    }
                    Ok(Err(_)) | Err(_) => {}
                }
            }
        }
        Ok(info)
    }

    // ---- worker management ------------------------------------------------

    async fn handle_worker(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::UpdaterState { gen, phase } => {
                let Some(slot) = self.updater.as_mut() else { return };
                if slot.gen != gen {
                    return;
                }
                slot.phase = phase;
                tracing::debug!(phase = phase.as_str(), "updater phase change");
                if phase == UpdaterPhase::UpdatingPassive {
                    self.drain_waiting().await;
                }
            }
            WorkerEvent::UpdaterBatch { gen, batch } => {
                let current = self.updater.as_ref().map(|slot| slot.gen);
                if current != Some(gen) {
                    return;
                }
                self.apply_batch(batch).await;
            }
            WorkerEvent::CompactDone { gen, done } => {
                self.handle_compact_done(gen, done).await;
            }
            WorkerEvent::CompactorDied { gen, reason } => {
                let Some(slot) = &self.compactor else { return };
                if slot.gen != gen {
                    return;
                }
                self.compactor = None;
                self.terminal = Some(Terminal::CompactorDied(reason));
            }
            WorkerEvent::DbSetClosed(reason) => {
                self.terminal = Some(Terminal::DbSetDied(reason));
            }
        }
    }

    async fn apply_batch(&mut self, batch: IndexedBatch) {
        // Role changes since the batch was produced may have dropped the
        // partition; its rows are then no longer wanted.
        let Some(&current) = self.group.header.roles.seqs.get(&batch.partition) else {
            return;
        };
        if batch.seq <= current {
            return;
        }
        for doc in &batch.docs {
            self.apply_doc(batch.partition, doc);
        }
        if let Some(slot) = self.updater.as_mut() {
            slot.docs_indexed += batch.docs.len() as u64;
        }
        self.group
            .header
            .roles
            .seqs
            .insert(batch.partition, batch.seq);
        self.group.dirty = true;
        self.schedule_checkpoint();
        if self.group.header.transfer_mask().contains(batch.partition) {
            self.check_transfer_absorbed(batch.partition).await;
        }
    }

    fn apply_doc(&mut self, partition: PartitionId, doc: &DocUpdate) {
        if let Some(old) = self.group.id_tree.get(partition, &doc.id).cloned() {
            for (view_idx, keys) in decode_id_entry_keys(&old).into_iter().enumerate() {
                if let Some(tree) = self.group.views.get_mut(view_idx) {
                    for key in keys {
                        tree.remove(partition, &key);
                    }
                }
            }
        }
        if doc.deleted {
            self.group.id_tree.remove(partition, &doc.id);
        } else {
            for (view_idx, rows) in doc.view_rows.iter().enumerate() {
                if let Some(tree) = self.group.views.get_mut(view_idx) {
                    for (key, value) in rows {
                        tree.insert(partition, key.clone(), value.clone());
                    }
                }
            }
            self.group.id_tree.insert(
                partition,
                doc.id.clone(),
                encode_id_entry(doc.seq, &doc.view_rows),
            );
        }
    }

    /// A partition adopted from the replica is absorbed once its indexed
    /// sequence has caught up with its feed: promote it to active, commit,
    /// and tell the replica to clean it up.
    async fn check_transfer_absorbed(&mut self, partition: PartitionId) {
        let latest = match self.dbset.partition_seq(partition).await {
            Ok(latest) => latest,
            Err(_) => return,
        };
        let indexed = self
            .group
            .header
            .roles
            .seqs
            .get(&partition)
            .copied()
            .unwrap_or(0);
        if indexed < latest {
            return;
        }
        tracing::info!(partition, seq = indexed, "replica transfer absorbed");
        self.group
            .header
            .replicas_on_transfer
            .retain(|p| *p != partition);
        self.group.header.roles.promote_active(&[partition]);
        if let Err(err) = self.commit(true) {
            tracing::error!(error = %err, "commit after transfer absorption failed");
        }
        if let Some(replica) = self.replica.clone() {
            let _ = replica
                .set_state(Vec::new(), Vec::new(), vec![partition])
                .await;
        }
    }

    async fn ensure_updater(&mut self) {
        if self.updater.is_some() || !self.defined() || self.terminal.is_some() {
            return;
        }
        self.stop_cleaner().await;
        self.worker_gen += 1;
        let gen = self.worker_gen;
        let (stop_tx, stop_rx) = watch::channel(StopSignal::Run);
        let roles = &self.group.header.roles;
        let ctx = UpdaterContext {
            gen,
            dbset: self.dbset.clone(),
            mapper: self.mapper.clone(),
            seqs: roles.seqs.clone(),
            active: roles.abitmask.to_partitions(),
            passive: roles.pbitmask.to_partitions(),
            batch_limit: self.config.updater_batch,
            events: self.events.clone(),
            stop: stop_rx,
        };
        let join = tokio::spawn(updater::run(ctx));
        self.updater = Some(UpdaterSlot {
            gen,
            stop: stop_tx,
            join,
            phase: UpdaterPhase::Starting,
            docs_indexed: 0,
        });
        tracing::debug!("updater started");
    }

    /// Stop a running updater and absorb its partial result inline.
    /// Returns whether one was running.
    async fn stop_updater(&mut self, signal: StopSignal) -> bool {
        let Some(slot) = self.updater.take() else {
            return false;
        };
        let _ = slot.stop.send(signal);
        match slot.join.await {
            Ok(exit) => self.absorb_updater_exit(exit, false).await,
            Err(err) => {
                if !err.is_cancelled() {
                    tracing::warn!(error = %err, "updater join failed during stop");
                }
            }
        }
        true
    }

    /// Common handling of an updater's terminal value. `natural` is false
    /// when the exit was forced by a stop; follow-up work scheduling is
    /// then the stopper's business.
    async fn absorb_updater_exit(&mut self, exit: UpdaterExit, natural: bool) {
        match exit {
            UpdaterExit::Finished(result) => {
                self.stats.record_update(UpdateRecord {
                    docs_indexed: result.docs_indexed,
                    docs_deleted: result.docs_deleted,
                    duration_ms: result.duration.as_millis() as u64,
                    stopped: result.stopped,
                });
                stats::publish(self.group.signature, &self.stats);
                tracing::info!(
                    docs_indexed = result.docs_indexed,
                    docs_deleted = result.docs_deleted,
                    stopped = result.stopped,
                    "updater finished"
                );
                if !result.stopped {
                    if let Err(err) = self.commit(true) {
                        tracing::error!(error = %err, "commit after update failed");
                    }
                    self.drain_waiting().await;
                    for partition in self.group.header.replicas_on_transfer.clone() {
                        self.check_transfer_absorbed(partition).await;
                    }
                    if self.group.group_type == GroupType::Replica {
                        self.promote_caught_up_passive().await;
                    }
                    if natural {
                        self.maybe_start_cleaner();
                    }
                }
            }
            UpdaterExit::Error(reason) => {
                self.stats.updater_errors += 1;
                stats::publish(self.group.signature, &self.stats);
                tracing::error!(reason = %reason, "updater failed");
                self.waiters.fail_waiting(&Error::UpdaterError(reason));
                if natural {
                    self.maybe_start_cleaner();
                }
            }
            UpdaterExit::Reset => {
                tracing::warn!("updater requested a reset, re-preparing group from disk");
                if let Err(err) = self.group.reload(&self.config) {
                    tracing::error!(error = %err, "group reload failed");
                    self.terminal = Some(Terminal::DbSetDied(err.to_string()));
                    return;
                }
                if natural {
                    self.ensure_updater().await;
                }
            }
        }
    }

    /// On a replica group, passive partitions that have caught up with
    /// their feed graduate to active, which makes them visible to replica
    /// routing.
    async fn promote_caught_up_passive(&mut self) {
        let mut promoted = Vec::new();
        for p in self.group.header.roles.pbitmask.to_partitions() {
            let latest = match self.dbset.partition_seq(p).await {
                Ok(latest) => latest,
                Err(_) => continue,
            };
            let indexed = self.group.header.roles.seqs.get(&p).copied().unwrap_or(0);
            if indexed >= latest {
                promoted.push(p);
            }
        }
        if promoted.is_empty() {
            return;
        }
        self.group.header.roles.promote_active(&promoted);
        if let Err(err) = self.commit(true) {
            tracing::error!(error = %err, "commit after replica promotion failed");
        }
        tracing::info!(partitions = ?promoted, "replica partitions now active");
    }

    fn maybe_start_cleaner(&mut self) {
        if self.config.auto_cleanup {
            self.start_cleaner_if_idle();
        }
    }

    fn start_cleaner_if_idle(&mut self) {
        if self.cleaner.is_some()
            || self.updater.is_some()
            || self.compactor.is_some()
            || self.terminal.is_some()
            || !self.defined()
            || self.group.header.roles.cbitmask.is_empty()
        {
            return;
        }
        let cancel = Arc::new(AtomicBool::new(false));
        let ctx = CleanerContext {
            id_tree: self.group.id_tree.clone(),
            views: self.group.views.clone(),
            cbitmask: self.group.header.roles.cbitmask.clone(),
            chunk_bytes: self.config.purge_chunk_bytes,
            cancel: cancel.clone(),
        };
        let join = tokio::spawn(cleaner::run(ctx));
        self.cleaner = Some(CleanerSlot { cancel, join });
        tracing::debug!(cbitmask = %self.group.header.roles.cbitmask, "cleaner started");
    }

    /// Stop a running cleaner and absorb its partial progress inline.
    async fn stop_cleaner(&mut self) -> bool {
        let Some(slot) = self.cleaner.take() else {
            return false;
        };
        slot.cancel.store(true, Ordering::Release);
        match slot.join.await {
            Ok(result) => self.absorb_clean_result(result, false).await,
            Err(err) => {
                if !err.is_cancelled() {
                    tracing::warn!(error = %err, "cleaner join failed during stop");
                }
            }
        }
        true
    }

    /// Install the cleaner's trees, shrink the cleanup mask to the
    /// partitions still present, and commit. Natural completions also
    /// re-check the pending transition and remaining cleanup work.
    async fn absorb_clean_result(&mut self, result: CleanResult, natural: bool) {
        self.group.id_tree = result.id_tree;
        self.group.views = result.views;
        let mut present = self.group.id_tree.partitions_present();
        for view in &self.group.views {
            present = present.union(&view.partitions_present());
        }
        let roles = &mut self.group.header.roles;
        roles.cbitmask = roles.cbitmask.intersect(&present);
        self.group.dirty = true;
        if let Err(err) = self.commit(true) {
            tracing::error!(error = %err, "commit after cleanup failed");
        }
        self.stats.record_cleanup(CleanupRecord {
            removed: result.removed,
            duration_ms: result.duration.as_millis() as u64,
            stopped: !result.completed,
        });
        stats::publish(self.group.signature, &self.stats);
        tracing::info!(
            removed = result.removed,
            completed = result.completed,
            cbitmask = %self.group.header.roles.cbitmask,
            "cleanup pass done"
        );
        if natural {
            self.recheck_pending = true;
            if !self.group.header.roles.cbitmask.is_empty() {
                self.maybe_start_cleaner();
            }
        }
    }

    /// A pending transition applies as soon as none of its active/passive
    /// partitions remain in cleanup.
    async fn maybe_apply_pending_transition(&mut self) {
        let applicable = match &self.group.header.pending_transition {
            Some(pending) => !pending
                .blocking_mask()
                .intersects(&self.group.header.roles.cbitmask),
            None => false,
        };
        if !applicable {
            return;
        }
        let pending = self
            .group
            .header
            .pending_transition
            .take()
            .expect("pending transition");
        tracing::info!(
            active = ?pending.active,
            passive = ?pending.passive,
            cleanup = ?pending.cleanup,
            "applying pending transition"
        );
        let updater_was_running = self.stop_updater(StopSignal::Immediately).await;
        if let Err(err) = self
            .persist_partition_states(&pending.active, &pending.passive, &pending.cleanup)
            .await
        {
            tracing::error!(error = %err, "pending transition failed to apply");
        }
        self.after_partition_update(updater_was_running).await;
        self.reevaluate_pending_waiters().await;
    }

    // ---- compaction -------------------------------------------------------

    fn compact_snapshot(&self) -> CompactSnapshot {
        CompactSnapshot {
            header: self.group.header.clone(),
            id_tree: self.group.id_tree.clone(),
            views: self.group.views.clone(),
        }
    }

    async fn handle_start_compact(&mut self) -> Result<()> {
        if !self.defined() {
            return Err(Error::ViewUndefined);
        }
        if self.compactor.is_some() {
            // At-most-one per role; starting twice is a no-op.
            return Ok(());
        }
        self.stop_cleaner().await;
        self.worker_gen += 1;
        let gen = self.worker_gen;
        let dst = file::compact_path(self.group.file.path());
        let ctx = CompactorContext {
            gen,
            snapshot: self.compact_snapshot(),
            dst: dst.clone(),
            signature: self.group.signature,
            events: self.events.clone(),
        };
        let join = tokio::spawn(compactor::run(ctx));
        self.compactor = Some(CompactorSlot {
            gen,
            join,
            path: dst,
        });
        tracing::info!("compaction started");
        Ok(())
    }

    async fn handle_cancel_compact(&mut self) -> Result<()> {
        let Some(slot) = self.compactor.take() else {
            return Ok(());
        };
        slot.join.abort();
        let _ = slot.join.await;
        let _ = fs::remove_file(&slot.path);
        tracing::info!("compaction cancelled");
        self.maybe_start_cleaner();
        Ok(())
    }

    /// Kill a running compactor and start a fresh one against the current
    /// state; used whenever partition roles change under it.
    async fn restart_compactor(&mut self) {
        let Some(slot) = self.compactor.take() else {
            return;
        };
        slot.join.abort();
        let _ = slot.join.await;
        let _ = fs::remove_file(&slot.path);
        tracing::debug!("restarting compactor against new partition states");
        if let Err(err) = self.handle_start_compact().await {
            tracing::error!(error = %err, "compactor restart failed");
        }
    }

    async fn handle_compact_done(&mut self, gen: u64, done: CompactDone) {
        let Some(slot) = &self.compactor else {
            let _ = done.verdict.send(CompactVerdict::Stop);
            return;
        };
        if slot.gen != gen {
            // A replaced compactor's late completion; its task is already
            // gone, so just drop the verdict channel.
            return;
        }

        if compactor::snapshot_behind(&done.header.roles.seqs, &self.group.header.roles.seqs) {
            self.stats.compactor_retries += 1;
            stats::publish(self.group.signature, &self.stats);
            let _ = done
                .verdict
                .send(CompactVerdict::Retry(self.compact_snapshot()));
            return;
        }

        let updater_was_running = self.stop_updater(StopSignal::Immediately).await;
        match self.swap_compacted_file(&done) {
            Ok(()) => {
                self.stats.record_compaction(CompactionRecord {
                    duration_ms: done.duration.as_millis() as u64,
                    retries: done.retries,
                });
                stats::publish(self.group.signature, &self.stats);
                let _ = done.verdict.send(CompactVerdict::Commit);
                self.compactor = None;
                tracing::info!(
                    retries = done.retries,
                    file = %self.group.file.path().display(),
                    "compaction swapped in"
                );
                if updater_was_running || self.waiters.waiting_len() > 0 {
                    self.ensure_updater().await;
                }
                self.maybe_start_cleaner();
            }
            Err(err) => {
                tracing::error!(error = %err, "compaction swap failed");
                let _ = done.verdict.send(CompactVerdict::Stop);
                self.compactor = None;
                if updater_was_running {
                    self.ensure_updater().await;
                }
            }
        }
    }

    /// The §4.6 swap: old file becomes read-only and is unlinked once its
    /// readers drain; the compacted file is renamed to the next suffix and
    /// the live header is committed onto it, reusing the compacted tree
    /// roots.
    fn swap_compacted_file(&mut self, done: &CompactDone) -> Result<()> {
        let old_path = self.group.file.path().to_path_buf();
        let suffix = file::path_suffix(&old_path).unwrap_or(1);
        let new_path = file::file_path(
            &self.config.dir,
            self.group.group_type,
            &self.group.signature,
            suffix + 1,
        );

        self.group.file.set_readonly()?;
        fs::rename(&done.path, &new_path)?;
        let mut new_file = IndexFile::open(&new_path)?;
        new_file.load_latest_header()?;

        let old_ref = std::mem::replace(
            &mut self.group.file_ref,
            Arc::new(FileRef::new(new_path)),
        );
        old_ref.mark_obsolete();
        drop(old_ref);
        self.group.file = new_file;

        // The live trees equal the compacted snapshot (the behind-check
        // guarantees it), so the fresh header can point at the compacted
        // blocks instead of rewriting them.
        self.group.header.id_tree_root = done.header.id_tree_root;
        self.group.header.view_states = done.header.view_states.clone();
        self.group.header.validate()?;
        self.group
            .file
            .append_header(&self.group.header.encode(&self.group.signature))?;
        self.group.file.sync()?;
        self.group.dirty = false;
        self.commit_due = None;
        Ok(())
    }

    // ---- commit policy ----------------------------------------------------

    fn commit(&mut self, fsync: bool) -> Result<()> {
        let result = self.group.write_header(fsync);
        if fsync && result.is_ok() {
            self.commit_due = None;
        }
        result
    }

    fn schedule_checkpoint(&mut self) {
        if self.commit_due.is_none() {
            self.commit_due = Some(TokioInstant::now() + self.config.commit_delay);
        }
    }

    // ---- terminal sequence ------------------------------------------------

    async fn terminate(&mut self, terminal: Terminal, rx: &mut mpsc::Receiver<ControlMsg>) {
        let err = terminal.as_error();
        tracing::info!(
            signature = %self.group.signature,
            reason = %err,
            "view group terminating"
        );

        self.waiters.fail_all(&err);

        self.dbset.close().await;

        if let Some(slot) = self.updater.take() {
            let _ = slot.stop.send(StopSignal::Immediately);
            let _ = slot.join.await;
        }
        if let Some(slot) = self.cleaner.take() {
            slot.cancel.store(true, Ordering::Release);
            let _ = slot.join.await;
        }
        if let Some(slot) = self.compactor.take() {
            slot.join.abort();
            let _ = slot.join.await;
            let _ = fs::remove_file(&slot.path);
        }
        if let Some(replica) = self.replica.take() {
            let _ = replica.shutdown().await;
        }

        if let Err(err) = self.group.file.set_readonly() {
            tracing::warn!(error = %err, "index file not marked read-only");
        }
        stats::remove(&self.group.signature);

        rx.close();
        while let Ok(msg) = rx.try_recv() {
            match msg {
                ControlMsg::Request(req) => self.fail_request(req, &err),
                ControlMsg::Worker(WorkerEvent::CompactDone { done, .. }) => {
                    let _ = done.verdict.send(CompactVerdict::Stop);
                }
                ControlMsg::Worker(_) => {}
            }
        }
        if let Some(ack) = self.shutdown_ack.take() {
            let _ = ack.send(());
        }
    }

    /// Answer a late request with the shutdown reason; §7 demands every
    /// client gets a typed reply.
    fn fail_request(&self, req: GroupRequest, err: &Error) {
        match req {
            GroupRequest::Define { reply, .. } => {
                let _ = reply.send(Err(err.clone()));
            }
            GroupRequest::IsDefined { reply } => {
                let _ = reply.send(self.defined());
            }
            GroupRequest::SetState { reply, .. }
            | GroupRequest::AddReplicas { reply, .. }
            | GroupRequest::RemoveReplicas { reply, .. }
            | GroupRequest::StartCompact { reply }
            | GroupRequest::CancelCompact { reply }
            | GroupRequest::TriggerCleanup { reply } => {
                let _ = reply.send(Err(err.clone()));
            }
            GroupRequest::RequestGroup { reply, .. } => {
                let _ = reply.send(Err(err.clone()));
            }
            GroupRequest::Info { reply } => {
                let _ = reply.send(Err(err.clone()));
            }
            GroupRequest::DataSize { reply } => {
                let _ = reply.send(Err(err.clone()));
            }
            GroupRequest::PartitionDeleted { reply, .. } => {
                let _ = reply.send(DeletedOutcome::Ignore);
            }
            GroupRequest::DdocUpdated { reply, .. } => {
                let _ = reply.send(());
            }
            GroupRequest::ResetStats { reply } => {
                let _ = reply.send(());
            }
            GroupRequest::RolePartitions { reply } => {
                let roles = &self.group.header.roles;
                let _ = reply.send((
                    roles.abitmask.to_partitions(),
                    roles.pbitmask.to_partitions(),
                ));
            }
            GroupRequest::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }
}

fn sorted(mut parts: Vec<PartitionId>) -> Vec<PartitionId> {
    parts.sort_unstable();
    parts.dedup();
    parts
}

/// Id-tree entry: the document's sequence plus the view keys it emitted,
/// so an update or deletion can retract its old rows.
fn encode_id_entry(seq: u64, view_rows: &[Vec<(bytes::Bytes, bytes::Bytes)>]) -> bytes::Bytes {
    use bytes::BufMut;
    let mut buf = bytes::BytesMut::with_capacity(16);
    buf.put_u64_le(seq);
    buf.put_u16_le(view_rows.len() as u16);
    for rows in view_rows {
        buf.put_u32_le(rows.len() as u32);
        for (key, _) in rows {
            buf.put_u32_le(key.len() as u32);
            buf.put_slice(key);
        }
    }
    buf.freeze()
}

fn decode_id_entry_keys(mut buf: &[u8]) -> Vec<Vec<bytes::Bytes>> {
    use bytes::Buf;
    fn take<'a>(buf: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
        if buf.len() < n {
            return None;
        }
        let (head, rest) = buf.split_at(n);
        *buf = rest;
        Some(head)
    }
    let Some(mut head) = take(&mut buf, 10) else {
        return Vec::new();
    };
    let _seq = head.get_u64_le();
    let views = head.get_u16_le() as usize;
    let mut out = Vec::with_capacity(views);
    for _ in 0..views {
        let Some(mut count_buf) = take(&mut buf, 4) else {
            return out;
        };
        let count = count_buf.get_u32_le() as usize;
        let mut keys = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let Some(mut len_buf) = take(&mut buf, 4) else {
                return out;
            };
            let len = len_buf.get_u32_le() as usize;
            let Some(key) = take(&mut buf, len) else {
                return out;
            };
            keys.push(bytes::Bytes::copy_from_slice(key));
        }
        out.push(keys);
    }
    out
}
