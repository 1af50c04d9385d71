//! The incremental updater.
//!
//! Pulls each owned partition's change feed from the last indexed
//! sequence, maps documents to view rows, and streams batches back to the
//! controller, which applies them to the live trees. Active partitions
//! are indexed first; the transition to the passive phase is what
//! unblocks freshness waiters. Stop signals arrive over a watch channel:
//! `AfterActive` lets the active pass finish, `Immediately` cuts off at
//! the next batch boundary. Every send races the stop signal so a stop
//! lands even when the controller is not draining its mailbox. The
//! terminal result travels back through the task's join handle.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};

use crate::dbset::DbSet;
use crate::group::ViewMapper;
use crate::message::{
    ControlMsg, DocUpdate, IndexedBatch, UpdateResult, UpdaterExit, UpdaterPhase, WorkerEvent,
};
use crate::roles::SeqMap;
use crate::PartitionId;

/// Stop request delivered to a running updater.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StopSignal {
    #[default]
    Run,
    AfterActive,
    Immediately,
}

pub struct UpdaterContext {
    pub gen: u64,
    pub dbset: Arc<dyn DbSet>,
    pub mapper: Arc<dyn ViewMapper>,
    pub seqs: SeqMap,
    pub active: Vec<PartitionId>,
    pub passive: Vec<PartitionId>,
    pub batch_limit: usize,
    pub events: mpsc::Sender<ControlMsg>,
    pub stop: watch::Receiver<StopSignal>,
}

enum SendOutcome {
    Sent,
    /// Stop requested, or the controller is gone.
    Interrupted,
}

enum PassOutcome {
    Done,
    Stopped,
    Reset,
}

pub async fn run(mut ctx: UpdaterContext) -> UpdaterExit {
    let started = Instant::now();
    let mut result = UpdateResult::default();

    for phase in [UpdaterPhase::Starting, UpdaterPhase::UpdatingActive] {
        let gen = ctx.gen;
        if matches!(
            send_event(&mut ctx, WorkerEvent::UpdaterState { gen, phase }).await,
            SendOutcome::Interrupted
        ) {
            result.stopped = true;
            result.duration = started.elapsed();
            return UpdaterExit::Finished(result);
        }
    }

    let active = ctx.active.clone();
    match index_partitions(&mut ctx, &active, &mut result).await {
        Err(reason) => return UpdaterExit::Error(reason),
        Ok(PassOutcome::Reset) => return UpdaterExit::Reset,
        Ok(PassOutcome::Stopped) => {
            result.stopped = true;
            result.duration = started.elapsed();
            return UpdaterExit::Finished(result);
        }
        Ok(PassOutcome::Done) => {}
    }

    if *ctx.stop.borrow() != StopSignal::Run {
        result.stopped = true;
        result.duration = started.elapsed();
        return UpdaterExit::Finished(result);
    }

    let gen = ctx.gen;
    if matches!(
        send_event(
            &mut ctx,
            WorkerEvent::UpdaterState {
                gen,
                phase: UpdaterPhase::UpdatingPassive,
            },
        )
        .await,
        SendOutcome::Interrupted
    ) {
        result.stopped = true;
        result.duration = started.elapsed();
        return UpdaterExit::Finished(result);
    }

    let passive = ctx.passive.clone();
    match index_partitions(&mut ctx, &passive, &mut result).await {
        Err(reason) => UpdaterExit::Error(reason),
        Ok(PassOutcome::Reset) => UpdaterExit::Reset,
        Ok(outcome) => {
            result.stopped = matches!(outcome, PassOutcome::Stopped);
            result.duration = started.elapsed();
            UpdaterExit::Finished(result)
        }
    }
}

async fn index_partitions(
    ctx: &mut UpdaterContext,
    partitions: &[PartitionId],
    result: &mut UpdateResult,
) -> Result<PassOutcome, String> {
    for &partition in partitions {
        let mut cursor = ctx.seqs.get(&partition).copied().unwrap_or(0);
        let latest = ctx
            .dbset
            .partition_seq(partition)
            .await
            .map_err(|e| e.to_string())?;
        if latest < cursor {
            tracing::warn!(partition, cursor, latest, "partition feed went backwards");
            return Ok(PassOutcome::Reset);
        }
        loop {
            if *ctx.stop.borrow() == StopSignal::Immediately {
                return Ok(PassOutcome::Stopped);
            }
            let changes = ctx
                .dbset
                .changes_since(partition, cursor, ctx.batch_limit)
                .await
                .map_err(|e| e.to_string())?;
            if changes.is_empty() {
                break;
            }
            let mut docs = Vec::with_capacity(changes.len());
            for change in &changes {
                cursor = change.seq;
                if change.deleted {
                    result.docs_deleted += 1;
                    docs.push(DocUpdate {
                        id: change.id.clone(),
                        seq: change.seq,
                        deleted: true,
                        view_rows: Vec::new(),
                    });
                } else {
                    result.docs_indexed += 1;
                    docs.push(DocUpdate {
                        id: change.id.clone(),
                        seq: change.seq,
                        deleted: false,
                        view_rows: ctx.mapper.map(change),
                    });
                }
            }
            ctx.seqs.insert(partition, cursor);
            let gen = ctx.gen;
            let batch = IndexedBatch {
                partition,
                seq: cursor,
                docs,
            };
            if matches!(
                send_event(ctx, WorkerEvent::UpdaterBatch { gen, batch }).await,
                SendOutcome::Interrupted
            ) {
                return Ok(PassOutcome::Stopped);
            }
        }
    }
    Ok(PassOutcome::Done)
}

/// Send an event, racing the stop signal so a full mailbox cannot wedge a
/// stop request.
async fn send_event(ctx: &mut UpdaterContext, event: WorkerEvent) -> SendOutcome {
    loop {
        tokio::select! {
            permit = ctx.events.reserve() => {
                return match permit {
                    Ok(permit) => {
                        permit.send(ControlMsg::Worker(event));
                        SendOutcome::Sent
                    }
                    Err(_) => SendOutcome::Interrupted,
                };
            }
            changed = ctx.stop.changed() => {
                if changed.is_err() || *ctx.stop.borrow() == StopSignal::Immediately {
                    return SendOutcome::Interrupted;
                }
            }
        }
    }
}
