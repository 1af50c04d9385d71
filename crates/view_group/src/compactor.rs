//! The on-line compactor.
//!
//! Rewrites a frozen snapshot of the group into `<file>.compact` and asks
//! the controller for a verdict. If the live group advanced past the
//! snapshot while the rewrite ran, the controller answers with a fresh
//! snapshot and the compactor rebuilds; otherwise the controller performs
//! the rename swap and the task exits. A stop verdict (or a dropped
//! controller) deletes the partial file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::error::Result;
use crate::file::IndexFile;
use crate::header::{GroupHeader, ViewState};
use crate::message::{
    CompactDone, CompactSnapshot, CompactVerdict, ControlMsg, WorkerEvent,
};
use crate::roles::SeqMap;
use crate::Signature;

pub struct CompactorContext {
    pub gen: u64,
    pub snapshot: CompactSnapshot,
    pub dst: PathBuf,
    pub signature: Signature,
    pub events: mpsc::Sender<ControlMsg>,
}

/// True when a compaction snapshot misses updates the live group already
/// indexed; the swap must not happen.
pub fn snapshot_behind(snapshot_seqs: &SeqMap, current_seqs: &SeqMap) -> bool {
    current_seqs
        .iter()
        .any(|(p, current)| snapshot_seqs.get(p).copied().unwrap_or(0) < *current)
}

pub async fn run(mut ctx: CompactorContext) {
    let started = Instant::now();
    let mut retries = 0u32;
    loop {
        let header = match build(&ctx.dst, &ctx.signature, &ctx.snapshot) {
            Ok(header) => header,
            Err(err) => {
                let _ = fs::remove_file(&ctx.dst);
                let _ = ctx
                    .events
                    .send(ControlMsg::Worker(WorkerEvent::CompactorDied {
                        gen: ctx.gen,
                        reason: err.to_string(),
                    }))
                    .await;
                return;
            }
        };

        let (verdict_tx, verdict_rx) = oneshot::channel();
        let done = CompactDone {
            path: ctx.dst.clone(),
            header,
            duration: started.elapsed(),
            retries,
            verdict: verdict_tx,
        };
        if ctx
            .events
            .send(ControlMsg::Worker(WorkerEvent::CompactDone {
                gen: ctx.gen,
                done,
            }))
            .await
            .is_err()
        {
            let _ = fs::remove_file(&ctx.dst);
            return;
        }

        match verdict_rx.await {
            Ok(CompactVerdict::Commit) => return,
            Ok(CompactVerdict::Retry(snapshot)) => {
                tracing::debug!(retries, "compaction snapshot fell behind, rebuilding");
                ctx.snapshot = snapshot;
                retries += 1;
            }
            Ok(CompactVerdict::Stop) | Err(_) => {
                let _ = fs::remove_file(&ctx.dst);
                return;
            }
        }
    }
}

fn build(dst: &Path, signature: &Signature, snapshot: &CompactSnapshot) -> Result<GroupHeader> {
    let mut file = IndexFile::create(dst)?;
    let mut header = snapshot.header.clone();
    let id_ptr = file.append_block(&snapshot.id_tree.encode())?;
    let mut view_states = Vec::with_capacity(snapshot.views.len());
    for tree in &snapshot.views {
        view_states.push(ViewState {
            root: Some(file.append_block(&tree.encode())?),
            seqs: header.roles.seqs.clone(),
            purge_seqs: header.roles.purge_seqs.clone(),
        });
    }
    header.id_tree_root = Some(id_ptr);
    header.view_states = view_states;
    file.append_header(&header.encode(signature))?;
    file.sync()?;
    Ok(header)
}
