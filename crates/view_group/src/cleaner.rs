//! The cleanup worker.
//!
//! Runs guided purge over a clone of the id tree and every view tree,
//! removing entries of partitions marked for cleanup. The cancel flag is
//! checked between purge chunks, so a stop lands within one chunk and the
//! controller still receives the partial progress. The result travels
//! back through the task's join handle; the controller polls it in its
//! main loop.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use crate::bitmask::Bitmask;
use crate::message::CleanResult;
use crate::tree::KeyTree;

pub struct CleanerContext {
    pub id_tree: KeyTree,
    pub views: Vec<KeyTree>,
    pub cbitmask: Bitmask,
    pub chunk_bytes: usize,
    pub cancel: Arc<AtomicBool>,
}

pub async fn run(mut ctx: CleanerContext) -> CleanResult {
    let started = Instant::now();
    let mut removed = 0u64;
    let mut completed = true;

    let outcome = ctx
        .id_tree
        .guided_purge(&ctx.cbitmask, ctx.chunk_bytes, &ctx.cancel);
    removed += outcome.removed;
    completed &= outcome.completed;

    for view in ctx.views.iter_mut() {
        if !completed {
            break;
        }
        tokio::task::yield_now().await;
        let outcome = view.guided_purge(&ctx.cbitmask, ctx.chunk_bytes, &ctx.cancel);
        removed += outcome.removed;
        completed &= outcome.completed;
    }

    CleanResult {
        id_tree: ctx.id_tree,
        views: ctx.views,
        removed,
        duration: started.elapsed(),
        completed,
    }
}
