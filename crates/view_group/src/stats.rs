//! Group activity counters and bounded history rings, plus the
//! process-wide registry monitoring surfaces read them from (keyed by
//! group signature).

use std::collections::{HashMap, VecDeque};
use std::sync::{OnceLock, RwLock};

use serde::Serialize;

use crate::Signature;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct UpdateRecord {
    pub docs_indexed: u64,
    pub docs_deleted: u64,
    pub duration_ms: u64,
    /// True when the run was cut short by a stop signal.
    pub stopped: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CompactionRecord {
    pub duration_ms: u64,
    pub retries: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CleanupRecord {
    pub removed: u64,
    pub duration_ms: u64,
    pub stopped: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct GroupStats {
    pub full_updates: u64,
    pub stopped_updates: u64,
    pub updater_errors: u64,
    pub compactions: u64,
    pub compactor_retries: u64,
    pub cleanups: u64,
    pub cleanup_stops: u64,
    /// Clients that had to park for a fresh snapshot or a pending
    /// transition.
    pub waiting_clients: u64,
    pub update_history: VecDeque<UpdateRecord>,
    pub compaction_history: VecDeque<CompactionRecord>,
    pub cleanup_history: VecDeque<CleanupRecord>,
    #[serde(skip)]
    history_size: usize,
}

impl GroupStats {
    pub fn new(history_size: usize) -> Self {
        Self {
            history_size: history_size.max(1),
            ..Self::default()
        }
    }

    pub fn record_update(&mut self, record: UpdateRecord) {
        if record.stopped {
            self.stopped_updates += 1;
        } else {
            self.full_updates += 1;
        }
        push_bounded(&mut self.update_history, record, self.history_size);
    }

    pub fn record_compaction(&mut self, record: CompactionRecord) {
        self.compactions += 1;
        push_bounded(&mut self.compaction_history, record, self.history_size);
    }

    pub fn record_cleanup(&mut self, record: CleanupRecord) {
        self.cleanups += 1;
        if record.stopped {
            self.cleanup_stops += 1;
        }
        push_bounded(&mut self.cleanup_history, record, self.history_size);
    }

    pub fn reset(&mut self) {
        let history_size = self.history_size;
        *self = Self::new(history_size);
    }
}

fn push_bounded<T>(ring: &mut VecDeque<T>, item: T, cap: usize) {
    ring.push_front(item);
    ring.truncate(cap);
}

type Registry = RwLock<HashMap<Signature, GroupStats>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Publish the current stats of a group; called by its controller after
/// every recorded event.
pub fn publish(signature: Signature, stats: &GroupStats) {
    registry()
        .write()
        .expect("stats registry lock")
        .insert(signature, stats.clone());
}

pub fn fetch(signature: &Signature) -> Option<GroupStats> {
    registry()
        .read()
        .expect("stats registry lock")
        .get(signature)
        .cloned()
}

/// Drop a terminated group's entry.
pub fn remove(signature: &Signature) {
    registry()
        .write()
        .expect("stats registry lock")
        .remove(signature);
}
