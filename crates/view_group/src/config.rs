//! Tunables for a view-group controller. Every knob has a compiled-in
//! default and an environment override, so deployments can retune without
//! a rebuild.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::Signature;

pub const DEFAULT_COMMIT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_AUTO_UPDATE_THRESHOLD: u64 = 20_000;
pub const DEFAULT_PURGE_CHUNK_BYTES: usize = 5_120;
pub const DEFAULT_HISTORY_SIZE: usize = 20;
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_UPDATER_BATCH: usize = 512;

/// Depth of the controller mailbox shared by client requests and worker
/// events.
pub const MAILBOX_DEPTH: usize = 1_024;

/// Highest partition count a group may be defined with.
pub const MAX_NUM_PARTITIONS: u32 = u16::MAX as u32;

#[derive(Clone, Debug)]
pub struct GroupConfig {
    /// Directory holding the group's index file(s).
    pub dir: PathBuf,
    /// Name of the database set this group indexes.
    pub set_name: String,
    /// Design-document-derived group name.
    pub name: String,
    /// Content signature of the compiled view definitions.
    pub signature: Signature,
    /// Language tag reported in group info.
    pub language: String,
    /// Delay before a non-fsync checkpoint after soft progress.
    pub commit_delay: Duration,
    /// Pending-change count above which an idle replica group updates
    /// itself.
    pub auto_update_threshold: u64,
    /// Guided-purge chunk size; the cleaner checks for cancellation
    /// between chunks.
    pub purge_chunk_bytes: usize,
    /// Entries kept per history ring (updates, compactions, cleanups).
    pub history_size: usize,
    /// Timeout for non-critical cross-controller calls (e.g. replica
    /// info).
    pub call_timeout: Duration,
    /// Max document changes per updater batch.
    pub updater_batch: usize,
    /// Start the cleaner automatically after role changes. Off means the
    /// cleaner only runs on an explicit `trigger_cleanup`.
    pub auto_cleanup: bool,
}

impl GroupConfig {
    pub fn new(
        dir: impl Into<PathBuf>,
        set_name: impl Into<String>,
        name: impl Into<String>,
        signature: Signature,
    ) -> Self {
        Self {
            dir: dir.into(),
            set_name: set_name.into(),
            name: name.into(),
            signature,
            language: "javascript".to_string(),
            commit_delay: env_duration_ms("VIEW_GROUP_COMMIT_DELAY_MS", DEFAULT_COMMIT_DELAY),
            auto_update_threshold: env_parse(
                "VIEW_GROUP_AUTO_UPDATE_THRESHOLD",
                DEFAULT_AUTO_UPDATE_THRESHOLD,
            ),
            purge_chunk_bytes: env_parse("VIEW_GROUP_PURGE_CHUNK_BYTES", DEFAULT_PURGE_CHUNK_BYTES),
            history_size: env_parse("VIEW_GROUP_HISTORY_SIZE", DEFAULT_HISTORY_SIZE),
            call_timeout: env_duration_ms("VIEW_GROUP_CALL_TIMEOUT_MS", DEFAULT_CALL_TIMEOUT),
            updater_batch: env_parse("VIEW_GROUP_UPDATER_BATCH", DEFAULT_UPDATER_BATCH),
            auto_cleanup: true,
        }
    }
}

fn env_parse<T: FromStr + Copy>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_duration_ms(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
