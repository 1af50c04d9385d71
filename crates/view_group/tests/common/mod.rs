//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use view_group::group::GroupType;
use view_group::header::GroupHeader;
use view_group::{
    open_group, GroupConfig, GroupHandle, IdentityMapper, MemDbSet, Signature,
};

/// Upper bound for deadline-poll loops.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TestGroup {
    pub handle: GroupHandle,
    pub db: Arc<MemDbSet>,
    pub config: GroupConfig,
    /// Kept for its Drop; removing the directory tears the group down.
    pub dir: TempDir,
}

impl TestGroup {
    /// Reopen the same group directory with a fresh controller, as a
    /// process restart would.
    pub fn reopen(&self) -> GroupHandle {
        open_group(
            self.config.clone(),
            self.db.clone(),
            Arc::new(IdentityMapper::new(2)),
        )
        .expect("reopen group")
    }
}

pub fn config_for(dir: &TempDir, name: &str) -> GroupConfig {
    GroupConfig::new(
        dir.path(),
        "testset",
        name,
        Signature::from_seed(name.as_bytes()),
    )
}

/// Open a fresh two-view group backed by an in-memory database set.
pub fn open(name: &str) -> TestGroup {
    open_with(name, |_| {})
}

pub fn open_with(name: &str, tweak: impl FnOnce(&mut GroupConfig)) -> TestGroup {
    let dir = TempDir::new().expect("temp dir");
    let mut config = config_for(&dir, name);
    tweak(&mut config);
    let db = Arc::new(MemDbSet::new());
    let handle = open_group(config.clone(), db.clone(), Arc::new(IdentityMapper::new(2)))
        .expect("open group");
    TestGroup {
        handle,
        db,
        config,
        dir,
    }
}

/// Poll an async condition until it holds or the deadline passes.
pub async fn wait_until<F, Fut>(mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while Instant::now() < deadline {
        if cond().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Read the latest committed header straight off the group's index file.
/// Works on a copy so the scan can never disturb the live file.
pub fn read_disk_header(config: &GroupConfig, group_type: GroupType) -> (Signature, GroupHeader) {
    let (path, _) = view_group::file::find_latest(&config.dir, group_type, &config.signature)
        .expect("scan dir")
        .expect("group file present");
    let copy = path.with_extension("testcopy");
    std::fs::copy(&path, &copy).expect("copy index file");
    let mut file = view_group::file::IndexFile::open(&copy).expect("open index file copy");
    let payload = file
        .load_latest_header()
        .expect("scan headers")
        .expect("at least one header");
    let decoded = GroupHeader::decode(&payload).expect("decode header");
    let _ = std::fs::remove_file(&copy);
    decoded
}

/// Raw bytes of the group's current index file.
pub fn disk_file_bytes(config: &GroupConfig, group_type: GroupType) -> Vec<u8> {
    let (path, _) = view_group::file::find_latest(&config.dir, group_type, &config.signature)
        .expect("scan dir")
        .expect("group file present");
    std::fs::read(path).expect("read index file")
}
