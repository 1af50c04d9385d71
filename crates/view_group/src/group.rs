//! Group state: the durable header, the trees it references, the open
//! index file, and the snapshot/info types handed to clients.

use std::fs;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use crate::bitmask::Bitmask;
use crate::config::GroupConfig;
use crate::controller::GroupHandle;
use crate::dbset::DocChange;
use crate::error::{Error, Result};
use crate::file::{self, FileRef, IndexFile};
use crate::header::{GroupHeader, PendingTransition, ViewState};
use crate::roles::SeqMap;
use crate::stats::GroupStats;
use crate::tree::KeyTree;
use crate::{PartitionId, Signature};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupType {
    Main,
    Replica,
}

impl GroupType {
    pub fn file_prefix(self) -> &'static str {
        match self {
            GroupType::Main => "main",
            GroupType::Replica => "replica",
        }
    }
}

/// The map-executor seam. The executor compiles the group's view
/// definitions elsewhere; the updater only needs document-to-rows.
pub trait ViewMapper: Send + Sync + 'static {
    fn view_count(&self) -> usize;

    /// Rows emitted for one document, one list per view. Not called for
    /// deletions.
    fn map(&self, change: &DocChange) -> Vec<Vec<(Bytes, Bytes)>>;
}

/// Maps every document to a single `(id, body)` row per view. Stands in
/// for the real executor in tests.
pub struct IdentityMapper {
    views: usize,
}

impl IdentityMapper {
    pub fn new(views: usize) -> Self {
        Self { views }
    }
}

impl ViewMapper for IdentityMapper {
    fn view_count(&self) -> usize {
        self.views
    }

    fn map(&self, change: &DocChange) -> Vec<Vec<(Bytes, Bytes)>> {
        (0..self.views)
            .map(|_| vec![(change.id.clone(), change.body.clone())])
            .collect()
    }
}

/// Controller-owned group state.
pub struct Group {
    pub group_type: GroupType,
    pub signature: Signature,
    pub header: GroupHeader,
    pub id_tree: KeyTree,
    pub views: Vec<KeyTree>,
    pub file: IndexFile,
    pub file_ref: Arc<FileRef>,
    /// Uncommitted tree or header changes exist.
    pub dirty: bool,
}

impl Group {
    /// Open the group's current index file, or initialise a fresh one.
    ///
    /// A damaged file (anything unrecoverable except EMFILE) is deleted
    /// and replaced; when a main group hits this during initialisation its
    /// replica file goes too, since the pair is only meaningful together.
    pub fn open(config: &GroupConfig, group_type: GroupType, view_count: usize) -> Result<Group> {
        fs::create_dir_all(&config.dir)?;
        match Self::try_open(config, group_type, view_count) {
            Err(err) if err.is_unrecoverable_load() => {
                tracing::warn!(
                    signature = %config.signature,
                    group_type = group_type.file_prefix(),
                    error = %err,
                    "discarding damaged index file"
                );
                file::delete_all(&config.dir, group_type, &config.signature)?;
                if group_type == GroupType::Main {
                    file::delete_all(&config.dir, GroupType::Replica, &config.signature)?;
                }
                Self::try_open(config, group_type, view_count)
            }
            other => other,
        }
    }

    fn try_open(config: &GroupConfig, group_type: GroupType, view_count: usize) -> Result<Group> {
        let signature = config.signature;
        let (path, mut file) =
            match file::find_latest(&config.dir, group_type, &signature)? {
                Some((path, _)) => {
                    let file = IndexFile::open(&path)?;
                    (path, file)
                }
                None => {
                    let path = file::file_path(&config.dir, group_type, &signature, 1);
                    let mut file = IndexFile::create(&path)?;
                    file.reset(&signature)?;
                    (path, file)
                }
            };

        let header = match file.load_latest_header()? {
            None => {
                file.reset(&signature)?;
                GroupHeader::default()
            }
            Some(payload) => {
                let (found_sig, header) = GroupHeader::decode(&payload)?;
                if found_sig != signature {
                    tracing::info!(
                        expected = %signature,
                        found = %found_sig,
                        "index file belongs to another signature, resetting"
                    );
                    file.reset(&signature)?;
                    GroupHeader::default()
                } else {
                    header
                }
            }
        };

        let mut group = Group {
            group_type,
            signature,
            header,
            id_tree: KeyTree::new(),
            views: vec![KeyTree::new(); view_count],
            file,
            file_ref: Arc::new(FileRef::new(path)),
            dirty: false,
        };
        group.load_trees(view_count)?;
        Ok(group)
    }

    fn load_trees(&mut self, view_count: usize) -> Result<()> {
        if self.header.is_defined() && self.header.view_states.len() != view_count {
            return Err(Error::CorruptHeader(format!(
                "header has {} views, group has {view_count}",
                self.header.view_states.len()
            )));
        }
        if let Some(ptr) = self.header.id_tree_root {
            self.id_tree = KeyTree::decode(&self.file.read_block(ptr)?)?;
        }
        for (i, state) in self.header.view_states.clone().iter().enumerate() {
            if let Some(ptr) = state.root {
                self.views[i] = KeyTree::decode(&self.file.read_block(ptr)?)?;
            }
        }
        Ok(())
    }

    /// Re-prepare the group from disk, dropping in-memory state. Used on
    /// an updater `reset` exit.
    pub fn reload(&mut self, config: &GroupConfig) -> Result<()> {
        let view_count = self.views.len();
        let fresh = Group::open(config, self.group_type, view_count)?;
        self.header = fresh.header;
        self.id_tree = fresh.id_tree;
        self.views = fresh.views;
        self.file = fresh.file;
        self.file_ref = fresh.file_ref;
        self.dirty = false;
        Ok(())
    }

    /// Append tree snapshots plus a header referencing them. `fsync` makes
    /// it a commit; without it this is a checkpoint.
    pub fn write_header(&mut self, fsync: bool) -> Result<()> {
        let id_ptr = self.file.append_block(&self.id_tree.encode())?;
        let mut view_states = Vec::with_capacity(self.views.len());
        for tree in &self.views {
            view_states.push(ViewState {
                root: Some(self.file.append_block(&tree.encode())?),
                seqs: self.header.roles.seqs.clone(),
                purge_seqs: self.header.roles.purge_seqs.clone(),
            });
        }
        self.header.id_tree_root = Some(id_ptr);
        self.header.view_states = view_states;
        self.header.validate()?;
        self.file.append_header(&self.header.encode(&self.signature))?;
        if fsync {
            self.file.sync()?;
        }
        self.dirty = false;
        Ok(())
    }

    pub fn data_size(&self) -> u64 {
        self.id_tree.data_size() + self.views.iter().map(KeyTree::data_size).sum::<u64>()
    }

    /// Live readers of the current file, excluding the controller itself.
    pub fn reader_count(&self) -> usize {
        Arc::strong_count(&self.file_ref) - 1
    }
}

/// A reference-counted read view of the group. Holding it keeps the
/// backing file alive across a compaction swap.
#[derive(Clone, Debug)]
pub struct GroupSnapshot {
    pub signature: Signature,
    pub group_type: GroupType,
    pub header: GroupHeader,
    pub id_tree: KeyTree,
    pub views: Vec<KeyTree>,
    /// Partitions the replica group currently serves as active; zero when
    /// the group has no replica.
    pub active_replicas: Bitmask,
    /// Handle to the replica group, for callers that must also read the
    /// replica side.
    pub replica: Option<GroupHandle>,
    file_ref: Arc<FileRef>,
}

impl GroupSnapshot {
    pub(crate) fn new(group: &Group, active_replicas: Bitmask, replica: Option<GroupHandle>) -> Self {
        Self {
            signature: group.signature,
            group_type: group.group_type,
            header: group.header.clone(),
            id_tree: group.id_tree.clone(),
            views: group.views.clone(),
            active_replicas,
            replica,
            file_ref: group.file_ref.clone(),
        }
    }

    pub fn file_path(&self) -> &std::path::Path {
        self.file_ref.path()
    }
}

/// Progress of a running updater, surfaced in group info.
#[derive(Clone, Debug, Default, Serialize)]
pub struct UpdateProgress {
    pub phase: String,
    pub docs_indexed: u64,
}

/// Structured status for monitoring surfaces; renders to JSON.
#[derive(Clone, Debug, Serialize)]
pub struct GroupInfo {
    pub set_name: String,
    pub name: String,
    pub signature: Signature,
    pub group_type: GroupType,
    pub language: String,
    pub disk_size: u64,
    pub data_size: u64,
    pub updater_running: bool,
    pub updater_state: Option<String>,
    pub update_progress: Option<UpdateProgress>,
    pub compact_running: bool,
    pub cleanup_running: bool,
    pub waiting_commit: bool,
    pub waiting_clients: usize,
    pub num_partitions: Option<u32>,
    pub seqs: SeqMap,
    pub purge_seqs: SeqMap,
    pub active_partitions: Vec<PartitionId>,
    pub passive_partitions: Vec<PartitionId>,
    pub cleanup_partitions: Vec<PartitionId>,
    pub pending_transition: Option<PendingTransition>,
    pub stats: GroupStats,
    /// Main groups only: partitions currently held by the replica.
    pub replica_partitions: Option<Vec<PartitionId>>,
    pub replicas_on_transfer: Option<Vec<PartitionId>>,
    pub replica_group_info: Option<Box<GroupInfo>>,
}
