/// Everything a view-group operation can fail with. Clonable because one
/// failure is fanned out to every parked waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Operation attempted before `define_view`.
    #[error("view group is not defined")]
    ViewUndefined,
    #[error("view group is already defined")]
    ViewAlreadyDefined,
    /// The active/passive/cleanup lists of one request intersect.
    #[error("intersecting partition lists")]
    IntersectingLists,
    /// A partition id is out of range for the group, or the list is
    /// otherwise malformed.
    #[error("invalid partition list")]
    InvalidPartitionList,
    /// The underlying database for a partition (or the master database)
    /// was deleted while we still owned it.
    #[error("database deleted: {0}")]
    DbDeleted(String),
    #[error("too many open files")]
    TooManyOpenFiles,
    /// Replica operation on a group opened without replica support.
    #[error("group has no replica")]
    ReplicasNotSupported,
    /// The replica's active set no longer matches the requested
    /// partitions; the caller must re-request from the main group.
    #[error("active replica set changed, retry")]
    Retry,
    #[error("updater failed: {0}")]
    UpdaterError(String),
    #[error("cleaner died: {0}")]
    CleanerDied(String),
    #[error("compactor died: {0}")]
    CompactorDied(String),
    #[error("database set died: {0}")]
    DbSetDied(String),
    /// The controller has terminated; carries the exit reason.
    #[error("group shut down: {0}")]
    Shutdown(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("corrupt group header: {0}")]
    CorruptHeader(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        // EMFILE is the one open error callers are contracted to see
        // verbatim; everything else degrades to the io kind.
        match err.raw_os_error() {
            Some(24) => Error::TooManyOpenFiles,
            _ => Error::Io(err.to_string()),
        }
    }
}

impl Error {
    /// True for errors the startup loader treats as unrecoverable file
    /// damage (delete the stale file and start over).
    pub fn is_unrecoverable_load(&self) -> bool {
        matches!(self, Error::Io(_) | Error::CorruptHeader(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
