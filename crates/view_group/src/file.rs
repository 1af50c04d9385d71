//! Index-file protocol.
//!
//! One group owns one append-only file named
//! `<dir>/<type>_<hex(signature)>.view.<N>`, where `N` is a monotonically
//! increasing suffix bumped on every compaction swap. The file is a
//! sequence of checksummed frames: data blocks (tree snapshots) and
//! headers. Loading scans forward and keeps the last valid header; a
//! short or corrupt frame ends the scan, so a torn tail rolls back to the
//! previous commit.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::Result;
use crate::group::GroupType;
use crate::header::BlockPtr;
use crate::Signature;

const FRAME_BLOCK: u8 = 1;
const FRAME_HEADER: u8 = 2;
const FRAME_HEAD_LEN: usize = 1 + 4 + 4;

/// Shared ownership of the on-disk file. Snapshots hold a clone; when the
/// controller swaps in a compacted file it marks the old one obsolete and
/// the last reference to drop unlinks it.
#[derive(Debug)]
pub struct FileRef {
    path: PathBuf,
    obsolete: AtomicBool,
}

impl FileRef {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            obsolete: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }
}

impl Drop for FileRef {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::Acquire) {
            if let Err(err) = fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %err, "obsolete index file not removed");
            }
        }
    }
}

/// Base name (without suffix) for a group file.
pub fn file_basename(group_type: GroupType, signature: &Signature) -> String {
    format!("{}_{}.view", group_type.file_prefix(), signature.to_hex())
}

pub fn file_path(dir: &Path, group_type: GroupType, signature: &Signature, suffix: u64) -> PathBuf {
    dir.join(format!(
        "{}.{suffix}",
        file_basename(group_type, signature)
    ))
}

/// Scan the directory for the highest-suffixed file of this group.
pub fn find_latest(
    dir: &Path,
    group_type: GroupType,
    signature: &Signature,
) -> Result<Option<(PathBuf, u64)>> {
    let base = file_basename(group_type, signature);
    let prefix = format!("{base}.");
    let mut best: Option<(PathBuf, u64)> = None;
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(rest) = name.strip_prefix(&prefix) else {
            continue;
        };
        let Ok(suffix) = rest.parse::<u64>() else {
            continue;
        };
        if best.as_ref().is_none_or(|(_, n)| suffix > *n) {
            best = Some((entry.path(), suffix));
        }
    }
    Ok(best)
}

/// Delete every suffixed file of a group, e.g. a stale replica index left
/// behind by a failed main-group load.
pub fn delete_all(dir: &Path, group_type: GroupType, signature: &Signature) -> Result<()> {
    while let Some((path, _)) = find_latest(dir, group_type, signature)? {
        fs::remove_file(&path)?;
    }
    Ok(())
}

pub fn compact_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".compact");
    PathBuf::from(name)
}

/// Parse the numeric suffix out of a group file path.
pub fn path_suffix(path: &Path) -> Option<u64> {
    path.extension()?.to_str()?.parse().ok()
}

/// An open index file positioned for appends.
pub struct IndexFile {
    path: PathBuf,
    file: File,
    end: u64,
}

impl IndexFile {
    /// Create (or truncate) a fresh file.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            end: 0,
        })
    }

    /// Open an existing file for appends. The caller is expected to call
    /// [`IndexFile::load_latest_header`] next, which establishes the valid
    /// end of the file.
    ///
    /// A terminating controller leaves its file read-only; reopening the
    /// group claims it back.
    pub fn open(path: &Path) -> Result<Self> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                let mut perms = fs::metadata(path)?.permissions();
                #[allow(clippy::permissions_set_readonly_false)]
                perms.set_readonly(false);
                fs::set_permissions(path, perms)?;
                OpenOptions::new().read(true).write(true).open(path)?
            }
            Err(err) => return Err(err.into()),
        };
        let end = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            end,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn disk_size(&self) -> u64 {
        self.end
    }

    fn append_frame(&mut self, kind: u8, payload: &[u8]) -> Result<u64> {
        let mut frame = BytesMut::with_capacity(FRAME_HEAD_LEN + payload.len());
        frame.put_u8(kind);
        frame.put_u32_le(payload.len() as u32);
        frame.put_u32_le(crc32fast::hash(payload));
        frame.put_slice(payload);
        self.file.seek(SeekFrom::Start(self.end))?;
        self.file.write_all(&frame)?;
        let payload_offset = self.end + FRAME_HEAD_LEN as u64;
        self.end += frame.len() as u64;
        Ok(payload_offset)
    }

    /// Append a data block; returns where the payload landed so a header
    /// can reference it.
    pub fn append_block(&mut self, payload: &[u8]) -> Result<BlockPtr> {
        let offset = self.append_frame(FRAME_BLOCK, payload)?;
        Ok(BlockPtr {
            offset,
            len: payload.len() as u32,
        })
    }

    pub fn append_header(&mut self, payload: &[u8]) -> Result<()> {
        self.append_frame(FRAME_HEADER, payload)?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Read back a block referenced by a header.
    pub fn read_block(&mut self, ptr: BlockPtr) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(ptr.offset))?;
        let mut payload = vec![0u8; ptr.len as usize];
        self.file.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Scan all frames and return the payload of the last valid header.
    /// Trailing garbage past the last valid frame is truncated so future
    /// appends land on a clean boundary.
    pub fn load_latest_header(&mut self) -> Result<Option<Vec<u8>>> {
        let file_len = self.file.metadata()?.len();
        self.file.seek(SeekFrom::Start(0))?;
        let mut offset = 0u64;
        let mut valid_end = 0u64;
        let mut latest: Option<Vec<u8>> = None;
        let mut head = [0u8; FRAME_HEAD_LEN];
        loop {
            if offset + FRAME_HEAD_LEN as u64 > file_len {
                break;
            }
            self.file.read_exact(&mut head)?;
            let mut cursor = &head[..];
            let kind = cursor.get_u8();
            let len = cursor.get_u32_le() as u64;
            let crc = cursor.get_u32_le();
            if kind != FRAME_BLOCK && kind != FRAME_HEADER {
                break;
            }
            if offset + FRAME_HEAD_LEN as u64 + len > file_len {
                break;
            }
            let mut payload = vec![0u8; len as usize];
            self.file.read_exact(&mut payload)?;
            if crc32fast::hash(&payload) != crc {
                break;
            }
            offset += FRAME_HEAD_LEN as u64 + len;
            valid_end = offset;
            if kind == FRAME_HEADER {
                latest = Some(payload);
            }
        }
        if valid_end < file_len {
            self.file.set_len(valid_end)?;
        }
        self.end = valid_end;
        self.file.seek(SeekFrom::Start(valid_end))?;
        Ok(latest)
    }

    /// Truncate to zero and write an empty header for this signature.
    pub fn reset(&mut self, signature: &Signature) -> Result<()> {
        self.file.set_len(0)?;
        self.end = 0;
        let empty = crate::header::GroupHeader::default();
        self.append_header(&empty.encode(signature))?;
        self.sync()
    }

    pub fn set_readonly(&self) -> Result<()> {
        let mut perms = self.file.metadata()?.permissions();
        perms.set_readonly(true);
        self.file.set_permissions(perms)?;
        Ok(())
    }
}
