//! Object identity
//!
//! The kernel addresses objects by a 64-bit node id. Every distinct
//! `(device, inode)` pair of the source tree gets exactly one id, no matter
//! how many names lead to it, and keeps an `O_PATH` descriptor open for as
//! long as the kernel holds references to it.

use super::lower;
use crate::error::{Error, Result};
use fuser::{FileAttr, FileType};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Handle the kernel uses to address a cached object
pub type NodeId = u64;

/// Node id of the mount root
pub const ROOT_ID: NodeId = fuser::FUSE_ROOT_ID;

/// Kernel lookups never bring the root near this
const ROOT_REFCOUNT: u64 = u64::MAX / 2;

fn system_time(sec: i64, nsec: i64) -> SystemTime {
    let nanos = Duration::from_nanos(nsec.clamp(0, 999_999_999) as u64);
    if sec >= 0 {
        UNIX_EPOCH + Duration::from_secs(sec as u64) + nanos
    } else {
        UNIX_EPOCH - Duration::from_secs(sec.unsigned_abs()) + nanos
    }
}

/// Map the `S_IFMT` bits of a mode
pub fn file_type(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

/// Kernel attributes for `st`, reported under node id `ino`
pub fn stat_to_attr(st: &libc::stat, ino: NodeId) -> FileAttr {
    let mtime = system_time(st.st_mtime as i64, st.st_mtime_nsec as i64);
    FileAttr {
        ino,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: system_time(st.st_atime as i64, st.st_atime_nsec as i64),
        mtime,
        ctime: system_time(st.st_ctime as i64, st.st_ctime_nsec as i64),
        // Linux stat has no birth time
        crtime: mtime,
        kind: file_type(st.st_mode),
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: 0,
    }
}

struct Record {
    fd: Arc<OwnedFd>,
    dev: u64,
    ino: u64,
    refcount: u64,
}

struct Arena {
    next_id: NodeId,
    records: HashMap<NodeId, Record>,
    by_identity: HashMap<(u64, u64), NodeId>,
}

/// One record per live source object
pub struct IdentityCache {
    arena: Mutex<Arena>,
}

impl IdentityCache {
    /// Create a cache whose root record points at `root`
    pub fn new(root: &Path) -> Result<Self> {
        let fd = lower::open_root(root)?;
        let st = lower::stat_fd(fd.as_fd())?;
        let dev = st.st_dev as u64;
        let ino = st.st_ino as u64;

        let mut records = HashMap::new();
        records.insert(
            ROOT_ID,
            Record {
                fd: Arc::new(fd),
                dev,
                ino,
                refcount: ROOT_REFCOUNT,
            },
        );
        let mut by_identity = HashMap::new();
        by_identity.insert((dev, ino), ROOT_ID);

        Ok(Self {
            arena: Mutex::new(Arena {
                next_id: ROOT_ID + 1,
                records,
                by_identity,
            }),
        })
    }

    /// Descriptor of a cached object.
    ///
    /// The returned descriptor stays valid even if the record is released
    /// while the caller still uses it.
    pub fn get(&self, id: NodeId) -> Result<Arc<OwnedFd>> {
        self.arena
            .lock()
            .records
            .get(&id)
            .map(|r| Arc::clone(&r.fd))
            .ok_or_else(|| Error::NotFound(format!("node {}", id)))
    }

    /// Look `name` up under `parent` and return its node id with one more
    /// reference, creating the record on first sight
    pub fn resolve_or_create(&self, parent: NodeId, name: &OsStr) -> Result<(NodeId, libc::stat)> {
        let parent_fd = self.get(parent)?;
        let fd = lower::open_path(parent_fd.as_fd(), name)?;
        let st = lower::stat_fd(fd.as_fd())?;
        let id = self.insert_or_ref(st.st_dev as u64, st.st_ino as u64, fd)?;
        Ok((id, st))
    }

    fn insert_or_ref(&self, dev: u64, ino: u64, fd: OwnedFd) -> Result<NodeId> {
        let mut arena = self.arena.lock();

        if let Some(&id) = arena.by_identity.get(&(dev, ino)) {
            if let Some(record) = arena.records.get_mut(&id) {
                record.refcount += 1;
                // `fd` is dropped here, the record keeps its own
                return Ok(id);
            }
        }

        arena
            .records
            .try_reserve(1)
            .map_err(|_| Error::OutOfMemory)?;
        arena
            .by_identity
            .try_reserve(1)
            .map_err(|_| Error::OutOfMemory)?;

        let id = arena.next_id;
        arena.next_id += 1;
        arena.records.insert(
            id,
            Record {
                fd: Arc::new(fd),
                dev,
                ino,
                refcount: 1,
            },
        );
        arena.by_identity.insert((dev, ino), id);
        debug!("new node {} for dev={} ino={}", id, dev, ino);
        Ok(id)
    }

    /// Drop `count` references; the record goes away at zero
    pub fn release(&self, id: NodeId, count: u64) {
        let mut arena = self.arena.lock();
        let Some(record) = arena.records.get_mut(&id) else {
            return;
        };
        record.refcount = record.refcount.saturating_sub(count);
        if record.refcount > 0 {
            return;
        }

        if let Some(record) = arena.records.remove(&id) {
            arena.by_identity.remove(&(record.dev, record.ino));
            debug!("released node {}", id);
        }
    }

    /// Current reference count of a record
    pub fn refcount(&self, id: NodeId) -> Option<u64> {
        self.arena.lock().records.get(&id).map(|r| r.refcount)
    }

    /// Number of live records, root included
    pub fn len(&self) -> usize {
        self.arena.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
