//! Passthrough FUSE filesystem
//!
//! Mirrors a source directory. Lookups go through the identity cache,
//! size-changing operations are charged to the space accountant, and
//! extended attributes live in the attribute store.

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use std::ffi::OsStr;
use std::io;
use std::os::fd::AsFd;
use std::os::unix::fs::{DirEntryExt, FileExt, FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info};

use super::handle::{DirEntry, HandleTable};
use super::inode::{stat_to_attr, IdentityCache, NodeId};
use super::lower::{self, TimeSpec};
use crate::error::{Error, Result};
use crate::quota::{total_size, SpaceAccountant};
use crate::xattr::{AttrReply, AttributeStore, SetMode};

/// Owner applied to newly created entries
type Owner = Option<(u32, u32)>;

fn bad_handle(fh: u64) -> Error {
    debug!("unknown file handle {}", fh);
    Error::Io(io::Error::from_raw_os_error(libc::EBADF))
}

fn dir_entry_kind(ft: std::fs::FileType) -> FileType {
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

fn time_spec(t: Option<TimeOrNow>) -> TimeSpec {
    match t {
        None => TimeSpec::Omit,
        Some(TimeOrNow::Now) => TimeSpec::Now,
        Some(TimeOrNow::SpecificTime(t)) => TimeSpec::At(t),
    }
}

/// Size of `path`, or zero if it does not exist
fn size_if_present(path: &Path) -> Result<u64> {
    match total_size(path) {
        Ok(size) => Ok(size),
        Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

/// True if both paths name the same source object
fn same_object(a: &Path, b: &Path) -> Result<bool> {
    let (a, b) = match (std::fs::symlink_metadata(a), std::fs::symlink_metadata(b)) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(e), _) | (_, Err(e)) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        (Err(e), _) | (_, Err(e)) => return Err(e.into()),
    };
    Ok(a.dev() == b.dev() && a.ino() == b.ino())
}

/// Passthrough filesystem over a source directory
pub struct UpperFs {
    /// Node id to source object mapping
    nodes: Arc<IdentityCache>,
    /// Write-time quota
    quota: Arc<SpaceAccountant>,
    /// Attribute store, `None` when extended attributes are disabled
    attrs: Option<Arc<AttributeStore>>,
    /// Open files and directory snapshots
    handles: HandleTable,
    /// Entry and attribute cache timeout handed to the kernel
    ttl: Duration,
    /// Chown new entries to the caller
    adopt_owner: bool,
}

impl UpperFs {
    pub fn new(
        nodes: Arc<IdentityCache>,
        quota: Arc<SpaceAccountant>,
        attrs: Option<Arc<AttributeStore>>,
        ttl: Duration,
    ) -> Self {
        Self {
            nodes,
            quota,
            attrs,
            handles: HandleTable::new(),
            ttl,
            adopt_owner: unsafe { libc::geteuid() } == 0,
        }
    }

    fn path_of(&self, ino: NodeId) -> Result<PathBuf> {
        let fd = self.nodes.get(ino)?;
        lower::fd_path(fd.as_fd())
    }

    fn owner(&self, req: &Request<'_>) -> Owner {
        self.adopt_owner.then(|| (req.uid(), req.gid()))
    }

    fn store(&self) -> Result<&AttributeStore> {
        self.attrs
            .as_deref()
            .ok_or_else(|| Error::BackendUnavailable("extended attributes disabled".to_string()))
    }

    /// Run the initial quota scan before `path` changes on disk, so the
    /// scan cannot already include a change that is then charged again
    fn prepare(&self, path: &Path) -> Result<()> {
        if self.quota.covers(path) {
            self.quota.remaining()?;
        }
        Ok(())
    }

    /// Record a size change that already happened on disk
    fn charge_after(&self, path: &Path, delta: i64) -> Result<()> {
        if delta != 0 && self.quota.covers(path) {
            self.quota.charge(delta)?;
        }
        Ok(())
    }

    /// Finish an entry whose reference was just taken. On failure the kernel
    /// never sees the entry and never forgets it, so the reference is dropped here.
    fn settle<T>(&self, id: NodeId, finish: impl FnOnce() -> Result<T>) -> Result<T> {
        finish().inspect_err(|_| self.nodes.release(id, 1))
    }

    /// Look up a freshly created entry, hand it to `owner` and charge its size
    fn new_entry(&self, parent: NodeId, name: &OsStr, owner: Owner) -> Result<FileAttr> {
        let (id, mut st) = self.nodes.resolve_or_create(parent, name)?;
        self.settle(id, || {
            if let Some((uid, gid)) = owner {
                let fd = self.nodes.get(id)?;
                lower::chown(fd.as_fd(), Some(uid), Some(gid))?;
                st = lower::stat_fd(fd.as_fd())?;
            }
            self.charge_after(&self.path_of(parent)?.join(name), st.st_size as i64)?;
            Ok(stat_to_attr(&st, id))
        })
    }

    fn lookup_entry(&self, parent: NodeId, name: &OsStr) -> Result<FileAttr> {
        let (id, st) = self.nodes.resolve_or_create(parent, name)?;
        Ok(stat_to_attr(&st, id))
    }

    fn attr(&self, ino: NodeId) -> Result<FileAttr> {
        let fd = self.nodes.get(ino)?;
        Ok(stat_to_attr(&lower::stat_fd(fd.as_fd())?, ino))
    }

    fn truncate(&self, ino: NodeId, fh: Option<u64>, size: u64) -> Result<()> {
        let fd = self.nodes.get(ino)?;
        let st = lower::stat_fd(fd.as_fd())?;
        let prior = st.st_size as u64;
        // Unlinked files were refunded when their last name went
        let covered = st.st_nlink > 0 && self.quota.covers(&lower::fd_path(fd.as_fd())?);
        let delta = size as i64 - prior as i64;

        if covered {
            if delta > 0 && self.quota.would_exceed()? {
                return Err(Error::QuotaExceeded);
            }
            self.quota.charge(delta)?;
        }

        let result = match fh.and_then(|fh| self.handles.file(fh)) {
            Some(file) => file.set_len(size).map_err(Error::from),
            None => lower::truncate(fd.as_fd(), size),
        };
        if let Err(e) = result {
            if covered {
                self.quota.charge(-delta)?;
            }
            return Err(e);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn set_attr(
        &self,
        ino: NodeId,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> Result<FileAttr> {
        let fd = self.nodes.get(ino)?;
        if let Some(mode) = mode {
            lower::chmod(fd.as_fd(), mode)?;
        }
        if uid.is_some() || gid.is_some() {
            lower::chown(fd.as_fd(), uid, gid)?;
        }
        if let Some(size) = size {
            self.truncate(ino, fh, size)?;
        }
        if atime.is_some() || mtime.is_some() {
            lower::set_times(fd.as_fd(), time_spec(atime), time_spec(mtime))?;
        }
        self.attr(ino)
    }

    fn make_node(
        &self,
        parent: NodeId,
        name: &OsStr,
        mode: u32,
        rdev: u32,
        owner: Owner,
    ) -> Result<FileAttr> {
        let dir = self.nodes.get(parent)?;
        self.prepare(&lower::fd_path(dir.as_fd())?.join(name))?;
        lower::mknod_at(dir.as_fd(), name, mode, rdev)?;
        self.new_entry(parent, name, owner)
    }

    fn make_dir(&self, parent: NodeId, name: &OsStr, mode: u32, owner: Owner) -> Result<FileAttr> {
        let dir = self.nodes.get(parent)?;
        self.prepare(&lower::fd_path(dir.as_fd())?.join(name))?;
        lower::mkdir_at(dir.as_fd(), name, mode)?;
        self.new_entry(parent, name, owner)
    }

    fn make_symlink(
        &self,
        parent: NodeId,
        name: &OsStr,
        target: &Path,
        owner: Owner,
    ) -> Result<FileAttr> {
        let dir = self.nodes.get(parent)?;
        self.prepare(&lower::fd_path(dir.as_fd())?.join(name))?;
        lower::symlink_at(target, dir.as_fd(), name)?;
        self.new_entry(parent, name, owner)
    }

    fn make_link(&self, ino: NodeId, newparent: NodeId, newname: &OsStr) -> Result<FileAttr> {
        let fd = self.nodes.get(ino)?;
        let dir = self.nodes.get(newparent)?;
        self.prepare(&lower::fd_path(dir.as_fd())?.join(newname))?;
        lower::link_at(fd.as_fd(), dir.as_fd(), newname)?;
        self.new_entry(newparent, newname, None)
    }

    /// Drop the attributes of a removed path
    fn forget_attributes(&self, path: &Path) -> Result<()> {
        if let Some(store) = &self.attrs {
            let dropped = store.remove_all(path)?;
            if dropped > 0 {
                debug!("dropped {} attributes of {:?}", dropped, path);
            }
        }
        Ok(())
    }

    fn remove_entry(&self, parent: NodeId, name: &OsStr, flags: i32) -> Result<()> {
        let dir = self.nodes.get(parent)?;
        let path = lower::fd_path(dir.as_fd())?.join(name);
        self.prepare(&path)?;
        let size = if self.quota.covers(&path) {
            total_size(&path)?
        } else {
            0
        };

        lower::unlink_at(dir.as_fd(), name, flags)?;
        self.charge_after(&path, -(size as i64))?;
        self.forget_attributes(&path)
    }

    fn move_entry(
        &self,
        parent: NodeId,
        name: &OsStr,
        newparent: NodeId,
        newname: &OsStr,
        flags: u32,
    ) -> Result<()> {
        let old_dir = self.nodes.get(parent)?;
        let new_dir = self.nodes.get(newparent)?;
        let from = lower::fd_path(old_dir.as_fd())?.join(name);
        let to = lower::fd_path(new_dir.as_fd())?.join(newname);
        let exchange = flags & libc::RENAME_EXCHANGE != 0;
        self.prepare(&from)?;
        self.prepare(&to)?;

        // Two names of one object: rename(2) leaves both in place
        if same_object(&from, &to)? {
            return lower::rename_at(old_dir.as_fd(), name, new_dir.as_fd(), newname, flags);
        }

        let crossing = self.quota.covers(&from) != self.quota.covers(&to);
        let moved = if crossing { total_size(&from)? } else { 0 };
        let replaced = if crossing || self.quota.covers(&to) {
            size_if_present(&to)?
        } else {
            0
        };

        lower::rename_at(old_dir.as_fd(), name, new_dir.as_fd(), newname, flags)?;

        if exchange {
            // Each side now holds what the other held
            if crossing {
                let delta = moved as i64 - replaced as i64;
                self.charge_after(&to, delta)?;
                self.charge_after(&from, -delta)?;
            }
        } else {
            if crossing {
                self.charge_after(&from, -(moved as i64))?;
                self.charge_after(&to, moved as i64)?;
            }
            self.charge_after(&to, -(replaced as i64))?;
        }

        if let Some(store) = &self.attrs {
            // Directories carry keys for everything below them
            let relocate = |old: &Path, new: &Path, path: &Path| -> Result<usize> {
                if std::fs::symlink_metadata(path)?.is_dir() {
                    store.rename_tree(old, new)
                } else {
                    store.rename_path(old, new)
                }
            };
            if exchange {
                let parked = PathBuf::from(format!("{}\0exchange", to.display()));
                relocate(&to, &parked, &from)?;
                relocate(&from, &to, &to)?;
                relocate(&parked, &from, &from)?;
            } else {
                store.remove_all(&to)?;
                relocate(&from, &to, &to)?;
            }
        }
        Ok(())
    }

    fn open_file(&self, ino: NodeId, flags: i32) -> Result<u64> {
        let fd = self.nodes.get(ino)?;
        let truncating = flags & libc::O_TRUNC != 0 && flags & libc::O_ACCMODE != libc::O_RDONLY;
        let prior = if truncating {
            self.prepare(&lower::fd_path(fd.as_fd())?)?;
            lower::stat_fd(fd.as_fd())?.st_size
        } else {
            0
        };

        let file = lower::reopen(fd.as_fd(), flags)?;
        if prior > 0 {
            self.charge_after(&lower::fd_path(fd.as_fd())?, -prior)?;
        }
        Ok(self.handles.insert_file(file))
    }

    fn create_file(
        &self,
        parent: NodeId,
        name: &OsStr,
        mode: u32,
        flags: i32,
        owner: Owner,
    ) -> Result<(FileAttr, u64)> {
        let dir = self.nodes.get(parent)?;
        self.prepare(&lower::fd_path(dir.as_fd())?.join(name))?;
        let existing = match lower::open_path(dir.as_fd(), name) {
            Ok(fd) => Some(lower::stat_fd(fd.as_fd())?.st_size),
            Err(_) => None,
        };

        let file = lower::create_at(dir.as_fd(), name, flags, mode)?;
        let attr = match existing {
            None => self.new_entry(parent, name, owner)?,
            Some(prior) => {
                let (id, st) = self.nodes.resolve_or_create(parent, name)?;
                self.settle(id, || {
                    let path = lower::fd_path(dir.as_fd())?.join(name);
                    self.charge_after(&path, st.st_size - prior)?;
                    Ok(stat_to_attr(&st, id))
                })?
            }
        };
        Ok((attr, self.handles.insert_file(file)))
    }

    fn read_file(&self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>> {
        let file = self.handles.file(fh).ok_or_else(|| bad_handle(fh))?;
        let mut buf = vec![0u8; size as usize];
        let n = file.read_at(&mut buf, offset as u64)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Write and charge only the growth of the file end
    fn write_file(&self, ino: NodeId, fh: u64, offset: i64, data: &[u8]) -> Result<u32> {
        let file = self.handles.file(fh).ok_or_else(|| bad_handle(fh))?;
        let offset = offset as u64;
        let path = self.path_of(ino)?;
        let meta = file.metadata()?;

        // Unlinked files were refunded when their last name went
        if meta.nlink() == 0 || !self.quota.covers(&path) {
            return Ok(file.write_at(data, offset)? as u32);
        }
        if self.quota.would_exceed()? {
            debug!("write to {:?} refused: quota exhausted", path);
            return Err(Error::QuotaExceeded);
        }

        let old_size = meta.len();
        let growth = |written: u64| (offset + written).saturating_sub(old_size) as i64;
        let predicted = growth(data.len() as u64);
        self.quota.charge(predicted)?;

        match file.write_at(data, offset) {
            Ok(n) => {
                let actual = growth(n as u64);
                if actual != predicted {
                    self.quota.charge(actual - predicted)?;
                }
                Ok(n as u32)
            }
            Err(e) => {
                self.quota.charge(-predicted)?;
                Err(e.into())
            }
        }
    }

    fn sync_file(&self, fh: u64, datasync: bool) -> Result<()> {
        let file = self.handles.file(fh).ok_or_else(|| bad_handle(fh))?;
        if datasync {
            file.sync_data()?;
        } else {
            file.sync_all()?;
        }
        Ok(())
    }

    fn open_dir(&self, ino: NodeId) -> Result<u64> {
        let fd = self.nodes.get(ino)?;
        let dir = lower::proc_path(fd.as_fd());
        // Source inode numbers throughout, like the entries read below
        let mut entries = vec![
            DirEntry {
                ino: lower::stat_fd(fd.as_fd())?.st_ino,
                kind: FileType::Directory,
                name: ".".into(),
            },
            DirEntry {
                ino: std::fs::metadata(dir.join(".."))?.ino(),
                kind: FileType::Directory,
                name: "..".into(),
            },
        ];
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            entries.push(DirEntry {
                ino: entry.ino(),
                kind: dir_entry_kind(entry.file_type()?),
                name: entry.file_name(),
            });
        }
        Ok(self.handles.insert_dir(entries))
    }

    fn fs_stats(&self, ino: NodeId) -> Result<nix::sys::statvfs::Statvfs> {
        let path = self.path_of(ino)?;
        Ok(nix::sys::statvfs::statvfs(path.as_path())?)
    }

    fn set_attribute(&self, ino: NodeId, name: &OsStr, value: &[u8], flags: i32) -> Result<()> {
        let store = self.store()?;
        let mode = SetMode::from_flags(flags)?;
        store.set(&self.path_of(ino)?, name, value, mode)
    }

    fn get_attribute(&self, ino: NodeId, name: &OsStr, size: u32) -> Result<AttrReply> {
        let store = self.store()?;
        store.get(&self.path_of(ino)?, name, size as usize)
    }

    fn list_attributes(&self, ino: NodeId, size: u32) -> Result<AttrReply> {
        let store = self.store()?;
        store.list(&self.path_of(ino)?, size as usize)
    }

    fn remove_attribute(&self, ino: NodeId, name: &OsStr) -> Result<()> {
        let store = self.store()?;
        store.remove(&self.path_of(ino)?, name)
    }
}

fn reply_xattr(result: Result<AttrReply>, reply: ReplyXattr) {
    match result {
        Ok(AttrReply::Size(n)) => reply.size(n as u32),
        Ok(AttrReply::Data(data)) => reply.data(&data),
        Err(e) => reply.error(e.to_errno()),
    }
}

fn reply_empty(result: Result<()>, reply: ReplyEmpty) {
    match result {
        Ok(()) => reply.ok(),
        Err(e) => reply.error(e.to_errno()),
    }
}

impl Filesystem for UpperFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> std::result::Result<(), libc::c_int> {
        info!(
            "upperfs ready (quota root {:?}, limit {:?}, xattr store {})",
            self.quota.root(),
            self.quota.limit(),
            if self.attrs.is_some() { "on" } else { "off" }
        );
        Ok(())
    }

    fn destroy(&mut self) {
        self.handles.clear();
        if let Some(store) = &self.attrs {
            if let Err(e) = store.close() {
                error!("Failed to close attribute store: {}", e);
            }
        }
        info!("upperfs unmounted");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);
        match self.lookup_entry(parent, name) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        debug!("forget(ino={}, nlookup={})", ino, nlookup);
        self.nodes.release(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);
        match self.attr(ino) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr(ino={}, mode={:?}, size={:?})", ino, mode, size);
        match self.set_attr(ino, mode, uid, gid, size, atime, mtime, fh) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);
        match self.nodes.get(ino).and_then(|fd| lower::read_link(fd.as_fd())) {
            Ok(target) => reply.data(&target),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod(parent={}, name={:?}, mode=0o{:o})", parent, name, mode);
        match self.make_node(parent, name, mode & !umask, rdev, self.owner(req)) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?}, mode=0o{:o})", parent, name, mode);
        match self.make_dir(parent, name, mode & !umask, self.owner(req)) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);
        reply_empty(self.remove_entry(parent, name, 0), reply);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);
        reply_empty(self.remove_entry(parent, name, libc::AT_REMOVEDIR), reply);
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink(parent={}, name={:?}, target={:?})", parent, link_name, target);
        match self.make_symlink(parent, link_name, target, self.owner(req)) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );
        reply_empty(self.move_entry(parent, name, newparent, newname, flags), reply);
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link(ino={}, newparent={}, newname={:?})", ino, newparent, newname);
        match self.make_link(ino, newparent, newname) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={})", ino, flags);
        match self.open_file(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);
        match self.read_file(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());
        match self.write_file(ino, fh, offset, data) {
            Ok(n) => reply.written(n),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush(ino={}, fh={})", ino, fh);
        if self.handles.file(fh).is_some() {
            reply.ok();
        } else {
            reply.error(libc::EBADF);
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);
        self.handles.remove(fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, fh={}, datasync={})", ino, fh, datasync);
        reply_empty(self.sync_file(fh, datasync), reply);
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!("opendir(ino={})", ino);
        match self.open_dir(ino) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, fh={}, offset={})", ino, fh, offset);
        let Some(entries) = self.handles.dir(fh) else {
            reply.error(libc::EBADF);
            return;
        };

        for (i, entry) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(entry.ino, (i + 1) as i64, entry.kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        debug!("releasedir(ino={}, fh={})", ino, fh);
        self.handles.remove(fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        debug!("statfs(ino={})", ino);
        match self.fs_stats(ino) {
            Ok(st) => reply.statfs(
                st.blocks() as u64,
                st.blocks_free() as u64,
                st.blocks_available() as u64,
                st.files() as u64,
                st.files_free() as u64,
                st.block_size() as u32,
                st.name_max() as u32,
                st.fragment_size() as u32,
            ),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        debug!("setxattr(ino={}, name={:?}, len={})", ino, name, value.len());
        reply_empty(self.set_attribute(ino, name, value, flags), reply);
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        debug!("getxattr(ino={}, name={:?}, size={})", ino, name, size);
        reply_xattr(self.get_attribute(ino, name, size), reply);
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        debug!("listxattr(ino={}, size={})", ino, size);
        reply_xattr(self.list_attributes(ino, size), reply);
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("removexattr(ino={}, name={:?})", ino, name);
        reply_empty(self.remove_attribute(ino, name), reply);
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);
        reply_empty(
            self.nodes.get(ino).and_then(|fd| lower::access(fd.as_fd(), mask)),
            reply,
        );
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!(
            "create(parent={}, name={:?}, mode=0o{:o}, flags=0x{:x})",
            parent, name, mode, flags
        );
        match self.create_file(parent, name, mode & !umask, flags, self.owner(req)) {
            Ok((attr, fh)) => reply.created(&self.ttl, &attr, 0, fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::inode::ROOT_ID;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        source: PathBuf,
        fs: UpperFs,
        quota: Arc<SpaceAccountant>,
        store: Arc<AttributeStore>,
    }

    fn fixture(limit: Option<u64>) -> Fixture {
        let dir = tempdir().unwrap();
        let source = dir.path().join("src");
        fs::create_dir(&source).unwrap();
        let source = source.canonicalize().unwrap();

        let nodes = Arc::new(IdentityCache::new(&source).unwrap());
        let quota = Arc::new(SpaceAccountant::new(&source, limit).unwrap());
        let store = Arc::new(AttributeStore::new(dir.path().join("xattr.db")));
        let fs = UpperFs::new(
            nodes,
            Arc::clone(&quota),
            Some(Arc::clone(&store)),
            Duration::from_secs(1),
        );
        Fixture {
            _dir: dir,
            source,
            fs,
            quota,
            store,
        }
    }

    fn name(s: &str) -> &OsStr {
        OsStr::new(s)
    }

    #[test]
    fn test_create_write_read() {
        let fx = fixture(None);
        let (attr, fh) = fx
            .fs
            .create_file(ROOT_ID, name("f"), 0o644, libc::O_RDWR, None)
            .unwrap();
        assert_eq!(attr.kind, FileType::RegularFile);

        assert_eq!(fx.fs.write_file(attr.ino, fh, 0, b"hello").unwrap(), 5);
        assert_eq!(fx.fs.read_file(fh, 1, 3).unwrap(), b"ell");
        assert_eq!(fs::read(fx.source.join("f")).unwrap(), b"hello");
    }

    #[test]
    fn test_write_charges_growth_only() {
        let fx = fixture(Some(1_000_000));
        let (attr, fh) = fx
            .fs
            .create_file(ROOT_ID, name("f"), 0o644, libc::O_RDWR, None)
            .unwrap();
        let start = fx.quota.remaining().unwrap();

        fx.fs.write_file(attr.ino, fh, 0, &[1u8; 100]).unwrap();
        assert_eq!(fx.quota.remaining().unwrap(), start - 100);

        // Overwrite inside the file does not change usage
        fx.fs.write_file(attr.ino, fh, 10, &[2u8; 50]).unwrap();
        assert_eq!(fx.quota.remaining().unwrap(), start - 100);

        // Straddling the end charges only the new tail
        fx.fs.write_file(attr.ino, fh, 90, &[3u8; 30]).unwrap();
        assert_eq!(fx.quota.remaining().unwrap(), start - 120);
    }

    #[test]
    fn test_write_refused_when_exhausted() {
        let fx = fixture(Some(0));
        let (attr, fh) = fx
            .fs
            .create_file(ROOT_ID, name("f"), 0o644, libc::O_RDWR, None)
            .unwrap();

        let err = fx.fs.write_file(attr.ino, fh, 0, b"data").unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOSPC);
        assert_eq!(fs::metadata(fx.source.join("f")).unwrap().len(), 0);
    }

    #[test]
    fn test_truncate_and_unlink_charges() {
        let fx = fixture(Some(1_000_000));
        fs::write(fx.source.join("f"), vec![0u8; 400]).unwrap();
        let start = fx.quota.remaining().unwrap();

        let attr = fx.fs.lookup_entry(ROOT_ID, name("f")).unwrap();
        fx.fs.truncate(attr.ino, None, 100).unwrap();
        assert_eq!(fx.quota.remaining().unwrap(), start + 300);

        fx.fs.truncate(attr.ino, None, 250).unwrap();
        assert_eq!(fx.quota.remaining().unwrap(), start + 150);

        fx.fs.remove_entry(ROOT_ID, name("f"), 0).unwrap();
        assert_eq!(fx.quota.remaining().unwrap(), start + 400);
        assert!(!fx.source.join("f").exists());
    }

    #[test]
    fn test_first_accounting_call_is_unlink() {
        let fx = fixture(Some(1_000_000));
        fs::write(fx.source.join("f"), vec![0u8; 400]).unwrap();
        let root_size = fs::symlink_metadata(&fx.source).unwrap().len() as i64;

        // No prior accounting call: the scan must see the file before it goes
        fx.fs.remove_entry(ROOT_ID, name("f"), 0).unwrap();
        assert_eq!(fx.quota.remaining().unwrap(), 1_000_000 - root_size);
    }

    #[test]
    fn test_rename_out_of_quota_subtree() {
        let dir = tempdir().unwrap();
        let source = dir.path().canonicalize().unwrap();
        fs::create_dir(source.join("limited")).unwrap();
        fs::create_dir(source.join("free")).unwrap();
        fs::write(source.join("limited").join("f"), vec![0u8; 500]).unwrap();

        let nodes = Arc::new(IdentityCache::new(&source).unwrap());
        let quota = Arc::new(SpaceAccountant::new(source.join("limited"), Some(1_000_000)).unwrap());
        let fs = UpperFs::new(nodes, Arc::clone(&quota), None, Duration::ZERO);
        let start = quota.remaining().unwrap();

        let limited = fs.lookup_entry(ROOT_ID, name("limited")).unwrap().ino;
        let free = fs.lookup_entry(ROOT_ID, name("free")).unwrap().ino;

        fs.move_entry(limited, name("f"), free, name("f"), 0).unwrap();
        assert_eq!(quota.remaining().unwrap(), start + 500);

        fs.move_entry(free, name("f"), limited, name("g"), 0).unwrap();
        assert_eq!(quota.remaining().unwrap(), start);
    }

    #[test]
    fn test_rename_over_existing_target() {
        let fx = fixture(Some(1_000_000));
        fs::write(fx.source.join("a"), vec![0u8; 100]).unwrap();
        fs::write(fx.source.join("b"), vec![0u8; 300]).unwrap();
        let start = fx.quota.remaining().unwrap();

        fx.fs.move_entry(ROOT_ID, name("a"), ROOT_ID, name("b"), 0).unwrap();
        assert_eq!(fx.quota.remaining().unwrap(), start + 300);
        assert_eq!(fs::metadata(fx.source.join("b")).unwrap().len(), 100);
    }

    #[test]
    fn test_attributes_follow_objects() {
        let fx = fixture(None);
        fs::create_dir(fx.source.join("d")).unwrap();
        fs::write(fx.source.join("d").join("f"), b"x").unwrap();

        let d = fx.fs.lookup_entry(ROOT_ID, name("d")).unwrap().ino;
        let f = fx.fs.lookup_entry(d, name("f")).unwrap().ino;
        fx.fs.set_attribute(f, name("user.tag"), b"v", 0).unwrap();
        assert_eq!(
            fx.fs.get_attribute(f, name("user.tag"), 16).unwrap(),
            AttrReply::Data(b"v".to_vec())
        );

        fx.fs.move_entry(ROOT_ID, name("d"), ROOT_ID, name("e"), 0).unwrap();
        // Same node, now reached through the new path
        assert_eq!(
            fx.fs.get_attribute(f, name("user.tag"), 0).unwrap(),
            AttrReply::Size(1)
        );

        let e = fx.fs.lookup_entry(ROOT_ID, name("e")).unwrap().ino;
        fx.fs.remove_entry(e, name("f"), 0).unwrap();
        assert!(fx.store.names(&fx.source.join("e").join("f")).unwrap().is_empty());
    }

    #[test]
    fn test_xattr_flags_and_errors() {
        let fx = fixture(None);
        fs::write(fx.source.join("f"), b"x").unwrap();
        let f = fx.fs.lookup_entry(ROOT_ID, name("f")).unwrap().ino;

        fx.fs.set_attribute(f, name("user.a"), b"1", libc::XATTR_CREATE).unwrap();
        let err = fx.fs.set_attribute(f, name("user.a"), b"2", libc::XATTR_CREATE).unwrap_err();
        assert_eq!(err.to_errno(), libc::EEXIST);
        let err = fx.fs.set_attribute(f, name("user.b"), b"2", libc::XATTR_REPLACE).unwrap_err();
        assert_eq!(err.to_errno(), libc::ENODATA);

        assert_eq!(fx.fs.list_attributes(f, 0).unwrap(), AttrReply::Size(7));
        fx.fs.remove_attribute(f, name("user.a")).unwrap();
        let err = fx.fs.remove_attribute(f, name("user.a")).unwrap_err();
        assert_eq!(err.to_errno(), libc::ENODATA);
    }

    #[test]
    fn test_xattr_disabled() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("f"), b"x").unwrap();
        let nodes = Arc::new(IdentityCache::new(dir.path()).unwrap());
        let quota = Arc::new(SpaceAccountant::unlimited(dir.path()).unwrap());
        let fs = UpperFs::new(nodes, quota, None, Duration::ZERO);

        let f = fs.lookup_entry(ROOT_ID, name("f")).unwrap().ino;
        let err = fs.get_attribute(f, name("user.x"), 0).unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOTSUP);
    }

    #[test]
    fn test_directory_listing() {
        let fx = fixture(None);
        fs::write(fx.source.join("a"), b"1").unwrap();
        fs::create_dir(fx.source.join("sub")).unwrap();

        let fh = fx.fs.open_dir(ROOT_ID).unwrap();
        let entries = fx.fs.handles.dir(fh).unwrap();
        let mut names: Vec<_> = entries.iter().map(|e| e.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec![".", "..", "a", "sub"]);

        let sub = entries.iter().find(|e| e.name == "sub").unwrap();
        assert_eq!(sub.kind, FileType::Directory);

        let ino_of = |n: &str| entries.iter().find(|e| e.name == n).unwrap().ino;
        assert_eq!(ino_of("."), fs::metadata(&fx.source).unwrap().ino());
        assert_eq!(
            ino_of(".."),
            fs::metadata(fx.source.parent().unwrap()).unwrap().ino()
        );
        assert_eq!(ino_of("sub"), fs::metadata(fx.source.join("sub")).unwrap().ino());
    }

    #[test]
    fn test_mkdir_symlink_link() {
        let fx = fixture(Some(10_000_000));
        let start = fx.quota.remaining().unwrap();

        let d = fx.fs.make_dir(ROOT_ID, name("d"), 0o755, None).unwrap();
        assert_eq!(d.kind, FileType::Directory);
        assert_eq!(fx.quota.remaining().unwrap(), start - d.size as i64);

        let l = fx.fs.make_symlink(ROOT_ID, name("l"), Path::new("d"), None).unwrap();
        assert_eq!(l.kind, FileType::Symlink);
        assert_eq!(
            fx.quota.remaining().unwrap(),
            start - d.size as i64 - l.size as i64
        );

        fs::write(fx.source.join("f"), b"abc").unwrap();
        let f = fx.fs.lookup_entry(ROOT_ID, name("f")).unwrap();
        let linked = fx.fs.make_link(f.ino, ROOT_ID, name("g")).unwrap();
        assert_eq!(linked.ino, f.ino);
        assert_eq!(linked.nlink, 2);
    }

    #[test]
    fn test_open_truncate_refunds() {
        let fx = fixture(Some(1_000_000));
        fs::write(fx.source.join("f"), vec![0u8; 700]).unwrap();
        let start = fx.quota.remaining().unwrap();

        let f = fx.fs.lookup_entry(ROOT_ID, name("f")).unwrap().ino;
        fx.fs.open_file(f, libc::O_WRONLY | libc::O_TRUNC).unwrap();
        assert_eq!(fx.quota.remaining().unwrap(), start + 700);
    }

    #[test]
    fn test_write_to_unlinked_file_is_free() {
        let fx = fixture(Some(1_000_000));
        let (attr, fh) = fx
            .fs
            .create_file(ROOT_ID, name("tmp"), 0o644, libc::O_RDWR, None)
            .unwrap();
        fx.fs.write_file(attr.ino, fh, 0, &[1u8; 1000]).unwrap();

        fx.fs.remove_entry(ROOT_ID, name("tmp"), 0).unwrap();
        let after_unlink = fx.quota.remaining().unwrap();

        // Still writable through the open handle, but no longer counted
        assert_eq!(fx.fs.write_file(attr.ino, fh, 1000, &[2u8; 5000]).unwrap(), 5000);
        fx.fs.truncate(attr.ino, Some(fh), 10_000).unwrap();
        assert_eq!(fx.quota.remaining().unwrap(), after_unlink);
    }

    #[test]
    fn test_failed_entry_setup_drops_reference() {
        let fx = fixture(None);
        fs::write(fx.source.join("f"), b"x").unwrap();

        let (id, _) = fx.fs.nodes.resolve_or_create(ROOT_ID, name("f")).unwrap();
        let err = fx
            .fs
            .settle(id, || -> Result<()> {
                Err(Error::Io(io::Error::from_raw_os_error(libc::EPERM)))
            })
            .unwrap_err();
        assert_eq!(err.to_errno(), libc::EPERM);
        assert_eq!(fx.fs.nodes.refcount(id), None);
        assert_eq!(fx.fs.nodes.len(), 1);

        let (id, _) = fx.fs.nodes.resolve_or_create(ROOT_ID, name("f")).unwrap();
        fx.fs.settle(id, || Ok(())).unwrap();
        assert_eq!(fx.fs.nodes.refcount(id), Some(1));
    }

    #[test]
    fn test_failed_write_reverses_charge() {
        let fx = fixture(Some(1_000_000));
        fs::write(fx.source.join("f"), b"").unwrap();
        let f = fx.fs.lookup_entry(ROOT_ID, name("f")).unwrap().ino;
        let fh = fx.fs.open_file(f, libc::O_RDONLY).unwrap();
        let start = fx.quota.remaining().unwrap();

        let err = fx.fs.write_file(f, fh, 0, &[1u8; 100]).unwrap_err();
        assert_eq!(err.to_errno(), libc::EBADF);
        assert_eq!(fx.quota.remaining().unwrap(), start);
        assert_eq!(fs::metadata(fx.source.join("f")).unwrap().len(), 0);
    }

    #[test]
    fn test_failed_truncate_reverses_charge() {
        let fx = fixture(Some(1_000_000));
        fs::write(fx.source.join("f"), vec![0u8; 100]).unwrap();
        let f = fx.fs.lookup_entry(ROOT_ID, name("f")).unwrap().ino;
        let fh = fx.fs.open_file(f, libc::O_RDONLY).unwrap();
        let start = fx.quota.remaining().unwrap();

        assert!(fx.fs.truncate(f, Some(fh), 500).is_err());
        assert_eq!(fx.quota.remaining().unwrap(), start);
        assert_eq!(fs::metadata(fx.source.join("f")).unwrap().len(), 100);
    }

    #[test]
    fn test_rename_between_links_of_one_file() {
        let fx = fixture(Some(1_000_000));
        let a = fx.source.join("a");
        fs::write(&a, vec![0u8; 100]).unwrap();
        fs::hard_link(&a, fx.source.join("b")).unwrap();
        fx.store.set(&a, name("user.a"), b"1", SetMode::CreateOrReplace).unwrap();
        let start = fx.quota.remaining().unwrap();

        fx.fs.move_entry(ROOT_ID, name("a"), ROOT_ID, name("b"), 0).unwrap();
        assert!(a.exists());
        assert!(fx.source.join("b").exists());
        assert_eq!(fx.quota.remaining().unwrap(), start);
        assert_eq!(fx.store.names(&a).unwrap(), vec![std::ffi::OsString::from("user.a")]);
        assert!(fx.store.names(&fx.source.join("b")).unwrap().is_empty());
    }
}
