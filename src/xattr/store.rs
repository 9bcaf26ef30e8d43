//! Persistent extended-attribute store backed by sled
//!
//! Attributes are kept outside the mirrored tree so they survive on
//! filesystems without (reliable) native xattr support. The database is
//! opened on first use and closed when the filesystem is unmounted.

use super::key::{attr_key, decode_key, name_after_prefix, path_prefix};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// How `set` treats an existing value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    /// Write unconditionally
    CreateOrReplace,
    /// Fail with `AttributeExists` if a value is present
    CreateOnly,
    /// Fail with `NoAttribute` if no value is present
    ReplaceOnly,
}

impl SetMode {
    /// Map `setxattr(2)` flags
    pub fn from_flags(flags: i32) -> Result<Self> {
        let create = flags & libc::XATTR_CREATE != 0;
        let replace = flags & libc::XATTR_REPLACE != 0;
        match (create, replace) {
            (false, false) => Ok(SetMode::CreateOrReplace),
            (true, false) => Ok(SetMode::CreateOnly),
            (false, true) => Ok(SetMode::ReplaceOnly),
            (true, true) => Err(Error::InvalidArgument(
                "XATTR_CREATE and XATTR_REPLACE are exclusive".to_string(),
            )),
        }
    }
}

/// Result of a read that may be a size probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrReply {
    /// Capacity was zero: length the caller needs
    Size(usize),
    /// The bytes themselves
    Data(Vec<u8>),
}

impl AttrReply {
    fn sized(bytes: Vec<u8>, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            Ok(AttrReply::Size(bytes.len()))
        } else if bytes.len() > capacity {
            Err(Error::OutOfRange {
                needed: bytes.len(),
                capacity,
            })
        } else {
            Ok(AttrReply::Data(bytes))
        }
    }
}

enum StoreState {
    Unopened,
    Open(sled::Db),
    Closed,
}

/// Attribute store keyed by `(path, name)`
pub struct AttributeStore {
    /// Directory holding the sled database
    db_dir: PathBuf,
    state: RwLock<StoreState>,
    /// Number of times the backend was opened
    opens: AtomicUsize,
}

fn describe(path: &Path, name: &OsStr) -> String {
    format!("{}@{}", name.to_string_lossy(), path.display())
}

impl AttributeStore {
    /// Create a store that will live in `db_dir`. Nothing is opened yet.
    pub fn new(db_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_dir: db_dir.into(),
            state: RwLock::new(StoreState::Unopened),
            opens: AtomicUsize::new(0),
        }
    }

    pub fn db_dir(&self) -> &Path {
        &self.db_dir
    }

    /// Whether the backend has been opened and not yet closed
    pub fn is_open(&self) -> bool {
        matches!(*self.state.read(), StoreState::Open(_))
    }

    /// Number of times the backend has been opened
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn db(&self) -> Result<sled::Db> {
        match &*self.state.read() {
            StoreState::Open(db) => return Ok(db.clone()),
            StoreState::Closed => {
                return Err(Error::BackendUnavailable("store is closed".to_string()))
            }
            StoreState::Unopened => {}
        }

        let mut state = self.state.write();
        match &*state {
            StoreState::Open(db) => return Ok(db.clone()),
            StoreState::Closed => {
                return Err(Error::BackendUnavailable("store is closed".to_string()))
            }
            StoreState::Unopened => {}
        }

        std::fs::create_dir_all(&self.db_dir).map_err(|e| {
            Error::BackendUnavailable(format!("cannot create {:?}: {}", self.db_dir, e))
        })?;
        let db = sled::Config::new()
            .path(&self.db_dir)
            .open()
            .map_err(|e| Error::BackendUnavailable(format!("cannot open {:?}: {}", self.db_dir, e)))?;

        self.opens.fetch_add(1, Ordering::SeqCst);
        info!("Opened attribute store at {:?}", self.db_dir);
        *state = StoreState::Open(db.clone());
        Ok(db)
    }

    /// Store `value` as attribute `name` of `path`
    pub fn set(&self, path: &Path, name: &OsStr, value: &[u8], mode: SetMode) -> Result<()> {
        let db = self.db()?;
        let key = attr_key(path, name);
        debug!("set {} ({} bytes, {:?})", describe(path, name), value.len(), mode);

        match mode {
            SetMode::CreateOrReplace => {
                db.insert(key, value)?;
            }
            SetMode::CreateOnly => {
                db.compare_and_swap(&key, None::<&[u8]>, Some(value))?
                    .map_err(|_| Error::AttributeExists(describe(path, name)))?;
            }
            SetMode::ReplaceOnly => loop {
                let current = db
                    .get(&key)?
                    .ok_or_else(|| Error::NoAttribute(describe(path, name)))?;
                match db.compare_and_swap(&key, Some(&current[..]), Some(value))? {
                    Ok(()) => break,
                    // Changed underneath us; re-read and retry
                    Err(_) => continue,
                }
            },
        }
        Ok(())
    }

    /// Read attribute `name` of `path`. A zero `capacity` probes the size.
    pub fn get(&self, path: &Path, name: &OsStr, capacity: usize) -> Result<AttrReply> {
        let db = self.db()?;
        let value = db
            .get(attr_key(path, name))?
            .ok_or_else(|| Error::NoAttribute(describe(path, name)))?;
        AttrReply::sized(value.to_vec(), capacity)
    }

    /// NUL-terminated names of every attribute of `path`. A zero `capacity`
    /// probes the size.
    pub fn list(&self, path: &Path, capacity: usize) -> Result<AttrReply> {
        let mut buf = Vec::new();
        for name in self.names(path)? {
            buf.extend_from_slice(name.as_bytes());
            buf.push(0);
        }
        AttrReply::sized(buf, capacity)
    }

    /// Attribute names of `path` in key order
    pub fn names(&self, path: &Path) -> Result<Vec<OsString>> {
        Ok(self.entries(path)?.into_iter().map(|(name, _)| name).collect())
    }

    /// Attribute names and values of `path` in key order
    pub fn entries(&self, path: &Path) -> Result<Vec<(OsString, Vec<u8>)>> {
        let db = self.db()?;
        let prefix = path_prefix(path);
        let mut entries = Vec::new();
        for item in db.scan_prefix(&prefix) {
            let (key, value) = item?;
            if let Some(name) = name_after_prefix(&key, &prefix) {
                entries.push((name.to_os_string(), value.to_vec()));
            }
        }
        Ok(entries)
    }

    /// Delete attribute `name` of `path`
    pub fn remove(&self, path: &Path, name: &OsStr) -> Result<()> {
        let db = self.db()?;
        debug!("remove {}", describe(path, name));
        db.remove(attr_key(path, name))?
            .map(|_| ())
            .ok_or_else(|| Error::NoAttribute(describe(path, name)))
    }

    /// Delete every attribute of `path`; returns how many were removed
    pub fn remove_all(&self, path: &Path) -> Result<usize> {
        let db = self.db()?;
        let mut batch = sled::Batch::default();
        let mut count = 0;
        for item in db.scan_prefix(path_prefix(path)) {
            let (key, _) = item?;
            batch.remove(key);
            count += 1;
        }
        if count > 0 {
            db.apply_batch(batch)?;
            debug!("dropped {} attributes of {:?}", count, path);
        }
        Ok(count)
    }

    /// Move the attributes of the single path `from` to `to`
    pub fn rename_path(&self, from: &Path, to: &Path) -> Result<usize> {
        let db = self.db()?;
        let prefix = path_prefix(from);
        let mut batch = sled::Batch::default();
        let mut count = 0;
        for item in db.scan_prefix(&prefix) {
            let (key, value) = item?;
            let Some(name) = name_after_prefix(&key, &prefix) else {
                continue;
            };
            batch.insert(attr_key(to, name), value);
            batch.remove(key);
            count += 1;
        }
        if count > 0 {
            db.apply_batch(batch)?;
            debug!("moved {} attributes {:?} -> {:?}", count, from, to);
        }
        Ok(count)
    }

    /// Move the attributes of `from` and everything below it to `to`.
    /// Walks the whole database, so only directories go through here.
    pub fn rename_tree(&self, from: &Path, to: &Path) -> Result<usize> {
        let db = self.db()?;
        let mut batch = sled::Batch::default();
        let mut count = 0;
        for item in db.iter() {
            let (key, value) = item?;
            let Some((path, name)) = decode_key(&key) else {
                warn!("skipping malformed attribute key ({} bytes)", key.len());
                continue;
            };
            let Ok(rest) = path.strip_prefix(from) else {
                continue;
            };
            let new_path = if rest.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(rest)
            };
            batch.remove(key.clone());
            batch.insert(attr_key(&new_path, name), value);
            count += 1;
        }
        if count > 0 {
            db.apply_batch(batch)?;
            debug!("moved {} attributes {:?} -> {:?}", count, from, to);
        }
        Ok(count)
    }

    /// Flush and release the backend. Later calls fail with
    /// `BackendUnavailable`.
    pub fn close(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.write(), StoreState::Closed);
        if let StoreState::Open(db) = previous {
            db.flush()?;
            info!("Closed attribute store at {:?}", self.db_dir);
        }
        Ok(())
    }
}

impl Drop for AttributeStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to flush attribute store: {}", e);
        }
    }
}
