//! Open file and directory handles

use fuser::FileType;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One directory entry captured at `opendir`
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: u64,
    pub kind: FileType,
    pub name: OsString,
}

enum Handle {
    File(Arc<File>),
    Dir(Arc<Vec<DirEntry>>),
}

/// Maps kernel file handles to open files and directory snapshots
pub struct HandleTable {
    next_fh: AtomicU64,
    handles: RwLock<HashMap<u64, Handle>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    fn insert(&self, handle: Handle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.handles.write().insert(fh, handle);
        fh
    }

    /// Register an open file and return its handle
    pub fn insert_file(&self, file: File) -> u64 {
        self.insert(Handle::File(Arc::new(file)))
    }

    /// Register a directory listing and return its handle
    pub fn insert_dir(&self, entries: Vec<DirEntry>) -> u64 {
        self.insert(Handle::Dir(Arc::new(entries)))
    }

    pub fn file(&self, fh: u64) -> Option<Arc<File>> {
        match self.handles.read().get(&fh)? {
            Handle::File(file) => Some(Arc::clone(file)),
            Handle::Dir(_) => None,
        }
    }

    pub fn dir(&self, fh: u64) -> Option<Arc<Vec<DirEntry>>> {
        match self.handles.read().get(&fh)? {
            Handle::Dir(entries) => Some(Arc::clone(entries)),
            Handle::File(_) => None,
        }
    }

    /// Close a handle; true if it existed
    pub fn remove(&self, fh: u64) -> bool {
        self.handles.write().remove(&fh).is_some()
    }

    /// Drop every handle
    pub fn clear(&self) {
        self.handles.write().clear();
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_handles() {
        let dir = tempdir().unwrap();
        let file = File::create(dir.path().join("f")).unwrap();
        let table = HandleTable::new();

        let fh = table.insert_file(file);
        assert!(table.file(fh).is_some());
        assert!(table.dir(fh).is_none());

        assert!(table.remove(fh));
        assert!(table.file(fh).is_none());
        assert!(!table.remove(fh));
    }

    #[test]
    fn test_dir_handles_are_unique() {
        let table = HandleTable::new();
        let a = table.insert_dir(vec![DirEntry {
            ino: 1,
            kind: FileType::Directory,
            name: OsString::from("."),
        }]);
        let b = table.insert_dir(Vec::new());

        assert_ne!(a, b);
        assert_eq!(table.dir(a).unwrap().len(), 1);
        assert!(table.dir(b).unwrap().is_empty());
        assert_eq!(table.len(), 2);

        table.clear();
        assert!(table.is_empty());
    }
}
