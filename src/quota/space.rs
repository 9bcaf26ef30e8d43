//! On-disk size of a directory tree

use crate::error::Result;
use nix::errno::Errno;
use nix::sys::statfs::{statfs, PROC_SUPER_MAGIC};
use std::fs;
use std::io;
use std::path::Path;

/// Recursive size of `path` in bytes.
///
/// A directory counts its own reported size plus every entry beneath it.
/// Symlinks are not followed. Subtrees that cannot be read for lack of
/// permission count as zero, and procfs is never descended.
pub fn total_size(path: &Path) -> Result<u64> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        Ok(meta.len() + directory_size(path)?)
    } else {
        Ok(meta.len())
    }
}

fn directory_size(path: &Path) -> Result<u64> {
    match statfs(path) {
        Ok(sfs) if sfs.filesystem_type() == PROC_SUPER_MAGIC => return Ok(0),
        Ok(_) => {}
        Err(Errno::EACCES) => return Ok(0),
        Err(e) => return Err(e.into()),
    }

    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut size = 0u64;
    for entry in entries {
        let entry = entry?;
        match total_size(&entry.path()) {
            Ok(child) => size += child,
            // Entry vanished between readdir and lstat
            Err(crate::Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {}
            Err(crate::Error::Io(e)) if e.kind() == io::ErrorKind::PermissionDenied => {}
            Err(e) => return Err(e),
        }
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_size() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.bin");
        fs::write(&file, vec![0u8; 1234]).unwrap();
        assert_eq!(total_size(&file).unwrap(), 1234);
    }

    #[test]
    fn test_directory_includes_own_size_and_children() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a"), vec![1u8; 100]).unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("b"), vec![2u8; 50]).unwrap();

        let root_len = fs::symlink_metadata(dir.path()).unwrap().len();
        let sub_len = fs::symlink_metadata(dir.path().join("sub")).unwrap().len();

        assert_eq!(total_size(dir.path()).unwrap(), root_len + sub_len + 150);
    }

    #[test]
    fn test_symlink_counts_link_not_target() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("big");
        fs::write(&target, vec![0u8; 4096]).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let link_len = fs::symlink_metadata(&link).unwrap().len();
        assert_eq!(total_size(&link).unwrap(), link_len);
    }

    #[test]
    fn test_missing_path_is_error() {
        let dir = tempdir().unwrap();
        let err = total_size(&dir.path().join("missing")).unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_procfs_contributes_nothing() {
        let proc_path = Path::new("/proc");
        if proc_path.exists() {
            let own = fs::symlink_metadata(proc_path).unwrap().len();
            assert_eq!(total_size(proc_path).unwrap(), own);
        }
    }
}
