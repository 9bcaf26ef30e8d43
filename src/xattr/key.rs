//! Key layout for the attribute store
//!
//! `[path length: u32 BE][path bytes][attribute name bytes]`
//!
//! The length header makes the path prefix self-delimiting: `/a` + `bc` and
//! `/ab` + `c` encode to different keys, and every attribute of one path
//! shares the exact prefix returned by [`path_prefix`].

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

const LEN_SIZE: usize = 4;

/// Prefix shared by every attribute of `path`
pub fn path_prefix(path: &Path) -> Vec<u8> {
    let bytes = path.as_os_str().as_bytes();
    let mut key = Vec::with_capacity(LEN_SIZE + bytes.len());
    key.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    key.extend_from_slice(bytes);
    key
}

/// Store key for attribute `name` of `path`
pub fn attr_key(path: &Path, name: &OsStr) -> Vec<u8> {
    let mut key = path_prefix(path);
    key.extend_from_slice(name.as_bytes());
    key
}

/// Split a store key back into `(path, name)`
pub fn decode_key(key: &[u8]) -> Option<(PathBuf, &OsStr)> {
    let header: [u8; LEN_SIZE] = key.get(..LEN_SIZE)?.try_into().ok()?;
    let path_len = u32::from_be_bytes(header) as usize;
    let path_end = LEN_SIZE.checked_add(path_len)?;
    let path = key.get(LEN_SIZE..path_end)?;
    let name = key.get(path_end..)?;
    Some((
        PathBuf::from(OsStr::from_bytes(path)),
        OsStr::from_bytes(name),
    ))
}

/// Attribute name of a key known to start with `prefix`
pub fn name_after_prefix<'a>(key: &'a [u8], prefix: &[u8]) -> Option<&'a OsStr> {
    key.strip_prefix(prefix).map(OsStr::from_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_recovers_path_and_name() {
        let key = attr_key(Path::new("/srv/data/file.txt"), OsStr::new("user.tag"));
        let (path, name) = decode_key(&key).unwrap();
        assert_eq!(path, Path::new("/srv/data/file.txt"));
        assert_eq!(name, OsStr::new("user.tag"));
    }

    #[test]
    fn test_no_ambiguity_between_path_and_name() {
        let a = attr_key(Path::new("/a"), OsStr::new("bc"));
        let b = attr_key(Path::new("/ab"), OsStr::new("c"));
        assert_ne!(a, b);

        // `/a` prefix must not match keys of `/ab`
        let prefix = path_prefix(Path::new("/a"));
        assert!(a.starts_with(&prefix));
        assert!(!b.starts_with(&prefix));
    }

    #[test]
    fn test_name_after_prefix() {
        let prefix = path_prefix(Path::new("/x"));
        let key = attr_key(Path::new("/x"), OsStr::new("user.k"));
        assert_eq!(name_after_prefix(&key, &prefix), Some(OsStr::new("user.k")));
        assert_eq!(name_after_prefix(b"other", &prefix), None);
    }

    #[test]
    fn test_truncated_key_rejected() {
        assert!(decode_key(&[0, 0]).is_none());
        assert!(decode_key(&[0, 0, 0, 9, b'/']).is_none());
    }
}
