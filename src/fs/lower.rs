//! Pass-through calls into the source tree
//!
//! Every object is addressed by an `O_PATH` descriptor rather than a path,
//! so renames in the source tree never leave a cached object pointing at
//! the wrong file. Calls that cannot take an `O_PATH` descriptor go through
//! its `/proc/self/fd` alias.

use crate::error::{Error, Result};
use std::ffi::{CString, OsStr};
use std::fs::{File, OpenOptions};
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

fn cstring(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes).map_err(|_| Error::InvalidArgument("name contains NUL".to_string()))
}

fn cvt(res: libc::c_int) -> io::Result<libc::c_int> {
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res)
    }
}

/// `/proc/self/fd/N` alias of a descriptor
pub fn proc_path(fd: BorrowedFd<'_>) -> PathBuf {
    PathBuf::from(format!("/proc/self/fd/{}", fd.as_raw_fd()))
}

fn proc_cpath(fd: BorrowedFd<'_>) -> Result<CString> {
    cstring(proc_path(fd).as_os_str().as_bytes())
}

/// Open the source root as an `O_PATH` directory descriptor
pub fn open_root(path: &Path) -> Result<OwnedFd> {
    let cpath = cstring(path.as_os_str().as_bytes())?;
    let fd = cvt(unsafe {
        libc::open(
            cpath.as_ptr(),
            libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Open `name` inside `dir` without following a trailing symlink
pub fn open_path(dir: BorrowedFd<'_>, name: &OsStr) -> Result<OwnedFd> {
    let cname = cstring(name.as_bytes())?;
    let fd = cvt(unsafe {
        libc::openat(
            dir.as_raw_fd(),
            cname.as_ptr(),
            libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC,
        )
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Attributes of the object behind `fd` itself
pub fn stat_fd(fd: BorrowedFd<'_>) -> Result<libc::stat> {
    let mut st = MaybeUninit::<libc::stat>::zeroed();
    cvt(unsafe {
        libc::fstatat(
            fd.as_raw_fd(),
            c"".as_ptr(),
            st.as_mut_ptr(),
            libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
        )
    })?;
    // fstatat succeeded, so the struct is filled in
    Ok(unsafe { st.assume_init() })
}

/// Current absolute path of the object behind `fd`
pub fn fd_path(fd: BorrowedFd<'_>) -> Result<PathBuf> {
    Ok(std::fs::read_link(proc_path(fd))?)
}

/// Open the object behind an `O_PATH` descriptor for real I/O
pub fn reopen(fd: BorrowedFd<'_>, flags: i32) -> Result<File> {
    let accmode = flags & libc::O_ACCMODE;
    // Offsets come from the kernel, so O_APPEND would only fight them
    let custom = flags
        & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_EXCL | libc::O_NOFOLLOW | libc::O_APPEND);
    let file = OpenOptions::new()
        .read(accmode == libc::O_RDONLY || accmode == libc::O_RDWR)
        .write(accmode == libc::O_WRONLY || accmode == libc::O_RDWR)
        .custom_flags(custom | libc::O_CLOEXEC)
        .open(proc_path(fd))?;
    Ok(file)
}

/// Create and open `name` inside `dir`
pub fn create_at(dir: BorrowedFd<'_>, name: &OsStr, flags: i32, mode: u32) -> Result<File> {
    let cname = cstring(name.as_bytes())?;
    let fd = cvt(unsafe {
        libc::openat(
            dir.as_raw_fd(),
            cname.as_ptr(),
            (flags | libc::O_CREAT | libc::O_CLOEXEC | libc::O_NOFOLLOW) & !(libc::O_PATH | libc::O_APPEND),
            mode as libc::c_uint,
        )
    })?;
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Target of the symlink behind `fd`
pub fn read_link(fd: BorrowedFd<'_>) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; libc::PATH_MAX as usize];
    let len = unsafe {
        libc::readlinkat(
            fd.as_raw_fd(),
            c"".as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    };
    if len < 0 {
        return Err(io::Error::last_os_error().into());
    }
    buf.truncate(len as usize);
    Ok(buf)
}

pub fn unlink_at(dir: BorrowedFd<'_>, name: &OsStr, flags: i32) -> Result<()> {
    let cname = cstring(name.as_bytes())?;
    cvt(unsafe { libc::unlinkat(dir.as_raw_fd(), cname.as_ptr(), flags) })?;
    Ok(())
}

pub fn mkdir_at(dir: BorrowedFd<'_>, name: &OsStr, mode: u32) -> Result<()> {
    let cname = cstring(name.as_bytes())?;
    cvt(unsafe { libc::mkdirat(dir.as_raw_fd(), cname.as_ptr(), mode as libc::mode_t) })?;
    Ok(())
}

pub fn mknod_at(dir: BorrowedFd<'_>, name: &OsStr, mode: u32, rdev: u32) -> Result<()> {
    let cname = cstring(name.as_bytes())?;
    cvt(unsafe {
        libc::mknodat(
            dir.as_raw_fd(),
            cname.as_ptr(),
            mode as libc::mode_t,
            rdev as libc::dev_t,
        )
    })?;
    Ok(())
}

pub fn symlink_at(target: &Path, dir: BorrowedFd<'_>, name: &OsStr) -> Result<()> {
    let ctarget = cstring(target.as_os_str().as_bytes())?;
    let cname = cstring(name.as_bytes())?;
    cvt(unsafe { libc::symlinkat(ctarget.as_ptr(), dir.as_raw_fd(), cname.as_ptr()) })?;
    Ok(())
}

/// Hard-link the object behind `fd` as `name` inside `dir`
pub fn link_at(fd: BorrowedFd<'_>, dir: BorrowedFd<'_>, name: &OsStr) -> Result<()> {
    let src = proc_cpath(fd)?;
    let cname = cstring(name.as_bytes())?;
    cvt(unsafe {
        libc::linkat(
            libc::AT_FDCWD,
            src.as_ptr(),
            dir.as_raw_fd(),
            cname.as_ptr(),
            libc::AT_SYMLINK_FOLLOW,
        )
    })?;
    Ok(())
}

pub fn rename_at(
    old_dir: BorrowedFd<'_>,
    old_name: &OsStr,
    new_dir: BorrowedFd<'_>,
    new_name: &OsStr,
    flags: u32,
) -> Result<()> {
    let old = cstring(old_name.as_bytes())?;
    let new = cstring(new_name.as_bytes())?;
    let res = if flags == 0 {
        unsafe {
            libc::renameat(
                old_dir.as_raw_fd(),
                old.as_ptr(),
                new_dir.as_raw_fd(),
                new.as_ptr(),
            )
        }
    } else {
        unsafe {
            libc::renameat2(
                old_dir.as_raw_fd(),
                old.as_ptr(),
                new_dir.as_raw_fd(),
                new.as_ptr(),
                flags,
            )
        }
    };
    cvt(res)?;
    Ok(())
}

pub fn chmod(fd: BorrowedFd<'_>, mode: u32) -> Result<()> {
    let path = proc_cpath(fd)?;
    cvt(unsafe { libc::chmod(path.as_ptr(), (mode & 0o7777) as libc::mode_t) })?;
    Ok(())
}

/// Change ownership; `None` leaves that id unchanged
pub fn chown(fd: BorrowedFd<'_>, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
    cvt(unsafe {
        libc::fchownat(
            fd.as_raw_fd(),
            c"".as_ptr(),
            uid.unwrap_or(u32::MAX),
            gid.unwrap_or(u32::MAX),
            libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
        )
    })?;
    Ok(())
}

/// Timestamp argument for [`set_times`]
#[derive(Debug, Clone, Copy)]
pub enum TimeSpec {
    Omit,
    Now,
    At(std::time::SystemTime),
}

impl TimeSpec {
    fn to_timespec(self) -> libc::timespec {
        match self {
            TimeSpec::Omit => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            },
            TimeSpec::Now => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_NOW,
            },
            TimeSpec::At(t) => {
                let d = t
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default();
                libc::timespec {
                    tv_sec: d.as_secs() as libc::time_t,
                    tv_nsec: d.subsec_nanos() as _,
                }
            }
        }
    }
}

pub fn set_times(fd: BorrowedFd<'_>, atime: TimeSpec, mtime: TimeSpec) -> Result<()> {
    let path = proc_cpath(fd)?;
    let times = [atime.to_timespec(), mtime.to_timespec()];
    cvt(unsafe { libc::utimensat(libc::AT_FDCWD, path.as_ptr(), times.as_ptr(), 0) })?;
    Ok(())
}

/// Truncate or extend the regular file behind `fd`
pub fn truncate(fd: BorrowedFd<'_>, size: u64) -> Result<()> {
    let file = reopen(fd, libc::O_WRONLY)?;
    file.set_len(size)?;
    Ok(())
}

pub fn access(fd: BorrowedFd<'_>, mask: i32) -> Result<()> {
    let path = proc_cpath(fd)?;
    cvt(unsafe { libc::faccessat(libc::AT_FDCWD, path.as_ptr(), mask, 0) })?;
    Ok(())
}
