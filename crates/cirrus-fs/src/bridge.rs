//! The kernel-bridge adapter.
//!
//! Translates filesystem callbacks into engine operations: validates the
//! path shape (absolute, no trailing slash except root), strips the
//! leading slash, and folds every error into a negative errno exactly
//! once. The kernel side itself (FUSE session setup, channel I/O) is out
//! of scope; this is the surface it calls.

use std::sync::Arc;

use cirrus_core::Error;
use tracing::debug;

use crate::file::OpenMode;
use crate::fs::Filesystem;
use crate::object::Stat;

/// Adapter between filesystem callbacks and the engine.
#[derive(Debug)]
pub struct FuseBridge {
    fs: Arc<Filesystem>,
    mountpoint_mode: u32,
}

fn validate_path(path: &str) -> Result<&str, i32> {
    let Some(stripped) = path.strip_prefix('/') else {
        debug!(path, "rejecting relative path");
        return Err(-libc::EINVAL);
    };

    if !stripped.is_empty() && stripped.ends_with('/') {
        debug!(path, "rejecting trailing slash");
        return Err(-libc::EINVAL);
    }

    Ok(stripped)
}

fn errno(error: &Error) -> i32 {
    error.to_errno()
}

impl FuseBridge {
    /// Wrap an engine, remembering the mount point's permission bits for
    /// root stats.
    #[must_use]
    pub fn new(fs: Arc<Filesystem>, mountpoint_mode: u32) -> Self {
        Self {
            fs,
            mountpoint_mode,
        }
    }

    /// The wrapped engine.
    #[must_use]
    pub fn filesystem(&self) -> &Arc<Filesystem> {
        &self.fs
    }

    /// `getattr`.
    pub fn getattr(&self, path: &str, stat_out: &mut Stat) -> i32 {
        let path = match validate_path(path) {
            Ok(path) => path,
            Err(errno) => return errno,
        };

        if path.is_empty() {
            // The mount point: effective ids of this process, the mount
            // point's mode, directory type bits.
            *stat_out = Stat {
                mode: libc::S_IFDIR | (self.mountpoint_mode & !libc::S_IFMT),
                // SAFETY: geteuid/getegid cannot fail.
                uid: unsafe { libc::geteuid() },
                gid: unsafe { libc::getegid() },
                mtime: chrono::Utc::now().timestamp(),
                size: 0,
                blocks: 0,
                nlink: 1,
            };
            return 0;
        }

        match self.fs.get_stats(path) {
            Ok(stat) => {
                *stat_out = stat;
                0
            }
            Err(e) => errno(&e),
        }
    }

    /// `chmod`.
    pub fn chmod(&self, path: &str, mode: u32) -> i32 {
        self.unit_op(path, |fs, path| fs.change_mode(path, mode))
    }

    /// `chown`.
    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> i32 {
        self.unit_op(path, |fs, path| fs.change_owner(path, uid, gid))
    }

    /// `utimens` (seconds resolution).
    pub fn utimens(&self, path: &str, mtime: i64) -> i32 {
        self.unit_op(path, |fs, path| fs.change_mtime(path, mtime))
    }

    /// `mkdir`.
    pub fn mkdir(&self, path: &str, mode: u32, uid: u32, gid: u32) -> i32 {
        self.unit_op(path, |fs, path| fs.create_directory(path, mode, uid, gid))
    }

    /// `mknod` for FIFOs.
    pub fn mkfifo(&self, path: &str, mode: u32, uid: u32, gid: u32) -> i32 {
        self.unit_op(path, |fs, path| fs.create_fifo(path, mode, uid, gid))
    }

    /// `symlink`.
    pub fn symlink(&self, target: &str, path: &str, uid: u32, gid: u32) -> i32 {
        self.unit_op(path, |fs, path| fs.create_symlink(path, uid, gid, target))
    }

    /// `readlink`.
    pub fn readlink(&self, path: &str, target_out: &mut String) -> i32 {
        let path = match validate_path(path) {
            Ok(path) => path,
            Err(errno) => return errno,
        };

        match self.fs.read_symlink(path) {
            Ok(target) => {
                *target_out = target;
                0
            }
            Err(e) => errno(&e),
        }
    }

    /// `unlink`.
    pub fn unlink(&self, path: &str) -> i32 {
        self.unit_op(path, Filesystem::remove_file)
    }

    /// `rmdir`.
    pub fn rmdir(&self, path: &str) -> i32 {
        self.unit_op(path, Filesystem::remove_directory)
    }

    /// `rename`.
    pub fn rename(&self, from: &str, to: &str) -> i32 {
        let from = match validate_path(from) {
            Ok(from) => from,
            Err(errno) => return errno,
        };
        let to = match validate_path(to) {
            Ok(to) => to,
            Err(errno) => return errno,
        };

        match self.fs.rename(from, to) {
            Ok(()) => 0,
            Err(e) => errno(&e),
        }
    }

    /// `readdir`; the filler receives each child name.
    pub fn readdir(&self, path: &str, filler: &mut dyn FnMut(&str)) -> i32 {
        let path = match validate_path(path) {
            Ok(path) => path,
            Err(errno) => return errno,
        };

        filler(".");
        filler("..");

        match self.fs.read_directory(path, filler) {
            Ok(()) => 0,
            Err(e) => errno(&e),
        }
    }

    /// `create`: returns the handle through `handle_out`.
    pub fn create(&self, path: &str, mode: u32, uid: u32, gid: u32, handle_out: &mut u64) -> i32 {
        let path = match validate_path(path) {
            Ok(path) => path,
            Err(errno) => return errno,
        };

        match self.fs.create_and_open(path, mode, uid, gid) {
            Ok(handle) => {
                *handle_out = handle;
                0
            }
            Err(e) => errno(&e),
        }
    }

    /// `open`: returns the handle through `handle_out`.
    pub fn open(&self, path: &str, truncate: bool, handle_out: &mut u64) -> i32 {
        let path = match validate_path(path) {
            Ok(path) => path,
            Err(errno) => return errno,
        };

        let mode = if truncate {
            OpenMode::Truncate
        } else {
            OpenMode::Default
        };

        match self.fs.open(path, mode) {
            Ok(handle) => {
                *handle_out = handle;
                0
            }
            Err(e) => errno(&e),
        }
    }

    /// `read`: returns the byte count, or a negative errno.
    #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    pub fn read(&self, handle: u64, buf: &mut [u8], offset: u64) -> i64 {
        match self.fs.read(handle, buf, offset) {
            Ok(n) => n as i64,
            Err(e) => i64::from(errno(&e)),
        }
    }

    /// `write`: returns the byte count, or a negative errno.
    #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    pub fn write(&self, handle: u64, data: &[u8], offset: u64) -> i64 {
        match self.fs.write(handle, data, offset) {
            Ok(n) => n as i64,
            Err(e) => i64::from(errno(&e)),
        }
    }

    /// `ftruncate`.
    pub fn ftruncate(&self, handle: u64, len: u64) -> i32 {
        match self.fs.ftruncate(handle, len) {
            Ok(()) => 0,
            Err(e) => errno(&e),
        }
    }

    /// `truncate` by path.
    pub fn truncate(&self, path: &str, len: u64) -> i32 {
        self.unit_op(path, |fs, path| fs.truncate_path(path, len))
    }

    /// `flush`.
    pub fn flush(&self, handle: u64) -> i32 {
        match self.fs.flush(handle) {
            Ok(()) => 0,
            Err(e) => errno(&e),
        }
    }

    /// `release`.
    pub fn release(&self, handle: u64) -> i32 {
        match self.fs.release(handle) {
            Ok(()) => 0,
            Err(e) => errno(&e),
        }
    }

    /// `getxattr`: with a buffer, copies the value; without, returns the
    /// value size.
    #[allow(clippy::cast_possible_wrap)]
    pub fn getxattr(&self, path: &str, name: &str, buffer: Option<&mut [u8]>) -> i64 {
        let path = match validate_path(path) {
            Ok(path) => path,
            Err(errno) => return i64::from(errno),
        };

        match self.fs.get_xattr(path, name, buffer) {
            Ok(n) => n as i64,
            // The one place where "buffer too small" must become ERANGE.
            Err(Error::Invalid(_)) => i64::from(-libc::ERANGE),
            Err(e) => i64::from(errno(&e)),
        }
    }

    /// `listxattr`.
    pub fn listxattr(&self, path: &str, names_out: &mut Vec<String>) -> i32 {
        let path = match validate_path(path) {
            Ok(path) => path,
            Err(errno) => return errno,
        };

        match self.fs.list_xattrs(path) {
            Ok(names) => {
                *names_out = names;
                0
            }
            Err(e) => errno(&e),
        }
    }

    /// `setxattr`.
    pub fn setxattr(&self, path: &str, name: &str, value: &[u8], flags: i32) -> i32 {
        self.unit_op(path, |fs, path| fs.set_xattr(path, name, value, flags))
    }

    /// `removexattr`.
    pub fn removexattr(&self, path: &str, name: &str) -> i32 {
        self.unit_op(path, |fs, path| fs.remove_xattr(path, name))
    }

    fn unit_op(
        &self,
        path: &str,
        op: impl FnOnce(&Filesystem, &str) -> cirrus_core::Result<()>,
    ) -> i32 {
        let path = match validate_path(path) {
            Ok(path) => path,
            Err(errno) => return errno,
        };

        match op(&self.fs, path) {
            Ok(()) => 0,
            Err(e) => errno(&e),
        }
    }
}
