//! FUSE userspace library implementation
//!
//! This is a rewrite of the high-level FUSE userspace library (path-based
//! interface) to fully take advantage of Rust's architecture. The library
//! speaks the kernel's node-id protocol on an already-mounted FUSE device
//! descriptor and translates it into absolute-path callbacks; establishing
//! the mount itself is left to the embedding layer.
//!
//! A filesystem is a table of optional [`Operations`] callbacks. Whatever
//! the table does not provide is answered with a not-implemented error on
//! behalf of the filesystem:
//!
//! ```no_run
//! use pathfuse::{Fuse, Operations};
//!
//! let mut ops = Operations::default();
//! ops.getattr = Some(Box::new(|_path| Err(libc::ENOENT)));
//! let fuse = Fuse::new(3, Some("debug"), ops);
//! fuse.run();
//! ```

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

use std::time::SystemTime;

#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

pub use crate::channel::{Channel, DeviceChannel};
pub use crate::context::{set_context_store, Context, ContextStore, PrivateData};
pub use crate::dirbuf::FillDir;
pub use crate::ll::abi::FUSE_ROOT_ID;
pub use crate::ll::ProtoVersion;
pub use crate::ops::{Operations, OperationsCompat1, OperationsCompat2, StatfsCompat1};
pub use crate::session::{is_lib_option, Cmd, Fuse, DEBUG_COMPAT1};

mod channel;
mod context;
mod dirbuf;
mod ll;
mod nodes;
pub mod ops;
mod reply;
mod request;
mod session;

/// File types
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum FileType {
    /// Named pipe (S_IFIFO)
    NamedPipe,
    /// Character device (S_IFCHR)
    CharDevice,
    /// Block device (S_IFBLK)
    BlockDevice,
    /// Directory (S_IFDIR)
    Directory,
    /// Regular file (S_IFREG)
    RegularFile,
    /// Symbolic link (S_IFLNK)
    Symlink,
    /// Unix domain socket (S_IFSOCK)
    Socket,
}

impl FileType {
    pub(crate) fn mode_bits(self) -> u32 {
        let bits = match self {
            FileType::NamedPipe => libc::S_IFIFO,
            FileType::CharDevice => libc::S_IFCHR,
            FileType::BlockDevice => libc::S_IFBLK,
            FileType::Directory => libc::S_IFDIR,
            FileType::RegularFile => libc::S_IFREG,
            FileType::Symlink => libc::S_IFLNK,
            FileType::Socket => libc::S_IFSOCK,
        };
        bits as u32
    }
}

/// File attributes returned by the `getattr` callback
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct FileStat {
    /// Inode number; replaced by the node id unless the filesystem was
    /// created with the `use_ino` option
    pub ino: u64,
    /// Size in bytes
    pub size: u64,
    /// Size in blocks
    pub blocks: u64,
    /// Time of last access
    pub atime: SystemTime,
    /// Time of last modification
    pub mtime: SystemTime,
    /// Time of last change
    pub ctime: SystemTime,
    /// Kind of file (directory, file, pipe, etc)
    pub kind: FileType,
    /// Permissions
    pub perm: u16,
    /// Number of hard links
    pub nlink: u32,
    /// User id
    pub uid: u32,
    /// Group id
    pub gid: u32,
    /// Rdev
    pub rdev: u32,
}

impl Default for FileStat {
    fn default() -> Self {
        FileStat {
            ino: 0,
            size: 0,
            blocks: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            kind: FileType::RegularFile,
            perm: 0o644,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
        }
    }
}

/// Filesystem statistics returned by the `statfs` callback
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Statfs {
    /// Total data blocks
    pub blocks: u64,
    /// Free blocks
    pub bfree: u64,
    /// Free blocks available to unprivileged users
    pub bavail: u64,
    /// Total file nodes
    pub files: u64,
    /// Free file nodes
    pub ffree: u64,
    /// Filesystem block size
    pub bsize: u32,
    /// Maximum filename length
    pub namelen: u32,
}

impl Default for Statfs {
    /// Safe defaults used when the filesystem has no `statfs` callback.
    fn default() -> Self {
        Statfs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: 0,
            bsize: 512,
            namelen: 255,
        }
    }
}

/// Per-open-file information passed between the kernel and the open/read/
/// write/flush/release family of callbacks.
///
/// The `open` and `opendir` callbacks may store an arbitrary file handle
/// (pointer, index, etc) in `fh`; it is passed back in every subsequent
/// operation on the same open file.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileInfo {
    /// Open flags, as given to open(2)
    pub flags: i32,
    /// File handle chosen by the filesystem
    pub fh: u64,
    /// Whether the write was caused by a page writeback
    pub writepage: bool,
}
