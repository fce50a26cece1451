//! User callback surface.
//!
//! A filesystem registers a table of optional operations; the dispatcher
//! invokes whichever are present and answers not-implemented for the rest.
//! These methods correspond to `fuse_operations` in libfuse: every callback
//! receives an absolute path starting with `/`, and failure is reported as
//! an `errno` error code as defined in the `libc` crate, e.g. `ENOENT` or
//! `EIO`.
//!
//! Two older table shapes are kept for source compatibility; both convert
//! into the current [`Operations`] table, so the rest of the library only
//! ever sees one shape.

use std::ffi::OsStr;
use std::fmt;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

use crate::context::PrivateData;
use crate::dirbuf::FillDir;
use crate::{FileInfo, FileStat, Statfs};

/// Result type of filesystem callbacks.
///
/// On failure, a callback returns an `errno` error code as defined in the
/// `libc` crate, e.g. `ENOENT` or `EIO`.
pub type Result<T> = std::result::Result<T, c_int>;

/// Get file attributes.
pub type GetattrCb = Box<dyn Fn(&Path) -> Result<FileStat> + Send + Sync>;
/// Read the target of a symbolic link.
pub type ReadlinkCb = Box<dyn Fn(&Path) -> Result<PathBuf> + Send + Sync>;
/// Create a file node with the given mode and device number.
pub type MknodCb = Box<dyn Fn(&Path, u32, u32) -> Result<()> + Send + Sync>;
/// Create a directory.
pub type MkdirCb = Box<dyn Fn(&Path, u32) -> Result<()> + Send + Sync>;
/// Remove a file.
pub type UnlinkCb = Box<dyn Fn(&Path) -> Result<()> + Send + Sync>;
/// Remove a directory.
pub type RmdirCb = Box<dyn Fn(&Path) -> Result<()> + Send + Sync>;
/// Create a symbolic link at the second path pointing to the first.
pub type SymlinkCb = Box<dyn Fn(&Path, &Path) -> Result<()> + Send + Sync>;
/// Rename a file or directory.
pub type RenameCb = Box<dyn Fn(&Path, &Path) -> Result<()> + Send + Sync>;
/// Create a hard link at the second path pointing to the first.
pub type LinkCb = Box<dyn Fn(&Path, &Path) -> Result<()> + Send + Sync>;
/// Change permission bits.
pub type ChmodCb = Box<dyn Fn(&Path, u32) -> Result<()> + Send + Sync>;
/// Change owner and/or group; absent values are left unchanged.
pub type ChownCb = Box<dyn Fn(&Path, Option<u32>, Option<u32>) -> Result<()> + Send + Sync>;
/// Change the size of a file.
pub type TruncateCb = Box<dyn Fn(&Path, u64) -> Result<()> + Send + Sync>;
/// Change access and modification times.
pub type UtimeCb = Box<dyn Fn(&Path, SystemTime, SystemTime) -> Result<()> + Send + Sync>;
/// Open a file; the callback may store a file handle in the
/// [`FileInfo`].
pub type OpenCb = Box<dyn Fn(&Path, &mut FileInfo) -> Result<()> + Send + Sync>;
/// Read data at an offset into the buffer, returning the byte count.
pub type ReadCb = Box<dyn Fn(&Path, &mut [u8], u64, &FileInfo) -> Result<usize> + Send + Sync>;
/// Write data at an offset, returning the byte count written.
pub type WriteCb = Box<dyn Fn(&Path, &[u8], u64, &FileInfo) -> Result<usize> + Send + Sync>;
/// Get filesystem statistics.
pub type StatfsCb = Box<dyn Fn(&Path) -> Result<Statfs> + Send + Sync>;
/// Called on each close() of an opened file.
pub type FlushCb = Box<dyn Fn(&Path, &FileInfo) -> Result<()> + Send + Sync>;
/// Release an open file once no references to it remain.
pub type ReleaseCb = Box<dyn Fn(&Path, &FileInfo) -> Result<()> + Send + Sync>;
/// Synchronize file contents; the flag selects data-only sync.
pub type FsyncCb = Box<dyn Fn(&Path, bool, &FileInfo) -> Result<()> + Send + Sync>;
/// Set an extended attribute.
pub type SetxattrCb = Box<dyn Fn(&Path, &OsStr, &[u8], u32) -> Result<()> + Send + Sync>;
/// Get an extended attribute into the buffer, returning its length.
/// With an empty buffer, return the length that would be written.
pub type GetxattrCb = Box<dyn Fn(&Path, &OsStr, &mut [u8]) -> Result<usize> + Send + Sync>;
/// List extended attribute names into the buffer, returning the total
/// length. With an empty buffer, return the length that would be written.
pub type ListxattrCb = Box<dyn Fn(&Path, &mut [u8]) -> Result<usize> + Send + Sync>;
/// Remove an extended attribute.
pub type RemovexattrCb = Box<dyn Fn(&Path, &OsStr) -> Result<()> + Send + Sync>;
/// Open a directory; the callback may store a directory handle in the
/// [`FileInfo`].
pub type OpendirCb = Box<dyn Fn(&Path, &mut FileInfo) -> Result<()> + Send + Sync>;
/// Read a directory: feed entries to the [`FillDir`] sink, starting at the
/// given offset, until it reports a full buffer.
pub type ReaddirCb =
    Box<dyn Fn(&Path, &mut FillDir<'_>, u64, &FileInfo) -> Result<()> + Send + Sync>;
/// Release an open directory.
pub type ReleasedirCb = Box<dyn Fn(&Path, &FileInfo) -> Result<()> + Send + Sync>;
/// Synchronize directory contents; the flag selects data-only sync.
pub type FsyncdirCb = Box<dyn Fn(&Path, bool, &FileInfo) -> Result<()> + Send + Sync>;
/// Initialize the filesystem; the returned value is published to every
/// callback through [`Context`](crate::Context).
pub type InitCb = Box<dyn Fn() -> Option<PrivateData> + Send + Sync>;
/// Clean up the filesystem on destruction.
pub type DestroyCb = Box<dyn Fn(Option<PrivateData>) + Send + Sync>;

/// The operation table of a filesystem.
///
/// Every callback is optional. Operations the kernel requests without a
/// registered callback are answered with `ENOSYS`, except where the
/// library can synthesize a sensible reply itself (`statfs`).
#[derive(Default)]
pub struct Operations {
    /// Get file attributes. Most other operations depend on this one: the
    /// lookup-class replies are populated from it.
    pub getattr: Option<GetattrCb>,
    /// Read the target of a symbolic link.
    pub readlink: Option<ReadlinkCb>,
    /// Create a file node (regular file, device, fifo or socket).
    pub mknod: Option<MknodCb>,
    /// Create a directory.
    pub mkdir: Option<MkdirCb>,
    /// Remove a file.
    pub unlink: Option<UnlinkCb>,
    /// Remove a directory.
    pub rmdir: Option<RmdirCb>,
    /// Create a symbolic link.
    pub symlink: Option<SymlinkCb>,
    /// Rename a file or directory.
    pub rename: Option<RenameCb>,
    /// Create a hard link.
    pub link: Option<LinkCb>,
    /// Change permission bits.
    pub chmod: Option<ChmodCb>,
    /// Change owner and group.
    pub chown: Option<ChownCb>,
    /// Change the size of a file.
    pub truncate: Option<TruncateCb>,
    /// Change access and modification times.
    pub utime: Option<UtimeCb>,
    /// Open a file.
    pub open: Option<OpenCb>,
    /// Read data from an open file.
    pub read: Option<ReadCb>,
    /// Write data to an open file.
    pub write: Option<WriteCb>,
    /// Get filesystem statistics.
    pub statfs: Option<StatfsCb>,
    /// Flush cached data on close().
    pub flush: Option<FlushCb>,
    /// Release an open file.
    pub release: Option<ReleaseCb>,
    /// Synchronize file contents.
    pub fsync: Option<FsyncCb>,
    /// Set an extended attribute.
    pub setxattr: Option<SetxattrCb>,
    /// Get an extended attribute.
    pub getxattr: Option<GetxattrCb>,
    /// List extended attributes.
    pub listxattr: Option<ListxattrCb>,
    /// Remove an extended attribute.
    pub removexattr: Option<RemovexattrCb>,
    /// Open a directory.
    pub opendir: Option<OpendirCb>,
    /// Read a directory.
    pub readdir: Option<ReaddirCb>,
    /// Release an open directory.
    pub releasedir: Option<ReleasedirCb>,
    /// Synchronize directory contents.
    pub fsyncdir: Option<FsyncdirCb>,
    /// Initialize the filesystem. Called before any other callback.
    pub init: Option<InitCb>,
    /// Clean up the filesystem. Called on destruction.
    pub destroy: Option<DestroyCb>,
}

macro_rules! registered {
    ($self:ident, $names:ident: $($op:ident),* $(,)?) => {
        $(if $self.$op.is_some() { $names.push(stringify!($op)); })*
    };
}

impl fmt::Debug for Operations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = Vec::new();
        registered!(self, names:
            getattr, readlink, mknod, mkdir, unlink, rmdir, symlink, rename,
            link, chmod, chown, truncate, utime, open, read, write, statfs,
            flush, release, fsync, setxattr, getxattr, listxattr,
            removexattr, opendir, readdir, releasedir, fsyncdir, init,
            destroy,
        );
        f.debug_struct("Operations")
            .field("registered", &names)
            .finish()
    }
}

/// Open a file given only the open flags (old table shape).
pub type OpenFlagsCb = Box<dyn Fn(&Path, i32) -> Result<()> + Send + Sync>;
/// Release an open file given only the open flags (old table shape).
pub type ReleaseFlagsCb = Box<dyn Fn(&Path, i32) -> Result<()> + Send + Sync>;
/// Read without per-open-file state (old table shape).
pub type ReadOldCb = Box<dyn Fn(&Path, &mut [u8], u64) -> Result<usize> + Send + Sync>;
/// Write without per-open-file state (old table shape).
pub type WriteOldCb = Box<dyn Fn(&Path, &[u8], u64) -> Result<usize> + Send + Sync>;
/// Flush without per-open-file state (old table shape).
pub type FlushOldCb = Box<dyn Fn(&Path) -> Result<()> + Send + Sync>;
/// Synchronize without per-open-file state (old table shape).
pub type FsyncOldCb = Box<dyn Fn(&Path, bool) -> Result<()> + Send + Sync>;
/// Read a whole directory in one pass (old table shape).
pub type GetdirCb = Box<dyn Fn(&Path, &mut FillDir<'_>) -> Result<()> + Send + Sync>;
/// Get filesystem statistics in the oldest wire shape.
pub type StatfsOldCb = Box<dyn Fn() -> Result<StatfsCompat1> + Send + Sync>;

/// Filesystem statistics as reported by the oldest `statfs` callback
/// shape; converted to [`Statfs`] before marshalling.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct StatfsCompat1 {
    /// Filesystem block size
    pub block_size: u32,
    /// Total data blocks
    pub blocks: u32,
    /// Free blocks
    pub blocks_free: u32,
    /// Total file nodes
    pub files: u32,
    /// Free file nodes
    pub files_free: u32,
    /// Maximum filename length
    pub namelen: u32,
}

impl From<StatfsCompat1> for Statfs {
    fn from(old: StatfsCompat1) -> Statfs {
        Statfs {
            blocks: old.blocks.into(),
            bfree: old.blocks_free.into(),
            bavail: old.blocks_free.into(),
            files: old.files.into(),
            ffree: old.files_free.into(),
            bsize: old.block_size,
            namelen: old.namelen,
        }
    }
}

/// The second-generation operation table: per-open-file state had not been
/// introduced yet, so the open family works on flags alone, and directory
/// listing is the one-shot `getdir`.
#[derive(Default)]
pub struct OperationsCompat2 {
    /// Get file attributes.
    pub getattr: Option<GetattrCb>,
    /// Read the target of a symbolic link.
    pub readlink: Option<ReadlinkCb>,
    /// Read a whole directory.
    pub getdir: Option<GetdirCb>,
    /// Create a file node.
    pub mknod: Option<MknodCb>,
    /// Create a directory.
    pub mkdir: Option<MkdirCb>,
    /// Remove a file.
    pub unlink: Option<UnlinkCb>,
    /// Remove a directory.
    pub rmdir: Option<RmdirCb>,
    /// Create a symbolic link.
    pub symlink: Option<SymlinkCb>,
    /// Rename a file or directory.
    pub rename: Option<RenameCb>,
    /// Create a hard link.
    pub link: Option<LinkCb>,
    /// Change permission bits.
    pub chmod: Option<ChmodCb>,
    /// Change owner and group.
    pub chown: Option<ChownCb>,
    /// Change the size of a file.
    pub truncate: Option<TruncateCb>,
    /// Change access and modification times.
    pub utime: Option<UtimeCb>,
    /// Open a file.
    pub open: Option<OpenFlagsCb>,
    /// Read data from an open file.
    pub read: Option<ReadOldCb>,
    /// Write data to an open file.
    pub write: Option<WriteOldCb>,
    /// Get filesystem statistics.
    pub statfs: Option<StatfsCb>,
    /// Flush cached data on close().
    pub flush: Option<FlushOldCb>,
    /// Release an open file.
    pub release: Option<ReleaseFlagsCb>,
    /// Synchronize file contents.
    pub fsync: Option<FsyncOldCb>,
}

/// The first-generation operation table; statfs has its own wire shape and
/// there is no flush.
#[derive(Default)]
pub struct OperationsCompat1 {
    /// Get file attributes.
    pub getattr: Option<GetattrCb>,
    /// Read the target of a symbolic link.
    pub readlink: Option<ReadlinkCb>,
    /// Read a whole directory.
    pub getdir: Option<GetdirCb>,
    /// Create a file node.
    pub mknod: Option<MknodCb>,
    /// Create a directory.
    pub mkdir: Option<MkdirCb>,
    /// Remove a file.
    pub unlink: Option<UnlinkCb>,
    /// Remove a directory.
    pub rmdir: Option<RmdirCb>,
    /// Create a symbolic link.
    pub symlink: Option<SymlinkCb>,
    /// Rename a file or directory.
    pub rename: Option<RenameCb>,
    /// Create a hard link.
    pub link: Option<LinkCb>,
    /// Change permission bits.
    pub chmod: Option<ChmodCb>,
    /// Change owner and group.
    pub chown: Option<ChownCb>,
    /// Change the size of a file.
    pub truncate: Option<TruncateCb>,
    /// Change access and modification times.
    pub utime: Option<UtimeCb>,
    /// Open a file.
    pub open: Option<OpenFlagsCb>,
    /// Read data from an open file.
    pub read: Option<ReadOldCb>,
    /// Write data to an open file.
    pub write: Option<WriteOldCb>,
    /// Get filesystem statistics.
    pub statfs: Option<StatfsOldCb>,
    /// Release an open file.
    pub release: Option<ReleaseFlagsCb>,
    /// Synchronize file contents.
    pub fsync: Option<FsyncOldCb>,
}

fn adapt_open(f: OpenFlagsCb) -> OpenCb {
    Box::new(move |path, fi| f(path, fi.flags))
}

fn adapt_release(f: ReleaseFlagsCb) -> ReleaseCb {
    // The old release signature cannot express "the path is already gone",
    // so the reconstruction-failed sentinel skips the call entirely.
    Box::new(move |path, fi| {
        if path.as_os_str() == "-" {
            return Ok(());
        }
        f(path, fi.flags)
    })
}

fn adapt_read(f: ReadOldCb) -> ReadCb {
    Box::new(move |path, buf, offset, _fi| f(path, buf, offset))
}

fn adapt_write(f: WriteOldCb) -> WriteCb {
    Box::new(move |path, buf, offset, _fi| f(path, buf, offset))
}

fn adapt_flush(f: FlushOldCb) -> FlushCb {
    Box::new(move |path, _fi| f(path))
}

fn adapt_fsync(f: FsyncOldCb) -> FsyncCb {
    Box::new(move |path, datasync, _fi| f(path, datasync))
}

fn adapt_getdir(f: GetdirCb) -> ReaddirCb {
    Box::new(move |path, filler, _offset, _fi| f(path, filler))
}

fn adapt_statfs_old(f: StatfsOldCb) -> StatfsCb {
    Box::new(move |_path| f().map(Statfs::from))
}

impl From<OperationsCompat2> for Operations {
    fn from(old: OperationsCompat2) -> Operations {
        Operations {
            getattr: old.getattr,
            readlink: old.readlink,
            mknod: old.mknod,
            mkdir: old.mkdir,
            unlink: old.unlink,
            rmdir: old.rmdir,
            symlink: old.symlink,
            rename: old.rename,
            link: old.link,
            chmod: old.chmod,
            chown: old.chown,
            truncate: old.truncate,
            utime: old.utime,
            open: old.open.map(adapt_open),
            read: old.read.map(adapt_read),
            write: old.write.map(adapt_write),
            statfs: old.statfs,
            flush: old.flush.map(adapt_flush),
            release: old.release.map(adapt_release),
            fsync: old.fsync.map(adapt_fsync),
            readdir: old.getdir.map(adapt_getdir),
            ..Operations::default()
        }
    }
}

impl From<OperationsCompat1> for Operations {
    fn from(old: OperationsCompat1) -> Operations {
        Operations {
            getattr: old.getattr,
            readlink: old.readlink,
            mknod: old.mknod,
            mkdir: old.mkdir,
            unlink: old.unlink,
            rmdir: old.rmdir,
            symlink: old.symlink,
            rename: old.rename,
            link: old.link,
            chmod: old.chmod,
            chown: old.chown,
            truncate: old.truncate,
            utime: old.utime,
            open: old.open.map(adapt_open),
            read: old.read.map(adapt_read),
            write: old.write.map(adapt_write),
            statfs: old.statfs.map(adapt_statfs_old),
            release: old.release.map(adapt_release),
            fsync: old.fsync.map(adapt_fsync),
            readdir: old.getdir.map(adapt_getdir),
            ..Operations::default()
        }
    }
}

impl fmt::Debug for OperationsCompat2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OperationsCompat2")
    }
}

impl fmt::Debug for OperationsCompat1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OperationsCompat1")
    }
}
