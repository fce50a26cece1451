//! The session: library options, per-opcode dispatch and the message loop.
//!
//! One [`Fuse`] object owns the callback table, the node directory and the
//! device channel. The message loop reads one framed command at a time and
//! hands it to the dispatcher; a caller-supplied worker pool may instead
//! drive [`Fuse::read_cmd`] and [`Fuse::process_cmd`] from several threads.
//!
//! Every handler follows the same skeleton: take the tree lock (read side,
//! or write side for the directory-mutating opcodes), reconstruct the
//! path, invoke the user callback if present, apply node-directory
//! updates, and marshal the reply.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::io::IoSlice;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use zerocopy::IntoBytes;

use crate::channel::{Channel, DeviceChannel};
use crate::context::{self, Context, PrivateData};
use crate::dirbuf::{DirHandle, DirState, FillDir};
use crate::ll::abi::*;
use crate::ll::ProtoVersion;
use crate::nodes::NodeTable;
use crate::ops::{Operations, OperationsCompat1, OperationsCompat2};
use crate::reply;
use crate::request::{Operation, Request, RequestError, RequestHeader};
use crate::{FileInfo, Statfs};

/// Debug flag accepted by [`Fuse::new_compat1`].
pub const DEBUG_COMPAT1: u32 = 1 << 1;

/// Whether an option string is recognized by the library (as opposed to
/// being destined for the kernel or the mount helper).
pub fn is_lib_option(opt: &str) -> bool {
    matches!(
        opt,
        "debug" | "hard_remove" | "use_ino" | "allow_root" | "readdir_ino"
    )
}

#[derive(Clone, Copy, Debug, Default)]
struct LibFlags {
    debug: bool,
    hard_remove: bool,
    use_ino: bool,
    allow_root: bool,
    readdir_ino: bool,
}

fn parse_lib_opts(opts: Option<&str>) -> LibFlags {
    let mut flags = LibFlags::default();
    if let Some(opts) = opts {
        for opt in opts.split(',') {
            match opt {
                "debug" => flags.debug = true,
                "hard_remove" => flags.hard_remove = true,
                "use_ino" => flags.use_ino = true,
                "allow_root" => flags.allow_root = true,
                "readdir_ino" => flags.readdir_ino = true,
                other => warn!("fuse: warning: unknown option `{}'", other),
            }
        }
    }
    flags
}

/// One framed command, owned by the worker that processes it.
#[derive(Debug)]
pub struct Cmd {
    buf: Vec<u8>,
}

#[derive(Debug, Default)]
struct DirTable {
    next_fh: u64,
    handles: HashMap<u64, Arc<DirHandle>>,
}

/// A FUSE session speaking the kernel protocol on one device channel.
pub struct Fuse {
    ch: Box<dyn Channel>,
    op: Operations,
    flags: LibFlags,
    owner: u32,
    nodes: Mutex<NodeTable>,
    tree_lock: RwLock<()>,
    dirs: Mutex<DirTable>,
    numavail: Mutex<i32>,
    major: AtomicU32,
    minor: AtomicU32,
    got_init: AtomicBool,
    exited: AtomicBool,
    user_data: Mutex<Option<PrivateData>>,
}

impl fmt::Debug for Fuse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fuse")
            .field("flags", &self.flags)
            .field("proto", &self.proto())
            .field("op", &self.op)
            .field("exited", &self.exited())
            .finish_non_exhaustive()
    }
}

impl Fuse {
    /// Create a session on an already-mounted FUSE device descriptor.
    ///
    /// `opts` is a comma-separated list of library options (`debug`,
    /// `hard_remove`, `use_ino`, `allow_root`, `readdir_ino`); unknown
    /// options are reported and ignored.
    pub fn new(fd: RawFd, opts: Option<&str>, op: Operations) -> Fuse {
        Fuse::with_channel(Box::new(DeviceChannel::new(fd)), opts, op)
    }

    /// Create a session from the second-generation callback table.
    pub fn new_compat2(fd: RawFd, opts: Option<&str>, op: OperationsCompat2) -> Fuse {
        Fuse::new(fd, opts, op.into())
    }

    /// Create a session from the first-generation callback table.
    pub fn new_compat1(fd: RawFd, flags: u32, op: OperationsCompat1) -> Fuse {
        let opts = if flags & DEBUG_COMPAT1 != 0 {
            Some("debug")
        } else {
            None
        };
        Fuse::new(fd, opts, op.into())
    }

    /// Create a session on an arbitrary transport. This is the seam used
    /// by embedders (and tests) that do not talk to a real device.
    pub fn with_channel(ch: Box<dyn Channel>, opts: Option<&str>, op: Operations) -> Fuse {
        Fuse {
            ch,
            op,
            flags: parse_lib_opts(opts),
            owner: unsafe { libc::getuid() },
            nodes: Mutex::new(NodeTable::new()),
            tree_lock: RwLock::new(()),
            dirs: Mutex::new(DirTable::default()),
            numavail: Mutex::new(0),
            major: AtomicU32::new(FUSE_KERNEL_VERSION),
            minor: AtomicU32::new(FUSE_KERNEL_MINOR_VERSION),
            got_init: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            user_data: Mutex::new(None),
        }
    }

    fn proto(&self) -> ProtoVersion {
        ProtoVersion {
            major: self.major.load(Ordering::Relaxed),
            minor: self.minor.load(Ordering::Relaxed),
        }
    }

    /// The protocol version negotiated at INIT time; the compiled-in
    /// version until then.
    pub fn protocol_version(&self) -> ProtoVersion {
        self.proto()
    }

    /// Stop the message loop.
    pub fn exit(&self) {
        self.exited.store(true, Ordering::SeqCst);
    }

    /// Whether the session has been told to stop.
    pub fn exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Workers currently free to pick up a request. A pool can watch this
    /// to decide when to spawn another thread.
    pub fn num_available(&self) -> i32 {
        *self.numavail.lock()
    }

    fn inc_avail(&self) {
        *self.numavail.lock() += 1;
    }

    fn dec_avail(&self) {
        *self.numavail.lock() -= 1;
    }

    /// Read one framed command off the channel.
    ///
    /// Returns `None` on transient conditions (interrupted read, command
    /// intercepted inline) and after fatal ones; check [`Fuse::exited`]
    /// to tell them apart. FORGET never becomes a command: it must not
    /// race with lookups on the same request stream, so it is handled
    /// right here.
    pub fn read_cmd(&self) -> Option<Cmd> {
        let mut buf = vec![0u8; FUSE_MAX_IN];
        let n = match self.ch.receive(&mut buf) {
            Ok(n) => n,
            Err(err) => {
                if self.exited() {
                    return None;
                }
                match err.raw_os_error() {
                    // Interrupted; try again.
                    Some(libc::EINTR) | Some(libc::ENOENT) => return None,
                    // Unmounted; exit silently.
                    Some(libc::ENODEV) => {
                        self.exit();
                        return None;
                    }
                    _ => {
                        error!("fuse: reading device: {}", err);
                        self.exit();
                        return None;
                    }
                }
            }
        };
        let proto = self.proto();
        let header_len = if proto.is_compat5() {
            std::mem::size_of::<fuse_in_header_compat5>()
        } else {
            std::mem::size_of::<fuse_in_header>()
        };
        if n < header_len {
            error!("short read on fuse device");
            self.exit();
            return None;
        }
        buf.truncate(n);
        if let Ok(req) = Request::parse(&buf, proto) {
            if let Operation::Forget { nlookup } = req.operation {
                self.do_forget(&req.header, nlookup);
                return None;
            }
        }
        Some(Cmd { buf })
    }

    /// Dispatch one command and write its reply.
    pub fn process_cmd(&self, cmd: Cmd) {
        self.dec_avail();
        let proto = self.proto();
        let header = match RequestHeader::parse(&cmd.buf, proto) {
            Ok((header, _)) => header,
            Err(err) => {
                error!("fuse: {}", err);
                return;
            }
        };
        let h = &header;
        if self.flags.debug {
            debug!(
                "unique: {}, opcode: {} ({}), nodeid: {}, insize: {}",
                h.unique,
                opname(h.opcode),
                h.opcode,
                h.nodeid,
                cmd.buf.len()
            );
        }
        let req = match Request::parse(&cmd.buf, proto) {
            Ok(req) => req,
            Err(RequestError::UnknownOperation(opcode)) => {
                warn!("fuse: unknown opcode ({})", opcode);
                let _ = self.send_reply(h.unique, -libc::ENOSYS, &[]);
                return;
            }
            Err(err) => {
                warn!("fuse: {}", err);
                let _ = self.send_reply(h.unique, -libc::EPROTO, &[]);
                return;
            }
        };
        if !self.got_init.load(Ordering::Acquire) && h.opcode != FUSE_INIT {
            // Old kernel version probably.
            let _ = self.send_reply(h.unique, -libc::EPROTO, &[]);
            return;
        }
        if self.flags.allow_root
            && h.uid != self.owner
            && h.uid != 0
            && !matches!(
                h.opcode,
                FUSE_INIT
                    | FUSE_READ
                    | FUSE_WRITE
                    | FUSE_FSYNC
                    | FUSE_RELEASE
                    | FUSE_READDIR
                    | FUSE_FSYNCDIR
                    | FUSE_RELEASEDIR
            )
        {
            let _ = self.send_reply(h.unique, -libc::EACCES, &[]);
            return;
        }
        context::enter(Context {
            uid: h.uid,
            gid: h.gid,
            pid: h.pid,
            private_data: self.user_data.lock().clone(),
        });
        match req.operation {
            Operation::Lookup { name } => self.do_lookup(h, name),
            Operation::Forget { nlookup } => self.do_forget(h, nlookup),
            Operation::GetAttr => self.do_getattr(h),
            Operation::SetAttr { valid, attr } => self.do_setattr(h, valid, &attr),
            Operation::ReadLink => self.do_readlink(h),
            Operation::Symlink { name, target } => self.do_symlink(h, name, target),
            Operation::MkNod { mode, rdev, name } => self.do_mknod(h, mode, rdev, name),
            Operation::MkDir { mode, name } => self.do_mkdir(h, mode, name),
            Operation::Unlink { name } => self.do_unlink(h, name),
            Operation::RmDir { name } => self.do_rmdir(h, name),
            Operation::Rename {
                newdir,
                name,
                newname,
            } => self.do_rename(h, newdir, name, newname),
            Operation::Link { oldnodeid, newname } => self.do_link(h, oldnodeid, newname),
            Operation::Open { flags } => self.do_open(h, flags),
            Operation::Read { fh, offset, size } => self.do_read(h, fh, offset, size),
            Operation::Write {
                fh,
                offset,
                write_flags,
                data,
            } => self.do_write(h, fh, offset, write_flags, data),
            Operation::StatFs => self.do_statfs(h),
            Operation::Release { fh, flags } => self.do_release(h, fh, flags),
            Operation::FSync { fh, datasync } => self.do_fsync(h, fh, datasync),
            Operation::SetXAttr { name, value, flags } => self.do_setxattr(h, name, value, flags),
            Operation::GetXAttr { name, size } => self.do_getxattr(h, name, size),
            Operation::ListXAttr { size } => self.do_listxattr(h, size),
            Operation::RemoveXAttr { name } => self.do_removexattr(h, name),
            Operation::Flush { fh } => self.do_flush(h, fh),
            Operation::Init { major, minor } => self.do_init(h, major, minor),
            Operation::OpenDir { flags } => self.do_opendir(h, flags),
            Operation::ReadDir { fh, offset, size } => self.do_readdir(h, fh, offset, size),
            Operation::ReleaseDir { fh } => self.do_releasedir(h, fh),
            Operation::FSyncDir { fh, datasync } => self.do_fsyncdir(h, fh, datasync),
        }
    }

    /// Run the message loop until the filesystem is unmounted or
    /// [`Fuse::exit`] is called.
    pub fn run(&self) {
        while !self.exited() {
            match self.read_cmd() {
                Some(cmd) => self.process_cmd(cmd),
                None => continue,
            }
        }
        self.exited.store(false, Ordering::SeqCst);
    }

    /// Deterministic teardown: unlink every node still hidden, then hand
    /// the user `destroy` callback its init data.
    pub fn destroy(self) {
        let hidden = self.nodes.lock().hidden_nodes();
        for nodeid in hidden {
            if let Some(ref unlink) = self.op.unlink {
                if let Some(path) = self.nodes.lock().path_of(nodeid, None) {
                    let _ = unlink(&path);
                }
            }
        }
        if let Some(ref destroy) = self.op.destroy {
            destroy(self.user_data.lock().take());
        }
    }

    fn send_reply(&self, unique: u64, error: i32, data: &[u8]) -> io::Result<()> {
        let error = reply::clamp_error(error);
        let data = if error == 0 { data } else { &[] };
        let out = reply::out_header(unique, error, data.len());
        if self.flags.debug {
            debug!(
                "   unique: {}, error: {} ({}), outsize: {}",
                unique,
                error,
                io::Error::from_raw_os_error(-error),
                out.len
            );
        }
        // Restore worker capacity before the write, so a blocked reply
        // cannot stall the pool's view of completed requests.
        self.inc_avail();
        let mut iov: SmallVec<[IoSlice<'_>; 2]> = SmallVec::new();
        iov.push(IoSlice::new(out.as_bytes()));
        if !data.is_empty() {
            iov.push(IoSlice::new(data));
        }
        let res = self.ch.send(&iov);
        if let Err(ref err) = res {
            // ENOENT means the operation was interrupted.
            if !self.exited() && err.raw_os_error() != Some(libc::ENOENT) {
                error!("fuse: writing device: {}", err);
            }
        }
        res
    }

    fn reply(&self, h: &RequestHeader, error: i32) {
        let _ = self.send_reply(h.unique, error, &[]);
    }

    fn interrupted(res: io::Result<()>) -> bool {
        matches!(res, Err(ref err) if err.raw_os_error() == Some(libc::ENOENT))
    }

    /// Resolve a user `getattr` into a lookup-class entry reply,
    /// registering the kernel reference in the node directory.
    fn lookup_path(
        &self,
        nodeid: u64,
        version: u64,
        name: &OsStr,
        path: &Path,
    ) -> Result<fuse_entry_out, i32> {
        let getattr = match self.op.getattr {
            Some(ref f) => f,
            None => return Err(-libc::ENOSYS),
        };
        let st = getattr(path).map_err(|e| -e)?;
        let mut attr = reply::stat_to_attr(&st);
        let (nodeid, generation) = self.nodes.lock().find_or_create(
            nodeid,
            name,
            &mut attr,
            version,
            self.flags.use_ino,
        );
        if self.flags.debug {
            debug!("   NODEID: {}", nodeid);
        }
        Ok(fuse_entry_out {
            nodeid,
            generation,
            entry_valid: reply::ENTRY_REVALIDATE_SECS,
            attr_valid: reply::ATTR_REVALIDATE_SECS,
            entry_valid_nsec: 0,
            attr_valid_nsec: 0,
            attr,
        })
    }

    /// Reply to a lookup-class request. A reply the kernel was no longer
    /// interested in (the originating syscall was interrupted) undoes the
    /// lookup-count bump, so the whole operation has no net effect.
    fn send_entry_reply(&self, h: &RequestHeader, res: Result<fuse_entry_out, i32>) {
        match res {
            Ok(entry) => {
                if Self::interrupted(self.send_reply(h.unique, 0, entry.as_bytes())) {
                    self.cancel_lookup(entry.nodeid, h.unique);
                }
            }
            Err(err) => self.reply(h, err),
        }
    }

    fn cancel_lookup(&self, nodeid: u64, version: u64) {
        let mut nodes = self.nodes.lock();
        if self.proto().old_forget() {
            nodes.forget_old(nodeid, version);
        } else {
            nodes.forget(nodeid, 1);
        }
    }

    fn do_lookup(&self, h: &RequestHeader, name: &OsStr) {
        let mut res = Err(-libc::ENOENT);
        {
            let _tree = self.tree_lock.read();
            if let Some(path) = self.nodes.lock().path_of(h.nodeid, Some(name)) {
                if self.flags.debug {
                    debug!("LOOKUP {}", path.display());
                }
                res = self.lookup_path(h.nodeid, h.unique, name, &path);
            }
        }
        self.send_entry_reply(h, res);
    }

    fn do_forget(&self, h: &RequestHeader, nlookup: u64) {
        if self.flags.debug {
            debug!("FORGET {}/{}", h.nodeid, nlookup);
        }
        let mut nodes = self.nodes.lock();
        if self.proto().old_forget() {
            // The payload value is the originating request unique, which
            // doubles as the node version on legacy peers.
            nodes.forget_old(h.nodeid, nlookup);
        } else {
            nodes.forget(h.nodeid, nlookup);
        }
    }

    fn do_getattr(&self, h: &RequestHeader) {
        let mut res = Err(-libc::ENOENT);
        {
            let _tree = self.tree_lock.read();
            if let Some(path) = self.nodes.lock().path_of(h.nodeid, None) {
                res = match self.op.getattr {
                    Some(ref getattr) => getattr(&path).map_err(|e| -e),
                    None => Err(-libc::ENOSYS),
                };
            }
        }
        match res {
            Ok(st) => {
                let mut attr = reply::stat_to_attr(&st);
                if !self.flags.use_ino {
                    attr.ino = h.nodeid;
                }
                let _ = self.send_reply(h.unique, 0, &reply::attr_out_bytes(attr));
            }
            Err(err) => self.reply(h, err),
        }
    }

    /// Apply the attribute changes selected by `valid`, in a fixed order
    /// with the first failure short-circuiting, then refresh.
    fn apply_setattr(&self, path: &Path, valid: u32, attr: &fuse_attr) -> Result<fuse_attr, i32> {
        if valid & FATTR_MODE != 0 {
            match self.op.chmod {
                Some(ref chmod) => chmod(path, attr.mode).map_err(|e| -e)?,
                None => return Err(-libc::ENOSYS),
            }
        }
        if valid & (FATTR_UID | FATTR_GID) != 0 {
            let uid = (valid & FATTR_UID != 0).then_some(attr.uid);
            let gid = (valid & FATTR_GID != 0).then_some(attr.gid);
            match self.op.chown {
                Some(ref chown) => chown(path, uid, gid).map_err(|e| -e)?,
                None => return Err(-libc::ENOSYS),
            }
        }
        if valid & FATTR_SIZE != 0 {
            match self.op.truncate {
                Some(ref truncate) => truncate(path, attr.size).map_err(|e| -e)?,
                None => return Err(-libc::ENOSYS),
            }
        }
        if valid & (FATTR_ATIME | FATTR_MTIME) == (FATTR_ATIME | FATTR_MTIME) {
            let atime = reply::system_time(attr.atime, attr.atimensec);
            let mtime = reply::system_time(attr.mtime, attr.mtimensec);
            match self.op.utime {
                Some(ref utime) => utime(path, atime, mtime).map_err(|e| -e)?,
                None => return Err(-libc::ENOSYS),
            }
        }
        let getattr = match self.op.getattr {
            Some(ref f) => f,
            None => return Err(-libc::ENOSYS),
        };
        let st = getattr(path).map_err(|e| -e)?;
        Ok(reply::stat_to_attr(&st))
    }

    fn do_setattr(&self, h: &RequestHeader, valid: u32, attr: &fuse_attr) {
        let mut res = Err(-libc::ENOENT);
        {
            let _tree = self.tree_lock.read();
            if let Some(path) = self.nodes.lock().path_of(h.nodeid, None) {
                res = if self.op.getattr.is_some() {
                    self.apply_setattr(&path, valid, attr)
                } else {
                    Err(-libc::ENOSYS)
                };
            }
        }
        match res {
            Ok(mut attr) => {
                if !self.flags.use_ino {
                    attr.ino = h.nodeid;
                }
                let _ = self.send_reply(h.unique, 0, &reply::attr_out_bytes(attr));
            }
            Err(err) => self.reply(h, err),
        }
    }

    fn do_readlink(&self, h: &RequestHeader) {
        let mut res = Err(-libc::ENOENT);
        {
            let _tree = self.tree_lock.read();
            if let Some(path) = self.nodes.lock().path_of(h.nodeid, None) {
                res = match self.op.readlink {
                    Some(ref readlink) => readlink(&path).map_err(|e| -e),
                    None => Err(-libc::ENOSYS),
                };
            }
        }
        match res {
            Ok(target) => {
                use std::os::unix::ffi::OsStrExt;
                let _ = self.send_reply(h.unique, 0, target.as_os_str().as_bytes());
            }
            Err(err) => self.reply(h, err),
        }
    }

    fn do_mknod(&self, h: &RequestHeader, mode: u32, rdev: u32, name: &OsStr) {
        let mut res = Err(-libc::ENOENT);
        {
            let _tree = self.tree_lock.read();
            if let Some(path) = self.nodes.lock().path_of(h.nodeid, Some(name)) {
                if self.flags.debug {
                    debug!("MKNOD {}", path.display());
                }
                res = match (&self.op.mknod, &self.op.getattr) {
                    (Some(mknod), Some(_)) => match mknod(&path, mode, rdev) {
                        Ok(()) => self.lookup_path(h.nodeid, h.unique, name, &path),
                        Err(e) => Err(-e),
                    },
                    _ => Err(-libc::ENOSYS),
                };
            }
        }
        self.send_entry_reply(h, res);
    }

    fn do_mkdir(&self, h: &RequestHeader, mode: u32, name: &OsStr) {
        let mut res = Err(-libc::ENOENT);
        {
            let _tree = self.tree_lock.read();
            if let Some(path) = self.nodes.lock().path_of(h.nodeid, Some(name)) {
                if self.flags.debug {
                    debug!("MKDIR {}", path.display());
                }
                res = match (&self.op.mkdir, &self.op.getattr) {
                    (Some(mkdir), Some(_)) => match mkdir(&path, mode) {
                        Ok(()) => self.lookup_path(h.nodeid, h.unique, name, &path),
                        Err(e) => Err(-e),
                    },
                    _ => Err(-libc::ENOSYS),
                };
            }
        }
        self.send_entry_reply(h, res);
    }

    fn do_symlink(&self, h: &RequestHeader, name: &OsStr, target: &OsStr) {
        let mut res = Err(-libc::ENOENT);
        {
            let _tree = self.tree_lock.read();
            if let Some(path) = self.nodes.lock().path_of(h.nodeid, Some(name)) {
                if self.flags.debug {
                    debug!("SYMLINK {}", path.display());
                }
                res = match (&self.op.symlink, &self.op.getattr) {
                    (Some(symlink), Some(_)) => match symlink(Path::new(target), &path) {
                        Ok(()) => self.lookup_path(h.nodeid, h.unique, name, &path),
                        Err(e) => Err(-e),
                    },
                    _ => Err(-libc::ENOSYS),
                };
            }
        }
        self.send_entry_reply(h, res);
    }

    fn do_link(&self, h: &RequestHeader, oldnodeid: u64, newname: &OsStr) {
        let mut res = Err(-libc::ENOENT);
        {
            let _tree = self.tree_lock.read();
            let oldpath = self.nodes.lock().path_of(oldnodeid, None);
            if let Some(oldpath) = oldpath {
                if let Some(newpath) = self.nodes.lock().path_of(h.nodeid, Some(newname)) {
                    if self.flags.debug {
                        debug!("LINK {}", newpath.display());
                    }
                    res = match (&self.op.link, &self.op.getattr) {
                        (Some(link), Some(_)) => match link(&oldpath, &newpath) {
                            Ok(()) => self.lookup_path(h.nodeid, h.unique, newname, &newpath),
                            Err(e) => Err(-e),
                        },
                        _ => Err(-libc::ENOSYS),
                    };
                }
            }
        }
        self.send_entry_reply(h, res);
    }

    /// Pick a hidden-name candidate that neither the name index nor the
    /// backing filesystem knows. The probe-then-rename window cannot be
    /// closed from here; after ten collisions the caller gives up with
    /// EBUSY.
    fn hidden_name(&self, dir: u64, oldname: &OsStr) -> Option<(OsString, PathBuf)> {
        let getattr = self.op.getattr.as_ref()?;
        for _ in 0..10 {
            let newname = self.nodes.lock().hidden_name(dir, oldname)?;
            let newpath = self.nodes.lock().path_of(dir, Some(&newname))?;
            if getattr(&newpath).is_err() {
                return Some((newname, newpath));
            }
        }
        None
    }

    /// Move an open file out of the way instead of unlinking it: rename
    /// it to a synthetic hidden name and mark the node, deferring the
    /// real unlink to the last release.
    fn hide_node(&self, oldpath: &Path, dir: u64, oldname: &OsStr) -> i32 {
        let rename = match (&self.op.rename, &self.op.unlink) {
            (Some(rename), Some(_)) => rename,
            _ => return -libc::EBUSY,
        };
        let (newname, newpath) = match self.hidden_name(dir, oldname) {
            Some(candidate) => candidate,
            None => return -libc::EBUSY,
        };
        if rename(oldpath, &newpath).is_err() {
            return -libc::EBUSY;
        }
        match self.nodes.lock().rename(dir, oldname, dir, &newname, true) {
            Ok(()) => 0,
            Err(e) => -e,
        }
    }

    fn do_unlink(&self, h: &RequestHeader, name: &OsStr) {
        let mut res = -libc::ENOENT;
        {
            let _tree = self.tree_lock.write();
            if let Some(path) = self.nodes.lock().path_of(h.nodeid, Some(name)) {
                if self.flags.debug {
                    debug!("UNLINK {}", path.display());
                }
                res = match self.op.unlink {
                    Some(ref unlink) => {
                        if !self.flags.hard_remove && self.nodes.lock().is_open(h.nodeid, name) {
                            self.hide_node(&path, h.nodeid, name)
                        } else {
                            match unlink(&path) {
                                Ok(()) => {
                                    self.nodes.lock().remove(h.nodeid, name);
                                    0
                                }
                                Err(e) => -e,
                            }
                        }
                    }
                    None => -libc::ENOSYS,
                };
            }
        }
        self.reply(h, res);
    }

    fn do_rmdir(&self, h: &RequestHeader, name: &OsStr) {
        let mut res = -libc::ENOENT;
        {
            let _tree = self.tree_lock.write();
            if let Some(path) = self.nodes.lock().path_of(h.nodeid, Some(name)) {
                if self.flags.debug {
                    debug!("RMDIR {}", path.display());
                }
                res = match self.op.rmdir {
                    Some(ref rmdir) => match rmdir(&path) {
                        Ok(()) => {
                            self.nodes.lock().remove(h.nodeid, name);
                            0
                        }
                        Err(e) => -e,
                    },
                    None => -libc::ENOSYS,
                };
            }
        }
        self.reply(h, res);
    }

    fn do_rename(&self, h: &RequestHeader, newdir: u64, name: &OsStr, newname: &OsStr) {
        let mut res = -libc::ENOENT;
        {
            let _tree = self.tree_lock.write();
            let oldpath = self.nodes.lock().path_of(h.nodeid, Some(name));
            if let Some(oldpath) = oldpath {
                if let Some(newpath) = self.nodes.lock().path_of(newdir, Some(newname)) {
                    if self.flags.debug {
                        debug!("RENAME {} -> {}", oldpath.display(), newpath.display());
                    }
                    res = match self.op.rename {
                        Some(ref rename) => {
                            let mut err = 0;
                            if !self.flags.hard_remove
                                && self.nodes.lock().is_open(newdir, newname)
                            {
                                err = self.hide_node(&newpath, newdir, newname);
                            }
                            if err == 0 {
                                err = match rename(&oldpath, &newpath) {
                                    Ok(()) => {
                                        match self.nodes.lock().rename(
                                            h.nodeid, name, newdir, newname, false,
                                        ) {
                                            Ok(()) => 0,
                                            Err(e) => -e,
                                        }
                                    }
                                    Err(e) => -e,
                                };
                            }
                            err
                        }
                        None => -libc::ENOSYS,
                    };
                }
            }
        }
        self.reply(h, res);
    }

    fn do_open(&self, h: &RequestHeader, flags: u32) {
        let mut fi = FileInfo {
            flags: flags as i32,
            ..FileInfo::default()
        };
        let _tree = self.tree_lock.read();
        let path = self.nodes.lock().path_of(h.nodeid, None);
        let res = match (&path, &self.op.open) {
            (None, _) => -libc::ENOENT,
            (Some(_), None) => -libc::ENOSYS,
            (Some(p), Some(open)) => match open(p, &mut fi) {
                Ok(()) => 0,
                Err(e) => -e,
            },
        };
        if res != 0 {
            self.reply(h, res);
            return;
        }
        if self.flags.debug {
            debug!("OPEN[{}] flags: {:#x}", fi.fh, flags);
        }
        let payload = reply::open_out_bytes(self.proto(), fi.fh);
        let mut nodes = self.nodes.lock();
        if Self::interrupted(self.send_reply(h.unique, 0, &payload)) {
            // The open syscall was interrupted, so it must be cancelled.
            if let (Some(release), Some(ref p)) = (&self.op.release, &path) {
                let _ = release(p, &fi);
            }
        } else {
            nodes.get_mut(h.nodeid).open_count += 1;
        }
    }

    fn do_read(&self, h: &RequestHeader, fh: u64, offset: u64, size: u32) {
        let mut buf = vec![0u8; size as usize];
        let fi = FileInfo {
            fh,
            ..FileInfo::default()
        };
        let mut res = Err(-libc::ENOENT);
        {
            let _tree = self.tree_lock.read();
            if let Some(path) = self.nodes.lock().path_of(h.nodeid, None) {
                if self.flags.debug {
                    debug!("READ[{}] {} bytes from {}", fh, size, offset);
                }
                res = match self.op.read {
                    Some(ref read) => read(&path, &mut buf, offset, &fi).map_err(|e| -e),
                    None => Err(-libc::ENOSYS),
                };
            }
        }
        match res {
            Ok(count) => {
                let count = count.min(buf.len());
                if self.flags.debug {
                    debug!("   READ[{}] {} bytes", fh, count);
                }
                let _ = self.send_reply(h.unique, 0, &buf[..count]);
            }
            Err(err) => self.reply(h, err),
        }
    }

    fn do_write(&self, h: &RequestHeader, fh: u64, offset: u64, write_flags: u32, data: &[u8]) {
        let fi = FileInfo {
            fh,
            writepage: write_flags & 1 != 0,
            ..FileInfo::default()
        };
        let mut res = Err(-libc::ENOENT);
        {
            let _tree = self.tree_lock.read();
            if let Some(path) = self.nodes.lock().path_of(h.nodeid, None) {
                if self.flags.debug {
                    debug!(
                        "WRITE{}[{}] {} bytes to {}",
                        if fi.writepage { "PAGE" } else { "" },
                        fh,
                        data.len(),
                        offset
                    );
                }
                res = match self.op.write {
                    Some(ref write) => write(&path, data, offset, &fi).map_err(|e| -e),
                    None => Err(-libc::ENOSYS),
                };
            }
        }
        match res {
            Ok(count) => {
                let payload = reply::write_out_bytes(self.proto(), count as u32);
                let _ = self.send_reply(h.unique, 0, &payload);
            }
            Err(err) => self.reply(h, err),
        }
    }

    fn do_statfs(&self, h: &RequestHeader) {
        let res = match self.op.statfs {
            Some(ref statfs) => statfs(Path::new("/")).map_err(|e| -e),
            None => Ok(Statfs::default()),
        };
        match res {
            Ok(st) => {
                let _ = self.send_reply(h.unique, 0, &reply::statfs_out_bytes(&st));
            }
            Err(err) => self.reply(h, err),
        }
    }

    fn do_flush(&self, h: &RequestHeader, fh: u64) {
        let fi = FileInfo {
            fh,
            ..FileInfo::default()
        };
        let mut res = -libc::ENOENT;
        {
            let _tree = self.tree_lock.read();
            if let Some(path) = self.nodes.lock().path_of(h.nodeid, None) {
                if self.flags.debug {
                    debug!("FLUSH[{}]", fh);
                }
                res = match self.op.flush {
                    Some(ref flush) => match flush(&path, &fi) {
                        Ok(()) => 0,
                        Err(e) => -e,
                    },
                    None => -libc::ENOSYS,
                };
            }
        }
        self.reply(h, res);
    }

    fn do_release(&self, h: &RequestHeader, fh: u64, flags: u32) {
        let fi = FileInfo {
            flags: flags as i32,
            fh,
            writepage: false,
        };
        let unlink_hidden = {
            let mut nodes = self.nodes.lock();
            let node = nodes.get_mut(h.nodeid);
            assert!(node.open_count > 0);
            node.open_count -= 1;
            node.is_hidden && node.open_count == 0
        };
        {
            let _tree = self.tree_lock.read();
            let path = self.nodes.lock().path_of(h.nodeid, None);
            if self.flags.debug {
                debug!("RELEASE[{}] flags: {:#x}", fh, flags);
            }
            if let Some(ref release) = self.op.release {
                let p: &Path = path.as_deref().unwrap_or_else(|| Path::new("-"));
                let _ = release(p, &fi);
            }
            if unlink_hidden {
                if let (Some(unlink), Some(ref path)) = (&self.op.unlink, &path) {
                    let _ = unlink(path);
                }
            }
        }
        self.reply(h, 0);
    }

    fn do_fsync(&self, h: &RequestHeader, fh: u64, datasync: bool) {
        let fi = FileInfo {
            fh,
            ..FileInfo::default()
        };
        let mut res = -libc::ENOENT;
        {
            let _tree = self.tree_lock.read();
            if let Some(path) = self.nodes.lock().path_of(h.nodeid, None) {
                if self.flags.debug {
                    debug!("FSYNC[{}]", fh);
                }
                res = match self.op.fsync {
                    Some(ref fsync) => match fsync(&path, datasync, &fi) {
                        Ok(()) => 0,
                        Err(e) => -e,
                    },
                    None => -libc::ENOSYS,
                };
            }
        }
        self.reply(h, res);
    }

    fn do_setxattr(&self, h: &RequestHeader, name: &OsStr, value: &[u8], flags: u32) {
        let mut res = -libc::ENOENT;
        {
            let _tree = self.tree_lock.read();
            if let Some(path) = self.nodes.lock().path_of(h.nodeid, None) {
                res = match self.op.setxattr {
                    Some(ref setxattr) => match setxattr(&path, name, value, flags) {
                        Ok(()) => 0,
                        Err(e) => -e,
                    },
                    None => -libc::ENOSYS,
                };
            }
        }
        self.reply(h, res);
    }

    fn common_getxattr(&self, h: &RequestHeader, name: &OsStr, buf: &mut [u8]) -> Result<usize, i32> {
        let _tree = self.tree_lock.read();
        match self.nodes.lock().path_of(h.nodeid, None) {
            Some(path) => match self.op.getxattr {
                Some(ref getxattr) => getxattr(&path, name, buf).map_err(|e| -e),
                None => Err(-libc::ENOSYS),
            },
            None => Err(-libc::ENOENT),
        }
    }

    fn do_getxattr(&self, h: &RequestHeader, name: &OsStr, size: u32) {
        if size == 0 {
            match self.common_getxattr(h, name, &mut []) {
                Ok(len) => {
                    let payload = reply::getxattr_out_bytes(self.proto(), len as u32);
                    let _ = self.send_reply(h.unique, 0, &payload);
                }
                Err(err) => self.reply(h, err),
            }
        } else {
            let mut buf = vec![0u8; size as usize];
            match self.common_getxattr(h, name, &mut buf) {
                Ok(len) if len > buf.len() => self.reply(h, -libc::ERANGE),
                Ok(len) => {
                    let _ = self.send_reply(h.unique, 0, &buf[..len]);
                }
                Err(err) => self.reply(h, err),
            }
        }
    }

    fn common_listxattr(&self, h: &RequestHeader, buf: &mut [u8]) -> Result<usize, i32> {
        let _tree = self.tree_lock.read();
        match self.nodes.lock().path_of(h.nodeid, None) {
            Some(path) => match self.op.listxattr {
                Some(ref listxattr) => listxattr(&path, buf).map_err(|e| -e),
                None => Err(-libc::ENOSYS),
            },
            None => Err(-libc::ENOENT),
        }
    }

    fn do_listxattr(&self, h: &RequestHeader, size: u32) {
        if size == 0 {
            match self.common_listxattr(h, &mut []) {
                Ok(len) => {
                    let payload = reply::getxattr_out_bytes(self.proto(), len as u32);
                    let _ = self.send_reply(h.unique, 0, &payload);
                }
                Err(err) => self.reply(h, err),
            }
        } else {
            let mut buf = vec![0u8; size as usize];
            match self.common_listxattr(h, &mut buf) {
                Ok(len) if len > buf.len() => self.reply(h, -libc::ERANGE),
                Ok(len) => {
                    let _ = self.send_reply(h.unique, 0, &buf[..len]);
                }
                Err(err) => self.reply(h, err),
            }
        }
    }

    fn do_removexattr(&self, h: &RequestHeader, name: &OsStr) {
        let mut res = -libc::ENOENT;
        {
            let _tree = self.tree_lock.read();
            if let Some(path) = self.nodes.lock().path_of(h.nodeid, None) {
                res = match self.op.removexattr {
                    Some(ref removexattr) => match removexattr(&path, name) {
                        Ok(()) => 0,
                        Err(e) => -e,
                    },
                    None => -libc::ENOSYS,
                };
            }
        }
        self.reply(h, res);
    }

    fn do_init(&self, h: &RequestHeader, major: u32, minor: u32) {
        if self.flags.debug {
            debug!("INIT: {}.{}", major, minor);
        }
        self.got_init.store(true, Ordering::Release);
        if let Some(ref init) = self.op.init {
            *self.user_data.lock() = init();
        }
        let (major, minor) = match major {
            5 => (5, 1),
            6 => (6, 1),
            _ => (FUSE_KERNEL_VERSION, FUSE_KERNEL_MINOR_VERSION),
        };
        self.major.store(major, Ordering::Relaxed);
        self.minor.store(minor, Ordering::Relaxed);
        if self.flags.debug {
            debug!("   INIT: {}.{}", major, minor);
        }
        let out = fuse_init_in_out { major, minor };
        let _ = self.send_reply(h.unique, 0, out.as_bytes());
    }

    fn register_dir(&self, dh: DirHandle) -> u64 {
        let mut dirs = self.dirs.lock();
        dirs.next_fh += 1;
        let fh = dirs.next_fh;
        dirs.handles.insert(fh, Arc::new(dh));
        fh
    }

    fn dir_handle(&self, fh: u64) -> Arc<DirHandle> {
        match self.dirs.lock().handles.get(&fh) {
            Some(dh) => Arc::clone(dh),
            None => panic!("fuse internal error: directory handle {} not found", fh),
        }
    }

    fn do_opendir(&self, h: &RequestHeader, flags: u32) {
        let node = if self.flags.readdir_ino {
            Some(self.nodes.lock().get(h.nodeid).nodeid)
        } else {
            None
        };
        if let Some(ref opendir) = self.op.opendir {
            let mut fi = FileInfo {
                flags: flags as i32,
                ..FileInfo::default()
            };
            let _tree = self.tree_lock.read();
            let path = self.nodes.lock().path_of(h.nodeid, None);
            let res = match path {
                Some(ref p) => match opendir(p, &mut fi) {
                    Ok(()) => 0,
                    Err(e) => -e,
                },
                None => -libc::ENOENT,
            };
            if res != 0 {
                self.reply(h, res);
                return;
            }
            let fh = self.register_dir(DirHandle::new(fi.fh, node));
            let payload = reply::open_out_bytes(self.proto(), fh);
            if Self::interrupted(self.send_reply(h.unique, 0, &payload)) {
                // The opendir syscall was interrupted, so it must be
                // cancelled.
                if let (Some(releasedir), Some(ref p)) = (&self.op.releasedir, &path) {
                    let _ = releasedir(p, &fi);
                }
                self.dirs.lock().handles.remove(&fh);
            }
        } else {
            let fh = self.register_dir(DirHandle::new(0, node));
            let payload = reply::open_out_bytes(self.proto(), fh);
            let _ = self.send_reply(h.unique, 0, &payload);
        }
    }

    fn readdir_fill(
        &self,
        h: &RequestHeader,
        dh: &DirHandle,
        state: &mut DirState,
        offset: u64,
        size: u32,
    ) -> i32 {
        let _tree = self.tree_lock.read();
        let path = match self.nodes.lock().path_of(h.nodeid, None) {
            Some(path) => path,
            None => return -libc::ENOENT,
        };
        let fi = FileInfo {
            fh: dh.user_fh,
            ..FileInfo::default()
        };
        state.contents.clear();
        state.error = 0;
        state.needlen = size as usize;
        state.filled = true;
        let err = match self.op.readdir {
            Some(ref readdir) => {
                let proto = self.proto();
                let offset = if proto.is_compat5() { 0 } else { offset };
                let mut filler = FillDir::new(
                    &mut *state,
                    &self.nodes,
                    dh.node,
                    proto,
                    self.flags.use_ino,
                    self.flags.readdir_ino,
                );
                match readdir(&path, &mut filler, offset, &fi) {
                    Ok(()) => 0,
                    Err(e) => -e,
                }
            }
            None => -libc::ENOSYS,
        };
        let err = if err == 0 { state.error } else { err };
        if err != 0 {
            state.filled = false;
        }
        err
    }

    fn do_readdir(&self, h: &RequestHeader, fh: u64, offset: u64, size: u32) {
        let dh = self.dir_handle(fh);
        let mut state = dh.state.lock();
        let mut err = 0;
        if !state.filled {
            err = self.readdir_fill(h, &dh, &mut state, offset, size);
        }
        let mut buf: &[u8] = &[];
        if err == 0 {
            if state.filled {
                // The buffer holds the whole directory; slice out the
                // requested window.
                let offset = offset as usize;
                if offset < state.contents.len() {
                    let end = (offset.saturating_add(size as usize)).min(state.contents.len());
                    buf = &state.contents[offset..end];
                }
            } else {
                buf = &state.contents;
            }
        }
        let _ = self.send_reply(h.unique, err, buf);
    }

    fn do_releasedir(&self, h: &RequestHeader, fh: u64) {
        let dh = self.dir_handle(fh);
        if let Some(ref releasedir) = self.op.releasedir {
            let fi = FileInfo {
                fh: dh.user_fh,
                ..FileInfo::default()
            };
            let _tree = self.tree_lock.read();
            let path = self.nodes.lock().path_of(h.nodeid, None);
            let p: &Path = path.as_deref().unwrap_or_else(|| Path::new("-"));
            let _ = releasedir(p, &fi);
        }
        self.dirs.lock().handles.remove(&fh);
        // Wait out a readdir still running on the handle before the
        // buffer goes away.
        drop(dh.state.lock());
        self.reply(h, 0);
    }

    fn do_fsyncdir(&self, h: &RequestHeader, fh: u64, datasync: bool) {
        let dh = self.dir_handle(fh);
        let fi = FileInfo {
            fh: dh.user_fh,
            ..FileInfo::default()
        };
        let mut res = -libc::ENOENT;
        {
            let _tree = self.tree_lock.read();
            if let Some(path) = self.nodes.lock().path_of(h.nodeid, None) {
                res = match self.op.fsyncdir {
                    Some(ref fsyncdir) => match fsyncdir(&path, datasync, &fi) {
                        Ok(()) => 0,
                        Err(e) => -e,
                    },
                    None => -libc::ENOSYS,
                };
            }
        }
        self.reply(h, res);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FileStat;
    use zerocopy::FromBytes;

    #[derive(Clone, Default)]
    struct MockChannel(Arc<MockInner>);

    #[derive(Default)]
    struct MockInner {
        sent: Mutex<Vec<Vec<u8>>>,
        fail_next_send: AtomicBool,
    }

    impl Channel for MockChannel {
        fn receive(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from_raw_os_error(libc::ENODEV))
        }

        fn send(&self, bufs: &[IoSlice<'_>]) -> io::Result<()> {
            if self.0.fail_next_send.swap(false, Ordering::SeqCst) {
                return Err(io::Error::from_raw_os_error(libc::ENOENT));
            }
            let mut frame = Vec::new();
            for buf in bufs {
                frame.extend_from_slice(buf);
            }
            self.0.sent.lock().push(frame);
            Ok(())
        }
    }

    impl MockChannel {
        fn take(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut *self.0.sent.lock())
        }

        fn fail_next(&self) {
            self.0.fail_next_send.store(true, Ordering::SeqCst);
        }
    }

    fn new_fuse(op: Operations, opts: Option<&str>) -> (Fuse, MockChannel) {
        let ch = MockChannel::default();
        let fuse = Fuse::with_channel(Box::new(ch.clone()), opts, op);
        (fuse, ch)
    }

    fn frame_from(opcode: u32, nodeid: u64, unique: u64, uid: u32, payload: &[u8]) -> Cmd {
        let header = fuse_in_header {
            len: (40 + payload.len()) as u32,
            opcode,
            unique,
            nodeid,
            uid,
            gid: uid,
            pid: 1,
            padding: 0,
        };
        let mut buf = header.as_bytes().to_vec();
        buf.extend_from_slice(payload);
        Cmd { buf }
    }

    fn frame(opcode: u32, nodeid: u64, unique: u64, payload: &[u8]) -> Cmd {
        frame_from(opcode, nodeid, unique, unsafe { libc::getuid() }, payload)
    }

    fn send_init(fuse: &Fuse, ch: &MockChannel) {
        let payload = fuse_init_in_out { major: 7, minor: 2 };
        fuse.process_cmd(frame(FUSE_INIT, 0, 1, payload.as_bytes()));
        let replies = ch.take();
        assert_eq!(replies.len(), 1);
    }

    fn reply_parts(frame: &[u8]) -> (fuse_out_header, Vec<u8>) {
        let (head, rest) = fuse_out_header::read_from_prefix(frame).unwrap();
        (head, rest.to_vec())
    }

    fn only_reply(ch: &MockChannel) -> (fuse_out_header, Vec<u8>) {
        let replies = ch.take();
        assert_eq!(replies.len(), 1);
        reply_parts(&replies[0])
    }

    #[test]
    fn requests_before_init_are_protocol_errors() {
        let (fuse, ch) = new_fuse(Operations::default(), None);
        fuse.process_cmd(frame(FUSE_GETATTR, 1, 9, &[]));
        let (head, payload) = only_reply(&ch);
        assert_eq!(head.error, -libc::EPROTO);
        assert!(payload.is_empty());
    }

    #[test]
    fn unknown_opcode_is_not_implemented() {
        let (fuse, ch) = new_fuse(Operations::default(), None);
        send_init(&fuse, &ch);
        fuse.process_cmd(frame(99, 1, 2, &[]));
        let (head, _) = only_reply(&ch);
        assert_eq!(head.error, -libc::ENOSYS);
    }

    #[test]
    fn missing_callback_is_not_implemented() {
        let (fuse, ch) = new_fuse(Operations::default(), None);
        send_init(&fuse, &ch);
        fuse.process_cmd(frame(FUSE_GETATTR, 1, 2, &[]));
        let (head, _) = only_reply(&ch);
        assert_eq!(head.error, -libc::ENOSYS);
    }

    #[test]
    fn allow_root_gates_foreign_uids() {
        let (fuse, ch) = new_fuse(Operations::default(), Some("allow_root"));
        send_init(&fuse, &ch);
        fuse.process_cmd(frame_from(FUSE_GETATTR, 1, 2, 12345, &[]));
        let (head, _) = only_reply(&ch);
        assert_eq!(head.error, -libc::EACCES);

        // Opcodes on already-validated handles pass the gate; this one
        // then fails on the missing callback instead.
        let fsync = fuse_fsync_in {
            fh: 0,
            fsync_flags: 0,
            padding: 0,
        };
        fuse.process_cmd(frame_from(FUSE_FSYNC, 1, 3, 12345, fsync.as_bytes()));
        let (head, _) = only_reply(&ch);
        assert_eq!(head.error, -libc::ENOSYS);
    }

    #[test]
    fn interrupted_lookup_reply_is_rolled_back() {
        let op = Operations {
            getattr: Some(Box::new(|_path| Ok(FileStat::default()))),
            ..Operations::default()
        };
        let (fuse, ch) = new_fuse(op, None);
        send_init(&fuse, &ch);
        ch.fail_next();
        fuse.process_cmd(frame(FUSE_LOOKUP, 1, 2, b"hello\0"));
        assert!(ch.take().is_empty());
        let nodes = fuse.nodes.lock();
        assert!(nodes.lookup(FUSE_ROOT_ID, OsStr::new("hello")).is_none());
        assert_eq!(nodes.get(FUSE_ROOT_ID).refctr, 1);
    }

    #[test]
    fn interrupted_open_reply_is_released() {
        let released = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&released);
        let op = Operations {
            open: Some(Box::new(|_path, fi| {
                fi.fh = 42;
                Ok(())
            })),
            release: Some(Box::new(move |path, fi| {
                log.lock().push((path.to_path_buf(), fi.fh));
                Ok(())
            })),
            ..Operations::default()
        };
        let (fuse, ch) = new_fuse(op, None);
        send_init(&fuse, &ch);

        let open = fuse_open_in {
            flags: 0,
            padding: 0,
        };
        ch.fail_next();
        fuse.process_cmd(frame(FUSE_OPEN, 1, 2, open.as_bytes()));
        assert!(ch.take().is_empty());
        assert_eq!(fuse.nodes.lock().get(FUSE_ROOT_ID).open_count, 0);
        assert_eq!(&*released.lock(), &[(PathBuf::from("/"), 42)]);

        fuse.process_cmd(frame(FUSE_OPEN, 1, 3, open.as_bytes()));
        let (head, payload) = only_reply(&ch);
        assert_eq!(head.error, 0);
        assert_eq!(payload.len(), 16);
        assert_eq!(fuse.nodes.lock().get(FUSE_ROOT_ID).open_count, 1);
    }

    #[test]
    fn statfs_without_callback_uses_defaults() {
        let (fuse, ch) = new_fuse(Operations::default(), None);
        send_init(&fuse, &ch);
        fuse.process_cmd(frame(FUSE_STATFS, 1, 2, &[]));
        let (head, payload) = only_reply(&ch);
        assert_eq!(head.error, 0);
        let out = fuse_statfs_out::read_from_bytes(&payload[..]).unwrap();
        assert_eq!(out.st.namelen, 255);
        assert_eq!(out.st.bsize, 512);
    }

    #[test]
    fn getxattr_probe_data_and_range_modes() {
        let op = Operations {
            getxattr: Some(Box::new(|_path, _name, buf| {
                let data = b"abc";
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(data.len())
            })),
            ..Operations::default()
        };
        let (fuse, ch) = new_fuse(op, None);
        send_init(&fuse, &ch);

        let probe = fuse_getxattr_in { size: 0, padding: 0 };
        let mut payload = probe.as_bytes().to_vec();
        payload.extend_from_slice(b"user.x\0");
        fuse.process_cmd(frame(FUSE_GETXATTR, 1, 2, &payload));
        let (head, body) = only_reply(&ch);
        assert_eq!(head.error, 0);
        let out = fuse_getxattr_out::read_from_bytes(&body[..]).unwrap();
        assert_eq!(out.size, 3);

        let small = fuse_getxattr_in { size: 2, padding: 0 };
        let mut payload = small.as_bytes().to_vec();
        payload.extend_from_slice(b"user.x\0");
        fuse.process_cmd(frame(FUSE_GETXATTR, 1, 3, &payload));
        let (head, _) = only_reply(&ch);
        assert_eq!(head.error, -libc::ERANGE);

        let big = fuse_getxattr_in { size: 8, padding: 0 };
        let mut payload = big.as_bytes().to_vec();
        payload.extend_from_slice(b"user.x\0");
        fuse.process_cmd(frame(FUSE_GETXATTR, 1, 4, &payload));
        let (head, body) = only_reply(&ch);
        assert_eq!(head.error, 0);
        assert_eq!(body, b"abc");
    }

    #[test]
    fn worker_capacity_is_restored_by_replies() {
        let (fuse, ch) = new_fuse(Operations::default(), None);
        send_init(&fuse, &ch);
        assert_eq!(fuse.num_available(), 0);
        fuse.process_cmd(frame(FUSE_STATFS, 1, 2, &[]));
        assert_eq!(fuse.num_available(), 0);
    }

    #[test]
    fn lib_options_are_recognized() {
        for opt in ["debug", "hard_remove", "use_ino", "allow_root", "readdir_ino"] {
            assert!(is_lib_option(opt));
        }
        assert!(!is_lib_option("max_read"));
        let flags = parse_lib_opts(Some("use_ino,bogus,hard_remove"));
        assert!(flags.use_ino && flags.hard_remove && !flags.debug);
    }
}
