//! Directory-read buffering.
//!
//! Each open directory owns an accumulator that collects dirent records in
//! the protocol wire format and serves successive READDIR requests from it.
//! Two operating modes exist, keyed by the negotiated protocol major: the
//! legacy major-5 dialect has no entry offsets, so the whole directory is
//! filled in one shot and sliced by request offset; the modern dialect
//! carries per-entry offsets and fills at most one request window at a
//! time.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use parking_lot::Mutex;
use zerocopy::IntoBytes;

use crate::ll::abi::{
    fuse_dirent, fuse_dirent_align, fuse_dirent_compat5, FUSE_NAME_MAX, FUSE_NAME_OFFSET,
    FUSE_NAME_OFFSET_COMPAT5,
};
use crate::ll::ProtoVersion;
use crate::nodes::NodeTable;
use crate::FileStat;

/// A per-opendir directory handle.
///
/// The kernel-visible file handle is the registry id under which the
/// session stores this object; the file handle chosen by the user's
/// `opendir` callback lives inside and is handed back to the directory
/// callbacks.
#[derive(Debug)]
pub(crate) struct DirHandle {
    pub(crate) state: Mutex<DirState>,
    pub(crate) user_fh: u64,
    /// Node id of the directory, kept when readdir entries should get
    /// best-effort inode numbers.
    pub(crate) node: Option<u64>,
}

impl DirHandle {
    pub(crate) fn new(user_fh: u64, node: Option<u64>) -> Self {
        DirHandle {
            state: Mutex::new(DirState {
                contents: Vec::new(),
                filled: false,
                error: 0,
                needlen: 0,
            }),
            user_fh,
            node,
        }
    }
}

/// Fill state of one directory handle, guarded by the handle mutex.
#[derive(Debug)]
pub(crate) struct DirState {
    /// Dirent records in wire format.
    pub(crate) contents: Vec<u8>,
    /// Whether `contents` holds the entire directory (slice-by-offset
    /// mode) rather than a single request window.
    pub(crate) filled: bool,
    /// Error reported by the fill sink, if any.
    pub(crate) error: i32,
    /// Requested read size bounding a modern-mode fill.
    pub(crate) needlen: usize,
}

/// Sink passed to the `readdir` callback; collects one dirent per
/// [`push`](FillDir::push) call.
#[derive(Debug)]
pub struct FillDir<'a> {
    state: &'a mut DirState,
    nodes: &'a Mutex<NodeTable>,
    dir: Option<u64>,
    proto: ProtoVersion,
    use_ino: bool,
    readdir_ino: bool,
}

impl<'a> FillDir<'a> {
    pub(crate) fn new(
        state: &'a mut DirState,
        nodes: &'a Mutex<NodeTable>,
        dir: Option<u64>,
        proto: ProtoVersion,
        use_ino: bool,
        readdir_ino: bool,
    ) -> Self {
        FillDir {
            state,
            nodes,
            dir,
            proto,
            use_ino,
            readdir_ino,
        }
    }

    /// Add one directory entry.
    ///
    /// `off` is the offset of the *next* entry, or zero for filesystems
    /// that do not track directory offsets. Returns `true` when the
    /// buffer is full (or an entry was rejected) and the callback should
    /// stop producing entries.
    pub fn push(&mut self, name: &OsStr, stat: Option<&FileStat>, off: u64) -> bool {
        let mut ino = stat.map(|s| s.ino).unwrap_or(u64::MAX);
        let typ = stat.map(|s| s.kind.mode_bits() >> 12).unwrap_or(0);
        if !self.use_ino {
            ino = u64::MAX;
            if self.readdir_ino {
                if let Some(dir) = self.dir {
                    let nodes = self.nodes.lock();
                    if let Some(id) = nodes.lookup_id(dir, name) {
                        ino = id;
                    }
                }
            }
        }

        let bytes = name.as_bytes();
        if bytes.is_empty() {
            self.state.error = -libc::EIO;
            return true;
        }
        let namelen = bytes.len().min(FUSE_NAME_MAX);
        let bytes = &bytes[..namelen];

        let name_offset = if self.proto.is_compat5() {
            FUSE_NAME_OFFSET_COMPAT5
        } else {
            FUSE_NAME_OFFSET
        };
        let entlen = name_offset + namelen;
        let entsize = fuse_dirent_align(entlen);
        let newlen = self.state.contents.len() + entsize;
        if off != 0 && !self.proto.is_compat5() {
            self.state.filled = false;
            if newlen > self.state.needlen {
                return true;
            }
        }

        if self.proto.is_compat5() {
            let dirent = fuse_dirent_compat5 {
                ino,
                namelen: namelen as u32,
                typ,
            };
            self.state.contents.extend_from_slice(dirent.as_bytes());
        } else {
            let dirent = fuse_dirent {
                ino,
                off: if off != 0 { off } else { newlen as u64 },
                namelen: namelen as u32,
                typ,
            };
            self.state.contents.extend_from_slice(dirent.as_bytes());
        }
        self.state.contents.extend_from_slice(bytes);
        self.state.contents.resize(newlen, 0);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ll::abi::FUSE_ROOT_ID;
    use crate::FileType;
    use zerocopy::FromBytes;

    const MODERN: ProtoVersion = ProtoVersion::NATIVE;
    const COMPAT5: ProtoVersion = ProtoVersion { major: 5, minor: 1 };

    fn state(needlen: usize) -> DirState {
        DirState {
            contents: Vec::new(),
            filled: true,
            error: 0,
            needlen,
        }
    }

    fn stat(ino: u64) -> FileStat {
        FileStat {
            ino,
            kind: FileType::RegularFile,
            ..FileStat::default()
        }
    }

    fn parse_modern(contents: &[u8]) -> Vec<(u64, u64, String)> {
        let mut out = Vec::new();
        let mut rest = contents;
        while !rest.is_empty() {
            let (head, tail) = fuse_dirent::read_from_prefix(rest).unwrap();
            let name = String::from_utf8(tail[..head.namelen as usize].to_vec()).unwrap();
            out.push((head.ino, head.off, name));
            let entsize = fuse_dirent_align(FUSE_NAME_OFFSET + head.namelen as usize);
            rest = &rest[entsize..];
        }
        out
    }

    #[test]
    fn modern_fill_stops_at_window() {
        let nodes = Mutex::new(NodeTable::new());
        // Room for two 32-byte records, not three.
        let mut st = state(70);
        let mut fill = FillDir::new(&mut st, &nodes, None, MODERN, true, false);
        assert!(!fill.push(OsStr::new("one"), Some(&stat(11)), 1));
        assert!(!fill.push(OsStr::new("two"), Some(&stat(12)), 2));
        assert!(fill.push(OsStr::new("three"), Some(&stat(13)), 3));
        assert!(!st.filled);
        assert_eq!(st.error, 0);
        let entries = parse_modern(&st.contents);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], (11, 1, "one".to_string()));
        assert_eq!(entries[1], (12, 2, "two".to_string()));
        assert_eq!(st.contents.len() % 8, 0);
    }

    #[test]
    fn entries_without_offsets_get_buffer_positions() {
        let nodes = Mutex::new(NodeTable::new());
        let mut st = state(4096);
        let mut fill = FillDir::new(&mut st, &nodes, None, MODERN, true, false);
        assert!(!fill.push(OsStr::new("a"), Some(&stat(1)), 0));
        assert!(!fill.push(OsStr::new("b"), Some(&stat(2)), 0));
        assert!(st.filled);
        let entries = parse_modern(&st.contents);
        assert_eq!(entries[0].1, 32);
        assert_eq!(entries[1].1, 64);
    }

    #[test]
    fn compat5_fill_ignores_offsets_and_window() {
        let nodes = Mutex::new(NodeTable::new());
        let mut st = state(8);
        let mut fill = FillDir::new(&mut st, &nodes, None, COMPAT5, true, false);
        for i in 0..50u64 {
            let name = format!("entry{}", i);
            assert!(!fill.push(OsStr::new(&name), Some(&stat(i)), i + 1));
        }
        assert!(st.filled);
        // 16-byte prefix plus the name, aligned up.
        let first = fuse_dirent_compat5::read_from_prefix(&st.contents).unwrap().0;
        assert_eq!(first.namelen, 6);
        assert_eq!(st.contents.len() % 8, 0);
        assert!(st.contents.len() > st.needlen);
    }

    #[test]
    fn empty_name_is_an_io_error() {
        let nodes = Mutex::new(NodeTable::new());
        let mut st = state(4096);
        let mut fill = FillDir::new(&mut st, &nodes, None, MODERN, false, false);
        assert!(fill.push(OsStr::new(""), None, 0));
        assert_eq!(st.error, -libc::EIO);
        assert!(st.contents.is_empty());
    }

    #[test]
    fn overlong_name_is_truncated() {
        let nodes = Mutex::new(NodeTable::new());
        let mut st = state(8192);
        let mut fill = FillDir::new(&mut st, &nodes, None, MODERN, true, false);
        let long = "x".repeat(FUSE_NAME_MAX + 100);
        assert!(!fill.push(OsStr::new(&long), Some(&stat(1)), 0));
        let head = fuse_dirent::read_from_prefix(&st.contents).unwrap().0;
        assert_eq!(head.namelen as usize, FUSE_NAME_MAX);
    }

    #[test]
    fn synthesized_inodes_come_from_the_node_table() {
        let nodes = Mutex::new(NodeTable::new());
        let child = {
            let mut table = nodes.lock();
            let mut attr = Default::default();
            let (id, _) =
                table.find_or_create(FUSE_ROOT_ID, OsStr::new("known"), &mut attr, 1, false);
            id
        };
        let mut st = state(4096);
        let mut fill = FillDir::new(
            &mut st,
            &nodes,
            Some(FUSE_ROOT_ID),
            MODERN,
            false,
            true,
        );
        // The user-supplied inode is ignored without use_ino.
        assert!(!fill.push(OsStr::new("known"), Some(&stat(999)), 0));
        assert!(!fill.push(OsStr::new("unknown"), Some(&stat(999)), 0));
        let entries = parse_modern(&st.contents);
        assert_eq!(entries[0].0, child);
        assert_eq!(entries[1].0, u64::MAX);
    }
}
