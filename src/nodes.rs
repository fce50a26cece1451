//! The node directory.
//!
//! The kernel refers to filesystem objects by opaque 64-bit node ids; user
//! callbacks want absolute paths. This module owns the mapping between the
//! two: an arena of nodes keyed by id, a name index keyed by
//! (parent, name), reference-counted node lifetime driven by kernel lookup
//! counts, and path reconstruction by walking parent links.
//!
//! All operations run under the session's node-directory mutex; the table
//! itself is single-threaded.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use log::debug;

use crate::ll::abi::{fuse_attr, FUSE_MAX_PATH, FUSE_ROOT_ID};

/// A kernel-visible filesystem object.
///
/// `refctr` counts the children whose `parent` is this node, plus one while
/// the node itself is name-indexed (the root carries the extra reference
/// for its whole lifetime). `nlookup` counts outstanding kernel references;
/// when it reaches zero the node is detached from the name index, which may
/// cascade into destruction once nothing references it as a parent.
#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) nodeid: u64,
    pub(crate) generation: u64,
    pub(crate) parent: u64,
    pub(crate) name: Option<OsString>,
    pub(crate) refctr: u32,
    pub(crate) nlookup: u64,
    pub(crate) version: u64,
    pub(crate) open_count: u32,
    pub(crate) is_hidden: bool,
}

#[derive(Debug)]
pub(crate) struct NodeTable {
    /// Id index; owns every live node.
    nodes: HashMap<u64, Node>,
    /// Name index: attached children per parent id.
    names: HashMap<u64, HashMap<OsString, u64>>,
    /// Monotonic id counter; skips ids still in use.
    ctr: u64,
    /// Bumped every time `ctr` wraps to zero, so a reused id is
    /// distinguishable from its prior incarnation.
    pub(crate) generation: u64,
    /// Monotonic counter feeding hidden-name candidates.
    hidectr: u32,
}

impl NodeTable {
    pub(crate) fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            FUSE_ROOT_ID,
            Node {
                nodeid: FUSE_ROOT_ID,
                generation: 0,
                parent: 0,
                name: Some(OsString::from("/")),
                refctr: 1,
                nlookup: 1,
                version: 0,
                open_count: 0,
                is_hidden: false,
            },
        );
        NodeTable {
            nodes,
            names: HashMap::new(),
            ctr: 0,
            generation: 0,
            hidectr: 0,
        }
    }

    fn get_nocheck(&self, nodeid: u64) -> Option<&Node> {
        self.nodes.get(&nodeid)
    }

    /// Fetch a node the kernel guaranteed to be live. A miss means the
    /// node table no longer matches the kernel's view; there is no safe way
    /// to continue from that.
    pub(crate) fn get(&self, nodeid: u64) -> &Node {
        match self.nodes.get(&nodeid) {
            Some(node) => node,
            None => panic!("fuse internal error: node {} not found", nodeid),
        }
    }

    pub(crate) fn get_mut(&mut self, nodeid: u64) -> &mut Node {
        match self.nodes.get_mut(&nodeid) {
            Some(node) => node,
            None => panic!("fuse internal error: node {} not found", nodeid),
        }
    }

    pub(crate) fn lookup_id(&self, parent: u64, name: &OsStr) -> Option<u64> {
        self.names.get(&parent)?.get(name).copied()
    }

    /// Name-index probe.
    pub(crate) fn lookup(&self, parent: u64, name: &OsStr) -> Option<&Node> {
        let id = self.lookup_id(parent, name)?;
        self.get_nocheck(id)
    }

    /// Issue a fresh node id, skipping ids still present in the id index
    /// and bumping the generation when the counter wraps.
    fn next_id(&mut self) -> u64 {
        loop {
            self.ctr = self.ctr.wrapping_add(1);
            if self.ctr == 0 {
                self.generation += 1;
                continue;
            }
            if !self.nodes.contains_key(&self.ctr) {
                return self.ctr;
            }
        }
    }

    /// Attach a node under (parent, name) and account for it in the
    /// parent's refcount.
    fn hash_name(&mut self, nodeid: u64, parent: u64, name: &OsStr) {
        self.get_mut(parent).refctr += 1;
        let node = self.get_mut(nodeid);
        node.parent = parent;
        node.name = Some(name.to_os_string());
        self.names
            .entry(parent)
            .or_default()
            .insert(name.to_os_string(), nodeid);
    }

    /// Detach a node from the name index, releasing the reference it held
    /// on its parent. No-op for already-detached nodes.
    fn unhash_name(&mut self, nodeid: u64) {
        let node = self.get_mut(nodeid);
        let name = match node.name.take() {
            Some(name) => name,
            None => return,
        };
        let parent = node.parent;
        node.parent = 0;
        if let Some(children) = self.names.get_mut(&parent) {
            children.remove(&name);
            if children.is_empty() {
                self.names.remove(&parent);
            }
        }
        self.unref(parent);
    }

    fn unref(&mut self, nodeid: u64) {
        let node = self.get_mut(nodeid);
        assert!(node.refctr > 0);
        node.refctr -= 1;
        if node.refctr == 0 {
            if let Some(node) = self.nodes.remove(&nodeid) {
                debug!("delete: {}", nodeid);
                assert!(node.name.is_none());
            }
        }
    }

    /// Look up (parent, name), allocating a fresh node on a miss. In both
    /// cases the kernel gains a reference: `nlookup` is bumped and the
    /// node's version refreshed. Unless the filesystem supplies its own
    /// inode numbers, the reply attribute's `ino` is rewritten to the
    /// node id.
    pub(crate) fn find_or_create(
        &mut self,
        parent: u64,
        name: &OsStr,
        attr: &mut fuse_attr,
        version: u64,
        use_ino: bool,
    ) -> (u64, u64) {
        let nodeid = match self.lookup_id(parent, name) {
            Some(nodeid) => nodeid,
            None => {
                let nodeid = self.next_id();
                let generation = self.generation;
                self.nodes.insert(
                    nodeid,
                    Node {
                        nodeid,
                        generation,
                        parent: 0,
                        name: None,
                        refctr: 1,
                        nlookup: 0,
                        version: 0,
                        open_count: 0,
                        is_hidden: false,
                    },
                );
                self.hash_name(nodeid, parent, name);
                nodeid
            }
        };
        if !use_ino {
            attr.ino = nodeid;
        }
        let node = self.get_mut(nodeid);
        node.version = version;
        node.nlookup += 1;
        (nodeid, node.generation)
    }

    /// Drop `nlookup` kernel references. On reaching zero the node is
    /// detached from the name index, which may cascade into destroying
    /// ancestors nothing else references.
    pub(crate) fn forget(&mut self, nodeid: u64, nlookup: u64) {
        if nodeid == FUSE_ROOT_ID {
            return;
        }
        let node = self.get_mut(nodeid);
        assert!(
            node.nlookup >= nlookup,
            "fuse internal error: lookup count underflow on node {}",
            nodeid
        );
        node.nlookup -= nlookup;
        if node.nlookup == 0 {
            self.unhash_name(nodeid);
            self.unref(nodeid);
        }
    }

    /// Legacy (major <= 6) forget: only effective when the stored version
    /// matches, protecting against out-of-order forgets that refer to a
    /// different incarnation of the id.
    pub(crate) fn forget_old(&mut self, nodeid: u64, version: u64) {
        let matched = match self.get_nocheck(nodeid) {
            Some(node) => node.version == version && nodeid != FUSE_ROOT_ID,
            None => false,
        };
        if matched {
            self.get_mut(nodeid).version = 0;
            self.unhash_name(nodeid);
            self.unref(nodeid);
        }
    }

    /// Detach the child at (parent, name) if present.
    pub(crate) fn remove(&mut self, parent: u64, name: &OsStr) {
        if let Some(nodeid) = self.lookup_id(parent, name) {
            self.unhash_name(nodeid);
        }
    }

    /// Re-index a node under a new (parent, name). An existing node at the
    /// target is detached; its id stays usable by already-open handles
    /// until their references drain. With `hide`, an existing target is a
    /// busy error instead, and on success the source is marked hidden.
    pub(crate) fn rename(
        &mut self,
        olddir: u64,
        oldname: &OsStr,
        newdir: u64,
        newname: &OsStr,
        hide: bool,
    ) -> Result<(), libc::c_int> {
        let nodeid = match self.lookup_id(olddir, oldname) {
            Some(nodeid) => nodeid,
            None => return Ok(()),
        };
        if let Some(target) = self.lookup_id(newdir, newname) {
            if hide {
                log::error!("fuse: hidden file got created during hiding");
                return Err(libc::EBUSY);
            }
            self.unhash_name(target);
        }
        self.unhash_name(nodeid);
        self.hash_name(nodeid, newdir, newname);
        if hide {
            self.get_mut(nodeid).is_hidden = true;
        }
        Ok(())
    }

    /// Reconstruct the absolute path of a node, optionally with a leaf
    /// name appended (for lookup-class targets that do not exist yet).
    ///
    /// Mirrors right-to-left buffer assembly with a fixed upper bound:
    /// each component costs its length plus a leading slash, and the total
    /// must stay under [`FUSE_MAX_PATH`]. Fails on overflow and on
    /// detached ancestors.
    pub(crate) fn path_of(&self, nodeid: u64, leaf: Option<&OsStr>) -> Option<PathBuf> {
        let mut parts: Vec<&OsStr> = Vec::new();
        let mut remaining = FUSE_MAX_PATH - 1;

        let mut take = |name: &OsStr| -> bool {
            let need = name.as_bytes().len() + 1;
            if need > remaining {
                log::error!("fuse: path too long: ...{}", name.to_string_lossy());
                return false;
            }
            remaining -= need;
            true
        };

        if let Some(name) = leaf {
            if !take(name) {
                return None;
            }
            parts.push(name);
        }

        let mut node = self.get(nodeid);
        while node.nodeid != FUSE_ROOT_ID {
            let name = node.name.as_deref()?;
            if !take(name) {
                return None;
            }
            parts.push(name);
            node = self.get(node.parent);
        }

        let mut path = OsString::new();
        for part in parts.iter().rev() {
            path.push("/");
            path.push(part);
        }
        if path.is_empty() {
            path.push("/");
        }
        Some(PathBuf::from(path))
    }

    /// Whether the child at (parent, name) has open file handles.
    pub(crate) fn is_open(&self, parent: u64, name: &OsStr) -> bool {
        matches!(self.lookup(parent, name), Some(node) if node.open_count > 0)
    }

    /// Produce a hidden-name candidate for the child at (dir, oldname):
    /// synthesized from the node id and a monotonic counter, and not
    /// present in the name index. The caller still has to probe the
    /// backing filesystem before using it.
    pub(crate) fn hidden_name(&mut self, dir: u64, oldname: &OsStr) -> Option<OsString> {
        let nodeid = self.lookup_id(dir, oldname)?;
        loop {
            self.hidectr = self.hidectr.wrapping_add(1);
            let candidate = format!(".fuse_hidden{:08x}{:08x}", nodeid as u32, self.hidectr);
            let candidate = OsString::from(candidate);
            if self.lookup_id(dir, &candidate).is_none() {
                return Some(candidate);
            }
        }
    }

    /// Ids of all nodes still marked hidden; used by the teardown path to
    /// unlink them before the table goes away.
    pub(crate) fn hidden_nodes(&self) -> Vec<u64> {
        self.nodes
            .values()
            .filter(|n| n.is_hidden)
            .map(|n| n.nodeid)
            .collect()
    }

    #[cfg(test)]
    fn set_ctr(&mut self, ctr: u64) {
        self.ctr = ctr;
    }
}
