//! Reply marshalling.
//!
//! A reply is a fixed header (length, error, request unique) followed by an
//! optional opcode-specific payload. Error codes are negative errnos in the
//! range (-1000, 0]; anything else is forced to `-ERANGE`. The handful of
//! payload structs whose layout depends on the negotiated protocol version
//! are encoded here.

use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;
use zerocopy::IntoBytes;

use crate::ll::abi::*;
use crate::ll::ProtoVersion;
use crate::{FileStat, Statfs};

/// Force out-of-range error values into the reply error domain.
pub(crate) fn clamp_error(error: i32) -> i32 {
    if error <= -1000 || error > 0 {
        warn!("fuse: bad error value: {}", error);
        -libc::ERANGE
    } else {
        error
    }
}

pub(crate) fn out_header(unique: u64, error: i32, payload_len: usize) -> fuse_out_header {
    fuse_out_header {
        len: (std::mem::size_of::<fuse_out_header>() + payload_len) as u32,
        error,
        unique,
    }
}

fn time_parts(t: SystemTime) -> (u64, u32) {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs(), d.subsec_nanos()),
        Err(_) => (0, 0),
    }
}

pub(crate) fn system_time(secs: u64, nsec: u32) -> SystemTime {
    UNIX_EPOCH + std::time::Duration::new(secs, nsec)
}

pub(crate) fn stat_to_attr(st: &FileStat) -> fuse_attr {
    let (atime, atimensec) = time_parts(st.atime);
    let (mtime, mtimensec) = time_parts(st.mtime);
    let (ctime, ctimensec) = time_parts(st.ctime);
    fuse_attr {
        ino: st.ino,
        size: st.size,
        blocks: st.blocks,
        atime,
        mtime,
        ctime,
        atimensec,
        mtimensec,
        ctimensec,
        mode: st.kind.mode_bits() | u32::from(st.perm),
        nlink: st.nlink,
        uid: st.uid,
        gid: st.gid,
        rdev: st.rdev,
    }
}

pub(crate) fn attr_out_bytes(attr: fuse_attr) -> Vec<u8> {
    let out = fuse_attr_out {
        attr_valid: ATTR_REVALIDATE_SECS,
        attr_valid_nsec: 0,
        dummy: 0,
        attr,
    };
    out.as_bytes().to_vec()
}

pub(crate) fn open_out_bytes(proto: ProtoVersion, fh: u64) -> Vec<u8> {
    if proto.is_compat5() {
        fuse_open_out_compat5 { fh, open_flags: 0 }.as_bytes().to_vec()
    } else {
        fuse_open_out {
            fh,
            open_flags: 0,
            padding: 0,
        }
        .as_bytes()
        .to_vec()
    }
}

pub(crate) fn write_out_bytes(proto: ProtoVersion, size: u32) -> Vec<u8> {
    if proto.is_compat5() {
        fuse_write_out_compat5 { size }.as_bytes().to_vec()
    } else {
        fuse_write_out { size, padding: 0 }.as_bytes().to_vec()
    }
}

pub(crate) fn getxattr_out_bytes(proto: ProtoVersion, size: u32) -> Vec<u8> {
    if proto.is_compat5() {
        fuse_getxattr_out_compat5 { size }.as_bytes().to_vec()
    } else {
        fuse_getxattr_out { size, padding: 0 }.as_bytes().to_vec()
    }
}

pub(crate) fn statfs_out_bytes(st: &Statfs) -> Vec<u8> {
    let out = fuse_statfs_out {
        st: fuse_kstatfs {
            blocks: st.blocks,
            bfree: st.bfree,
            bavail: st.bavail,
            files: st.files,
            ffree: st.ffree,
            bsize: st.bsize,
            namelen: st.namelen,
        },
    };
    out.as_bytes().to_vec()
}

/// How long the kernel may cache a lookup reply's attributes.
pub(crate) const ATTR_REVALIDATE_SECS: u64 = 1;
/// How long the kernel may cache a lookup reply's entry.
pub(crate) const ENTRY_REVALIDATE_SECS: u64 = 1;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FileType;

    #[test]
    fn error_values_outside_range_become_erange() {
        assert_eq!(clamp_error(0), 0);
        assert_eq!(clamp_error(-libc::ENOENT), -libc::ENOENT);
        assert_eq!(clamp_error(-999), -999);
        assert_eq!(clamp_error(-1000), -libc::ERANGE);
        assert_eq!(clamp_error(5), -libc::ERANGE);
    }

    #[test]
    fn header_counts_payload() {
        let out = out_header(7, 0, 16);
        assert_eq!(out.len, 32);
        assert_eq!(out.unique, 7);
    }

    #[test]
    fn versioned_payload_sizes() {
        let compat5 = ProtoVersion { major: 5, minor: 1 };
        let modern = ProtoVersion::NATIVE;
        assert_eq!(open_out_bytes(modern, 1).len(), 16);
        assert_eq!(open_out_bytes(compat5, 1).len(), 12);
        assert_eq!(write_out_bytes(modern, 1).len(), 8);
        assert_eq!(write_out_bytes(compat5, 1).len(), 4);
        assert_eq!(getxattr_out_bytes(modern, 1).len(), 8);
        assert_eq!(getxattr_out_bytes(compat5, 1).len(), 4);
        assert_eq!(statfs_out_bytes(&Statfs::default()).len(), 48);
    }

    #[test]
    fn stat_conversion_merges_kind_and_perm() {
        let st = FileStat {
            kind: FileType::Directory,
            perm: 0o755,
            ..FileStat::default()
        };
        let attr = stat_to_attr(&st);
        assert_eq!(attr.mode, libc::S_IFDIR as u32 | 0o755);
    }
}
