//! Request parsing.
//!
//! A framed request begins with a fixed header followed by opcode-specific
//! arguments. Both header layouts are understood: the modern one and the
//! shorter legacy major-5 one, selected by the negotiated protocol version.
//! The legacy peer is recognized at INIT time through the padding word of
//! the modern header layout, which on such a peer holds the first payload
//! word — the protocol major.

use std::error;
use std::ffi::OsStr;
use std::fmt;

use crate::ll::abi::*;
use crate::ll::argument::ArgumentIterator;
use crate::ll::ProtoVersion;

/// Error that may occur while parsing a request read off the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RequestError {
    /// Not enough data for the request header.
    ShortReadHeader(usize),
    /// The frame claims more data than was read.
    ShortRead(usize, usize),
    /// Kernel requested an unknown operation.
    UnknownOperation(u32),
    /// Not enough data for the opcode's arguments.
    InsufficientData,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::ShortReadHeader(len) => {
                write!(f, "short read of request header ({} bytes)", len)
            }
            RequestError::ShortRead(len, total) => {
                write!(f, "short read of request ({} < {})", len, total)
            }
            RequestError::UnknownOperation(opcode) => write!(f, "unknown opcode ({})", opcode),
            RequestError::InsufficientData => write!(f, "insufficient argument data"),
        }
    }
}

impl error::Error for RequestError {}

/// Request header, normalized across the two wire layouts.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RequestHeader {
    pub len: u32,
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub padding: u32,
}

/// A filesystem operation the kernel driver wants us to perform, with its
/// arguments decoded from the opcode-specific payload.
#[derive(Debug)]
pub(crate) enum Operation<'a> {
    Lookup { name: &'a OsStr },
    Forget { nlookup: u64 },
    GetAttr,
    SetAttr { valid: u32, attr: fuse_attr },
    ReadLink,
    Symlink { name: &'a OsStr, target: &'a OsStr },
    MkNod { mode: u32, rdev: u32, name: &'a OsStr },
    MkDir { mode: u32, name: &'a OsStr },
    Unlink { name: &'a OsStr },
    RmDir { name: &'a OsStr },
    Rename { newdir: u64, name: &'a OsStr, newname: &'a OsStr },
    Link { oldnodeid: u64, newname: &'a OsStr },
    Open { flags: u32 },
    Read { fh: u64, offset: u64, size: u32 },
    Write { fh: u64, offset: u64, write_flags: u32, data: &'a [u8] },
    StatFs,
    Release { fh: u64, flags: u32 },
    FSync { fh: u64, datasync: bool },
    SetXAttr { name: &'a OsStr, value: &'a [u8], flags: u32 },
    GetXAttr { name: &'a OsStr, size: u32 },
    ListXAttr { size: u32 },
    RemoveXAttr { name: &'a OsStr },
    Flush { fh: u64 },
    Init { major: u32, minor: u32 },
    OpenDir { flags: u32 },
    ReadDir { fh: u64, offset: u64, size: u32 },
    ReleaseDir { fh: u64 },
    FSyncDir { fh: u64, datasync: bool },
}

impl RequestHeader {
    /// Parse just the header of a framed request, returning it along with
    /// the opcode-specific payload that follows.
    pub(crate) fn parse(
        data: &[u8],
        proto: ProtoVersion,
    ) -> Result<(RequestHeader, &[u8]), RequestError> {
        let mut args = ArgumentIterator::new(data);
        let header = if proto.is_compat5() {
            let h: fuse_in_header_compat5 = args
                .fetch()
                .ok_or(RequestError::ShortReadHeader(data.len()))?;
            RequestHeader {
                len: h.len,
                opcode: h.opcode,
                unique: h.unique,
                nodeid: h.nodeid,
                uid: h.uid,
                gid: h.gid,
                pid: h.pid,
                padding: 0,
            }
        } else {
            let h: fuse_in_header = args
                .fetch()
                .ok_or(RequestError::ShortReadHeader(data.len()))?;
            RequestHeader {
                len: h.len,
                opcode: h.opcode,
                unique: h.unique,
                nodeid: h.nodeid,
                uid: h.uid,
                gid: h.gid,
                pid: h.pid,
                padding: h.padding,
            }
        };
        if (header.len as usize) > data.len() {
            return Err(RequestError::ShortRead(data.len(), header.len as usize));
        }
        Ok((header, args.fetch_all()))
    }
}

#[derive(Debug)]
pub(crate) struct Request<'a> {
    pub header: RequestHeader,
    pub operation: Operation<'a>,
}

impl<'a> Request<'a> {
    /// Parse one framed request. `proto` selects the header and payload
    /// layouts; before INIT the compiled-in version applies.
    pub(crate) fn parse(data: &'a [u8], proto: ProtoVersion) -> Result<Request<'a>, RequestError> {
        let (header, payload) = RequestHeader::parse(data, proto)?;
        let operation = Operation::parse(&header, proto, ArgumentIterator::new(payload))?;
        Ok(Request { header, operation })
    }
}

impl<'a> Operation<'a> {
    fn parse(
        header: &RequestHeader,
        proto: ProtoVersion,
        mut args: ArgumentIterator<'a>,
    ) -> Result<Operation<'a>, RequestError> {
        let short = RequestError::InsufficientData;
        let op = match header.opcode {
            FUSE_LOOKUP => Operation::Lookup {
                name: args.fetch_str().ok_or(short)?,
            },
            FUSE_FORGET => {
                let arg: fuse_forget_in = args.fetch().ok_or(short)?;
                Operation::Forget {
                    nlookup: arg.nlookup,
                }
            }
            FUSE_GETATTR => Operation::GetAttr,
            FUSE_SETATTR => {
                if proto.is_compat5() {
                    let arg: fuse_setattr_in_compat5 = args.fetch().ok_or(short)?;
                    Operation::SetAttr {
                        valid: arg.valid,
                        attr: arg.attr,
                    }
                } else {
                    let arg: fuse_setattr_in = args.fetch().ok_or(short)?;
                    Operation::SetAttr {
                        valid: arg.valid,
                        attr: arg.attr,
                    }
                }
            }
            FUSE_READLINK => Operation::ReadLink,
            FUSE_SYMLINK => Operation::Symlink {
                name: args.fetch_str().ok_or(short)?,
                target: args.fetch_str().ok_or(short)?,
            },
            FUSE_MKNOD => {
                let arg: fuse_mknod_in = args.fetch().ok_or(short)?;
                Operation::MkNod {
                    mode: arg.mode,
                    rdev: arg.rdev,
                    name: args.fetch_str().ok_or(short)?,
                }
            }
            FUSE_MKDIR => {
                let mode = if proto.is_compat5() {
                    let arg: fuse_mkdir_in_compat5 = args.fetch().ok_or(short)?;
                    arg.mode
                } else {
                    let arg: fuse_mkdir_in = args.fetch().ok_or(short)?;
                    arg.mode
                };
                Operation::MkDir {
                    mode,
                    name: args.fetch_str().ok_or(short)?,
                }
            }
            FUSE_UNLINK => Operation::Unlink {
                name: args.fetch_str().ok_or(short)?,
            },
            FUSE_RMDIR => Operation::RmDir {
                name: args.fetch_str().ok_or(short)?,
            },
            FUSE_RENAME => {
                let arg: fuse_rename_in = args.fetch().ok_or(short)?;
                Operation::Rename {
                    newdir: arg.newdir,
                    name: args.fetch_str().ok_or(short)?,
                    newname: args.fetch_str().ok_or(short)?,
                }
            }
            FUSE_LINK => {
                let arg: fuse_link_in = args.fetch().ok_or(short)?;
                Operation::Link {
                    oldnodeid: arg.oldnodeid,
                    newname: args.fetch_str().ok_or(short)?,
                }
            }
            FUSE_OPEN => {
                let arg: fuse_open_in = args.fetch().ok_or(short)?;
                Operation::Open { flags: arg.flags }
            }
            FUSE_READ => {
                let arg: fuse_read_in = args.fetch().ok_or(short)?;
                Operation::Read {
                    fh: arg.fh,
                    offset: arg.offset,
                    size: arg.size,
                }
            }
            FUSE_WRITE => {
                let arg: fuse_write_in = args.fetch().ok_or(short)?;
                let data = args.fetch_all();
                if data.len() < arg.size as usize {
                    return Err(short);
                }
                Operation::Write {
                    fh: arg.fh,
                    offset: arg.offset,
                    write_flags: arg.write_flags,
                    data: &data[..arg.size as usize],
                }
            }
            FUSE_STATFS => Operation::StatFs,
            FUSE_RELEASE => {
                let arg: fuse_release_in = args.fetch().ok_or(short)?;
                Operation::Release {
                    fh: arg.fh,
                    flags: arg.flags,
                }
            }
            FUSE_FSYNC => {
                let arg: fuse_fsync_in = args.fetch().ok_or(short)?;
                Operation::FSync {
                    fh: arg.fh,
                    datasync: arg.fsync_flags & 1 != 0,
                }
            }
            FUSE_SETXATTR => {
                let arg: fuse_setxattr_in = args.fetch().ok_or(short)?;
                let name = args.fetch_str().ok_or(short)?;
                let value = args.fetch_all();
                if value.len() < arg.size as usize {
                    return Err(short);
                }
                Operation::SetXAttr {
                    name,
                    value: &value[..arg.size as usize],
                    flags: arg.flags,
                }
            }
            FUSE_GETXATTR => {
                let arg: fuse_getxattr_in = args.fetch().ok_or(short)?;
                Operation::GetXAttr {
                    name: args.fetch_str().ok_or(short)?,
                    size: arg.size,
                }
            }
            FUSE_LISTXATTR => {
                let arg: fuse_getxattr_in = args.fetch().ok_or(short)?;
                Operation::ListXAttr { size: arg.size }
            }
            FUSE_REMOVEXATTR => Operation::RemoveXAttr {
                name: args.fetch_str().ok_or(short)?,
            },
            FUSE_FLUSH => {
                let arg: fuse_flush_in = args.fetch().ok_or(short)?;
                Operation::Flush { fh: arg.fh }
            }
            FUSE_INIT => {
                if header.padding == 5 {
                    // Legacy major-5 peer: its header is shorter, so the
                    // word read as padding was really the payload's major
                    // and the word at the modern payload offset is the
                    // minor.
                    let minor: u32 = args.fetch().ok_or(short)?;
                    Operation::Init { major: 5, minor }
                } else {
                    let arg: fuse_init_in_out = args.fetch().ok_or(short)?;
                    Operation::Init {
                        major: arg.major,
                        minor: arg.minor,
                    }
                }
            }
            FUSE_OPENDIR => {
                let arg: fuse_open_in = args.fetch().ok_or(short)?;
                Operation::OpenDir { flags: arg.flags }
            }
            FUSE_READDIR => {
                let arg: fuse_read_in = args.fetch().ok_or(short)?;
                Operation::ReadDir {
                    fh: arg.fh,
                    offset: arg.offset,
                    size: arg.size,
                }
            }
            FUSE_RELEASEDIR => {
                let arg: fuse_release_in = args.fetch().ok_or(short)?;
                Operation::ReleaseDir { fh: arg.fh }
            }
            FUSE_FSYNCDIR => {
                let arg: fuse_fsync_in = args.fetch().ok_or(short)?;
                Operation::FSyncDir {
                    fh: arg.fh,
                    datasync: arg.fsync_flags & 1 != 0,
                }
            }
            opcode => return Err(RequestError::UnknownOperation(opcode)),
        };
        Ok(op)
    }
}
