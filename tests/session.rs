//! End-to-end session tests over an in-memory channel.
//!
//! Frames are built the way the kernel driver would lay them out (host
//! endian), fed through the message loop, and the replies picked apart
//! byte by byte.

use std::collections::VecDeque;
use std::io;
use std::io::IoSlice;
use std::path::Path;
use std::sync::{Arc, Mutex};

use pathfuse::{Channel, FileStat, FileType, Fuse, Operations};

#[derive(Clone, Default)]
struct Loopback(Arc<Inner>);

#[derive(Default)]
struct Inner {
    incoming: Mutex<VecDeque<Vec<u8>>>,
    outgoing: Mutex<Vec<Vec<u8>>>,
}

impl Channel for Loopback {
    fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.incoming.lock().unwrap().pop_front() {
            Some(frame) => {
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(frame.len())
            }
            // Queue drained; reads as an unmount.
            None => Err(io::Error::from_raw_os_error(libc::ENODEV)),
        }
    }

    fn send(&self, bufs: &[IoSlice<'_>]) -> io::Result<()> {
        let mut frame = Vec::new();
        for buf in bufs {
            frame.extend_from_slice(buf);
        }
        self.0.outgoing.lock().unwrap().push(frame);
        Ok(())
    }
}

impl Loopback {
    fn push(&self, frame: Vec<u8>) {
        self.0.incoming.lock().unwrap().push_back(frame);
    }

    fn drain(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.0.outgoing.lock().unwrap())
    }
}

const LOOKUP: u32 = 1;
const MKDIR: u32 = 9;
const UNLINK: u32 = 10;
const OPEN: u32 = 14;
const WRITE: u32 = 16;
const RELEASE: u32 = 18;
const INIT: u32 = 26;
const OPENDIR: u32 = 27;
const READDIR: u32 = 28;

fn uid() -> u32 {
    unsafe { libc::getuid() }
}

/// Modern request frame: 40-byte header plus payload.
fn frame(opcode: u32, unique: u64, nodeid: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&((40 + payload.len()) as u32).to_ne_bytes());
    buf.extend_from_slice(&opcode.to_ne_bytes());
    buf.extend_from_slice(&unique.to_ne_bytes());
    buf.extend_from_slice(&nodeid.to_ne_bytes());
    buf.extend_from_slice(&uid().to_ne_bytes());
    buf.extend_from_slice(&uid().to_ne_bytes());
    buf.extend_from_slice(&1u32.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Legacy major-5 request frame: 36-byte header, no padding word.
fn frame_v5(opcode: u32, unique: u64, nodeid: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&((36 + payload.len()) as u32).to_ne_bytes());
    buf.extend_from_slice(&opcode.to_ne_bytes());
    buf.extend_from_slice(&unique.to_ne_bytes());
    buf.extend_from_slice(&nodeid.to_ne_bytes());
    buf.extend_from_slice(&uid().to_ne_bytes());
    buf.extend_from_slice(&uid().to_ne_bytes());
    buf.extend_from_slice(&1u32.to_ne_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn name_payload(name: &str) -> Vec<u8> {
    let mut buf = name.as_bytes().to_vec();
    buf.push(0);
    buf
}

fn open_in(flags: u32) -> Vec<u8> {
    let mut buf = flags.to_ne_bytes().to_vec();
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf
}

fn release_in(fh: u64, flags: u32) -> Vec<u8> {
    let mut buf = fh.to_ne_bytes().to_vec();
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf
}

fn read_in(fh: u64, offset: u64, size: u32) -> Vec<u8> {
    let mut buf = fh.to_ne_bytes().to_vec();
    buf.extend_from_slice(&offset.to_ne_bytes());
    buf.extend_from_slice(&size.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes(buf[at..at + 4].try_into().unwrap())
}

fn u64_at(buf: &[u8], at: usize) -> u64 {
    u64::from_ne_bytes(buf[at..at + 8].try_into().unwrap())
}

fn i32_at(buf: &[u8], at: usize) -> i32 {
    i32::from_ne_bytes(buf[at..at + 4].try_into().unwrap())
}

/// Split a reply into (error, unique, payload).
fn parse_reply(frame: &[u8]) -> (i32, u64, &[u8]) {
    assert_eq!(u32_at(frame, 0) as usize, frame.len());
    (i32_at(frame, 4), u64_at(frame, 8), &frame[16..])
}

fn file_stat(ino: u64) -> FileStat {
    FileStat {
        ino,
        size: 13,
        nlink: 1,
        ..FileStat::default()
    }
}

fn dir_stat() -> FileStat {
    FileStat {
        kind: FileType::Directory,
        perm: 0o755,
        nlink: 2,
        ..FileStat::default()
    }
}

fn session(op: Operations, opts: Option<&str>) -> (Fuse, Loopback) {
    let ch = Loopback::default();
    let fuse = Fuse::with_channel(Box::new(ch.clone()), opts, op);
    (fuse, ch)
}

#[test]
fn lookup_of_a_fresh_name() {
    let op = Operations {
        getattr: Some(Box::new(|path| {
            if path == Path::new("/hello") {
                Ok(file_stat(0))
            } else {
                Err(libc::ENOENT)
            }
        })),
        ..Operations::default()
    };
    let (fuse, ch) = session(op, None);

    ch.push(frame(INIT, 1, 0, &[7u32.to_ne_bytes(), 2u32.to_ne_bytes()].concat()));
    ch.push(frame(LOOKUP, 2, 1, &name_payload("hello")));
    fuse.run();

    let replies = ch.drain();
    assert_eq!(replies.len(), 2);
    let (err, unique, payload) = parse_reply(&replies[0]);
    assert_eq!((err, unique), (0, 1));
    assert_eq!(u32_at(payload, 0), 7);

    let (err, unique, payload) = parse_reply(&replies[1]);
    assert_eq!((err, unique), (0, 2));
    assert_eq!(payload.len(), 120);
    assert_eq!(u64_at(payload, 0), 2); // nodeid
    assert_eq!(u64_at(payload, 8), 0); // generation
    assert_eq!(u64_at(payload, 16), 1); // entry_valid
    assert_eq!(u64_at(payload, 24), 1); // attr_valid
    assert_eq!(u64_at(payload, 40), 2); // attr.ino mirrors the node id
}

#[test]
fn use_ino_trusts_the_filesystem_inode() {
    let op = Operations {
        getattr: Some(Box::new(|_| Ok(file_stat(777)))),
        ..Operations::default()
    };
    let (fuse, ch) = session(op, Some("use_ino"));

    ch.push(frame(INIT, 1, 0, &[7u32.to_ne_bytes(), 2u32.to_ne_bytes()].concat()));
    ch.push(frame(LOOKUP, 2, 1, &name_payload("hello")));
    fuse.run();

    let replies = ch.drain();
    let (err, _, payload) = parse_reply(&replies[1]);
    assert_eq!(err, 0);
    assert_eq!(u64_at(payload, 0), 2); // node id still allocated
    assert_eq!(u64_at(payload, 40), 777); // but the inode is the user's
}

fn removal_ops(events: &Arc<Mutex<Vec<String>>>) -> Operations {
    let ev_rename = Arc::clone(events);
    let ev_unlink = Arc::clone(events);
    let ev_release = Arc::clone(events);
    Operations {
        getattr: Some(Box::new(|path| {
            if path == Path::new("/hello") {
                Ok(file_stat(0))
            } else {
                // Hidden-name candidates probe here and must miss.
                Err(libc::ENOENT)
            }
        })),
        open: Some(Box::new(|_, fi| {
            fi.fh = 11;
            Ok(())
        })),
        rename: Some(Box::new(move |from, to| {
            ev_rename
                .lock()
                .unwrap()
                .push(format!("rename {} {}", from.display(), to.display()));
            Ok(())
        })),
        unlink: Some(Box::new(move |path| {
            ev_unlink
                .lock()
                .unwrap()
                .push(format!("unlink {}", path.display()));
            Ok(())
        })),
        release: Some(Box::new(move |path, _| {
            ev_release
                .lock()
                .unwrap()
                .push(format!("release {}", path.display()));
            Ok(())
        })),
        ..Operations::default()
    }
}

#[test]
fn unlink_while_open_hides_until_last_release() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let (fuse, ch) = session(removal_ops(&events), None);

    ch.push(frame(INIT, 1, 0, &[7u32.to_ne_bytes(), 2u32.to_ne_bytes()].concat()));
    ch.push(frame(LOOKUP, 2, 1, &name_payload("hello")));
    ch.push(frame(OPEN, 3, 2, &open_in(0)));
    ch.push(frame(UNLINK, 4, 1, &name_payload("hello")));
    ch.push(frame(RELEASE, 5, 2, &release_in(11, 0)));
    fuse.run();

    let replies = ch.drain();
    assert_eq!(replies.len(), 5);
    let (err, _, _) = parse_reply(&replies[3]);
    assert_eq!(err, 0);

    let events = events.lock().unwrap();
    assert_eq!(
        &*events,
        &[
            "rename /hello /.fuse_hidden0000000200000001".to_string(),
            "release /.fuse_hidden0000000200000001".to_string(),
            "unlink /.fuse_hidden0000000200000001".to_string(),
        ]
    );
}

#[test]
fn hard_remove_unlinks_immediately() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let (fuse, ch) = session(removal_ops(&events), Some("hard_remove"));

    ch.push(frame(INIT, 1, 0, &[7u32.to_ne_bytes(), 2u32.to_ne_bytes()].concat()));
    ch.push(frame(LOOKUP, 2, 1, &name_payload("hello")));
    ch.push(frame(OPEN, 3, 2, &open_in(0)));
    ch.push(frame(UNLINK, 4, 1, &name_payload("hello")));
    ch.push(frame(RELEASE, 5, 2, &release_in(11, 0)));
    fuse.run();

    let replies = ch.drain();
    assert_eq!(replies.len(), 5);
    let (err, _, _) = parse_reply(&replies[3]);
    assert_eq!(err, 0);

    let events = events.lock().unwrap();
    // No hiding dance: the unlink happens up front, and release sees a
    // node that no longer has a reconstructible path.
    assert_eq!(
        &*events,
        &["unlink /hello".to_string(), "release -".to_string()]
    );
}

#[test]
fn readdir_pages_through_a_large_directory() {
    let op = Operations {
        getattr: Some(Box::new(|_| Ok(dir_stat()))),
        readdir: Some(Box::new(|_, filler, offset, _| {
            for i in (offset as usize)..30 {
                let name = format!("e{:02}", i);
                if filler.push(
                    std::ffi::OsStr::new(&name),
                    Some(&file_stat(i as u64 + 100)),
                    (i + 1) as u64,
                ) {
                    break;
                }
            }
            Ok(())
        })),
        ..Operations::default()
    };
    let (fuse, ch) = session(op, None);

    ch.push(frame(INIT, 1, 0, &[7u32.to_ne_bytes(), 2u32.to_ne_bytes()].concat()));
    ch.push(frame(OPENDIR, 2, 1, &open_in(0)));
    fuse.run();
    let replies = ch.drain();
    let (err, _, payload) = parse_reply(&replies[1]);
    assert_eq!(err, 0);
    let fh = u64_at(payload, 0);

    let mut names = Vec::new();
    let mut offset = 0u64;
    let mut unique = 3;
    loop {
        ch.push(frame(READDIR, unique, 1, &read_in(fh, offset, 300)));
        unique += 1;
        fuse.run();
        let replies = ch.drain();
        assert_eq!(replies.len(), 1);
        let (err, _, payload) = parse_reply(&replies[0]);
        assert_eq!(err, 0);
        if payload.is_empty() {
            break;
        }
        assert!(payload.len() <= 300);
        // Each reply must end exactly at a record boundary.
        let mut rest = payload;
        while !rest.is_empty() {
            let namelen = u32_at(rest, 16) as usize;
            let entsize = (24 + namelen + 7) & !7;
            names.push(String::from_utf8(rest[24..24 + namelen].to_vec()).unwrap());
            offset = u64_at(rest, 8);
            rest = &rest[entsize..];
        }
    }

    let expected: Vec<String> = (0..30).map(|i| format!("e{:02}", i)).collect();
    assert_eq!(names, expected);
}

#[test]
fn major_5_negotiation_selects_compat_layouts() {
    let mkdirs = Arc::new(Mutex::new(Vec::new()));
    let mkdir_log = Arc::clone(&mkdirs);
    let op = Operations {
        getattr: Some(Box::new(|path| {
            if path == Path::new("/dir") {
                Ok(dir_stat())
            } else if path == Path::new("/f") {
                Ok(file_stat(0))
            } else {
                Err(libc::ENOENT)
            }
        })),
        mkdir: Some(Box::new(move |path, mode| {
            mkdir_log
                .lock()
                .unwrap()
                .push(format!("mkdir {} {:o}", path.display(), mode));
            Ok(())
        })),
        open: Some(Box::new(|_, fi| {
            fi.fh = 99;
            Ok(())
        })),
        write: Some(Box::new(|_, data, _, _| Ok(data.len()))),
        ..Operations::default()
    };
    let (fuse, ch) = session(op, None);

    // The v5 kernel's INIT: short header, so the major lands where the
    // modern layout keeps its padding word.
    ch.push(frame_v5(INIT, 1, 0, &[5u32.to_ne_bytes(), 1u32.to_ne_bytes()].concat()));
    fuse.run();
    let replies = ch.drain();
    let (err, _, payload) = parse_reply(&replies[0]);
    assert_eq!(err, 0);
    assert_eq!(u32_at(payload, 0), 5);
    assert_eq!(u32_at(payload, 4), 1);

    // Compat-5 MKDIR payload: the name sits right after the mode.
    let mut payload = 0o750u32.to_ne_bytes().to_vec();
    payload.extend_from_slice(b"dir\0");
    ch.push(frame_v5(MKDIR, 2, 1, &payload));
    fuse.run();
    let replies = ch.drain();
    let (err, _, payload) = parse_reply(&replies[0]);
    assert_eq!(err, 0);
    assert_eq!(payload.len(), 120);
    assert_eq!(u64_at(payload, 0), 2);
    assert_eq!(&*mkdirs.lock().unwrap(), &["mkdir /dir 750".to_string()]);

    // Compat-5 open-out and write-out are the unpadded sizes.
    ch.push(frame_v5(LOOKUP, 3, 1, &name_payload("f")));
    fuse.run();
    let replies = ch.drain();
    let (_, _, payload) = parse_reply(&replies[0]);
    let file_node = u64_at(payload, 0);
    assert_eq!(file_node, 3);

    ch.push(frame_v5(OPEN, 4, file_node, &open_in(0)));
    fuse.run();
    let replies = ch.drain();
    let (err, _, payload) = parse_reply(&replies[0]);
    assert_eq!(err, 0);
    assert_eq!(payload.len(), 12);
    assert_eq!(u64_at(payload, 0), 99);

    let mut payload = 99u64.to_ne_bytes().to_vec();
    payload.extend_from_slice(&0u64.to_ne_bytes());
    payload.extend_from_slice(&3u32.to_ne_bytes());
    payload.extend_from_slice(&0u32.to_ne_bytes());
    payload.extend_from_slice(b"abc");
    ch.push(frame_v5(WRITE, 5, file_node, &payload));
    fuse.run();
    let replies = ch.drain();
    let (err, _, payload) = parse_reply(&replies[0]);
    assert_eq!(err, 0);
    assert_eq!(payload.len(), 4);
    assert_eq!(u32_at(payload, 0), 3);
}

#[test]
fn major_6_negotiation() {
    let (fuse, ch) = session(Operations::default(), None);
    ch.push(frame(INIT, 1, 0, &[6u32.to_ne_bytes(), 5u32.to_ne_bytes()].concat()));
    fuse.run();
    let replies = ch.drain();
    let (err, _, payload) = parse_reply(&replies[0]);
    assert_eq!(err, 0);
    assert_eq!(u32_at(payload, 0), 6);
    assert_eq!(u32_at(payload, 4), 1);
}
