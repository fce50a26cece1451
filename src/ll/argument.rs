//! Argument cursor over a request payload.
//!
//! Request payloads are sequences of fixed-layout structs and NUL-terminated
//! names. The cursor hands out typed copies and name slices in order.

use std::ffi::OsStr;
use std::mem;
use std::os::unix::ffi::OsStrExt;

use zerocopy::FromBytes;

pub(crate) struct ArgumentIterator<'a> {
    data: &'a [u8],
}

impl<'a> ArgumentIterator<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        ArgumentIterator { data }
    }

    /// Fetch a typed argument from the front of the payload.
    pub(crate) fn fetch<T: FromBytes>(&mut self) -> Option<T> {
        let (arg, rest) = T::read_from_prefix(self.data).ok()?;
        self.data = rest;
        Some(arg)
    }

    /// Fetch a NUL-terminated name from the front of the payload.
    pub(crate) fn fetch_str(&mut self) -> Option<&'a OsStr> {
        let len = memchr::memchr(0, self.data)?;
        let (name, rest) = self.data.split_at(len);
        self.data = &rest[1..];
        Some(OsStr::from_bytes(name))
    }

    /// Fetch the remaining payload.
    pub(crate) fn fetch_all(&mut self) -> &'a [u8] {
        mem::take(&mut self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ll::abi::fuse_mknod_in;

    const PAYLOAD: [u8; 16] = [
        0xa4, 0x01, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, // mode, rdev
        0x66, 0x6f, 0x6f, 0x00, // "foo"
        0xde, 0xad, 0xbe, 0xef, // trailing data
    ];

    #[test]
    fn fetch_struct_then_str() {
        let mut it = ArgumentIterator::new(&PAYLOAD);
        let arg: fuse_mknod_in = it.fetch().unwrap();
        assert_eq!(arg.mode, 0o644);
        assert_eq!(arg.rdev, 7);
        assert_eq!(it.fetch_str().unwrap(), OsStr::new("foo"));
        assert_eq!(it.fetch_all(), [0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn fetch_str_missing_terminator() {
        let mut it = ArgumentIterator::new(&[0x66, 0x6f, 0x6f]);
        assert!(it.fetch_str().is_none());
    }

    #[test]
    fn fetch_short_struct() {
        let mut it = ArgumentIterator::new(&PAYLOAD[..4]);
        assert!(it.fetch::<fuse_mknod_in>().is_none());
    }
}
