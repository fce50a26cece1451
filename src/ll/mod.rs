//! Low-level protocol plumbing: wire structs and payload parsing.

pub(crate) mod abi;
pub(crate) mod argument;

/// Negotiated protocol version of the kernel connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtoVersion {
    /// Major version, fixed at INIT time.
    pub major: u32,
    /// Minor version, fixed at INIT time.
    pub minor: u32,
}

impl ProtoVersion {
    /// The compiled-in version offered to the kernel.
    pub const NATIVE: ProtoVersion = ProtoVersion {
        major: abi::FUSE_KERNEL_VERSION,
        minor: abi::FUSE_KERNEL_MINOR_VERSION,
    };

    /// Whether the peer speaks the legacy major-5 dialect with unpadded
    /// struct layouts.
    #[inline]
    pub fn is_compat5(&self) -> bool {
        self.major == 5
    }

    /// Whether the peer uses the legacy forget path that matches on a
    /// version value instead of carrying a lookup count.
    #[inline]
    pub fn old_forget(&self) -> bool {
        self.major <= 6
    }
}
