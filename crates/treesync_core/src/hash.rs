//! Content hashes for cache nodes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use std::fmt;

/// A 20-byte SHA-1 digest summarizing a subtree.
///
/// Rendered as 28 characters of standard base64, which is also the form
/// used inside parent preimages.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHash([u8; NodeHash::LEN]);

impl NodeHash {
    /// Digest length in bytes.
    pub const LEN: usize = 20;

    /// Hash of `true`.
    pub const TRUE: NodeHash = NodeHash([
        0x13, 0x9c, 0xfa, 0xd5, 0x03, 0x34, 0x94, 0xdf, 0xd4, 0xd9, 0x6b, 0x0e, 0x9e, 0xeb, 0x2c,
        0xcc, 0x24, 0xe4, 0x47, 0xc3,
    ]);

    /// Hash of `false`.
    pub const FALSE: NodeHash = NodeHash([
        0x69, 0x24, 0x8d, 0xa2, 0xa7, 0x12, 0xe2, 0x84, 0x30, 0x27, 0x6c, 0x71, 0x1f, 0x6d, 0x2b,
        0xbe, 0x9a, 0x77, 0xcc, 0xfd,
    ]);

    /// Wraps raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    /// Standard base64 rendering (28 characters).
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Parses the base64 rendering.
    #[must_use]
    pub fn from_base64(text: &str) -> Option<Self> {
        let bytes = STANDARD.decode(text).ok()?;
        let bytes: [u8; Self::LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Hashes the concatenation of `parts`.
    pub(crate) fn digest(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha1::new();
        for part in parts {
            hasher.update(part);
        }
        let out = hasher.finalize();
        let mut bytes = [0u8; Self::LEN];
        bytes.copy_from_slice(&out);
        Self(bytes)
    }

    /// Hash of a boolean leaf.
    pub(crate) const fn of_bool(b: bool) -> Self {
        if b {
            Self::TRUE
        } else {
            Self::FALSE
        }
    }
}

impl fmt::Display for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeHash({})", self.to_base64())
    }
}
