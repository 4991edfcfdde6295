use std::fmt;

/// A 20-byte SHA-1 digest of a 64-byte page window.
///
/// The hash function itself is treated as a black box external collaborator; this crate
/// only ever moves already-computed digests across the wire. Construction from raw bytes
/// is infallible — validity of the *content* being hashed is the caller's concern.
#[derive(Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Digest(pub [u8; 20]);

/// The canonical "no non-null 64-byte window found on this page" fallback digest.
///
/// The SHA-1 digest of a 64-byte all-zero window, returned whenever every sampled window
/// on a page is all-zero.
pub const NULL_FINGERPRINT: Digest = Digest([
    0xc8, 0xd7, 0xd0, 0xef, 0x0e, 0xed, 0xfa, 0x82, 0xd2, 0xea, 0x1a, 0xa5, 0x92, 0x84, 0x5b,
    0x9a, 0x6d, 0x4b, 0x02, 0xb7,
]);

impl Digest {
    /// Borrows the digest's raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Builds a digest from a pre-hashed byte slice.
    ///
    /// Returns `None` if `bytes` is not exactly 20 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 20]>::try_from(bytes).ok().map(Self)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::{Digest, NULL_FINGERPRINT};

    // ── 1. display round-trips to the known null-fingerprint hex string ──
    #[test]
    fn null_fingerprint_hex() {
        assert_eq!(
            NULL_FINGERPRINT.to_string(),
            "c8d7d0ef0eedfa82d2ea1aa592845b9a6d4b02b7"
        );
    }

    // ── 2. from_slice rejects wrong lengths ──
    #[test]
    fn from_slice_rejects_wrong_length() {
        assert!(Digest::from_slice(&[0u8; 19]).is_none());
        assert!(Digest::from_slice(&[0u8; 21]).is_none());
        assert!(Digest::from_slice(&[0u8; 20]).is_some());
    }

    // ── 3. equality is byte-wise ──
    #[test]
    fn equality_is_byte_wise() {
        let a = Digest([1u8; 20]);
        let b = Digest([1u8; 20]);
        let c = Digest([2u8; 20]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
