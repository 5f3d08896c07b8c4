// SPDX-License-Identifier: Apache-2.0
//! Identifier and hashing utilities.
use blake3::Hasher;

/// Canonical 256-bit hash used for state roots, patch digests, and seeds.
pub type Hash = [u8; 32];

/// Stable 128-bit identifier for every entity in the story graph.
///
/// Many fixtures use stable, label-derived ids via [`make_uid`]
/// (`blake3("uid:" || label)` truncated to 16 bytes), but this is a
/// convention, not a global constraint: ids allocated during a tick come
/// from the tick's deterministic RNG instead.
///
/// Tooling must not assume that every `Uid` corresponds to a human-readable
/// label, or that ids are reversible back into strings.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Uid(pub [u8; 16]);

/// The all-zero id used as the unbound endpoint of open edges.
pub const NIL_UID: Uid = Uid([0u8; 16]);

impl Uid {
    /// Returns the canonical byte representation of this id.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Returns `true` for the all-zero placeholder id.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; 16]
    }

    /// Builds a `Uid` from two 64-bit words (high, low), little-endian.
    #[must_use]
    pub fn from_words(hi: u64, lo: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&hi.to_le_bytes());
        bytes[8..].copy_from_slice(&lo.to_le_bytes());
        Self(bytes)
    }

    /// Lowercase hex rendering of the full id.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex prefix used in labels and diagnostics.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parses a lowercase hex rendering produced by [`Uid::to_hex`].
    #[must_use]
    pub fn from_hex(s: &str) -> Option<Self> {
        let raw = hex::decode(s).ok()?;
        let bytes: [u8; 16] = raw.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl core::fmt::Debug for Uid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Uid({})", self.short())
    }
}

impl core::fmt::Display for Uid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Produces a stable, domain-separated identifier (prefix `b"uid:"`) using BLAKE3.
///
/// The 256-bit digest is truncated to the 128-bit id width.
pub fn make_uid(label: &str) -> Uid {
    let mut hasher = Hasher::new();
    hasher.update(b"uid:");
    hasher.update(label.as_bytes());
    let digest: Hash = hasher.finalize().into();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uid(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_derived_ids_are_stable_and_distinct() {
        assert_eq!(make_uid("foo"), make_uid("foo"));
        assert_ne!(make_uid("foo"), make_uid("bar"));
        assert!(!make_uid("foo").is_nil());
    }

    #[test]
    fn hex_round_trip() {
        let uid = make_uid("round-trip");
        assert_eq!(Uid::from_hex(&uid.to_hex()), Some(uid));
        assert_eq!(Uid::from_hex("zz"), None);
    }

    #[test]
    fn nil_is_all_zeroes() {
        assert!(NIL_UID.is_nil());
        assert_eq!(Uid::from_words(0, 0), NIL_UID);
    }
}
