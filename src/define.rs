use std::{fmt, str::FromStr};

use sha2::{Digest as _, Sha256};

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The identifier of a torrent, derived deterministically from its metainfo
/// descriptor. Two torrents compare equal iff their info hashes compare equal.
pub type InfoHash = Sha1Hash;

/// The peer ID is an arbitrary 20 byte string, assigned locally and unique per
/// process instance.
pub type PeerId = [u8; 20];

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector of most significant bits to least significant
/// bits, that is, where the highest bit of the first byte represents the first
/// piece, the second highest the second piece, and so on. A truthy value means
/// the peer has the piece.
///
/// The `u8`/`Msb0` backing makes the raw byte slice the stable wire
/// representation of the bitfield.
pub type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

/// The type of a piece's index.
///
/// On the wire piece indices are sent as bencoded integers, but in the source
/// code we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;

/// The content hash of a blob: a SHA-256 over the blob's bytes.
///
/// The lowercase hexadecimal form is the blob's file name in both store
/// regions, and is how the blob is addressed by remote peers and the metainfo
/// descriptor service.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Computes the digest of the given blob contents.
    pub fn from_blob(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The lowercase hexadecimal form, which is also the blob's file name.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl FromStr for Digest {
    type Err = InvalidDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s).map_err(|_| InvalidDigestError)?;
        let bytes: [u8; 32] = raw.try_into().map_err(|_| InvalidDigestError)?;
        Ok(Self(bytes))
    }
}

/// Error returned when parsing a digest from a string that is not 64
/// hexadecimal characters.
#[derive(Debug, thiserror::Error)]
#[error("invalid blob digest")]
pub struct InvalidDigestError;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_hex_round_trip() {
        let d = Digest::from_blob(b"hello world");
        let parsed: Digest = d.to_hex().parse().unwrap();
        assert_eq!(d, parsed);
    }

    #[test]
    fn test_digest_parse_rejects_garbage() {
        assert!("not hex".parse::<Digest>().is_err());
        // valid hex but wrong width
        assert!("abcd".parse::<Digest>().is_err());
    }
}
