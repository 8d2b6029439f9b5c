use std::fmt;

use sha1::{Digest as _, Sha1};

use crate::error::metainfo::{MetainfoError, Result};
use crate::{Bitfield, Digest, InfoHash, PieceIndex, Sha1Hash};

/// The width of one entry in the concatenated piece sum string.
pub const PIECE_SUM_LEN: usize = 20;

/// The blob descriptor: everything a peer must agree on before exchanging
/// pieces. Immutable after creation.
#[derive(Clone, PartialEq)]
pub struct MetaInfo {
    /// The content hash of the whole blob.
    digest: Digest,
    /// The length of the blob, in bytes.
    total_length: u64,
    /// The length of every piece except possibly the last, in bytes.
    piece_length: u64,
    /// A concatenation of 20 byte SHA-1 sums, one per piece, in piece order.
    piece_sums: Vec<u8>,
    /// Derived from the other fields at construction; equal descriptors
    /// always derive equal info hashes.
    info_hash: InfoHash,
}

impl fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaInfo")
            .field("digest", &self.digest)
            .field("total_length", &self.total_length)
            .field("piece_length", &self.piece_length)
            .field("piece_sums", &"<sums...>")
            .field("info_hash", &hex::encode(self.info_hash))
            .finish()
    }
}

impl MetaInfo {
    /// Creates a descriptor and derives its info hash.
    ///
    /// Rules:
    /// - the piece length and total length must be non-zero,
    /// - the piece sum string must hold exactly one 20 byte sum per piece.
    pub fn new(
        digest: Digest,
        total_length: u64,
        piece_length: u64,
        piece_sums: Vec<u8>,
    ) -> Result<Self> {
        if piece_length == 0 || total_length == 0 {
            log::warn!("Metainfo with zero piece or total length");
            return Err(MetainfoError::InvalidMetainfo);
        }
        let num_pieces = total_length.div_ceil(piece_length) as usize;
        if piece_sums.len() != num_pieces * PIECE_SUM_LEN {
            log::warn!(
                "Metainfo piece sums hold {} bytes, expected {}",
                piece_sums.len(),
                num_pieces * PIECE_SUM_LEN
            );
            return Err(MetainfoError::InvalidMetainfo);
        }

        let info_hash = raw::MetaInfo {
            digest: digest.to_hex(),
            total_length,
            piece_length,
            piece_sums: piece_sums.clone(),
        }
        .info_hash()?;

        Ok(Self {
            digest,
            total_length,
            piece_length,
            piece_sums,
            info_hash,
        })
    }

    /// Parses a persisted or downloaded descriptor.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: raw::MetaInfo = serde_bencode::from_bytes(bytes)?;
        let digest = raw.digest.parse().map_err(|_| {
            log::warn!("Metainfo digest is not valid hex");
            MetainfoError::InvalidMetainfo
        })?;
        Self::new(digest, raw.total_length, raw.piece_length, raw.piece_sums)
    }

    /// The canonical serialized form; also the input of the info hash.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let raw = raw::MetaInfo {
            digest: self.digest.to_hex(),
            total_length: self.total_length,
            piece_length: self.piece_length,
            piece_sums: self.piece_sums.clone(),
        };
        Ok(serde_bencode::to_bytes(&raw)?)
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// The length of every piece but possibly the last.
    pub fn max_piece_len(&self) -> u64 {
        self.piece_length
    }

    pub fn num_pieces(&self) -> usize {
        self.total_length.div_ceil(self.piece_length) as usize
    }

    /// The length of the piece at the given index; only the last piece may be
    /// shorter than the maximum.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds.
    pub fn piece_len(&self, index: PieceIndex) -> u64 {
        assert!(index < self.num_pieces());
        if index == self.num_pieces() - 1 {
            let tail = self.total_length % self.piece_length;
            if tail > 0 {
                return tail;
            }
        }
        self.piece_length
    }

    /// The absolute offset of the piece's first byte within the blob.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_length
    }

    /// The expected sum of the piece at the given index.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds.
    pub fn piece_sum(&self, index: PieceIndex) -> Sha1Hash {
        let pos = index * PIECE_SUM_LEN;
        let mut sum = [0; PIECE_SUM_LEN];
        sum.copy_from_slice(&self.piece_sums[pos..pos + PIECE_SUM_LEN]);
        sum
    }

    /// An all-zero bitfield sized for this torrent.
    pub fn empty_bitfield(&self) -> Bitfield {
        Bitfield::repeat(false, self.num_pieces())
    }

    /// Computes the concatenated piece sum string of a blob. Used by origin
    /// tooling and tests to build descriptors.
    pub fn sum_pieces(data: &[u8], piece_length: u64) -> Vec<u8> {
        let mut sums =
            Vec::with_capacity(data.len().div_ceil(piece_length as usize));
        for piece in data.chunks(piece_length as usize) {
            let sum = Sha1::digest(piece);
            sums.extend_from_slice(&sum);
        }
        sums
    }
}

/// A read-only snapshot of a torrent returned to observers.
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    pub metainfo: MetaInfo,
    pub bitfield: Bitfield,
    pub percent_downloaded: f64,
}

impl TorrentInfo {
    pub fn new(metainfo: &MetaInfo, bitfield: Bitfield) -> Self {
        let percent_downloaded =
            100.0 * bitfield.count_ones() as f64 / metainfo.num_pieces() as f64;
        Self {
            metainfo: metainfo.clone(),
            bitfield,
            percent_downloaded,
        }
    }

    pub fn digest(&self) -> &Digest {
        self.metainfo.digest()
    }

    pub fn info_hash(&self) -> InfoHash {
        self.metainfo.info_hash()
    }
}

mod raw {
    //! Only for the `bencode` crate to (de)serialize the descriptor.

    use serde_derive::{Deserialize, Serialize};
    use sha1::{Digest as _, Sha1};

    use super::Result;
    use crate::InfoHash;

    /// Field names are declared in bencode key order so the encoded dict is
    /// canonical; the info hash is the SHA-1 over this encoding.
    #[derive(Debug, Serialize, Deserialize)]
    pub(super) struct MetaInfo {
        /// The blob digest in lowercase hex.
        pub digest: String,
        #[serde(rename = "length")]
        /// Size of the blob in bytes.
        pub total_length: u64,
        #[serde(rename = "piece length")]
        /// Number of bytes per piece.
        pub piece_length: u64,
        #[serde(rename = "piece sums", with = "serde_bytes")]
        /// Concatenation of each piece's 20 byte SHA-1 sum.
        pub piece_sums: Vec<u8>,
    }

    impl MetaInfo {
        pub fn info_hash(&self) -> Result<InfoHash> {
            let encoded = serde_bencode::to_bytes(self)?;
            let digest = Sha1::digest(&encoded);
            let mut info_hash = [0; 20];
            info_hash.copy_from_slice(&digest);
            Ok(info_hash)
        }
    }
}
