//! On-disk state: the per torrent store and the torrent archive.

pub mod archive;
pub mod client;
pub mod piece;
pub mod torrent;

pub use archive::TorrentArchive;
pub use client::{HttpMetainfoClient, MetainfoClient};
pub use torrent::{PieceReader, TorrentStore};

use std::path::{Path, PathBuf};
use std::{fs, io};

use crate::Digest;

/// Resolves the on-disk locations of a blob and its sibling metadata.
///
/// A blob lives in exactly one of two sibling directories: `download` while
/// pieces are being materialized, `cache` once it is complete. Its file name
/// is the digest in hex; the serialized metainfo and the piece status byte
/// vector live next to it with `.metainfo` and `.status` suffixes. Promotion
/// moves the blob and its metainfo from `download` to `cache` and drops the
/// status entry.
#[derive(Debug, Clone)]
pub struct Layout {
    download_dir: PathBuf,
    cache_dir: PathBuf,
}

impl Layout {
    /// Creates both region directories under the root.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref();
        let layout = Self {
            download_dir: root.join("download"),
            cache_dir: root.join("cache"),
        };
        fs::create_dir_all(&layout.download_dir)?;
        fs::create_dir_all(&layout.cache_dir)?;
        Ok(layout)
    }

    pub fn download_blob(&self, digest: &Digest) -> PathBuf {
        self.download_dir.join(digest.to_hex())
    }

    pub fn cache_blob(&self, digest: &Digest) -> PathBuf {
        self.cache_dir.join(digest.to_hex())
    }

    pub fn download_metainfo(&self, digest: &Digest) -> PathBuf {
        self.download_dir.join(format!("{}.metainfo", digest.to_hex()))
    }

    pub fn cache_metainfo(&self, digest: &Digest) -> PathBuf {
        self.cache_dir.join(format!("{}.metainfo", digest.to_hex()))
    }

    pub fn download_status(&self, digest: &Digest) -> PathBuf {
        self.download_dir.join(format!("{}.status", digest.to_hex()))
    }
}
