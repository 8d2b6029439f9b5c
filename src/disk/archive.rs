//! The torrent archive: the catalog of blobs this agent stores.
//!
//! Keyed by digest over the two-region directory layout. On first access
//! the metainfo descriptor may be fetched synchronously from the descriptor
//! service, with bounded retries and exponential backoff.

use std::{fs, io};

use crate::conf::ArchiveConf;
use crate::error::archive::{ArchiveError, DownloadError, Result};
use crate::metainfo::{MetaInfo, TorrentInfo};
use crate::{Bitfield, Digest};

use super::client::MetainfoClient;
use super::piece::STATUS_COMPLETE;
use super::torrent::TorrentStore;
use super::Layout;

pub struct TorrentArchive<C> {
    conf: ArchiveConf,
    layout: Layout,
    client: C,
}

impl<C: MetainfoClient> TorrentArchive<C> {
    pub fn new(
        conf: ArchiveConf,
        layout: Layout,
        client: C,
    ) -> Self {
        Self {
            conf,
            layout,
            client,
        }
    }

    /// Returns a torrent store for the digest, fetching and persisting its
    /// metainfo on first access and pre-allocating the download file.
    ///
    /// An unknown digest surfaces as [`ArchiveError::NotFound`]; transient
    /// fetch failures are retried with exponential backoff inside an
    /// overall deadline before surfacing.
    pub async fn create_torrent(
        &self,
        namespace: &str,
        digest: &Digest,
    ) -> Result<TorrentStore> {
        let metainfo = match self.load_metainfo(digest)? {
            Some(metainfo) => metainfo,
            None => {
                log::info!(
                    "Torrent {}: fetching metainfo in namespace {}",
                    digest,
                    namespace
                );
                self.download_metainfo(namespace, digest).await?
            }
        };
        Ok(TorrentStore::open(self.layout.clone(), metainfo)?)
    }

    /// A read-only snapshot assembled from the persisted metainfo and the
    /// current piece status metadata; does not touch the blob itself.
    pub fn stat(&self, digest: &Digest) -> Result<TorrentInfo> {
        let metainfo =
            self.load_metainfo(digest)?.ok_or(ArchiveError::NotFound)?;
        let num_pieces = metainfo.num_pieces();

        let bitfield = if self.layout.cache_blob(digest).exists() {
            Bitfield::repeat(true, num_pieces)
        } else {
            match fs::read(self.layout.download_status(digest)) {
                Ok(raw) => {
                    let mut bits: Bitfield = raw
                        .iter()
                        .map(|&byte| byte == STATUS_COMPLETE)
                        .collect();
                    bits.resize(num_pieces, false);
                    bits
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    Bitfield::repeat(false, num_pieces)
                }
                Err(e) => return Err(e.into()),
            }
        };
        Ok(TorrentInfo::new(&metainfo, bitfield))
    }

    /// Opens an existing torrent; fails if its metainfo was never persisted.
    pub fn get_torrent(&self, digest: &Digest) -> Result<TorrentStore> {
        let metainfo =
            self.load_metainfo(digest)?.ok_or(ArchiveError::NotFound)?;
        Ok(TorrentStore::open(self.layout.clone(), metainfo)?)
    }

    /// Removes the blob and its metadata from both regions. Absence is not
    /// an error.
    pub fn delete_torrent(&self, digest: &Digest) -> Result<()> {
        log::info!("Deleting torrent {}", digest);
        let paths = [
            self.layout.download_blob(digest),
            self.layout.download_metainfo(digest),
            self.layout.download_status(digest),
            self.layout.cache_blob(digest),
            self.layout.cache_metainfo(digest),
        ];
        for path in paths {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn load_metainfo(&self, digest: &Digest) -> Result<Option<MetaInfo>> {
        let paths = [
            self.layout.download_metainfo(digest),
            self.layout.cache_metainfo(digest),
        ];
        for path in paths {
            match fs::read(&path) {
                Ok(raw) => return Ok(Some(MetaInfo::from_bytes(&raw)?)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    async fn download_metainfo(
        &self,
        namespace: &str,
        digest: &Digest,
    ) -> Result<MetaInfo> {
        let fetch = self.fetch_with_retries(namespace, digest);
        match tokio::time::timeout(self.conf.metainfo_download_timeout, fetch)
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ArchiveError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "metainfo download timed out",
            ))),
        }
    }

    async fn fetch_with_retries(
        &self,
        namespace: &str,
        digest: &Digest,
    ) -> Result<MetaInfo> {
        let attempts = self.conf.unavailable_metainfo_retries.max(1);
        let mut sleep = self.conf.unavailable_metainfo_retry_sleep;
        let mut last: Option<DownloadError> = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(sleep).await;
                sleep *= 2;
            }
            match self.client.download(namespace, digest).await {
                Ok(metainfo) => return Ok(metainfo),
                Err(DownloadError::NotFound) => {
                    return Err(ArchiveError::NotFound)
                }
                Err(e) => {
                    log::warn!(
                        "Metainfo fetch attempt {}/{} for {} failed: {}",
                        attempt,
                        attempts,
                        digest,
                        e
                    );
                    last = Some(e);
                }
            }
        }
        Err(ArchiveError::Download(last.expect("no fetch was attempted")))
    }
}
