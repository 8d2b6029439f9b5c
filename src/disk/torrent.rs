//! The per blob persistent state machine.
//!
//! A torrent store restores piece status from disk metadata, serializes
//! concurrent writers to the same piece, hashes each written piece against
//! its expected sum before committing, and atomically promotes a fully
//! downloaded blob from the download region to the cache region.
//!
//! Locking is fine grained: one atomic status per piece plus an atomic
//! completion counter; nothing is held across the bulk copy or the hash, so
//! many pieces stream in parallel.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use nix::sys::uio::{pread, pwrite};
use sha1::{Digest as _, Sha1};
use tokio::task;

use crate::error::store::{ReadError, WriteError};
use crate::metainfo::{MetaInfo, TorrentInfo};
use crate::{Bitfield, PieceIndex};

use super::piece::{Piece, PieceStatus, STATUS_COMPLETE, STATUS_EMPTY};
use super::Layout;

/// Pieces are hashed and written in chunks of this size.
const COPY_CHUNK: usize = 64 * 1024;

/// Handle to one blob's on-disk state. Clones share the same store.
#[derive(Clone)]
pub struct TorrentStore {
    inner: Arc<Inner>,
}

struct Inner {
    metainfo: MetaInfo,
    layout: Layout,
    pieces: Vec<Piece>,
    num_complete: AtomicUsize,
    /// Write side handles into the download region; absent once the blob
    /// was restored from the cache region.
    files: Option<WriteFiles>,
}

struct WriteFiles {
    blob: File,
    status: File,
}

impl TorrentStore {
    /// Opens the store for a torrent, creating the download file, the piece
    /// status metadata and the persisted metainfo if they don't exist yet.
    ///
    /// Restoring is O(num_pieces): the one-byte-per-piece status metadata is
    /// read back and unknown bytes are coerced to empty; hashing is never
    /// used to reconstruct state. A blob residing in the cache region is
    /// complete regardless of metadata.
    pub fn open(layout: Layout, metainfo: MetaInfo) -> io::Result<Self> {
        let num_pieces = metainfo.num_pieces();
        let digest = *metainfo.digest();

        if layout.cache_blob(&digest).exists() {
            log::debug!("Torrent {} restored from cache", digest);
            let pieces = (0..num_pieces)
                .map(|_| Piece::new(PieceStatus::Complete))
                .collect();
            return Ok(Self {
                inner: Arc::new(Inner {
                    metainfo,
                    layout,
                    pieces,
                    num_complete: AtomicUsize::new(num_pieces),
                    files: None,
                }),
            });
        }

        // pre-allocate the blob at its declared length; benign if present
        let blob = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(layout.download_blob(&digest))?;
        if blob.metadata()?.len() != metainfo.total_length() {
            blob.set_len(metainfo.total_length())?;
        }

        let status = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(layout.download_status(&digest))?;
        if status.metadata()?.len() != num_pieces as u64 {
            status.set_len(num_pieces as u64)?;
        }

        let metainfo_path = layout.download_metainfo(&digest);
        if !metainfo_path.exists() {
            let encoded = metainfo
                .to_bytes()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            fs::write(&metainfo_path, encoded)?;
        }

        let mut raw = vec![0u8; num_pieces];
        pread_exact(&status, &mut raw, 0)?;
        let mut num_complete = 0;
        let pieces = raw
            .iter()
            .enumerate()
            .map(|(index, &byte)| match byte {
                STATUS_COMPLETE => {
                    num_complete += 1;
                    Piece::new(PieceStatus::Complete)
                }
                STATUS_EMPTY => Piece::new(PieceStatus::Empty),
                other => {
                    log::warn!(
                        "Torrent {} piece {} has unknown status byte {}, \
                         treating as empty",
                        digest,
                        index,
                        other
                    );
                    Piece::new(PieceStatus::Empty)
                }
            })
            .collect();
        log::debug!(
            "Torrent {} restored with {}/{} complete pieces",
            digest,
            num_complete,
            num_pieces
        );

        Ok(Self {
            inner: Arc::new(Inner {
                metainfo,
                layout,
                pieces,
                num_complete: AtomicUsize::new(num_complete),
                files: Some(WriteFiles { blob, status }),
            }),
        })
    }

    pub fn metainfo(&self) -> &MetaInfo {
        &self.inner.metainfo
    }

    pub fn num_complete(&self) -> usize {
        self.inner.num_complete.load(Ordering::SeqCst)
    }

    pub fn is_complete(&self) -> bool {
        self.num_complete() == self.inner.metainfo.num_pieces()
    }

    /// A snapshot of which pieces are complete.
    pub fn bitfield(&self) -> Bitfield {
        self.inner
            .pieces
            .iter()
            .map(|piece| piece.status() == PieceStatus::Complete)
            .collect()
    }

    /// A read-only snapshot for observers.
    pub fn torrent_info(&self) -> TorrentInfo {
        TorrentInfo::new(&self.inner.metainfo, self.bitfield())
    }

    /// Materializes one piece.
    ///
    /// The payload must be the whole piece. Exactly one of any number of
    /// concurrent writers of the same piece succeeds; the others observe
    /// `PieceComplete` or `WriteConflict`. The bytes are hashed against the
    /// expected piece sum before the piece commits; any failure rolls the
    /// piece back to empty. Completing the last piece promotes the blob to
    /// the cache region.
    pub async fn write_piece(
        &self,
        index: PieceIndex,
        data: Bytes,
    ) -> Result<(), WriteError> {
        if index >= self.inner.metainfo.num_pieces() {
            return Err(WriteError::InvalidPieceIndex);
        }
        let want = self.inner.metainfo.piece_len(index);
        if data.len() as u64 != want {
            return Err(WriteError::UnexpectedLength {
                got: data.len() as u64,
                want,
            });
        }

        self.inner.pieces[index].acquire()?;

        let inner = Arc::clone(&self.inner);
        task::spawn_blocking(move || inner.commit_piece(index, &data))
            .await
            .expect("piece write task panicked")
    }

    /// Returns a lazy, single use reader over a complete piece.
    pub fn get_piece_reader(
        &self,
        index: PieceIndex,
    ) -> Result<PieceReader, ReadError> {
        if index >= self.inner.metainfo.num_pieces() {
            return Err(ReadError::InvalidPieceIndex);
        }
        if self.inner.pieces[index].status() != PieceStatus::Complete {
            return Err(ReadError::PieceNotComplete);
        }
        Ok(PieceReader {
            inner: Arc::clone(&self.inner),
            index,
        })
    }
}

impl Inner {
    fn commit_piece(
        &self,
        index: PieceIndex,
        data: &[u8],
    ) -> Result<(), WriteError> {
        if let Err(e) = self.write_verified(index, data) {
            self.pieces[index].release();
            return Err(e);
        }
        self.pieces[index].commit();

        let complete = self.num_complete.fetch_add(1, Ordering::SeqCst) + 1;
        if complete == self.metainfo.num_pieces() {
            // the torrent is logically done even if promotion fails; only
            // the promotion artifact is stale
            self.promote()?;
        }
        Ok(())
    }

    fn write_verified(
        &self,
        index: PieceIndex,
        data: &[u8],
    ) -> Result<(), WriteError> {
        let files = self
            .files
            .as_ref()
            .expect("write on a cache resident torrent");

        // hash while copying so a bad payload is caught before commit
        let mut hasher = Sha1::new();
        let mut offset = self.metainfo.piece_offset(index) as i64;
        for chunk in data.chunks(COPY_CHUNK) {
            hasher.update(chunk);
            pwrite_all(&files.blob, chunk, offset)?;
            offset += chunk.len() as i64;
        }
        let sum: [u8; 20] = hasher.finalize().into();
        if sum != self.metainfo.piece_sum(index) {
            return Err(WriteError::InvalidPieceSum);
        }

        // one byte at the piece's offset; concurrent updates at other
        // offsets cannot clobber each other
        pwrite_all(&files.status, &[STATUS_COMPLETE], index as i64)?;
        Ok(())
    }

    /// Moves the blob and its metainfo into the cache region. A racing
    /// promoter loses the hard link with `AlreadyExists` and treats that as
    /// success.
    fn promote(&self) -> Result<(), WriteError> {
        let digest = self.metainfo.digest();
        let src = self.layout.download_blob(digest);
        let dst = self.layout.cache_blob(digest);
        match fs::hard_link(&src, &dst) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                log::debug!("Torrent {} already promoted", digest);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        log::info!("Torrent {} promoted to cache", digest);

        fs::rename(
            self.layout.download_metainfo(digest),
            self.layout.cache_metainfo(digest),
        )?;
        fs::remove_file(&src)?;
        fs::remove_file(self.layout.download_status(digest))?;
        Ok(())
    }
}

/// A lazy reader over one complete piece.
///
/// The underlying file, in whichever region currently holds the blob, is
/// opened at read time; the reader may be consumed exactly once and
/// dropping it releases the handle.
pub struct PieceReader {
    inner: Arc<Inner>,
    index: PieceIndex,
}

impl PieceReader {
    pub fn index(&self) -> PieceIndex {
        self.index
    }

    pub fn length(&self) -> u64 {
        self.inner.metainfo.piece_len(self.index)
    }

    pub fn read_all(self) -> io::Result<Bytes> {
        let digest = self.inner.metainfo.digest();
        let file = match File::open(self.inner.layout.download_blob(digest)) {
            Ok(file) => file,
            // promoted since the reader was handed out
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                File::open(self.inner.layout.cache_blob(digest))?
            }
            Err(e) => return Err(e),
        };
        let mut buf = vec![0u8; self.length() as usize];
        pread_exact(
            &file,
            &mut buf,
            self.inner.metainfo.piece_offset(self.index) as i64,
        )?;
        Ok(buf.into())
    }
}

impl fmt::Debug for TorrentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TorrentStore(..)")
    }
}

impl fmt::Debug for PieceReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PieceReader(piece={}, len={})",
            self.index,
            self.length()
        )
    }
}

fn pwrite_all(file: &File, mut buf: &[u8], mut offset: i64) -> io::Result<()> {
    while !buf.is_empty() {
        let written =
            pwrite(file, buf, offset).map_err(io::Error::from)?;
        if written == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        buf = &buf[written..];
        offset += written as i64;
    }
    Ok(())
}

fn pread_exact(
    file: &File,
    mut buf: &mut [u8],
    mut offset: i64,
) -> io::Result<()> {
    while !buf.is_empty() {
        let read = pread(file, buf, offset).map_err(io::Error::from)?;
        if read == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf = &mut buf[read..];
        offset += read as i64;
    }
    Ok(())
}
