use crate::error::metainfo::MetainfoError;

pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;

/// Error type of the metainfo descriptor client.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("metainfo not found")]
    /// The descriptor service does not know this digest. Not retried.
    NotFound,

    #[error("metainfo fetch returned status {0}")]
    /// Any non-success, non-404 status. Retryable.
    Status(reqwest::StatusCode),

    #[error("{0}")]
    /// A transport error. Retryable.
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    /// The service responded with bytes that do not decode to a descriptor.
    Metainfo(#[from] MetainfoError),
}

impl DownloadError {
    /// Whether another fetch attempt can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound)
    }
}

/// Error type of the torrent archive.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("torrent not found")]
    /// No metainfo exists for the digest, locally or at the descriptor
    /// service.
    NotFound,

    #[error("metainfo download: {0}")]
    /// The descriptor fetch failed after exhausting its retry budget.
    Download(DownloadError),

    #[error("{0}")]
    Metainfo(#[from] MetainfoError),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}
