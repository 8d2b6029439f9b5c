pub type Result<T, E = MetainfoError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum MetainfoError {
    #[error("invalid metainfo")]
    /// The descriptor fields do not describe a valid torrent: a zero piece
    /// length, a zero total length, or a piece sum string whose length does
    /// not match the piece count.
    InvalidMetainfo,

    #[error("{0}")]
    /// The descriptor could not be encoded or decoded.
    Bencode(#[from] serde_bencode::Error),
}
