pub type Result<T, E = WriteError> = std::result::Result<T, E>;

/// Error type returned on failed piece writes.
///
/// All of these are non-fatal for the torrent: the dispatcher reacts by
/// counting a duplicate, or by re-requesting the piece from another peer.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("invalid piece index")]
    /// The piece index is out of bounds for this torrent.
    InvalidPieceIndex,

    #[error("piece has {got} bytes, expected {want}")]
    /// The payload length does not match the piece length. Pieces are the
    /// atomic unit of transfer; partial writes are rejected up front.
    UnexpectedLength { got: u64, want: u64 },

    #[error("piece is already complete")]
    /// A prior writer finished this piece. The payload is a duplicate.
    PieceComplete,

    #[error("piece is being written by another writer")]
    /// Another writer holds the piece dirty right now.
    WriteConflict,

    #[error("invalid piece sum")]
    /// The written bytes do not hash to the expected piece sum. The piece was
    /// rolled back to empty.
    InvalidPieceSum,

    #[error("{0}")]
    /// An IO error occurred. The piece was rolled back to empty.
    Io(#[from] std::io::Error),
}

/// Error type returned on failed piece reads.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("invalid piece index")]
    InvalidPieceIndex,

    #[error("piece not complete")]
    /// Only complete pieces are readable.
    PieceNotComplete,

    #[error("{0}")]
    Io(#[from] std::io::Error),
}
