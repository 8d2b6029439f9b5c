pub type Result<T, E = ConnError> = std::result::Result<T, E>;

/// Errors of an established connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("send buffer full")]
    /// The bounded outbound queue had no capacity. The message was dropped
    /// and counted; the connection stays open. Dropping instead of blocking
    /// keeps a slow or dead remote from stalling the dispatcher.
    SendBufferFull,

    #[error("connection closed")]
    /// The connection has been closed; no further messages are accepted.
    Closed,

    #[error("{0}")]
    /// A socket error. Fatal for the connection; there is no reconnect at
    /// this layer.
    Io(#[from] std::io::Error),
}

/// Errors of the opening bitfield exchange. Each closes the socket and
/// surfaces to the caller.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    Timeout,

    #[error("remote sent peer id {got} instead of {want}")]
    /// The outbound handshake received a bitfield from a different peer than
    /// the tracker promised.
    PeerIdMismatch { got: String, want: String },

    #[error("remote is on torrent {got} instead of {want}")]
    InfoHashMismatch { got: String, want: String },

    #[error("expected opening bitfield, got {0}")]
    /// The first message of the exchange was not a bitfield.
    UnexpectedMessage(&'static str),

    #[error("remote closed during handshake")]
    ClosedByRemote,

    #[error("{0}")]
    /// A framing, decode or socket error.
    Io(#[from] std::io::Error),
}

/// Error of a bandwidth reservation.
#[derive(Debug, thiserror::Error)]
pub enum BandwidthError {
    #[error("reservation of {bits} bits exceeds burst capacity {burst}")]
    /// The reservation can never be satisfied: it is larger than the bucket.
    /// Fatal for the piece transfer, not for the connection.
    ExceedsBurst { bits: u64, burst: u64 },
}
