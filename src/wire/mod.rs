//! The peer wire protocol: message model and framed codec.

pub mod codec;

pub use codec::{MessageCodec, MAX_HEADER_LEN};

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

use crate::disk::PieceReader;
use crate::{Bitfield, Digest, InfoHash, PeerId, PieceIndex};

// Wire message type tags. Stable; never renumber.
pub(crate) const MSG_BITFIELD: u8 = 0;
pub(crate) const MSG_PIECE_REQUEST: u8 = 1;
pub(crate) const MSG_PIECE_PAYLOAD: u8 = 2;
pub(crate) const MSG_ANNOUNCE_PIECE: u8 = 3;
pub(crate) const MSG_CANCEL_PIECE: u8 = 4;
pub(crate) const MSG_COMPLETE: u8 = 5;
pub(crate) const MSG_ERROR: u8 = 6;

/// Message names indexed by wire type tag; used for logs and drop counters.
pub(crate) const MSG_NAMES: [&str; 7] = [
    "bitfield",
    "piece_request",
    "piece_payload",
    "announce_piece",
    "cancel_piece",
    "complete",
    "error",
];

/// The messages exchanged by peers.
#[derive(Debug, PartialEq)]
pub enum Message {
    /// The opening exchange that establishes identity, torrent selection and
    /// piece availability. Only valid during the handshake; received at any
    /// later point it is logged and ignored.
    Bitfield(HandshakeMessage),
    /// Ask the remote for a whole piece. `offset` is always zero and `length`
    /// always the full piece length; pieces are the atomic unit of transfer.
    PieceRequest {
        piece: PieceIndex,
        offset: u64,
        length: u64,
    },
    /// A piece's bytes. The declared `length` payload bytes travel on the
    /// wire immediately after the serialized header.
    PiecePayload {
        piece: PieceIndex,
        offset: u64,
        length: u64,
        payload: Payload,
    },
    /// The sender newly holds the piece.
    AnnouncePiece { piece: PieceIndex },
    /// Accepted on the wire but never acted upon: this protocol does not
    /// interrupt in-flight pieces.
    CancelPiece { piece: PieceIndex },
    /// The sender holds every piece of the torrent.
    Complete,
    /// The sender could not serve a request for the given piece.
    Error {
        piece: PieceIndex,
        code: ErrorCode,
        text: String,
    },
}

impl Message {
    pub(crate) fn type_id(&self) -> u8 {
        match self {
            Self::Bitfield(_) => MSG_BITFIELD,
            Self::PieceRequest { .. } => MSG_PIECE_REQUEST,
            Self::PiecePayload { .. } => MSG_PIECE_PAYLOAD,
            Self::AnnouncePiece { .. } => MSG_ANNOUNCE_PIECE,
            Self::CancelPiece { .. } => MSG_CANCEL_PIECE,
            Self::Complete => MSG_COMPLETE,
            Self::Error { .. } => MSG_ERROR,
        }
    }

    /// Short name for logs and drop counters.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bitfield(_) => "bitfield",
            Self::PieceRequest { .. } => "piece_request",
            Self::PiecePayload { .. } => "piece_payload",
            Self::AnnouncePiece { .. } => "announce_piece",
            Self::CancelPiece { .. } => "cancel_piece",
            Self::Complete => "complete",
            Self::Error { .. } => "error",
        }
    }
}

/// Machine readable reasons carried by [`Message::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The remote asked for a piece we could not read.
    PieceRequestFailed,
}

impl ErrorCode {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            Self::PieceRequestFailed => 0,
        }
    }

    pub(crate) fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::PieceRequestFailed),
            _ => None,
        }
    }
}

/// The bytes of a piece transfer.
///
/// Inbound payloads are buffered into memory by the codec. Outbound payloads
/// of a serving peer are lazy readers into the torrent store; the
/// connection's write loop resolves them to bytes after the egress
/// reservation, so queued payloads don't pin piece data in memory.
pub enum Payload {
    Bytes(Bytes),
    Store(PieceReader),
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(data) => write!(f, "Bytes({} bytes)", data.len()),
            Self::Store(reader) => write!(f, "Store({:?})", reader),
        }
    }
}

/// Only in-memory payloads compare; a lazy reader is never equal to
/// anything. Used by codec tests.
impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Self::Bytes(data)
    }
}

impl From<PieceReader> for Payload {
    fn from(reader: PieceReader) -> Self {
        Self::Store(reader)
    }
}

/// The single message each side sends at the beginning of a session.
///
/// Carries the sender's identity, the torrent it wants to exchange, its own
/// piece availability, and optionally the last known bitfields of other
/// peers it talks to (piggybacked so a fresh peer learns some of the swarm
/// without extra round trips). The opener includes its namespace tag, the
/// acceptor leaves it empty.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeMessage {
    pub peer_id: PeerId,
    pub digest: Digest,
    pub info_hash: InfoHash,
    pub bitfield: Bitfield,
    pub remote_bitfields: BTreeMap<PeerId, Bitfield>,
    pub namespace: String,
}
