//! The framed wire codec.
//!
//! Every message is a big-endian `u32` length prefix followed by that many
//! bytes of bencoded header. If the header is a piece payload, its declared
//! `length` bytes of raw piece data follow the header with no additional
//! framing. The header schema is a bencoded dict with fixed one-letter keys;
//! both ends must agree on it byte for byte.

use std::io::{self, Cursor};

use bytes::{Buf, BytesMut};
use serde_bytes::ByteBuf;
use tokio_util::codec::{Decoder, Encoder};

use super::{
    ErrorCode, HandshakeMessage, Message, Payload, MSG_ANNOUNCE_PIECE,
    MSG_BITFIELD, MSG_CANCEL_PIECE, MSG_COMPLETE, MSG_ERROR,
    MSG_PIECE_PAYLOAD, MSG_PIECE_REQUEST,
};
use crate::{Bitfield, PieceIndex};

/// Maximum size of a serialized message header. Anything larger is rejected
/// with a framing error, which is fatal for the connection.
pub const MAX_HEADER_LEN: usize = 32 * 1024;

/// Codec for the framed message stream.
///
/// The decoder is stateful: after reading a piece payload header it consumes
/// exactly the declared number of payload bytes before yielding the message,
/// so messages decode correctly no matter how the stream is chunked.
#[derive(Default)]
pub struct MessageCodec {
    /// Set while the payload bytes of a decoded piece payload header have
    /// not fully arrived yet.
    pending_payload: Option<PendingPayload>,
}

struct PendingPayload {
    piece: PieceIndex,
    offset: u64,
    length: u64,
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> io::Result<()> {
        let mut header = raw::Header {
            t: msg.type_id(),
            ..Default::default()
        };
        let mut payload = None;

        match msg {
            Message::Bitfield(hs) => {
                header.b =
                    Some(ByteBuf::from(hs.bitfield.as_raw_slice().to_vec()));
                header.d = Some(hs.digest.to_hex());
                header.h = Some(hex::encode(hs.info_hash));
                header.m = Some(
                    hs.remote_bitfields
                        .iter()
                        .map(|(id, bits)| {
                            (
                                hex::encode(id),
                                ByteBuf::from(bits.as_raw_slice().to_vec()),
                            )
                        })
                        .collect(),
                );
                header.n = Some(hs.namespace);
                header.p = Some(ByteBuf::from(hs.peer_id.to_vec()));
            }
            Message::PieceRequest {
                piece,
                offset,
                length,
            } => {
                header.i = Some(piece as u64);
                header.o = Some(offset);
                header.l = Some(length);
            }
            Message::PiecePayload {
                piece,
                offset,
                length,
                payload: data,
            } => {
                header.i = Some(piece as u64);
                header.o = Some(offset);
                header.l = Some(length);
                let data = match data {
                    Payload::Bytes(data) => data,
                    Payload::Store(_) => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "store backed payload must be resolved before \
                             encoding",
                        ))
                    }
                };
                if data.len() as u64 != length {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "piece payload does not match its declared length",
                    ));
                }
                payload = Some(data);
            }
            Message::AnnouncePiece { piece }
            | Message::CancelPiece { piece } => {
                header.i = Some(piece as u64);
            }
            Message::Complete => {}
            Message::Error { piece, code, text } => {
                header.c = Some(code.to_wire());
                header.i = Some(piece as u64);
                header.x = Some(text);
            }
        }

        let encoded = serde_bencode::to_bytes(&header)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if encoded.len() > MAX_HEADER_LEN {
            return Err(oversize_header(encoded.len()));
        }

        buf.reserve(
            4 + encoded.len()
                + payload.as_ref().map(|p| p.len()).unwrap_or_default(),
        );
        buf.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
        buf.extend_from_slice(&encoded);
        if let Some(data) = payload {
            buf.extend_from_slice(&data);
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        // finish a piece payload whose header already arrived
        if let Some(pending) = &self.pending_payload {
            if (buf.len() as u64) < pending.length {
                return Ok(None);
            }
            let pending = self.pending_payload.take().unwrap();
            let data = buf.split_to(pending.length as usize).freeze();
            return Ok(Some(Message::PiecePayload {
                piece: pending.piece,
                offset: pending.offset,
                length: pending.length,
                payload: Payload::Bytes(data),
            }));
        }

        if buf.len() < 4 {
            return Ok(None);
        }

        // `get_*` advances the buffer cursor, but we may not have the whole
        // message yet, so peek the length prefix through a cursor.
        let mut tmp_buf = Cursor::new(&buf);
        let header_len = tmp_buf.get_u32() as usize;
        if header_len > MAX_HEADER_LEN {
            return Err(oversize_header(header_len));
        }
        if buf.len() < 4 + header_len {
            return Ok(None);
        }

        buf.advance(4);
        let header_bytes = buf.split_to(header_len);
        let header: raw::Header = serde_bencode::from_bytes(&header_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if header.t == MSG_PIECE_PAYLOAD {
            self.pending_payload = Some(PendingPayload {
                piece: required(header.i, "i")? as PieceIndex,
                offset: required(header.o, "o")?,
                length: required(header.l, "l")?,
            });
            // the payload bytes may already be in the buffer
            return self.decode(buf);
        }

        header.into_message().map(Some)
    }
}

fn oversize_header(len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!(
            "message header of {} bytes exceeds the {} byte cap",
            len, MAX_HEADER_LEN
        ),
    )
}

fn invalid_data<E: Into<Box<dyn std::error::Error + Send + Sync>>>(
    e: E,
) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

fn required<T>(field: Option<T>, key: &str) -> io::Result<T> {
    field.ok_or_else(|| {
        invalid_data(format!("message header missing required key {:?}", key))
    })
}

fn to_fixed<const N: usize>(raw: &[u8], what: &str) -> io::Result<[u8; N]> {
    raw.try_into().map_err(|_| {
        invalid_data(format!(
            "{} must be {} bytes, got {}",
            what,
            N,
            raw.len()
        ))
    })
}

mod raw {
    //! Only for the bencode crate to (de)serialize message headers.

    use std::collections::BTreeMap;

    use serde_bytes::ByteBuf;
    use serde_derive::{Deserialize, Serialize};

    /// One dict for every message kind; absent keys are skipped. Fields are
    /// declared in key order so the encoding is canonical.
    #[derive(Debug, Default, Serialize, Deserialize)]
    pub(super) struct Header {
        /// Own bitfield, raw bits (bitfield message).
        #[serde(skip_serializing_if = "Option::is_none")]
        pub b: Option<ByteBuf>,
        /// Error code (error message).
        #[serde(skip_serializing_if = "Option::is_none")]
        pub c: Option<u8>,
        /// Blob digest, hex (bitfield message).
        #[serde(skip_serializing_if = "Option::is_none")]
        pub d: Option<String>,
        /// Info hash, hex (bitfield message).
        #[serde(skip_serializing_if = "Option::is_none")]
        pub h: Option<String>,
        /// Piece index.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub i: Option<u64>,
        /// Request or payload length in bytes.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub l: Option<u64>,
        /// Piggybacked bitfields of other peers, keyed by peer id hex
        /// (bitfield message).
        #[serde(skip_serializing_if = "Option::is_none")]
        pub m: Option<BTreeMap<String, ByteBuf>>,
        /// Namespace tag; set by the opener only (bitfield message).
        #[serde(skip_serializing_if = "Option::is_none")]
        pub n: Option<String>,
        /// Byte offset within the piece; always zero.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub o: Option<u64>,
        /// Peer id, raw bytes (bitfield message).
        #[serde(skip_serializing_if = "Option::is_none")]
        pub p: Option<ByteBuf>,
        /// Message type tag.
        pub t: u8,
        /// Error text (error message).
        #[serde(skip_serializing_if = "Option::is_none")]
        pub x: Option<String>,
    }

    use super::*;
    use crate::{Digest, PeerId};

    impl Header {
        /// Builds every message except the piece payload, which the decoder
        /// assembles itself once the payload bytes arrive.
        pub(super) fn into_message(self) -> io::Result<Message> {
            match self.t {
                MSG_BITFIELD => {
                    let peer_id: PeerId =
                        to_fixed(&required(self.p, "p")?, "peer id")?;
                    let digest: Digest = required(self.d, "d")?
                        .parse()
                        .map_err(invalid_data)?;
                    let info_hash = to_fixed(
                        &hex::decode(required(self.h, "h")?)
                            .map_err(invalid_data)?,
                        "info hash",
                    )?;
                    let bitfield = Bitfield::from_vec(
                        required(self.b, "b")?.into_vec(),
                    );
                    let mut remote_bitfields = BTreeMap::new();
                    for (id, bits) in self.m.unwrap_or_default() {
                        let id: PeerId = to_fixed(
                            &hex::decode(id).map_err(invalid_data)?,
                            "peer id",
                        )?;
                        remote_bitfields
                            .insert(id, Bitfield::from_vec(bits.into_vec()));
                    }
                    Ok(Message::Bitfield(HandshakeMessage {
                        peer_id,
                        digest,
                        info_hash,
                        bitfield,
                        remote_bitfields,
                        namespace: self.n.unwrap_or_default(),
                    }))
                }
                MSG_PIECE_REQUEST => Ok(Message::PieceRequest {
                    piece: required(self.i, "i")? as PieceIndex,
                    offset: required(self.o, "o")?,
                    length: required(self.l, "l")?,
                }),
                MSG_ANNOUNCE_PIECE => Ok(Message::AnnouncePiece {
                    piece: required(self.i, "i")? as PieceIndex,
                }),
                MSG_CANCEL_PIECE => Ok(Message::CancelPiece {
                    piece: required(self.i, "i")? as PieceIndex,
                }),
                MSG_COMPLETE => Ok(Message::Complete),
                MSG_ERROR => Ok(Message::Error {
                    piece: required(self.i, "i")? as PieceIndex,
                    code: ErrorCode::from_wire(required(self.c, "c")?)
                        .ok_or_else(|| {
                            invalid_data("unknown error code")
                        })?,
                    text: self.x.unwrap_or_default(),
                }),
                other => Err(invalid_data(format!(
                    "unknown message type {}",
                    other
                ))),
            }
        }
    }

}
