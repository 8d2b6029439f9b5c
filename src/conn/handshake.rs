//! The opening bitfield exchange.
//!
//! Both sides send exactly one bitfield message carrying their identity, the
//! torrent they want to exchange, their own piece availability, optionally
//! the last known bitfields of other peers, and (for the opener) a namespace
//! tag. On success a fully initialized but not yet started [`Connection`] is
//! returned together with everything the dispatcher needs to register the
//! peer.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use super::{Connection, MessageReceiver};
use crate::bandwidth::BandwidthLimiter;
use crate::clock::Clock;
use crate::conf::ConnConf;
use crate::error::conn::HandshakeError;
use crate::events::Events;
use crate::metainfo::MetaInfo;
use crate::wire::{HandshakeMessage, Message, MessageCodec};
use crate::{Bitfield, Digest, InfoHash, PeerId};

type Result<T> = std::result::Result<T, HandshakeError>;

/// Upgrades raw sockets, inbound or outbound, into connections.
pub struct Handshaker {
    local_peer_id: PeerId,
    conf: ConnConf,
    bandwidth: Arc<BandwidthLimiter>,
    events: Arc<dyn Events>,
    clock: Arc<dyn Clock>,
}

/// What a successful handshake yields: the connection plus the remote's
/// announced state.
pub struct HandshakeResult {
    pub conn: Arc<Connection>,
    /// The connection's inbound message channel, to be consumed by the
    /// dispatcher's feed task.
    pub receiver: MessageReceiver,
    /// The remote's own piece availability.
    pub bitfield: Bitfield,
    /// Piggybacked bitfields of other peers the remote talks to.
    pub remote_bitfields: BTreeMap<PeerId, Bitfield>,
    /// The opener's namespace tag; empty on outbound handshakes.
    pub namespace: String,
}

impl fmt::Debug for HandshakeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandshakeResult(..)")
    }
}

/// An accepted socket whose opening bitfield has been read but not yet
/// answered. The caller looks up the torrent it names, then calls
/// [`Handshaker::establish`].
pub struct PendingConn {
    framed: Framed<TcpStream, MessageCodec>,
    addr: SocketAddr,
    remote: HandshakeMessage,
}

impl PendingConn {
    pub fn peer_id(&self) -> PeerId {
        self.remote.peer_id
    }

    pub fn digest(&self) -> &Digest {
        &self.remote.digest
    }

    pub fn info_hash(&self) -> InfoHash {
        self.remote.info_hash
    }

    pub fn namespace(&self) -> &str {
        &self.remote.namespace
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Handshaker {
    pub fn new(
        local_peer_id: PeerId,
        conf: ConnConf,
        bandwidth: Arc<BandwidthLimiter>,
        events: Arc<dyn Events>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            local_peer_id,
            conf,
            bandwidth,
            events,
            clock,
        }
    }

    /// Opens an outbound connection to the peer the tracker handed out.
    ///
    /// Sends our bitfield first, then verifies that the remote is the peer
    /// we dialed and is on the same torrent. Any failure closes the socket.
    #[allow(clippy::too_many_arguments)]
    pub async fn initialize(
        &self,
        expected_peer_id: PeerId,
        addr: SocketAddr,
        metainfo: &MetaInfo,
        own_bitfield: Bitfield,
        piggyback: BTreeMap<PeerId, Bitfield>,
        namespace: &str,
    ) -> Result<HandshakeResult> {
        log::debug!("Opening connection to peer {}", addr);
        let socket = TcpStream::connect(addr).await?;
        let mut framed = Framed::new(socket, MessageCodec::default());

        self.send_bitfield(
            &mut framed,
            HandshakeMessage {
                peer_id: self.local_peer_id,
                digest: *metainfo.digest(),
                info_hash: metainfo.info_hash(),
                bitfield: own_bitfield,
                remote_bitfields: piggyback,
                namespace: namespace.to_owned(),
            },
        )
        .await?;
        let remote = self.recv_bitfield(&mut framed).await?;

        if remote.peer_id != expected_peer_id {
            return Err(HandshakeError::PeerIdMismatch {
                got: hex::encode(remote.peer_id),
                want: hex::encode(expected_peer_id),
            });
        }
        if remote.info_hash != metainfo.info_hash() {
            return Err(HandshakeError::InfoHashMismatch {
                got: hex::encode(remote.info_hash),
                want: hex::encode(metainfo.info_hash()),
            });
        }

        log::debug!("Handshake with peer {} succeeded", addr);
        Ok(self.build(framed, remote, metainfo, false))
    }

    /// Reads the opening bitfield off an accepted socket, establishing which
    /// torrent the remote wants to exchange.
    pub async fn accept(&self, socket: TcpStream) -> Result<PendingConn> {
        let addr = socket.peer_addr()?;
        log::debug!("Accepting connection from peer {}", addr);
        let mut framed = Framed::new(socket, MessageCodec::default());
        let remote = self.recv_bitfield(&mut framed).await?;
        Ok(PendingConn {
            framed,
            addr,
            remote,
        })
    }

    /// Answers an accepted handshake with our own bitfield. The acceptor
    /// leaves the namespace tag empty.
    pub async fn establish(
        &self,
        pending: PendingConn,
        metainfo: &MetaInfo,
        own_bitfield: Bitfield,
        piggyback: BTreeMap<PeerId, Bitfield>,
    ) -> Result<HandshakeResult> {
        let PendingConn {
            mut framed,
            addr,
            remote,
        } = pending;

        if remote.info_hash != metainfo.info_hash() {
            return Err(HandshakeError::InfoHashMismatch {
                got: hex::encode(remote.info_hash),
                want: hex::encode(metainfo.info_hash()),
            });
        }

        self.send_bitfield(
            &mut framed,
            HandshakeMessage {
                peer_id: self.local_peer_id,
                digest: *metainfo.digest(),
                info_hash: metainfo.info_hash(),
                bitfield: own_bitfield,
                remote_bitfields: piggyback,
                namespace: String::new(),
            },
        )
        .await?;

        log::debug!("Handshake with peer {} succeeded", addr);
        Ok(self.build(framed, remote, metainfo, true))
    }

    async fn send_bitfield(
        &self,
        framed: &mut Framed<TcpStream, MessageCodec>,
        msg: HandshakeMessage,
    ) -> Result<()> {
        match timeout(
            self.conf.handshake_timeout,
            framed.send(Message::Bitfield(msg)),
        )
        .await
        {
            Err(_) => Err(HandshakeError::Timeout),
            Ok(sent) => Ok(sent?),
        }
    }

    async fn recv_bitfield(
        &self,
        framed: &mut Framed<TcpStream, MessageCodec>,
    ) -> Result<HandshakeMessage> {
        let msg =
            match timeout(self.conf.handshake_timeout, framed.next()).await {
                Err(_) => return Err(HandshakeError::Timeout),
                Ok(None) => return Err(HandshakeError::ClosedByRemote),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(msg))) => msg,
            };
        match msg {
            Message::Bitfield(hs) => Ok(hs),
            other => Err(HandshakeError::UnexpectedMessage(other.name())),
        }
    }

    fn build(
        &self,
        framed: Framed<TcpStream, MessageCodec>,
        mut remote: HandshakeMessage,
        metainfo: &MetaInfo,
        opened_by_remote: bool,
    ) -> HandshakeResult {
        // wire bitfields are padded to whole bytes; trim to the piece count
        let num_pieces = metainfo.num_pieces();
        remote.bitfield.resize(num_pieces, false);
        for bits in remote.remote_bitfields.values_mut() {
            bits.resize(num_pieces, false);
        }

        let (conn, receiver) = Connection::new(
            remote.peer_id,
            metainfo.info_hash(),
            opened_by_remote,
            framed,
            &self.conf,
            Arc::clone(&self.bandwidth),
            Arc::clone(&self.events),
            &*self.clock,
        );
        HandshakeResult {
            conn,
            receiver,
            bitfield: remote.bitfield,
            remote_bitfields: remote.remote_bitfields,
            namespace: remote.namespace,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::clock::SystemClock;
    use crate::conf::BandwidthConf;

    fn handshaker(peer_id: PeerId, conf: ConnConf) -> Handshaker {
        Handshaker::new(
            peer_id,
            conf,
            Arc::new(BandwidthLimiter::new(&BandwidthConf::default())),
            Arc::new(()),
            Arc::new(SystemClock),
        )
    }

    fn make_metainfo() -> MetaInfo {
        let data = b"0123456789abcdef";
        MetaInfo::new(
            Digest::from_blob(data),
            data.len() as u64,
            4,
            MetaInfo::sum_pieces(data, 4),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_handshake_exchanges_bitfields_and_namespace() {
        let metainfo = make_metainfo();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let seed_metainfo = metainfo.clone();
        let seeder = tokio::spawn(async move {
            let handshaker = handshaker(*b"seed-000000000000000", ConnConf::default());
            let (socket, _) = listener.accept().await.unwrap();
            let pending = handshaker.accept(socket).await.unwrap();
            assert_eq!(pending.peer_id(), *b"agnt-000000000000000");
            assert_eq!(pending.info_hash(), seed_metainfo.info_hash());
            assert_eq!(pending.namespace(), "library/busybox");
            handshaker
                .establish(
                    pending,
                    &seed_metainfo,
                    Bitfield::repeat(true, seed_metainfo.num_pieces()),
                    BTreeMap::new(),
                )
                .await
                .unwrap()
        });

        let handshaker = handshaker(*b"agnt-000000000000000", ConnConf::default());
        let result = handshaker
            .initialize(
                *b"seed-000000000000000",
                addr,
                &metainfo,
                metainfo.empty_bitfield(),
                BTreeMap::new(),
                "library/busybox",
            )
            .await
            .unwrap();

        // the seed advertised a complete bitfield, the agent an empty one
        assert!(result.bitfield.all());
        assert_eq!(result.bitfield.len(), metainfo.num_pieces());
        // the acceptor sends no namespace
        assert_eq!(result.namespace, "");
        assert!(!result.conn.opened_by_remote());

        let accepted = seeder.await.unwrap();
        assert!(accepted.bitfield.not_any());
        assert_eq!(accepted.namespace, "library/busybox");
        assert!(accepted.conn.opened_by_remote());
    }

    #[tokio::test]
    async fn test_peer_id_mismatch_is_fatal() {
        let metainfo = make_metainfo();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let seed_metainfo = metainfo.clone();
        tokio::spawn(async move {
            let handshaker = handshaker(*b"mallory-peer-0000000", ConnConf::default());
            let (socket, _) = listener.accept().await.unwrap();
            let pending = handshaker.accept(socket).await.unwrap();
            let _ = handshaker
                .establish(
                    pending,
                    &seed_metainfo,
                    Bitfield::repeat(true, seed_metainfo.num_pieces()),
                    BTreeMap::new(),
                )
                .await;
        });

        let handshaker = handshaker(*b"agnt-000000000000000", ConnConf::default());
        let err = handshaker
            .initialize(
                *b"seed-000000000000000",
                addr,
                &metainfo,
                metainfo.empty_bitfield(),
                BTreeMap::new(),
                "",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::PeerIdMismatch { .. }));
    }

    #[tokio::test]
    async fn test_silent_remote_times_out() {
        let metainfo = make_metainfo();
        // a listener that accepts but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let handshaker = handshaker(
            *b"agnt-000000000000000",
            ConnConf {
                handshake_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        );
        let err = handshaker
            .initialize(
                *b"seed-000000000000000",
                addr,
                &metainfo,
                metainfo.empty_bitfield(),
                BTreeMap::new(),
                "",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout));
    }
}
