//! One dispatcher per torrent.
//!
//! The dispatcher tracks the peers exchanging this torrent, drives piece
//! requests up to the pipeline limit, writes incoming piece payloads through
//! the torrent store, announces newly completed pieces, enters endgame near
//! completion and fires a completion event exactly once.

pub mod peer;
pub mod policy;
pub mod request;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task;

use crate::bitfield::SyncBitfield;
use crate::clock::Clock;
use crate::conf::DispatchConf;
use crate::conn::{Connection, MessageReceiver};
use crate::disk::TorrentStore;
use crate::error::store::WriteError;
use crate::events::Events;
use crate::wire::{ErrorCode, Message, Payload};
use crate::{Bitfield, InfoHash, PeerId, PieceIndex};

use self::peer::{Counters, Peer};
use self::request::{RequestManager, RequestStatus};

/// How many peers advertise each piece; one atomic counter per piece,
/// shared by all feed tasks of the torrent.
pub struct PieceCensus {
    counts: Vec<AtomicUsize>,
}

impl PieceCensus {
    fn new(num_pieces: usize) -> Self {
        Self {
            counts: (0..num_pieces).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    pub fn count(&self, piece: PieceIndex) -> usize {
        self.counts[piece].load(Ordering::Relaxed)
    }

    pub fn as_slice(&self) -> &[AtomicUsize] {
        &self.counts
    }

    fn incr(&self, piece: PieceIndex) {
        self.counts[piece].fetch_add(1, Ordering::Relaxed);
    }

    fn decr(&self, piece: PieceIndex) {
        self.counts[piece].fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct Dispatcher {
    this: Weak<Dispatcher>,
    conf: DispatchConf,
    clock: Arc<dyn Clock>,
    events: Arc<dyn Events>,
    local_peer_id: PeerId,
    store: TorrentStore,
    peers: Mutex<HashMap<PeerId, Arc<Peer>>>,
    requests: RequestManager,
    census: PieceCensus,
    completed: AtomicBool,
    /// Stops the periodic resend task.
    ticker_stop: watch::Sender<bool>,
}

impl Dispatcher {
    /// Creates the dispatcher and spawns its periodic resend task. If the
    /// torrent is already complete the completion path fires immediately.
    pub fn new(
        conf: DispatchConf,
        clock: Arc<dyn Clock>,
        events: Arc<dyn Events>,
        local_peer_id: PeerId,
        store: TorrentStore,
    ) -> Arc<Self> {
        let timeout =
            request::request_timeout(&conf, store.metainfo().max_piece_len());
        let requests = RequestManager::new(
            timeout,
            conf.pipeline_limit,
            conf.piece_request_policy,
            Arc::clone(&clock),
        );
        let num_pieces = store.metainfo().num_pieces();
        let (ticker_stop, ticker_rx) = watch::channel(false);

        let dispatcher = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            conf,
            clock,
            events,
            local_peer_id,
            store,
            peers: Mutex::new(HashMap::new()),
            requests,
            census: PieceCensus::new(num_pieces),
            completed: AtomicBool::new(false),
            ticker_stop,
        });

        task::spawn(Arc::clone(&dispatcher).tick_loop(ticker_rx, timeout / 2));
        if dispatcher.store.is_complete() {
            dispatcher.complete();
        }
        dispatcher
    }

    pub fn info_hash(&self) -> InfoHash {
        self.store.metainfo().info_hash()
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn store(&self) -> &TorrentStore {
        &self.store
    }

    pub fn census(&self) -> &PieceCensus {
        &self.census
    }

    pub fn num_peers(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Whether the tail of the download allows duplicate requests for the
    /// same piece across peers.
    pub fn endgame(&self) -> bool {
        if self.conf.disable_endgame {
            return false;
        }
        let num_pieces = self.store.metainfo().num_pieces();
        num_pieces - self.store.num_complete() <= self.conf.endgame_threshold()
    }

    /// Registers a peer, spawns its feed task and immediately evaluates
    /// piece requests once.
    pub fn add_peer(
        &self,
        peer_id: PeerId,
        bitfield: Bitfield,
        conn: Arc<Connection>,
        receiver: MessageReceiver,
    ) {
        let peer =
            Arc::new(Peer::new(peer_id, SyncBitfield::new(bitfield), conn));
        for piece in peer.bitfield().set_bits() {
            self.census.incr(piece);
        }
        self.peers.lock().unwrap().insert(peer_id, Arc::clone(&peer));
        log::info!(
            "Torrent {}: added peer {} ({} pieces)",
            hex::encode(&self.info_hash()[..4]),
            peer,
            peer.bitfield().count_ones()
        );

        let this = self.this.upgrade().expect("dispatcher self reference");
        let feed_peer = Arc::clone(&peer);
        task::spawn(async move { this.feed(feed_peer, receiver).await });

        self.maybe_request_more(&peer);
    }

    /// Reads the peer's messages until its connection closes the channel,
    /// then removes the peer.
    async fn feed(
        self: Arc<Self>,
        peer: Arc<Peer>,
        mut receiver: MessageReceiver,
    ) {
        while let Some(msg) = receiver.recv().await {
            self.dispatch(&peer, msg).await;
        }
        self.remove_peer(peer.peer_id());
    }

    fn remove_peer(&self, peer_id: PeerId) {
        let peer = match self.peers.lock().unwrap().remove(&peer_id) {
            Some(peer) => peer,
            None => return,
        };
        self.requests.clear_peer(peer_id);
        for piece in peer.bitfield().set_bits() {
            self.census.decr(piece);
        }
        log::info!(
            "Torrent {}: removed peer {}, stats: {}",
            hex::encode(&self.info_hash()[..4]),
            peer,
            peer.stats()
        );
        self.events.peer_removed(peer_id, self.info_hash());
    }

    /// Fills the peer's request pipeline from the pieces it has and we miss.
    fn maybe_request_more(&self, peer: &Peer) {
        let missing = !self.store.bitfield();
        let candidates = peer.bitfield().intersection(&missing);
        if candidates.not_any() {
            return;
        }

        let picked = self.requests.reserve(
            peer.peer_id(),
            &candidates,
            self.endgame(),
            self.census.as_slice(),
        );
        for piece in picked {
            let length = self.store.metainfo().piece_len(piece);
            Counters::incr(&peer.counters().pieces_requested);
            Counters::incr(&peer.counters().requests_sent);
            if peer
                .conn()
                .send(Message::PieceRequest {
                    piece,
                    offset: 0,
                    length,
                })
                .is_err()
            {
                // the resend pass will reassign this to another peer
                self.requests.mark_unsent(peer.peer_id(), piece);
                break;
            }
        }
    }

    /// Reassigns unsent, invalid and expired requests. For expired and
    /// invalid requests the original peer was unhelpful and is skipped; one
    /// successful resend per failed request.
    fn resend_failed_requests(&self) {
        let failed = self.requests.failed_requests();
        if failed.is_empty() {
            return;
        }
        log::debug!(
            "Torrent {}: resending {} failed piece requests",
            hex::encode(&self.info_hash()[..4]),
            failed.len()
        );

        let peers: Vec<Arc<Peer>> =
            self.peers.lock().unwrap().values().cloned().collect();
        let num_pieces = self.store.metainfo().num_pieces();
        for req in failed {
            for peer in &peers {
                if peer.peer_id() == req.peer_id
                    && matches!(
                        req.status,
                        RequestStatus::Expired | RequestStatus::Invalid
                    )
                {
                    continue;
                }
                if !peer.bitfield().has(req.piece) {
                    continue;
                }
                if self.try_send_piece_request(peer, req.piece, num_pieces) {
                    break;
                }
            }
        }
    }

    /// Attempts to reserve and send one specific piece to one peer.
    fn try_send_piece_request(
        &self,
        peer: &Peer,
        piece: PieceIndex,
        num_pieces: usize,
    ) -> bool {
        let mut single = Bitfield::repeat(false, num_pieces);
        single.set(piece, true);
        let picked = self.requests.reserve(
            peer.peer_id(),
            &single,
            self.endgame(),
            self.census.as_slice(),
        );
        if picked.is_empty() {
            return false;
        }
        let length = self.store.metainfo().piece_len(piece);
        Counters::incr(&peer.counters().pieces_requested);
        Counters::incr(&peer.counters().requests_sent);
        if peer
            .conn()
            .send(Message::PieceRequest {
                piece,
                offset: 0,
                length,
            })
            .is_err()
        {
            self.requests.mark_unsent(peer.peer_id(), piece);
            return false;
        }
        true
    }

    /// Handles one inbound message from the peer; each branch is
    /// independent of the others.
    async fn dispatch(&self, peer: &Arc<Peer>, msg: Message) {
        match msg {
            Message::Error {
                piece,
                code: ErrorCode::PieceRequestFailed,
                text,
            } => {
                log::warn!(
                    "Peer {} failed our request for piece {}: {}",
                    peer,
                    piece,
                    text
                );
                self.requests.mark_invalid(peer.peer_id(), piece);
            }
            Message::AnnouncePiece { piece } => {
                if piece >= self.store.metainfo().num_pieces() {
                    log::warn!(
                        "Peer {} announced out of bounds piece {}",
                        peer,
                        piece
                    );
                    return;
                }
                self.mark_peer_has(peer, piece);
                self.maybe_request_more(peer);
            }
            Message::PieceRequest {
                piece,
                offset,
                length,
            } => {
                self.handle_piece_request(peer, piece, offset, length);
            }
            Message::PiecePayload {
                piece,
                offset,
                length,
                payload,
            } => {
                self.handle_piece_payload(peer, piece, offset, length, payload)
                    .await;
            }
            Message::CancelPiece { piece } => {
                // in-flight pieces are never interrupted
                log::trace!(
                    "Peer {} cancelled piece {}; ignoring",
                    peer,
                    piece
                );
            }
            Message::Bitfield(_) => {
                log::warn!(
                    "Peer {} sent a bitfield outside the handshake; ignoring",
                    peer
                );
            }
            Message::Complete => {
                if self.store.is_complete() {
                    // neither side has anything left to exchange
                    peer.conn().close();
                } else {
                    let num_pieces = self.store.metainfo().num_pieces();
                    for piece in 0..num_pieces {
                        self.mark_peer_has(peer, piece);
                    }
                    self.maybe_request_more(peer);
                }
            }
        }
    }

    /// Sets the peer's bit and keeps the census in sync.
    fn mark_peer_has(&self, peer: &Peer, piece: PieceIndex) {
        if !peer.bitfield().set(piece, true) {
            self.census.incr(piece);
        }
    }

    /// Serves a remote's request for a whole piece out of the local store.
    fn handle_piece_request(
        &self,
        peer: &Arc<Peer>,
        piece: PieceIndex,
        offset: u64,
        length: u64,
    ) {
        Counters::incr(&peer.counters().requests_received);

        let num_pieces = self.store.metainfo().num_pieces();
        let full_piece = piece < num_pieces
            && offset == 0
            && length == self.store.metainfo().piece_len(piece);
        let reader = if full_piece {
            self.store.get_piece_reader(piece)
        } else {
            Err(crate::error::store::ReadError::InvalidPieceIndex)
        };

        let reader = match reader {
            Ok(reader) => reader,
            Err(e) => {
                log::warn!(
                    "Peer {} requested unreadable piece {}: {}",
                    peer,
                    piece,
                    e
                );
                let _ = peer.conn().send(Message::Error {
                    piece,
                    code: ErrorCode::PieceRequestFailed,
                    text: e.to_string(),
                });
                return;
            }
        };

        let length = reader.length();
        if peer
            .conn()
            .send(Message::PiecePayload {
                piece,
                offset: 0,
                length,
                payload: Payload::Store(reader),
            })
            .is_err()
        {
            return;
        }
        Counters::incr(&peer.counters().pieces_sent);
        peer.touch_last_piece_sent(self.clock.now());
        // they asked for it and we just gave it to them
        self.mark_peer_has(peer, piece);
    }

    /// Writes a received piece through the store and fans out the news.
    async fn handle_piece_payload(
        &self,
        peer: &Arc<Peer>,
        piece: PieceIndex,
        offset: u64,
        length: u64,
        payload: Payload,
    ) {
        Counters::incr(&peer.counters().pieces_received);

        let num_pieces = self.store.metainfo().num_pieces();
        let full_piece = piece < num_pieces
            && offset == 0
            && length == self.store.metainfo().piece_len(piece);
        let data = match payload {
            Payload::Bytes(data) if full_piece => data,
            _ => {
                log::warn!(
                    "Peer {} sent unusable payload for piece {}",
                    peer,
                    piece
                );
                self.requests.mark_invalid(peer.peer_id(), piece);
                return;
            }
        };

        match self.store.write_piece(piece, data).await {
            Ok(()) => {}
            Err(WriteError::PieceComplete) => {
                Counters::incr(&peer.counters().duplicate_pieces);
                return;
            }
            Err(WriteError::WriteConflict) => {
                // another peer's payload is mid-write; no re-issue needed
                log::debug!(
                    "Peer {} raced another writer on piece {}",
                    peer,
                    piece
                );
                return;
            }
            Err(e) => {
                log::warn!(
                    "Failed to write piece {} from peer {}: {}",
                    piece,
                    peer,
                    e
                );
                self.requests.mark_invalid(peer.peer_id(), piece);
                return;
            }
        }

        Counters::incr(&peer.counters().good_pieces);
        peer.touch_last_good_piece_received(self.clock.now());
        self.requests.clear(piece);

        if self.store.is_complete() {
            self.complete();
        }
        self.maybe_request_more(peer);

        let peers: Vec<Arc<Peer>> =
            self.peers.lock().unwrap().values().cloned().collect();
        for other in peers {
            if other.peer_id() == peer.peer_id() {
                continue;
            }
            let _ = other.conn().send(Message::AnnouncePiece { piece });
        }
    }

    /// The completion path. Idempotent; fires the completion event exactly
    /// once, stops the resend ticker, closes connections to peers that are
    /// themselves complete and tells the rest.
    fn complete(&self) {
        if self.completed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!(
            "Torrent {} complete",
            hex::encode(&self.info_hash()[..4])
        );
        let _ = self.ticker_stop.send(true);

        let peers: Vec<Arc<Peer>> =
            self.peers.lock().unwrap().values().cloned().collect();
        for peer in peers {
            if peer.bitfield().complete() {
                peer.conn().close();
            } else {
                let _ = peer.conn().send(Message::Complete);
            }
        }
        self.events.dispatcher_complete(self.info_hash());
    }

    /// Stops the ticker, closes every peer connection and emits aggregate
    /// per peer statistics.
    pub fn tear_down(&self) {
        let _ = self.ticker_stop.send(true);
        let peers: Vec<Arc<Peer>> =
            self.peers.lock().unwrap().values().cloned().collect();
        for peer in peers {
            log::info!(
                "Torrent {}: peer {} stats: {}",
                hex::encode(&self.info_hash()[..4]),
                peer,
                peer.stats()
            );
            peer.conn().close();
        }
    }

    /// Invokes the resend pass every half request timeout until stopped.
    async fn tick_loop(
        self: Arc<Self>,
        mut stop: watch::Receiver<bool>,
        period: Duration,
    ) {
        let mut interval = tokio::time::interval(period);
        interval
            .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = stop.changed() => break,
                _ = interval.tick() => self.resend_failed_requests(),
            }
        }
    }

    #[cfg(test)]
    fn failed_requests(&self) -> Vec<request::PieceRequest> {
        self.requests.failed_requests()
    }

    #[cfg(test)]
    fn pending_pieces(&self, peer_id: PeerId) -> Vec<PieceIndex> {
        self.requests.pending_pieces(peer_id)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::codec::Framed;

    use super::policy::PolicyKind;
    use super::*;
    use crate::bandwidth::BandwidthLimiter;
    use crate::clock::{SimulatedClock, SystemClock};
    use crate::conf::{BandwidthConf, ConnConf};
    use crate::conn::Handshaker;
    use crate::disk::Layout;
    use crate::metainfo::MetaInfo;
    use crate::wire::{HandshakeMessage, MessageCodec};
    use crate::Digest;

    #[derive(Default)]
    struct Probe {
        complete: AtomicUsize,
        removed: AtomicUsize,
    }

    impl Events for Probe {
        fn on_conn_closed(&self, _conn: &Connection) {}

        fn dispatcher_complete(&self, _info_hash: InfoHash) {
            self.complete.fetch_add(1, Ordering::SeqCst);
        }

        fn peer_removed(&self, _peer_id: PeerId, _info_hash: InfoHash) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn wait_for(what: &str, cond: impl Fn() -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(10), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        waited.unwrap_or_else(|_| panic!("timed out waiting for {}", what));
    }

    fn make_metainfo(data: &[u8], piece_length: u64) -> MetaInfo {
        MetaInfo::new(
            Digest::from_blob(data),
            data.len() as u64,
            piece_length,
            MetaInfo::sum_pieces(data, piece_length),
        )
        .unwrap()
    }

    fn make_store(root: &TempDir, metainfo: &MetaInfo) -> TorrentStore {
        TorrentStore::open(Layout::new(root.path()).unwrap(), metainfo.clone())
            .unwrap()
    }

    async fn seeded_store(
        root: &TempDir,
        metainfo: &MetaInfo,
        data: &[u8],
    ) -> TorrentStore {
        let store = make_store(root, metainfo);
        let piece_length = metainfo.max_piece_len() as usize;
        for (index, piece) in data.chunks(piece_length).enumerate() {
            store
                .write_piece(index, Bytes::copy_from_slice(piece))
                .await
                .unwrap();
        }
        assert!(store.is_complete());
        store
    }

    fn dispatcher(
        conf: DispatchConf,
        clock: Arc<dyn Clock>,
        probe: &Arc<Probe>,
        store: TorrentStore,
    ) -> Arc<Dispatcher> {
        Dispatcher::new(
            conf,
            clock,
            Arc::clone(probe) as Arc<dyn Events>,
            *b"local-agent-00000000",
            store,
        )
    }

    /// A connection over a real socket whose remote end is a raw framed
    /// stream the test scripts by hand. The connection is not started, so
    /// outbound messages stay observable in its queue.
    async fn test_conn(
        peer_id: PeerId,
    ) -> (Arc<Connection>, MessageReceiver, Framed<TcpStream, MessageCodec>)
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let bandwidth = Arc::new(BandwidthLimiter::new(&BandwidthConf {
            egress_bits_per_sec: 1_000_000_000,
            ingress_bits_per_sec: 1_000_000_000,
        }));
        let (conn, receiver) = Connection::new(
            peer_id,
            [0; 20],
            false,
            Framed::new(client, MessageCodec::default()),
            &ConnConf::default(),
            bandwidth,
            Arc::new(()),
            &SystemClock,
        );
        (conn, receiver, Framed::new(server, MessageCodec::default()))
    }

    fn peer_bits(num_pieces: usize, held: &[usize]) -> Bitfield {
        let mut bits = Bitfield::repeat(false, num_pieces);
        for &piece in held {
            bits.set(piece, true);
        }
        bits
    }

    fn census_counts(d: &Dispatcher) -> Vec<usize> {
        (0..d.store().metainfo().num_pieces())
            .map(|piece| d.census().count(piece))
            .collect()
    }

    #[tokio::test]
    async fn test_complete_fires_immediately_for_complete_torrent() {
        let data = b"AB";
        let metainfo = make_metainfo(data, 1);
        let root = TempDir::new().unwrap();
        let store = seeded_store(&root, &metainfo, data).await;

        let probe = Arc::new(Probe::default());
        let d = dispatcher(
            DispatchConf::default(),
            Arc::new(SystemClock),
            &probe,
            store,
        );
        assert_eq!(probe.complete.load(Ordering::SeqCst), 1);
        assert!(d.endgame());
    }

    #[tokio::test]
    async fn test_census_follows_peer_lifecycle() {
        let metainfo = make_metainfo(b"abcd", 1);
        let root = TempDir::new().unwrap();
        let store = make_store(&root, &metainfo);
        let probe = Arc::new(Probe::default());
        let d = dispatcher(
            DispatchConf {
                disable_endgame: true,
                ..Default::default()
            },
            Arc::new(SystemClock),
            &probe,
            store,
        );

        let (conn_a, recv_a, _remote_a) = test_conn([1; 20]).await;
        let (conn_b, recv_b, _remote_b) = test_conn([2; 20]).await;
        d.add_peer([1; 20], peer_bits(4, &[0, 1]), conn_a, recv_a);
        d.add_peer([2; 20], peer_bits(4, &[1, 2]), conn_b, recv_b);
        assert_eq!(census_counts(&d), vec![1, 2, 1, 0]);

        // an announcement raises the census once, repeats are no-ops
        let peer_b = d.peers.lock().unwrap().get(&[2; 20]).cloned().unwrap();
        d.dispatch(&peer_b, Message::AnnouncePiece { piece: 3 }).await;
        d.dispatch(&peer_b, Message::AnnouncePiece { piece: 3 }).await;
        assert_eq!(census_counts(&d), vec![1, 2, 1, 1]);

        // out of bounds announcements are dropped
        d.dispatch(&peer_b, Message::AnnouncePiece { piece: 9 }).await;
        assert_eq!(census_counts(&d), vec![1, 2, 1, 1]);

        d.remove_peer([2; 20]);
        assert_eq!(census_counts(&d), vec![1, 1, 0, 0]);
        assert_eq!(probe.removed.load(Ordering::SeqCst), 1);
        assert!(d.pending_pieces([2; 20]).is_empty());
    }

    #[tokio::test]
    async fn test_peer_complete_message_expands_bitfield() {
        let metainfo = make_metainfo(b"abcd", 1);
        let root = TempDir::new().unwrap();
        let store = make_store(&root, &metainfo);
        let probe = Arc::new(Probe::default());
        let d = dispatcher(
            DispatchConf {
                disable_endgame: true,
                ..Default::default()
            },
            Arc::new(SystemClock),
            &probe,
            store,
        );

        let (conn, recv, _remote) = test_conn([1; 20]).await;
        d.add_peer([1; 20], peer_bits(4, &[]), conn, recv);
        assert!(d.pending_pieces([1; 20]).is_empty());

        let peer = d.peers.lock().unwrap().get(&[1; 20]).cloned().unwrap();
        d.dispatch(&peer, Message::Complete).await;
        assert!(peer.bitfield().complete());
        assert_eq!(census_counts(&d), vec![1, 1, 1, 1]);
        // pipeline fills from the now-available pieces
        assert_eq!(d.pending_pieces([1; 20]).len(), 3);
    }

    #[tokio::test]
    async fn test_cancel_and_late_bitfield_are_ignored() {
        let metainfo = make_metainfo(b"abcd", 1);
        let root = TempDir::new().unwrap();
        let store = make_store(&root, &metainfo);
        let probe = Arc::new(Probe::default());
        let d = dispatcher(
            DispatchConf::default(),
            Arc::new(SystemClock),
            &probe,
            store,
        );

        let (conn, recv, _remote) = test_conn([1; 20]).await;
        d.add_peer([1; 20], peer_bits(4, &[0]), conn, recv);
        let peer = d.peers.lock().unwrap().get(&[1; 20]).cloned().unwrap();
        let before = d.pending_pieces([1; 20]);

        d.dispatch(&peer, Message::CancelPiece { piece: 0 }).await;
        d.dispatch(
            &peer,
            Message::Bitfield(HandshakeMessage {
                peer_id: [1; 20],
                digest: *d.store().metainfo().digest(),
                info_hash: d.info_hash(),
                bitfield: peer_bits(4, &[0, 1, 2, 3]),
                remote_bitfields: BTreeMap::new(),
                namespace: String::new(),
            }),
        )
        .await;

        // neither message changed any request or availability state
        assert_eq!(d.pending_pieces([1; 20]), before);
        assert_eq!(census_counts(&d), vec![1, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_peer_error_marks_request_invalid() {
        let metainfo = make_metainfo(b"abcd", 1);
        let root = TempDir::new().unwrap();
        let store = make_store(&root, &metainfo);
        let probe = Arc::new(Probe::default());
        let d = dispatcher(
            DispatchConf {
                pipeline_limit: 1,
                disable_endgame: true,
                ..Default::default()
            },
            Arc::new(SystemClock),
            &probe,
            store,
        );

        let (conn, recv, _remote) = test_conn([1; 20]).await;
        d.add_peer([1; 20], peer_bits(4, &[2]), conn, recv);
        assert_eq!(d.pending_pieces([1; 20]), vec![2]);

        let peer = d.peers.lock().unwrap().get(&[1; 20]).cloned().unwrap();
        d.dispatch(
            &peer,
            Message::Error {
                piece: 2,
                code: ErrorCode::PieceRequestFailed,
                text: "piece not readable".into(),
            },
        )
        .await;

        let failed = d.failed_requests();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].piece, 2);
        assert_eq!(failed[0].status, RequestStatus::Invalid);
    }

    /// Every branch of the transfer bookkeeping shows up in the peer's
    /// stats: our outbound requests, the pieces we serve, and good and
    /// duplicate payloads.
    #[tokio::test]
    async fn test_peer_stats_track_transfers() {
        let data = b"AB";
        let metainfo = make_metainfo(data, 1);
        let root = TempDir::new().unwrap();
        let store = make_store(&root, &metainfo);
        // piece 0 is locally complete so we can serve it
        store
            .write_piece(0, Bytes::from_static(b"A"))
            .await
            .unwrap();

        let probe = Arc::new(Probe::default());
        let d = dispatcher(
            DispatchConf {
                pipeline_limit: 1,
                disable_endgame: true,
                ..Default::default()
            },
            Arc::new(SystemClock),
            &probe,
            store,
        );

        let (conn, recv, _remote) = test_conn([1; 20]).await;
        d.add_peer([1; 20], peer_bits(2, &[1]), conn, recv);
        let peer = d.peers.lock().unwrap().get(&[1; 20]).cloned().unwrap();

        // registering the peer requested its piece 1 right away
        let stats = peer.stats();
        assert_eq!(stats.requests_sent, 1);
        assert_eq!(stats.pieces_requested, 1);
        assert_eq!(stats.pieces_received, 0);
        assert!(peer.last_piece_sent().is_none());
        assert!(peer.last_good_piece_received().is_none());

        // the peer asks for piece 0 and we serve it
        d.dispatch(
            &peer,
            Message::PieceRequest {
                piece: 0,
                offset: 0,
                length: 1,
            },
        )
        .await;
        let stats = peer.stats();
        assert_eq!(stats.requests_received, 1);
        assert_eq!(stats.pieces_sent, 1);
        assert!(peer.last_piece_sent().is_some());

        // the peer answers our request for piece 1
        d.dispatch(
            &peer,
            Message::PiecePayload {
                piece: 1,
                offset: 0,
                length: 1,
                payload: Payload::Bytes(Bytes::from_static(b"B")),
            },
        )
        .await;
        let stats = peer.stats();
        assert_eq!(stats.pieces_received, 1);
        assert_eq!(stats.good_pieces, 1);
        assert_eq!(stats.duplicate_pieces, 0);
        assert!(peer.last_good_piece_received().is_some());

        // a replayed payload for the now-complete piece is a duplicate
        d.dispatch(
            &peer,
            Message::PiecePayload {
                piece: 1,
                offset: 0,
                length: 1,
                payload: Payload::Bytes(Bytes::from_static(b"B")),
            },
        )
        .await;
        let stats = peer.stats();
        assert_eq!(stats.pieces_received, 2);
        assert_eq!(stats.good_pieces, 1);
        assert_eq!(stats.duplicate_pieces, 1);
    }

    /// Expired requests are reassigned, skipping the peer that sat on them.
    /// Peer `i` holds pieces `{i, i+1}`, so after all initial requests
    /// expire each piece moves to its other holder.
    #[tokio::test]
    async fn test_expired_requests_move_to_other_holders() {
        let metainfo = make_metainfo(b"abc", 1);
        let root = TempDir::new().unwrap();
        let store = make_store(&root, &metainfo);
        let probe = Arc::new(Probe::default());
        let clock = Arc::new(SimulatedClock::new());
        let d = dispatcher(
            DispatchConf {
                pipeline_limit: 1,
                disable_endgame: true,
                piece_request_policy: PolicyKind::RarestFirst,
                ..Default::default()
            },
            Arc::clone(&clock) as Arc<dyn Clock>,
            &probe,
            store,
        );

        let peers: [PeerId; 3] = [[1; 20], [2; 20], [3; 20]];
        let mut remotes = Vec::new();
        for &peer_id in &peers {
            let (conn, recv, remote) = test_conn(peer_id).await;
            d.add_peer(peer_id, peer_bits(3, &[]), conn, recv);
            remotes.push(remote);
        }

        // peer i announces pieces i and i+1 in order; with a pipeline of
        // one, peer i ends up with the request for piece i
        for (i, &peer_id) in peers.iter().enumerate() {
            let peer =
                d.peers.lock().unwrap().get(&peer_id).cloned().unwrap();
            d.dispatch(&peer, Message::AnnouncePiece { piece: i }).await;
            d.dispatch(
                &peer,
                Message::AnnouncePiece { piece: (i + 1) % 3 },
            )
            .await;
            assert_eq!(d.pending_pieces(peer_id), vec![i]);
        }
        assert_eq!(census_counts(&d), vec![2, 2, 2]);

        clock.advance(d.requests.timeout() + Duration::from_secs(1));
        assert_eq!(d.failed_requests().len(), 3);

        d.resend_failed_requests();

        // piece i's only other holder is peer i-1: one pending request per
        // peer, still one per piece
        assert_eq!(d.pending_pieces(peers[0]), vec![1]);
        assert_eq!(d.pending_pieces(peers[1]), vec![2]);
        assert_eq!(d.pending_pieces(peers[2]), vec![0]);
    }

    /// The single piece exchange: a seed and an empty agent handshake,
    /// the agent requests the piece, writes it, and both finish with
    /// all-ones bitfields and the agent's blob promoted to cache.
    #[tokio::test]
    async fn test_single_piece_exchange_end_to_end() {
        let data = b"A";
        let metainfo = make_metainfo(data, 1);

        let seed_root = TempDir::new().unwrap();
        let seed_store = seeded_store(&seed_root, &metainfo, data).await;
        let seed_probe = Arc::new(Probe::default());
        let seed_dispatcher = dispatcher(
            DispatchConf::default(),
            Arc::new(SystemClock),
            &seed_probe,
            seed_store.clone(),
        );

        let agent_root = TempDir::new().unwrap();
        let agent_store = make_store(&agent_root, &metainfo);
        let agent_probe = Arc::new(Probe::default());
        let agent_dispatcher = dispatcher(
            DispatchConf::default(),
            Arc::new(SystemClock),
            &agent_probe,
            agent_store.clone(),
        );

        let bandwidth =
            Arc::new(BandwidthLimiter::new(&BandwidthConf::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let seed_metainfo = metainfo.clone();
        let seed_side = {
            let seed_dispatcher = Arc::clone(&seed_dispatcher);
            let seed_store = seed_store.clone();
            let bandwidth = Arc::clone(&bandwidth);
            tokio::spawn(async move {
                let handshaker = Handshaker::new(
                    *b"seed-peer-0000000000",
                    ConnConf::default(),
                    bandwidth,
                    Arc::new(()),
                    Arc::new(SystemClock),
                );
                let (socket, _) = listener.accept().await.unwrap();
                let pending = handshaker.accept(socket).await.unwrap();
                let result = handshaker
                    .establish(
                        pending,
                        &seed_metainfo,
                        seed_store.bitfield(),
                        BTreeMap::new(),
                    )
                    .await
                    .unwrap();
                seed_dispatcher.add_peer(
                    result.conn.remote_peer_id(),
                    result.bitfield,
                    Arc::clone(&result.conn),
                    result.receiver,
                );
                result.conn.start();
            })
        };

        let handshaker = Handshaker::new(
            *b"agnt-peer-0000000000",
            ConnConf::default(),
            Arc::clone(&bandwidth),
            Arc::new(()),
            Arc::new(SystemClock),
        );
        let result = handshaker
            .initialize(
                *b"seed-peer-0000000000",
                addr,
                &metainfo,
                agent_store.bitfield(),
                BTreeMap::new(),
                "library/busybox",
            )
            .await
            .unwrap();
        assert!(result.bitfield.all());
        agent_dispatcher.add_peer(
            result.conn.remote_peer_id(),
            result.bitfield,
            Arc::clone(&result.conn),
            result.receiver,
        );
        result.conn.start();
        seed_side.await.unwrap();

        wait_for("agent to complete", || {
            agent_probe.complete.load(Ordering::SeqCst) == 1
        })
        .await;

        assert!(agent_store.is_complete());
        assert!(agent_store.bitfield().all());
        let agent_layout = Layout::new(agent_root.path()).unwrap();
        assert_eq!(
            std::fs::read(agent_layout.cache_blob(metainfo.digest()))
                .unwrap(),
            data
        );

        // the agent closes the seed connection once both sides are
        // complete; the seed then drops the peer
        wait_for("seed to drop the peer", || {
            seed_probe.removed.load(Ordering::SeqCst) == 1
        })
        .await;
    }
}
