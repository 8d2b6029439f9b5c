//! A connection owns one socket after a successful handshake.
//!
//! It runs independent read and write loops, exposes a bounded send queue
//! and a receive channel, enforces bandwidth reservation on piece payloads
//! and supports idempotent close. Any socket error is fatal for the
//! connection; there is no reconnect at this layer.

pub mod handshake;

pub use handshake::{HandshakeResult, Handshaker, PendingConn};

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task;
use tokio_util::codec::Framed;

use crate::bandwidth::BandwidthLimiter;
use crate::clock::Clock;
use crate::conf::ConnConf;
use crate::error::conn::{ConnError, Result};
use crate::events::Events;
use crate::wire::{Message, MessageCodec, Payload, MSG_NAMES};
use crate::{InfoHash, PeerId};

/// The channel on which the owner receives messages read off the socket.
/// Closes when the read loop exits.
pub type MessageReceiver = mpsc::Receiver<Message>;

pub struct Connection {
    /// Self reference handed to the loop and shutdown tasks.
    this: Weak<Connection>,
    remote_peer_id: PeerId,
    info_hash: InfoHash,
    created_at: Instant,
    /// Whether the remote end opened the handshake.
    opened_by_remote: bool,
    outbox: mpsc::Sender<Message>,
    started: AtomicBool,
    closed: AtomicBool,
    /// Latched to true by close; both loops watch it and drain.
    done: watch::Sender<bool>,
    /// The socket and channel ends handed to the loops by start.
    io: Mutex<Option<ConnIo>>,
    /// Join handles of the loops, taken once by the shutdown sequence.
    loops: Mutex<Option<(task::JoinHandle<()>, task::JoinHandle<()>)>>,
    bandwidth: Arc<BandwidthLimiter>,
    events: Arc<dyn Events>,
    dropped: DroppedMessages,
}

struct ConnIo {
    framed: Framed<TcpStream, MessageCodec>,
    incoming: mpsc::Sender<Message>,
    outbox_rx: mpsc::Receiver<Message>,
}

impl Connection {
    pub(crate) fn new(
        remote_peer_id: PeerId,
        info_hash: InfoHash,
        opened_by_remote: bool,
        framed: Framed<TcpStream, MessageCodec>,
        conf: &ConnConf,
        bandwidth: Arc<BandwidthLimiter>,
        events: Arc<dyn Events>,
        clock: &dyn Clock,
    ) -> (Arc<Self>, MessageReceiver) {
        let (outbox, outbox_rx) = mpsc::channel(conf.sender_buffer_size);
        let (incoming, receiver) = mpsc::channel(conf.receiver_buffer_size);
        let (done, _) = watch::channel(false);
        let conn = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            remote_peer_id,
            info_hash,
            created_at: clock.now(),
            opened_by_remote,
            outbox,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            done,
            io: Mutex::new(Some(ConnIo {
                framed,
                incoming,
                outbox_rx,
            })),
            loops: Mutex::new(None),
            bandwidth,
            events,
            dropped: DroppedMessages::default(),
        });
        (conn, receiver)
    }

    pub fn remote_peer_id(&self) -> PeerId {
        self.remote_peer_id
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn opened_by_remote(&self) -> bool {
        self.opened_by_remote
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Counters of messages dropped by a full send queue.
    pub fn dropped_messages(&self) -> &DroppedMessages {
        &self.dropped
    }

    /// Spawns the read and write loops. May be called at most once;
    /// subsequent calls are no-ops.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.is_closed() {
            return;
        }
        let io = match self.io.lock().unwrap().take() {
            Some(io) => io,
            None => return,
        };
        let this = self.this.upgrade().expect("connection self reference");
        log::debug!("Starting connection {}", self);
        let (sink, stream) = io.framed.split();
        let read =
            task::spawn(Arc::clone(&this).read_loop(stream, io.incoming));
        let write = task::spawn(this.write_loop(sink, io.outbox_rx));
        *self.loops.lock().unwrap() = Some((read, write));
    }

    /// Enqueues a message without blocking.
    ///
    /// If the bounded send queue is full the message is dropped, the
    /// per-type counter incremented and an error returned; a slow or dead
    /// remote must not stall the dispatcher.
    pub fn send(&self, msg: Message) -> Result<()> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }
        match self.outbox.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                self.dropped.incr(&msg);
                log::warn!(
                    "Connection {} send buffer full, dropping {}",
                    self,
                    msg.name()
                );
                Err(ConnError::SendBufferFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ConnError::Closed),
        }
    }

    /// Initiates the shutdown sequence. Idempotent: concurrent and repeated
    /// calls after the first are no-ops.
    ///
    /// The winning caller latches the closed flag, signals both loops to
    /// drain and exit, and hands the rest of the sequence to an unblocked
    /// task which joins the loops (closing the socket) and then fires
    /// `on_conn_closed` exactly once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("Closing connection {}", self);
        let _ = self.done.send(true);
        // a socket that was never started is dropped right here
        drop(self.io.lock().unwrap().take());

        let conn = self.this.upgrade().expect("connection self reference");
        task::spawn(async move {
            let loops = conn.loops.lock().unwrap().take();
            if let Some((read, write)) = loops {
                let _ = read.await;
                let _ = write.await;
            }
            log::debug!("Connection {} closed", conn);
            conn.events.on_conn_closed(&conn);
        });
    }

    /// Reads one message per iteration. Piece payloads reserve their size in
    /// ingress tokens before they are handed to the receiver channel.
    async fn read_loop(
        self: Arc<Self>,
        mut stream: SplitStream<Framed<TcpStream, MessageCodec>>,
        incoming: mpsc::Sender<Message>,
    ) {
        let mut done = self.done.subscribe();
        loop {
            if *done.borrow() {
                break;
            }
            tokio::select! {
                _ = done.changed() => break,
                frame = stream.next() => match frame {
                    None => {
                        log::debug!("Connection {} remote closed", self);
                        break;
                    }
                    Some(Err(e)) => {
                        log::error!("Connection {} read error: {}", self, e);
                        break;
                    }
                    Some(Ok(msg)) => {
                        if let Message::PiecePayload { length, .. } = &msg {
                            if let Err(e) = self
                                .bandwidth
                                .reserve_ingress(length * 8)
                                .await
                            {
                                log::error!(
                                    "Connection {} dropping inbound piece: {}",
                                    self,
                                    e
                                );
                                continue;
                            }
                        }
                        if incoming.send(msg).await.is_err() {
                            log::debug!(
                                "Connection {} receiver dropped",
                                self
                            );
                            break;
                        }
                    }
                }
            }
        }
        drop(incoming);
        self.close();
    }

    /// Writes one message per iteration, in enqueue order.
    async fn write_loop(
        self: Arc<Self>,
        mut sink: SplitSink<Framed<TcpStream, MessageCodec>, Message>,
        mut outbox: mpsc::Receiver<Message>,
    ) {
        let mut done = self.done.subscribe();
        loop {
            if *done.borrow() {
                break;
            }
            tokio::select! {
                _ = done.changed() => break,
                maybe = outbox.recv() => match maybe {
                    None => break,
                    Some(msg) => {
                        let msg = match self.prepare_outbound(msg).await {
                            Some(msg) => msg,
                            // the piece transfer was aborted; the
                            // connection stays open
                            None => continue,
                        };
                        if let Err(e) = sink.send(msg).await {
                            log::error!(
                                "Connection {} write error: {}",
                                self,
                                e
                            );
                            break;
                        }
                    }
                }
            }
        }
        self.close();
    }

    /// Reserves egress tokens for a piece payload and resolves store backed
    /// payloads into bytes on the blocking pool. Returns `None` when the
    /// transfer must be aborted.
    async fn prepare_outbound(&self, msg: Message) -> Option<Message> {
        let (piece, offset, length, payload) = match msg {
            Message::PiecePayload {
                piece,
                offset,
                length,
                payload,
            } => (piece, offset, length, payload),
            msg => return Some(msg),
        };

        if let Err(e) = self.bandwidth.reserve_egress(length * 8).await {
            log::error!(
                "Connection {} dropping outbound piece {}: {}",
                self,
                piece,
                e
            );
            return None;
        }

        let data = match payload {
            Payload::Bytes(data) => data,
            Payload::Store(reader) => {
                let read = task::spawn_blocking(move || reader.read_all())
                    .await
                    .expect("piece read task panicked");
                match read {
                    Ok(data) => data,
                    Err(e) => {
                        log::error!(
                            "Connection {} cannot read piece {}: {}",
                            self,
                            piece,
                            e
                        );
                        return None;
                    }
                }
            }
        };

        Some(Message::PiecePayload {
            piece,
            offset,
            length,
            payload: Payload::Bytes(data),
        })
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} ({})",
            hex::encode(&self.remote_peer_id[..4]),
            hex::encode(&self.info_hash[..4]),
            if self.opened_by_remote {
                "inbound"
            } else {
                "outbound"
            }
        )
    }
}

/// Counts outbound messages dropped because the send queue was full, by
/// message type.
#[derive(Default)]
pub struct DroppedMessages {
    counts: [AtomicU64; MSG_NAMES.len()],
}

impl DroppedMessages {
    fn incr(&self, msg: &Message) {
        self.counts[msg.type_id() as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    /// Non-zero counters as `(message name, count)` pairs.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        self.counts
            .iter()
            .enumerate()
            .filter_map(|(id, count)| {
                let count = count.load(Ordering::Relaxed);
                (count > 0).then(|| (MSG_NAMES[id], count))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::net::TcpListener;

    use super::*;
    use crate::clock::SystemClock;
    use crate::conf::BandwidthConf;

    struct ClosedProbe {
        closed: AtomicUsize,
    }

    impl ClosedProbe {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                closed: AtomicUsize::new(0),
            })
        }

        /// The shutdown sequence runs on a detached task, so wait for it.
        async fn wait_closed(&self) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while self.closed.load(Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("connection did not close in time");
        }
    }

    impl Events for ClosedProbe {
        fn on_conn_closed(&self, _conn: &Connection) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn dispatcher_complete(&self, _info_hash: InfoHash) {}

        fn peer_removed(&self, _peer_id: PeerId, _info_hash: InfoHash) {}
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn make_conn(
        socket: TcpStream,
        conf: &ConnConf,
        events: Arc<dyn Events>,
    ) -> (Arc<Connection>, MessageReceiver) {
        let bandwidth = Arc::new(BandwidthLimiter::new(&BandwidthConf {
            egress_bits_per_sec: 1_000_000_000,
            ingress_bits_per_sec: 1_000_000_000,
        }));
        Connection::new(
            [1; 20],
            [2; 20],
            false,
            Framed::new(socket, MessageCodec::default()),
            conf,
            bandwidth,
            events,
            &SystemClock,
        )
    }

    #[tokio::test]
    async fn test_messages_flow_both_ways() {
        let (a, b) = socket_pair().await;
        let conf = ConnConf::default();
        let probe = ClosedProbe::new();
        let (conn_a, mut recv_a) =
            make_conn(a, &conf, probe.clone() as Arc<dyn Events>);
        let (conn_b, mut recv_b) =
            make_conn(b, &conf, probe.clone() as Arc<dyn Events>);
        conn_a.start();
        conn_b.start();

        conn_a
            .send(Message::PieceRequest {
                piece: 0,
                offset: 0,
                length: 1,
            })
            .unwrap();
        let got = recv_b.recv().await.unwrap();
        assert!(matches!(got, Message::PieceRequest { piece: 0, .. }));

        conn_b
            .send(Message::PiecePayload {
                piece: 0,
                offset: 0,
                length: 1,
                payload: Payload::Bytes(Bytes::from_static(b"A")),
            })
            .unwrap();
        let got = recv_a.recv().await.unwrap();
        match got {
            Message::PiecePayload { payload, .. } => {
                assert_eq!(payload, Payload::Bytes(Bytes::from_static(b"A")))
            }
            other => panic!("unexpected message: {:?}", other),
        }

        conn_a.close();
        conn_b.close();
    }

    #[tokio::test]
    async fn test_full_send_queue_drops_instead_of_blocking() {
        let (a, _b) = socket_pair().await;
        let conf = ConnConf {
            sender_buffer_size: 1,
            ..Default::default()
        };
        let probe = ClosedProbe::new();
        // never started, so the queue is not drained
        let (conn, _recv) = make_conn(a, &conf, probe as Arc<dyn Events>);

        conn.send(Message::Complete).unwrap();
        let err = conn.send(Message::AnnouncePiece { piece: 0 });
        assert!(matches!(err, Err(ConnError::SendBufferFull)));
        assert_eq!(conn.dropped_messages().total(), 1);
        assert_eq!(
            conn.dropped_messages().snapshot(),
            vec![("announce_piece", 1)]
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent_under_contention() {
        let (a, _b) = socket_pair().await;
        let conf = ConnConf::default();
        let probe = ClosedProbe::new();
        let (conn, _recv) =
            make_conn(a, &conf, probe.clone() as Arc<dyn Events>);
        conn.start();

        let mut tasks = Vec::new();
        for _ in 0..1000 {
            let conn = Arc::clone(&conn);
            tasks.push(tokio::spawn(async move { conn.close() }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        probe.wait_closed().await;
        // give a second shutdown sequence, if one were to exist, time to run
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(conn.is_closed());
        assert_eq!(probe.closed.load(Ordering::SeqCst), 1);
        assert!(conn.send(Message::Complete).is_err());
    }

    #[tokio::test]
    async fn test_remote_close_tears_down_and_fires_event() {
        let (a, b) = socket_pair().await;
        let conf = ConnConf::default();
        let probe = ClosedProbe::new();
        let (conn, mut recv) =
            make_conn(a, &conf, probe.clone() as Arc<dyn Events>);
        conn.start();

        drop(b);
        // read loop sees EOF, closes the receiver channel and the conn
        assert!(recv.recv().await.is_none());
        probe.wait_closed().await;
        assert!(conn.is_closed());
    }
}
