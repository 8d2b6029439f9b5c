//! Lifecycle callbacks surfaced to the host.
//!
//! The scheduler embedding this crate implements [`Events`] to learn about
//! connection teardown, torrent completion and peer churn; the engine holds
//! it behind an `Arc` and never blocks on it.

use crate::conn::Connection;
use crate::{InfoHash, PeerId};

pub trait Events: Send + Sync + 'static {
    /// The connection finished its shutdown sequence: both loops have
    /// exited and the socket is closed. Fired exactly once per connection.
    fn on_conn_closed(&self, conn: &Connection);

    /// The torrent's last piece completed. Fired exactly once per torrent.
    fn dispatcher_complete(&self, info_hash: InfoHash);

    /// A peer's feed task ended and the peer was dropped from the torrent.
    fn peer_removed(&self, peer_id: PeerId, info_hash: InfoHash);
}

/// Hosts that don't care about a surface can start from the no-op impl.
impl Events for () {
    fn on_conn_closed(&self, _conn: &Connection) {}

    fn dispatcher_complete(&self, _info_hash: InfoHash) {}

    fn peer_removed(&self, _peer_id: PeerId, _info_hash: InfoHash) {}
}
