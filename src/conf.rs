//! This module defines types used to configure the agent and its parts.

use std::time::Duration;

use crate::dispatch::policy::PolicyKind;

/// The global configuration for the piece exchange engine and all its parts.
#[derive(Debug, Clone, Default)]
pub struct Conf {
    pub conn: ConnConf,
    pub bandwidth: BandwidthConf,
    pub dispatch: DispatchConf,
    pub archive: ArchiveConf,
}

/// Configuration of a single peer connection.
#[derive(Debug, Clone)]
pub struct ConnConf {
    /// Bounds the single round trip of the opening bitfield exchange. After
    /// the handshake no socket deadlines are set; idleness is managed at
    /// higher layers.
    pub handshake_timeout: Duration,
    /// Capacity of the bounded outbound message queue. A full queue drops the
    /// message instead of blocking the sender.
    pub sender_buffer_size: usize,
    /// Capacity of the bounded inbound message channel.
    pub receiver_buffer_size: usize,
}

impl Default for ConnConf {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            sender_buffer_size: 10_000,
            receiver_buffer_size: 10_000,
        }
    }
}

/// Configuration of the process-wide bandwidth limiter.
///
/// Both rates are in bits per second and apply to piece payload bytes only;
/// message headers are not accounted. The burst capacity of each bucket is
/// one second worth of tokens. Rates are effectively rounded down to the
/// 10 ms refill granularity.
#[derive(Debug, Clone)]
pub struct BandwidthConf {
    pub egress_bits_per_sec: u64,
    pub ingress_bits_per_sec: u64,
}

impl Default for BandwidthConf {
    fn default() -> Self {
        Self {
            egress_bits_per_sec: 200 * 8 * MBIT,
            ingress_bits_per_sec: 300 * 8 * MBIT,
        }
    }
}

const MBIT: u64 = 1_000_000;

/// Configuration of a torrent's dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchConf {
    /// The floor of the piece request timeout.
    pub piece_request_min_timeout: Duration,
    /// Scales the piece request timeout with the torrent's piece length.
    pub piece_request_timeout_per_mb: Duration,
    /// Which strategy picks the next pieces to reserve.
    pub piece_request_policy: PolicyKind,
    /// The maximum number of in-flight piece requests per peer.
    pub pipeline_limit: usize,
    /// Remaining-piece count at or below which the same missing piece may be
    /// requested from multiple peers. Defaults to the pipeline limit.
    pub endgame_threshold: Option<usize>,
    pub disable_endgame: bool,
}

impl DispatchConf {
    /// The effective endgame threshold.
    pub fn endgame_threshold(&self) -> usize {
        self.endgame_threshold.unwrap_or(self.pipeline_limit)
    }
}

impl Default for DispatchConf {
    fn default() -> Self {
        Self {
            piece_request_min_timeout: Duration::from_secs(4),
            piece_request_timeout_per_mb: Duration::from_secs(4),
            piece_request_policy: PolicyKind::Default,
            pipeline_limit: 3,
            endgame_threshold: None,
            disable_endgame: false,
        }
    }
}

/// Configuration of the torrent archive.
#[derive(Debug, Clone)]
pub struct ArchiveConf {
    /// How many times a transient metainfo fetch failure is retried.
    pub unavailable_metainfo_retries: usize,
    /// The first retry sleep; subsequent sleeps double.
    pub unavailable_metainfo_retry_sleep: Duration,
    /// The overall deadline for one metainfo fetch including retries.
    pub metainfo_download_timeout: Duration,
}

impl Default for ArchiveConf {
    fn default() -> Self {
        Self {
            unavailable_metainfo_retries: 3,
            unavailable_metainfo_retry_sleep: Duration::from_secs(5),
            metainfo_download_timeout: Duration::from_secs(10 * 60),
        }
    }
}
