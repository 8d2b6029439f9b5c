//! The process-wide bandwidth limiter.
//!
//! One instance is constructed at startup and shared by reference counting
//! between every connection in the process. It holds two independent token
//! buckets, one for ingress and one for egress piece bytes; message headers
//! are not accounted.

use std::time::Duration;

use leaky_bucket::RateLimiter;

use crate::conf::BandwidthConf;
use crate::error::conn::BandwidthError;

/// The refill granularity of both buckets. Rates are effectively rounded
/// down to a multiple of the refills per second.
const REFILL_INTERVAL: Duration = Duration::from_millis(10);
const REFILLS_PER_SEC: u64 = 100;

/// Token buckets rate limiting piece payload bytes, in bits per second.
///
/// Reservations are granted in FIFO order: two concurrent reservers of equal
/// size receive tokens in the order they asked. A reservation larger than a
/// bucket's burst capacity can never be satisfied and fails immediately.
pub struct BandwidthLimiter {
    egress: RateLimiter,
    egress_burst: u64,
    ingress: RateLimiter,
    ingress_burst: u64,
}

impl BandwidthLimiter {
    pub fn new(conf: &BandwidthConf) -> Self {
        Self {
            egress: bucket(conf.egress_bits_per_sec),
            egress_burst: conf.egress_bits_per_sec,
            ingress: bucket(conf.ingress_bits_per_sec),
            ingress_burst: conf.ingress_bits_per_sec,
        }
    }

    /// Blocks until `bits` egress tokens are available.
    pub async fn reserve_egress(&self, bits: u64) -> Result<(), BandwidthError> {
        reserve(&self.egress, self.egress_burst, bits).await
    }

    /// Blocks until `bits` ingress tokens are available.
    pub async fn reserve_ingress(
        &self,
        bits: u64,
    ) -> Result<(), BandwidthError> {
        reserve(&self.ingress, self.ingress_burst, bits).await
    }
}

/// The burst capacity is one second worth of tokens; buckets start empty.
fn bucket(bits_per_sec: u64) -> RateLimiter {
    RateLimiter::builder()
        .max(bits_per_sec as usize)
        .initial(0)
        .refill(((bits_per_sec / REFILLS_PER_SEC).max(1)) as usize)
        .interval(REFILL_INTERVAL)
        .build()
}

async fn reserve(
    limiter: &RateLimiter,
    burst: u64,
    bits: u64,
) -> Result<(), BandwidthError> {
    if bits > burst {
        return Err(BandwidthError::ExceedsBurst { bits, burst });
    }
    limiter.acquire(bits as usize).await;
    Ok(())
}
