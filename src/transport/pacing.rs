//! Token-bucket pacing of outbound datagrams.
//!
//! The bucket holds bytes and refills continuously at the current send rate. Each successful
//! send nudges the rate towards the configured bandwidth; each reported loss scales it down
//! proportionally to the number of lost datagrams, bounded per NACK burst and floored at a
//! configured fraction of the bandwidth.

use std::cmp::min;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::config::Config;

pub struct RateController {
    bandwidth_kbps: i64,
    rate_kbps: i64,
    bucket: u64,
    max_bucket: u64,
    mtu: u64,
    last_refill: Instant,
    upscale_permille: i64,
    downscale_permille: i64,
    max_scale_percent: i64,
    min_shift: u32,
}

impl RateController {
    pub fn new(config: &Config) -> RateController {
        RateController {
            bandwidth_kbps: config.bandwidth_kbps,
            rate_kbps: config.bandwidth_kbps,
            bucket: 0,
            max_bucket: config.max_bucket_size(),
            mtu: config.mtu as u64,
            last_refill: Instant::now(),
            upscale_permille: config.error_upscale_permille,
            downscale_permille: config.error_downscale_permille,
            max_scale_percent: config.error_max_scale_percent,
            min_shift: config.min_send_rate_shift,
        }
    }

    /// Current send rate in KB/s.
    pub fn rate(&self) -> i64 {
        self.rate_kbps
    }

    fn floor_rate(&self) -> i64 {
        (self.bandwidth_kbps >> self.min_shift).max(1)
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now - self.last_refill;
        self.last_refill = now;

        // KB/s is close enough to bytes/ms that the conversion factor is dropped
        let tokens = (elapsed.as_secs_f64() * 1000.0 * self.rate_kbps as f64) as u64;
        self.bucket = min(self.bucket + tokens, self.max_bucket);
    }

    /// Waits until the bucket holds enough tokens for a send of `bytes`, debits them, and
    /// applies the per-send speedup. Yields to the runtime while waiting; the caller is the
    /// protocol task, which must never busy-spin.
    pub async fn acquire(&mut self, bytes: usize) {
        let needed = min(bytes as u64, self.mtu);

        self.refill();
        while self.bucket < needed {
            let deficit = needed - self.bucket;
            // KB/s ~ bytes/ms, so the wait for `deficit` bytes is deficit/rate milliseconds
            let wait_ms = deficit / self.rate_kbps.max(1) as u64 + 1;
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            self.refill();
        }
        self.bucket -= needed;

        if self.rate_kbps < self.bandwidth_kbps {
            self.rate_kbps = min(
                self.rate_kbps + self.bandwidth_kbps * self.upscale_permille / 1000,
                self.bandwidth_kbps,
            );
            trace!("speeding up to {} KB/s", self.rate_kbps);
        }
    }

    /// Applies the slow-down for `lost` datagrams reported by a NACK.
    pub fn on_loss(&mut self, lost: u16) {
        let floor = self.floor_rate();
        if self.rate_kbps <= floor {
            return;
        }

        let delta = lost as f64 * self.downscale_permille as f64 / 1000.0;
        let max_delta = self.max_scale_percent as f64 / 100.0;
        let down_scale = delta.min(max_delta);

        self.rate_kbps -= 1 + (self.rate_kbps as f64 * down_scale) as i64;
        self.rate_kbps = self.rate_kbps.max(floor);
        trace!(
            "lost {}, slowing down {:.1}% to {} KB/s",
            lost,
            down_scale * 100.0,
            self.rate_kbps
        );
    }
}
