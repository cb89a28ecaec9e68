// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Write controller
//!
//! Background state (flush backlog, compaction debt) steers the foreground
//! write path through three intensities, each expressed as an RAII token so
//! a condition clears exactly when its last holder drops:
//!
//! - **stop**: writers park until every stop token is gone;
//! - **delay**: writers sleep long enough to match the configured delayed
//!   write rate;
//! - **compaction pressure**: low-priority writers pay a token-bucket rate
//!   limit, everyone else proceeds untouched.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Default delayed write rate (16 MB/s).
pub const DEFAULT_DELAYED_WRITE_RATE: u64 = 16 * 1024 * 1024;

/// Default refill budget for the low-pri limiter (4 MB/s).
pub const DEFAULT_LOW_PRI_RATE: u64 = 4 * 1024 * 1024;

#[derive(Debug)]
pub struct WriteController {
    total_stopped: AtomicU32,
    total_delayed: AtomicU32,
    total_compaction_pressure: AtomicU32,
    /// Target throughput while delayed, bytes per second.
    delayed_write_rate: AtomicU64,
    low_pri_rate_limiter: RateLimiter,
}

impl Default for WriteController {
    fn default() -> Self {
        Self::new(DEFAULT_DELAYED_WRITE_RATE, DEFAULT_LOW_PRI_RATE)
    }
}

impl WriteController {
    pub fn new(delayed_write_rate: u64, low_pri_rate: u64) -> Self {
        Self {
            total_stopped: AtomicU32::new(0),
            total_delayed: AtomicU32::new(0),
            total_compaction_pressure: AtomicU32::new(0),
            delayed_write_rate: AtomicU64::new(delayed_write_rate.max(1)),
            low_pri_rate_limiter: RateLimiter::new(low_pri_rate),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.total_stopped.load(Ordering::Acquire) > 0
    }

    pub fn needs_delay(&self) -> bool {
        self.total_delayed.load(Ordering::Acquire) > 0
    }

    /// Whether compactions are falling behind enough that low-priority
    /// writes should yield bandwidth.
    pub fn need_speedup_compaction(&self) -> bool {
        self.needs_delay() || self.total_compaction_pressure.load(Ordering::Acquire) > 0
    }

    pub fn set_delayed_write_rate(&self, bytes_per_sec: u64) {
        self.delayed_write_rate
            .store(bytes_per_sec.max(1), Ordering::Relaxed);
    }

    pub fn delayed_write_rate(&self) -> u64 {
        self.delayed_write_rate.load(Ordering::Relaxed)
    }

    /// How long a write of `num_bytes` should sleep to match the delayed
    /// rate. Zero when stopped (the caller parks instead) or not delayed.
    pub fn get_delay(&self, num_bytes: u64) -> Duration {
        if self.is_stopped() || !self.needs_delay() {
            return Duration::ZERO;
        }
        let rate = self.delayed_write_rate();
        Duration::from_micros(num_bytes.saturating_mul(1_000_000) / rate)
    }

    pub fn low_pri_rate_limiter(&self) -> &RateLimiter {
        &self.low_pri_rate_limiter
    }

    /// Halt all writes until the token drops.
    pub fn stop_write_token(self: &Arc<Self>) -> StopWriteToken {
        self.total_stopped.fetch_add(1, Ordering::SeqCst);
        StopWriteToken {
            controller: Arc::clone(self),
        }
    }

    /// Slow writes down to the delayed rate until the token drops.
    pub fn delay_write_token(self: &Arc<Self>) -> DelayWriteToken {
        self.total_delayed.fetch_add(1, Ordering::SeqCst);
        DelayWriteToken {
            controller: Arc::clone(self),
        }
    }

    /// Signal compaction pressure without slowing normal writes.
    pub fn compaction_pressure_token(self: &Arc<Self>) -> CompactionPressureToken {
        self.total_compaction_pressure.fetch_add(1, Ordering::SeqCst);
        CompactionPressureToken {
            controller: Arc::clone(self),
        }
    }
}

macro_rules! controller_token {
    ($name:ident, $counter:ident) => {
        #[derive(Debug)]
        pub struct $name {
            controller: Arc<WriteController>,
        }

        impl Drop for $name {
            fn drop(&mut self) {
                let prev = self.controller.$counter.fetch_sub(1, Ordering::SeqCst);
                debug_assert!(prev >= 1);
            }
        }
    };
}

controller_token!(StopWriteToken, total_stopped);
controller_token!(DelayWriteToken, total_delayed);
controller_token!(CompactionPressureToken, total_compaction_pressure);

// =============================================================================
// Low-priority rate limiter
// =============================================================================

/// Token-bucket limiter for low-priority writes. `request` blocks the
/// calling thread until enough budget has accumulated; it never fails.
#[derive(Debug)]
pub struct RateLimiter {
    bytes_per_sec: AtomicU64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    available: i64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec: AtomicU64::new(bytes_per_sec.max(1)),
            state: Mutex::new(BucketState {
                available: 0,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn set_bytes_per_second(&self, bytes_per_sec: u64) {
        self.bytes_per_sec
            .store(bytes_per_sec.max(1), Ordering::Relaxed);
    }

    /// Charge `bytes` against the budget, sleeping until the bucket covers
    /// the debt. Low-pri writers are slowed, never starved: progress is
    /// guaranteed once the accumulated budget goes non-negative.
    pub fn request(&self, bytes: u64) {
        let rate = self.bytes_per_sec.load(Ordering::Relaxed);
        let deficit = {
            let mut state = self.state.lock();
            let elapsed = state.last_refill.elapsed();
            state.last_refill = Instant::now();
            let refill = (elapsed.as_micros() as u64).saturating_mul(rate) / 1_000_000;
            // Cap the accumulated credit at one second of budget so an idle
            // limiter cannot bank an unbounded burst.
            state.available = (state.available + refill as i64).min(rate as i64);
            state.available -= bytes as i64;
            state.available
        };
        if deficit < 0 {
            let sleep_us = ((-deficit) as u64).saturating_mul(1_000_000) / rate;
            std::thread::sleep(Duration::from_micros(sleep_us));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_toggle_state() {
        let controller = Arc::new(WriteController::default());
        assert!(!controller.is_stopped());
        assert!(!controller.needs_delay());

        let stop = controller.stop_write_token();
        let delay = controller.delay_write_token();
        assert!(controller.is_stopped());
        assert!(controller.needs_delay());
        assert!(controller.need_speedup_compaction());

        drop(stop);
        assert!(!controller.is_stopped());
        assert!(controller.needs_delay());
        drop(delay);
        assert!(!controller.needs_delay());
        assert!(!controller.need_speedup_compaction());
    }

    #[test]
    fn test_pressure_token_does_not_delay() {
        let controller = Arc::new(WriteController::default());
        let pressure = controller.compaction_pressure_token();
        assert!(controller.need_speedup_compaction());
        assert!(!controller.needs_delay());
        assert!(!controller.is_stopped());
        drop(pressure);
        assert!(!controller.need_speedup_compaction());
    }

    #[test]
    fn test_get_delay_scales_with_bytes() {
        let controller = Arc::new(WriteController::new(1024 * 1024, DEFAULT_LOW_PRI_RATE));
        assert_eq!(controller.get_delay(4096), Duration::ZERO);

        let _delay = controller.delay_write_token();
        let one_mb = controller.get_delay(1024 * 1024);
        let half_mb = controller.get_delay(512 * 1024);
        assert_eq!(one_mb, Duration::from_secs(1));
        assert_eq!(half_mb, Duration::from_millis(500));
    }

    #[test]
    fn test_stopped_reports_no_delay() {
        let controller = Arc::new(WriteController::default());
        let _stop = controller.stop_write_token();
        let _delay = controller.delay_write_token();
        assert_eq!(controller.get_delay(1 << 20), Duration::ZERO);
    }

    #[test]
    fn test_rate_limiter_paces_requests() {
        // 1 MB/s budget, 256 KB debt => at least ~200ms of pacing across
        // the second request.
        let limiter = RateLimiter::new(1024 * 1024);
        let start = Instant::now();
        limiter.request(256 * 1024);
        limiter.request(1);
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
