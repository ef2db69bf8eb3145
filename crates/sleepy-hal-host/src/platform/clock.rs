use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

/// Host wall clock plus a virtual offset that simulated sleeps push forward.
#[derive(Debug)]
pub struct VirtualClock {
    started: Instant,
    epoch_ms_at_start: i64,
    offset_ms: AtomicU64,
    valid: AtomicBool,
}

impl VirtualClock {
    /// Starts from the host's current time. An invalid clock becomes valid once the
    /// cloud session syncs it.
    pub fn new(valid: bool) -> Self {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |since| i64::try_from(since.as_millis()).unwrap_or(i64::MAX));
        Self::starting_at_ms(epoch_ms, valid)
    }

    pub fn starting_at(epoch_seconds: i64, valid: bool) -> Self {
        Self::starting_at_ms(epoch_seconds.saturating_mul(1_000), valid)
    }

    fn starting_at_ms(epoch_ms: i64, valid: bool) -> Self {
        Self {
            started: Instant::now(),
            epoch_ms_at_start: epoch_ms,
            offset_ms: AtomicU64::new(0),
            valid: AtomicBool::new(valid),
        }
    }

    pub fn now(&self) -> i64 {
        let millis = i64::try_from(self.millis()).unwrap_or(i64::MAX);
        self.epoch_ms_at_start.saturating_add(millis) / 1_000
    }

    pub fn millis(&self) -> u64 {
        let real = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        real.saturating_add(self.offset_ms.load(Ordering::Acquire))
    }

    pub fn advance(&self, ms: u64) {
        self.offset_ms.fetch_add(ms, Ordering::AcqRel);
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn set_valid(&self, valid: bool) {
        if self.valid.swap(valid, Ordering::AcqRel) != valid {
            log::info!("clock: valid={} now={}", valid, self.now());
        }
    }
}
