//! Rate limiting for preview publication.
//!
//! Values offered faster than the interval are coalesced: only the newest
//! one is kept and it goes out on the next [`Throttle::flush`] once the
//! interval has passed. The last value offered is never lost.

/// Default preview interval, 10 updates per second
pub const PREVIEW_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone)]
pub struct Throttle<T> {
    interval_ms: u64,
    last_emit_ms: Option<u64>,
    pending: Option<T>,
    latest: Option<T>,
}

impl<T: Clone> Throttle<T> {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_emit_ms: None,
            pending: None,
            latest: None,
        }
    }

    /// Offer a value. Returns it if it may be published now.
    pub fn offer(&mut self, value: T, current_time_ms: u64) -> Option<T> {
        self.latest = Some(value.clone());
        if self.ready(current_time_ms) {
            self.pending = None;
            self.last_emit_ms = Some(current_time_ms);
            Some(value)
        } else {
            self.pending = Some(value);
            None
        }
    }

    /// Release the coalesced value if the interval has passed.
    pub fn flush(&mut self, current_time_ms: u64) -> Option<T> {
        if self.pending.is_some() && self.ready(current_time_ms) {
            self.last_emit_ms = Some(current_time_ms);
            return self.pending.take();
        }
        None
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Most recent value offered, published or not.
    pub fn latest(&self) -> Option<&T> {
        self.latest.as_ref()
    }

    fn ready(&self, current_time_ms: u64) -> bool {
        self.last_emit_ms
            .map_or(true, |last| current_time_ms.saturating_sub(last) >= self.interval_ms)
    }
}

impl<T: Clone> Default for Throttle<T> {
    fn default() -> Self {
        Self::new(PREVIEW_INTERVAL_MS)
    }
}
