//! Sliding 60-second operation counters
//!
//! Used for the store's ops_60s heartbeat field and the directory's
//! per-photo read-rate tracking. A fixed ring of one-second buckets is
//! advanced lazily on access; stale buckets are zeroed as the window slides.

use parking_lot::Mutex;
use std::time::Instant;

const WINDOW_SECS: usize = 60;

/// Sliding window counter over the trailing 60 seconds
pub struct OpsWindow {
    inner: Mutex<Inner>,
}

struct Inner {
    start: Instant,
    buckets: [u64; WINDOW_SECS],
    /// Absolute second index of the bucket last written
    last_sec: u64,
}

impl OpsWindow {
    /// Create an empty window
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                start: Instant::now(),
                buckets: [0; WINDOW_SECS],
                last_sec: 0,
            }),
        }
    }

    /// Record one operation at the current instant
    pub fn record(&self) {
        let mut inner = self.inner.lock();
        let sec = inner.start.elapsed().as_secs();
        inner.advance_to(sec);
        inner.buckets[(sec as usize) % WINDOW_SECS] += 1;
    }

    /// Total operations in the trailing 60 seconds
    #[must_use]
    pub fn count(&self) -> u64 {
        let mut inner = self.inner.lock();
        let sec = inner.start.elapsed().as_secs();
        inner.advance_to(sec);
        inner.buckets.iter().sum()
    }
}

impl Inner {
    /// Zero buckets that fell out of the window since the last touch
    fn advance_to(&mut self, sec: u64) {
        if sec <= self.last_sec {
            return;
        }
        let stale = (sec - self.last_sec).min(WINDOW_SECS as u64);
        for i in 0..stale {
            let idx = ((self.last_sec + 1 + i) as usize) % WINDOW_SECS;
            self.buckets[idx] = 0;
        }
        self.last_sec = sec;
    }
}

impl Default for OpsWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_accumulate() {
        let w = OpsWindow::new();
        for _ in 0..5 {
            w.record();
        }
        assert_eq!(w.count(), 5);
    }

    #[test]
    fn test_stale_buckets_zeroed() {
        let w = OpsWindow::new();
        w.record();
        {
            // Simulate the window sliding far past the recorded bucket
            let mut inner = w.inner.lock();
            let target = inner.last_sec + WINDOW_SECS as u64 + 1;
            inner.advance_to(target);
        }
        assert_eq!(w.count(), 0);
    }
}
