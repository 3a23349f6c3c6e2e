//! Sliding-window estimation of the incoming byte rate.

#[derive(Debug, Default, Clone, Copy)]
struct Bucket {
    sum: usize,
    samples: usize,
}

/// Bucketed byte counter over a sliding window, one bucket per millisecond.
///
/// `scale` converts the accumulated byte count into the reported unit; 8000
/// yields bits per second for a window measured in milliseconds.
pub struct RateStatistics {
    buckets: Vec<Bucket>,
    accumulated_count: usize,
    num_samples: usize,
    oldest_time_ms: i64,
    oldest_index: usize,
    window_size_ms: i64,
    scale: f64,
    initialized: bool,
}

impl RateStatistics {
    pub fn new(window_size_ms: i64, scale: f64) -> Self {
        Self {
            buckets: vec![Bucket::default(); window_size_ms as usize + 1],
            accumulated_count: 0,
            num_samples: 0,
            oldest_time_ms: 0,
            oldest_index: 0,
            window_size_ms,
            scale,
            initialized: false,
        }
    }

    pub fn update(&mut self, count: usize, now_ms: i64) {
        if now_ms < self.oldest_time_ms {
            // Too old.
            return;
        }
        self.erase_old(now_ms);
        if !self.initialized {
            self.oldest_time_ms = now_ms;
            self.initialized = true;
        }
        let now_offset = (now_ms - self.oldest_time_ms) as usize;
        let mut index = self.oldest_index + now_offset;
        if index >= self.buckets.len() {
            index -= self.buckets.len();
        }
        self.buckets[index].sum += count;
        self.buckets[index].samples += 1;
        self.accumulated_count += count;
        self.num_samples += 1;
    }

    /// Current rate, available once at least half the window has been
    /// observed.
    pub fn rate(&mut self, now_ms: i64) -> Option<u32> {
        self.erase_old(now_ms);
        let active_window_size_ms = now_ms - self.oldest_time_ms + 1;
        if !self.initialized
            || self.num_samples == 0
            || active_window_size_ms <= self.window_size_ms / 2
        {
            return None;
        }
        Some((self.accumulated_count as f64 * self.scale / active_window_size_ms as f64 + 0.5) as u32)
    }

    fn erase_old(&mut self, now_ms: i64) {
        if !self.initialized {
            return;
        }
        let new_oldest_time_ms = now_ms - self.window_size_ms + 1;
        if new_oldest_time_ms <= self.oldest_time_ms {
            return;
        }
        if new_oldest_time_ms > self.oldest_time_ms + self.window_size_ms {
            // The whole window has expired.
            self.buckets.fill(Bucket::default());
            self.accumulated_count = 0;
            self.num_samples = 0;
            self.oldest_index = 0;
            self.oldest_time_ms = new_oldest_time_ms;
            return;
        }
        while self.oldest_time_ms < new_oldest_time_ms {
            let oldest_bucket = self.buckets[self.oldest_index];
            self.accumulated_count -= oldest_bucket.sum;
            self.num_samples -= oldest_bucket.samples;
            self.buckets[self.oldest_index] = Bucket::default();
            self.oldest_index += 1;
            if self.oldest_index >= self.buckets.len() {
                self.oldest_index = 0;
            }
            self.oldest_time_ms += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW_MS: i64 = 1000;
    const SCALE: f64 = 8000.0;

    #[test]
    fn test_no_rate_until_half_window_observed() {
        let mut stats = RateStatistics::new(WINDOW_MS, SCALE);
        let mut now_ms = 0;
        while now_ms < WINDOW_MS / 2 {
            stats.update(1000, now_ms);
            assert_eq!(stats.rate(now_ms), None, "at {now_ms} ms");
            now_ms += 10;
        }
        stats.update(1000, now_ms);
        assert!(stats.rate(now_ms).is_some());
    }

    #[test]
    fn test_steady_rate_is_reported() {
        let mut stats = RateStatistics::new(WINDOW_MS, SCALE);
        // 1000 bytes every 10 ms is 800 kbps.
        for i in 0..=200 {
            stats.update(1000, i * 10);
        }
        let rate_bps = stats.rate(2000).unwrap();
        assert!((790_000..=810_000).contains(&rate_bps), "rate {rate_bps}");
    }

    #[test]
    fn test_rate_unavailable_after_silence() {
        let mut stats = RateStatistics::new(WINDOW_MS, SCALE);
        for i in 0..=100 {
            stats.update(1000, i * 10);
        }
        assert!(stats.rate(1000).is_some());
        // Everything has left the window.
        assert_eq!(stats.rate(1000 + 2 * WINDOW_MS), None);
    }

    #[test]
    fn test_window_slides_over_old_samples() {
        let mut stats = RateStatistics::new(WINDOW_MS, SCALE);
        // A burst followed by a slower steady stream; once the burst leaves
        // the window only the steady rate remains.
        for i in 0..10 {
            stats.update(5000, i);
        }
        for i in 1..=30 {
            stats.update(1000, i * 100);
        }
        let rate_bps = stats.rate(3000).unwrap();
        // 1000 bytes per 100 ms is 80 kbps.
        assert!((70_000..=90_000).contains(&rate_bps), "rate {rate_bps}");
    }

    #[test]
    fn test_update_older_than_window_is_ignored() {
        let mut stats = RateStatistics::new(WINDOW_MS, SCALE);
        stats.update(1000, 5000);
        stats.rate(5000 + WINDOW_MS);
        // Far in the past relative to the advanced window.
        stats.update(1000, 0);
        assert_eq!(stats.rate(5000 + WINDOW_MS), None);
    }
}
