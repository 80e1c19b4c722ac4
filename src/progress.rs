//! Download progress reporting.
//!
//! [`PercentTracker`] turns byte counts into integer percentages that are
//! monotonic non-decreasing, start at 0 and end at exactly 100 on success.
//! Callers only see a value when it changes.

/// Callback receiving download percentages in `[0, 100]`.
pub type ProgressCallback<'a> = &'a mut (dyn FnMut(u8) + Send);

/// A progress sample published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub percent: u8,
    pub bytes_received: u64,
    pub total_bytes: u64,
}

/// Converts received byte counts into monotonic percentages.
#[derive(Debug, Clone)]
pub struct PercentTracker {
    total_bytes: u64,
    bytes_received: u64,
    last: Option<u8>,
}

impl PercentTracker {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            bytes_received: 0,
            last: None,
        }
    }

    /// Emit the initial 0%.
    pub fn start(&mut self) -> Option<u8> {
        self.emit(0)
    }

    /// Record `bytes` more received. Returns the new percentage if it rose.
    ///
    /// Stays below 100 until [`PercentTracker::finish`] so the final value is
    /// only reported once the transfer has actually completed.
    pub fn advance(&mut self, bytes: u64) -> Option<u8> {
        self.bytes_received = self.bytes_received.saturating_add(bytes);
        let percent = if self.total_bytes == 0 {
            0
        } else {
            let raw = self.bytes_received.saturating_mul(100) / self.total_bytes;
            raw.min(99) as u8
        };
        self.emit(percent)
    }

    /// Emit the final 100%.
    pub fn finish(&mut self) -> Option<u8> {
        self.emit(100)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Current sample for observers.
    pub fn sample(&self) -> DownloadProgress {
        DownloadProgress {
            percent: self.last.unwrap_or(0),
            bytes_received: self.bytes_received,
            total_bytes: self.total_bytes,
        }
    }

    fn emit(&mut self, percent: u8) -> Option<u8> {
        match self.last {
            Some(last) if percent <= last => None,
            _ => {
                self.last = Some(percent);
                Some(percent)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(total: u64, chunks: &[u64]) -> Vec<u8> {
        let mut tracker = PercentTracker::new(total);
        let mut seen = Vec::new();
        seen.extend(tracker.start());
        for chunk in chunks {
            seen.extend(tracker.advance(*chunk));
        }
        seen.extend(tracker.finish());
        seen
    }

    #[test]
    fn starts_at_zero_ends_at_hundred() {
        let seen = drive(1000, &[250, 250, 250, 250]);
        assert_eq!(seen, vec![0, 25, 50, 75, 99, 100]);
    }

    #[test]
    fn sequence_is_non_decreasing() {
        let seen = drive(997, &[1, 1, 100, 3, 400, 0, 492]);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.first(), Some(&0));
        assert_eq!(seen.last(), Some(&100));
    }

    #[test]
    fn unchanged_percent_is_not_repeated() {
        let mut tracker = PercentTracker::new(10_000);
        assert_eq!(tracker.start(), Some(0));
        assert_eq!(tracker.advance(1), None);
        assert_eq!(tracker.advance(99), Some(1));
        assert_eq!(tracker.advance(1), None);
    }

    #[test]
    fn oversized_transfer_still_ends_at_exactly_hundred() {
        let seen = drive(100, &[80, 80]);
        assert_eq!(seen, vec![0, 80, 99, 100]);
    }

    #[test]
    fn zero_length_payload() {
        assert_eq!(drive(0, &[]), vec![0, 100]);
    }

    #[test]
    fn finish_is_reported_once() {
        let mut tracker = PercentTracker::new(10);
        tracker.start();
        assert_eq!(tracker.finish(), Some(100));
        assert_eq!(tracker.finish(), None);
        assert_eq!(tracker.sample().percent, 100);
    }
}
