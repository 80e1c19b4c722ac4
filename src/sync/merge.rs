//! Conflict resolution for concurrently received `settings-changed` events.
//!
//! Last-write-wins by event timestamp, ties broken by the lexically greater
//! source instance id. There are no vector clocks: two writes with skewed
//! clocks resolve by wall time alone.

/// Tracks the newest settings write seen by this instance.
#[derive(Debug, Clone, Default)]
pub struct LastWriteWins {
    latest: Option<(i64, String)>,
}

impl LastWriteWins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a write. Returns `true` (and records it) when it beats everything
    /// seen so far.
    pub fn offer(&mut self, timestamp: i64, source_instance_id: &str) -> bool {
        let wins = match &self.latest {
            None => true,
            Some((ts, source)) => {
                (timestamp, source_instance_id) > (*ts, source.as_str())
            }
        };
        if wins {
            self.latest = Some((timestamp, source_instance_id.to_owned()));
        }
        wins
    }

    /// The current winning write, if any.
    pub fn latest(&self) -> Option<(i64, &str)> {
        self.latest.as_ref().map(|(ts, s)| (*ts, s.as_str()))
    }
}
